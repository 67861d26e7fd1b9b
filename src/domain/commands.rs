//! Outgoing command codec
//!
//! Commands travel as ASCII text with colon separated fields. The line
//! terminator is added by the session when the frame is written.
//!
//! ```text
//! T:H:M:S                 set displayed time
//! C:H:M:S                 set countdown target
//! L:mode:bri:r:g:b        configure LEDs (bri/r/g/b legacy zero padded)
//! REQ_CONN                handshake reply / retry
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Handshake reply literal
pub const HANDSHAKE_REPLY: &str = "REQ_CONN";

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// Validation and parse failures for outgoing commands.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("{field} out of range: {value} (expected {min}..={max})")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("malformed command: {0}")]
    Malformed(String),
}

/// LED mode, brightness and colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedConfig {
    /// Effect number, 1..=8
    pub mode: u8,
    /// Percent, 0..=100
    pub brightness: u8,
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Default for LedConfig {
    fn default() -> Self {
        Self {
            mode: 1,
            brightness: 50,
            r: 0,
            g: 192,
            b: 240,
        }
    }
}

impl LedConfig {
    /// Build a config from a packed `0xRRGGBB` colour.
    pub fn from_rgb(mode: u8, brightness: u8, rgb: u32) -> Self {
        Self {
            mode,
            brightness,
            r: (rgb >> 16) as u8,
            g: (rgb >> 8) as u8,
            b: rgb as u8,
        }
    }
}

/// A command the application sends to the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingCommand {
    TimeSet { hour: u8, min: u8, sec: u8 },
    CountdownSet { hour: u8, min: u8, sec: u8 },
    LedConfig(LedConfig),
    HandshakeReply,
}

impl OutgoingCommand {
    /// `TimeSet` for the wall clock at `now`, shifted by `utc_offset_minutes`.
    ///
    /// Seconds are sent as zero; the clock starts the minute on receipt.
    pub fn time_from_clock(now: SystemTime, utc_offset_minutes: i32) -> Self {
        let epoch_secs = match now.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_secs() as i64,
            Err(e) => -(e.duration().as_secs() as i64),
        };
        let local = (epoch_secs + utc_offset_minutes as i64 * 60).rem_euclid(SECONDS_PER_DAY);

        Self::TimeSet {
            hour: (local / 3600) as u8,
            min: (local % 3600 / 60) as u8,
            sec: 0,
        }
    }

    /// Check every field against its allowed range.
    pub fn validate(&self) -> Result<(), CommandError> {
        match *self {
            Self::TimeSet { hour, min, sec } | Self::CountdownSet { hour, min, sec } => {
                check_range("hour", hour, 0, 99)?;
                check_range("min", min, 0, 59)?;
                check_range("sec", sec, 0, 59)
            }
            Self::LedConfig(led) => {
                check_range("mode", led.mode, 1, 8)?;
                check_range("brightness", led.brightness, 0, 100)
            }
            Self::HandshakeReply => Ok(()),
        }
    }

    /// Encode to wire bytes, without the trailing LF.
    pub fn encode(&self) -> Result<Vec<u8>, CommandError> {
        self.validate()?;

        let text = match *self {
            Self::TimeSet { hour, min, sec } => format!("T:{}:{}:{}", hour, min, sec),
            Self::CountdownSet { hour, min, sec } => format!("C:{}:{}:{}", hour, min, sec),
            Self::LedConfig(led) => format!(
                "L:{}:{}:{}:{}:{}",
                led.mode,
                legacy_pad(led.brightness),
                legacy_pad(led.r),
                legacy_pad(led.g),
                legacy_pad(led.b)
            ),
            Self::HandshakeReply => HANDSHAKE_REPLY.to_string(),
        };

        Ok(text.into_bytes())
    }

    /// Parse wire bytes back into a command. Padded and unpadded numbers are accepted.
    pub fn decode(bytes: &[u8]) -> Result<Self, CommandError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| CommandError::Malformed("not ASCII".to_string()))?;
        text.parse()
    }
}

impl FromStr for OutgoingCommand {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim_end_matches(['\r', '\n']);
        if s == HANDSHAKE_REPLY {
            return Ok(Self::HandshakeReply);
        }

        let mut parts = s.split(':');
        let tag = parts.next().unwrap_or_default();
        let fields = parts.map(parse_field).collect::<Result<Vec<u8>, _>>()?;

        let command = match (tag, fields.as_slice()) {
            ("T", &[hour, min, sec]) => Self::TimeSet { hour, min, sec },
            ("C", &[hour, min, sec]) => Self::CountdownSet { hour, min, sec },
            ("L", &[mode, brightness, r, g, b]) => Self::LedConfig(LedConfig {
                mode,
                brightness,
                r,
                g,
                b,
            }),
            _ => return Err(CommandError::Malformed(s.to_string())),
        };

        command.validate()?;
        Ok(command)
    }
}

impl fmt::Display for OutgoingCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.encode() {
            Ok(bytes) => f.write_str(&String::from_utf8_lossy(&bytes)),
            Err(e) => write!(f, "<invalid: {}>", e),
        }
    }
}

fn check_range(field: &'static str, value: u8, min: u8, max: u8) -> Result<(), CommandError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(CommandError::OutOfRange {
            field,
            value: value as u32,
            min: min as u32,
            max: max as u32,
        })
    }
}

fn parse_field(field: &str) -> Result<u8, CommandError> {
    field
        .parse::<u8>()
        .map_err(|_| CommandError::Malformed(format!("bad numeric field {:?}", field)))
}

/// Zero padding as the clock firmware has always received it.
///
/// Zero becomes `000`, 1..=99 get a single leading zero (so `5` is `05`,
/// not `005`), and three digit values are sent as is.
fn legacy_pad(value: u8) -> String {
    match value {
        0 => "000".to_string(),
        1..=99 => format!("0{}", value),
        _ => value.to_string(),
    }
}
