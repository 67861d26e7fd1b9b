//! Line-oriented console for driving the link by hand.
//!
//! ```text
//! time H M S                  set displayed time
//! sync                        set time from the system clock
//! countdown H M S             set countdown target
//! led MODE BRI R G B          configure LEDs (or: led MODE BRI #RRGGBB)
//! connect ADDRESS [NAME]      dial a clock
//! listen                      wait for the clock to dial in
//! disconnect | status | help | quit
//! ```

use std::str::{FromStr, SplitWhitespace};

use crate::domain::commands::{CommandError, LedConfig, OutgoingCommand};
use crate::domain::models::RemoteDevice;

/// One parsed console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Send(OutgoingCommand),
    SyncClock,
    Connect(RemoteDevice),
    Listen,
    Disconnect,
    Status,
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  time H M S               set displayed time
  sync                     set time from the system clock
  countdown H M S          set countdown target
  led MODE BRI R G B       configure LEDs (or: led MODE BRI #RRGGBB)
  connect ADDRESS [NAME]   dial a clock
  listen                   wait for the clock to dial in
  disconnect               close the current link
  status                   show link state
  quit                     exit";

impl FromStr for ConsoleCommand {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words
            .next()
            .ok_or_else(|| CommandError::Malformed("empty line".to_string()))?
            .to_ascii_lowercase();

        let command = match verb.as_str() {
            "time" | "t" => {
                let (hour, min, sec) = hms(&mut words)?;
                Self::Send(OutgoingCommand::TimeSet { hour, min, sec })
            }
            "countdown" | "c" => {
                let (hour, min, sec) = hms(&mut words)?;
                Self::Send(OutgoingCommand::CountdownSet { hour, min, sec })
            }
            "led" | "l" => Self::Send(OutgoingCommand::LedConfig(led(&mut words)?)),
            "sync" => Self::SyncClock,
            "connect" => {
                let address = words
                    .next()
                    .ok_or_else(|| CommandError::Malformed("connect needs an address".to_string()))?;
                let name = words.by_ref().collect::<Vec<_>>().join(" ");
                return Ok(Self::Connect(RemoteDevice::new(address, name)));
            }
            "listen" => Self::Listen,
            "disconnect" => Self::Disconnect,
            "status" => Self::Status,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => return Err(CommandError::Malformed(format!("unknown command {:?}", other))),
        };

        match words.next() {
            Some(extra) => Err(CommandError::Malformed(format!(
                "unexpected argument {:?}",
                extra
            ))),
            None => Ok(command),
        }
    }
}

fn hms(words: &mut SplitWhitespace<'_>) -> Result<(u8, u8, u8), CommandError> {
    Ok((
        number("hour", words.next())?,
        number("min", words.next())?,
        number("sec", words.next())?,
    ))
}

fn led(words: &mut SplitWhitespace<'_>) -> Result<LedConfig, CommandError> {
    let mode = number("mode", words.next())?;
    let brightness = number("brightness", words.next())?;

    let first = words.next();
    if let Some(hex) = first.and_then(|w| w.strip_prefix('#')) {
        let rgb = u32::from_str_radix(hex, 16)
            .ok()
            .filter(|_| hex.len() == 6)
            .ok_or_else(|| CommandError::Malformed(format!("bad colour #{}", hex)))?;
        return Ok(LedConfig::from_rgb(mode, brightness, rgb));
    }

    Ok(LedConfig {
        mode,
        brightness,
        r: number("r", first)?,
        g: number("g", words.next())?,
        b: number("b", words.next())?,
    })
}

fn number(field: &'static str, word: Option<&str>) -> Result<u8, CommandError> {
    let word = word.ok_or_else(|| CommandError::Malformed(format!("missing {}", field)))?;
    let value: u32 = word
        .parse()
        .map_err(|_| CommandError::Malformed(format!("{} is not a number: {:?}", field, word)))?;

    u8::try_from(value).map_err(|_| CommandError::OutOfRange {
        field,
        value,
        min: 0,
        max: u8::MAX as u32,
    })
}
