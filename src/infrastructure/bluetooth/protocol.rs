//! Nixie Clock Link Protocol
//!
//! Service identity shared by the listener and dialer roles. The wire
//! vocabulary itself lives in `domain::commands` and `domain::handshake`.

use crate::error::{LinkError, Result};
use uuid::Uuid;

/// Serial Port Profile UUID, the service HC-05 style modules expose
pub const SERVICE_UUID: &str = "00001101-0000-1000-8000-00805F9B34FB";

/// Service name published with the listening SDP record
pub const SERVICE_NAME: &str = "AllThingsBluetooth";

/// Byte that terminates every frame on the wire
pub const FRAME_DELIMITER: u8 = b'\n';

/// Receive buffer size of the clock firmware; longer lines are not valid frames
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024;

/// Identity the listener advertises and the dialer looks up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub uuid: Uuid,
    pub name: String,
}

impl ServiceRecord {
    pub fn new(uuid: Uuid, name: impl Into<String>) -> Self {
        Self {
            uuid,
            name: name.into(),
        }
    }
}

impl Default for ServiceRecord {
    fn default() -> Self {
        Self {
            uuid: spp_uuid(),
            name: SERVICE_NAME.to_string(),
        }
    }
}

/// The fixed SPP service UUID.
pub fn spp_uuid() -> Uuid {
    Uuid::from_u128(0x00001101_0000_1000_8000_00805F9B34FB)
}

/// Parse a UUID string such as [`SERVICE_UUID`]
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid> {
    Uuid::parse_str(uuid_str.trim())
        .map_err(|e| LinkError::Protocol(format!("invalid service UUID {:?}: {}", uuid_str, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uuid() {
        let uuid = parse_uuid(SERVICE_UUID).unwrap();
        assert_eq!(uuid, spp_uuid());
        assert_eq!(uuid.as_fields().0, 0x00001101);
    }

    #[test]
    fn test_parse_uuid_rejects_garbage() {
        assert!(matches!(parse_uuid("not-a-uuid"), Err(LinkError::Protocol(_))));
    }

    #[test]
    fn test_default_record() {
        let record = ServiceRecord::default();
        assert_eq!(record.name, SERVICE_NAME);
        assert_eq!(record.uuid.to_string().to_uppercase(), SERVICE_UUID);
    }
}
