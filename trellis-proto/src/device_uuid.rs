//! Device UUID - the 128-bit identity an unprovisioned node beacons with

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// The 128-bit UUID broadcast in unprovisioned device beacons.
///
/// Serialized as plain lowercase hex (no hyphens); parsed leniently, see
/// [`DeviceUuid::parse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceUuid(Uuid);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseUuidError;

impl std::fmt::Display for ParseUuidError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "expected 16 hex octets, optionally separated by a single character")
    }
}

impl std::error::Error for ParseUuidError {}

impl DeviceUuid {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Parse 16 octets written as hex, with no separators or with any single
    /// non-hex character between octets ("0011..ff", "00:11:..:ff",
    /// "00-11-..-ff" are all accepted).
    pub fn parse(s: &str) -> Result<Self, ParseUuidError> {
        let mut bytes = [0u8; 16];
        let mut chars = s.chars().peekable();

        for (i, slot) in bytes.iter_mut().enumerate() {
            if i > 0 {
                // Allow exactly one separator of any kind between octets
                if let Some(c) = chars.peek() {
                    if !c.is_ascii_hexdigit() {
                        chars.next();
                    }
                }
            }
            let hi = chars.next().and_then(|c| c.to_digit(16)).ok_or(ParseUuidError)?;
            let lo = chars.next().and_then(|c| c.to_digit(16)).ok_or(ParseUuidError)?;
            *slot = ((hi as u8) << 4) | lo as u8;
        }

        if chars.next().is_some() {
            return Err(ParseUuidError);
        }

        Ok(Self::from_bytes(bytes))
    }

    /// Short form for log lines - first four octets
    pub fn short(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.as_bytes()[..4])
    }
}

impl std::fmt::Display for DeviceUuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", data_encoding::HEXLOWER.encode(self.as_bytes()))
    }
}

impl std::str::FromStr for DeviceUuid {
    type Err = ParseUuidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for DeviceUuid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&data_encoding::HEXLOWER.encode(self.as_bytes()))
    }
}

impl<'de> Deserialize<'de> for DeviceUuid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: [u8; 16] = [
        0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee,
        0xff,
    ];

    #[test]
    fn parses_bare_hex() {
        let uuid = DeviceUuid::parse("00112233445566778899aabbccddeeff").unwrap();
        assert_eq!(uuid.as_bytes(), &RAW);
    }

    #[test]
    fn parses_with_arbitrary_separators() {
        for s in [
            "00:11:22:33:44:55:66:77:88:99:aa:bb:cc:dd:ee:ff",
            "00-11-22-33-44-55-66-77-88-99-AA-BB-CC-DD-EE-FF",
            "00 11 22 33 44 55 66 77 88 99 aa bb cc dd ee ff",
        ] {
            assert_eq!(DeviceUuid::parse(s).unwrap().as_bytes(), &RAW);
        }
    }

    #[test]
    fn rejects_short_and_trailing_input() {
        assert!(DeviceUuid::parse("0011").is_err());
        assert!(DeviceUuid::parse("00112233445566778899aabbccddeeff00").is_err());
        assert!(DeviceUuid::parse("").is_err());
    }

    #[test]
    fn display_round_trips() {
        let uuid = DeviceUuid::from_bytes(RAW);
        assert_eq!(DeviceUuid::parse(&uuid.to_string()).unwrap(), uuid);
    }
}
