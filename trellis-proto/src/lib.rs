//! Trellis mesh data dictionary - addresses, status codes and failure reasons
//!
//! Pure data types shared between the provisioner core and its bearers.
//! No I/O happens here; the configuration request encodings live in
//! [`config`] and the device UUID type in [`device_uuid`].

use serde::{Deserialize, Serialize};

pub mod config;
pub mod device_uuid;

pub use config::{CompositionData, ConfigRequest, ElementDescriptor};
pub use device_uuid::DeviceUuid;

// Synchronous command result codes, as returned by the stack before any
// radio traffic happens.
pub const STATUS_OK: u16 = 0x0000;
pub const STATUS_INVALID_PARAM: u16 = 0x0021;
pub const STATUS_BUSY: u16 = 0x0026;
pub const STATUS_NO_RESOURCES: u16 = 0x0031;
pub const STATUS_ALREADY_EXISTS: u16 = 0x0501;
pub const STATUS_DOES_NOT_EXIST: u16 = 0x0502;

/// Key index into the network or application key tables
pub type KeyIndex = u16;

/// Primary-element address assigned to a node during provisioning.
///
/// Mesh unicast addresses are 15-bit; the top bit distinguishes group
/// addresses, which never identify a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnicastAddress(pub u16);

impl UnicastAddress {
    pub const MAX: u16 = 0x7FFF;

    /// Returns None for 0 (unassigned) and for group/virtual addresses
    pub fn new(raw: u16) -> Option<Self> {
        if raw == 0 || raw > Self::MAX {
            None
        } else {
            Some(Self(raw))
        }
    }

    pub fn value(&self) -> u16 {
        self.0
    }
}

impl std::fmt::Display for UnicastAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// Advertising bearer an unprovisioned beacon was observed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bearer {
    /// PB-ADV, the broadcast provisioning bearer
    Adv,
    /// PB-GATT, provisioning over a GATT connection
    Gatt,
}

impl std::fmt::Display for Bearer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Bearer::Adv => write!(f, "PB-ADV"),
            Bearer::Gatt => write!(f, "PB-GATT"),
        }
    }
}

// Provisioning failure reason codes carried by the provisioning-failed event.
pub const PROV_ERR_INVALID_PDU: u8 = 0x01;
pub const PROV_ERR_INVALID_FORMAT: u8 = 0x02;
pub const PROV_ERR_UNEXPECTED_PDU: u8 = 0x03;
pub const PROV_ERR_CONFIRMATION_FAILED: u8 = 0x04;
pub const PROV_ERR_OUT_OF_RESOURCES: u8 = 0x05;
pub const PROV_ERR_DECRYPTION_FAILED: u8 = 0x06;
pub const PROV_ERR_UNEXPECTED: u8 = 0x07;
pub const PROV_ERR_CANNOT_ASSIGN_ADDRESS: u8 = 0x08;

/// Why a provisioning attempt ended without admitting the node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningFailure {
    InvalidPdu,
    InvalidFormat,
    UnexpectedPdu,
    ConfirmationFailed,
    OutOfResources,
    DecryptionFailed,
    Unexpected,
    CannotAssignAddress,
    /// The provisioning link timed out before the handshake finished
    Timeout,
    /// The host cancelled the session
    Cancelled,
    /// Reason code we do not recognize
    Unknown(u8),
}

impl ProvisioningFailure {
    pub fn from_code(code: u8) -> Self {
        match code {
            PROV_ERR_INVALID_PDU => Self::InvalidPdu,
            PROV_ERR_INVALID_FORMAT => Self::InvalidFormat,
            PROV_ERR_UNEXPECTED_PDU => Self::UnexpectedPdu,
            PROV_ERR_CONFIRMATION_FAILED => Self::ConfirmationFailed,
            PROV_ERR_OUT_OF_RESOURCES => Self::OutOfResources,
            PROV_ERR_DECRYPTION_FAILED => Self::DecryptionFailed,
            PROV_ERR_UNEXPECTED => Self::Unexpected,
            PROV_ERR_CANNOT_ASSIGN_ADDRESS => Self::CannotAssignAddress,
            other => Self::Unknown(other),
        }
    }
}

impl std::fmt::Display for ProvisioningFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPdu => write!(f, "invalid PDU"),
            Self::InvalidFormat => write!(f, "invalid PDU format"),
            Self::UnexpectedPdu => write!(f, "unexpected PDU"),
            Self::ConfirmationFailed => write!(f, "confirmation value mismatch"),
            Self::OutOfResources => write!(f, "device out of resources"),
            Self::DecryptionFailed => write!(f, "decryption failed"),
            Self::Unexpected => write!(f, "unexpected error"),
            Self::CannotAssignAddress => write!(f, "no unicast addresses left to assign"),
            Self::Timeout => write!(f, "provisioning link timed out"),
            Self::Cancelled => write!(f, "cancelled by host"),
            Self::Unknown(code) => write!(f, "unknown reason 0x{code:02x}"),
        }
    }
}

/// Outcome of a single configuration request, as reported by the remote
/// node's configuration server (0x00 is success, anything else is a mesh
/// foundation status code).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigStatus {
    Success,
    Error(u8),
}

impl ConfigStatus {
    pub fn from_code(code: u8) -> Self {
        if code == 0 {
            Self::Success
        } else {
            Self::Error(code)
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for ConfigStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Error(code) => write!(f, "status 0x{code:02x}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unicast_address_range() {
        assert_eq!(UnicastAddress::new(0), None);
        assert_eq!(UnicastAddress::new(0x0042).map(|a| a.value()), Some(0x0042));
        assert_eq!(UnicastAddress::new(0x7FFF).map(|a| a.value()), Some(0x7FFF));
        assert_eq!(UnicastAddress::new(0x8000), None);
    }

    #[test]
    fn failure_reason_codes_round_trip() {
        assert_eq!(
            ProvisioningFailure::from_code(PROV_ERR_DECRYPTION_FAILED),
            ProvisioningFailure::DecryptionFailed
        );
        assert_eq!(ProvisioningFailure::from_code(0x77), ProvisioningFailure::Unknown(0x77));
    }
}
