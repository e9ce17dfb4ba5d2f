//! Configuration-model requests and the composition data they return
//!
//! Compact host-side encodings only; the stack owns the on-air format.

use std::io;

use crate::{KeyIndex, UnicastAddress};

// Request opcodes understood by a node's configuration server.
pub const CONFIG_APPKEY_ADD: u16 = 0x0000;
pub const CONFIG_MODEL_PUB_SET: u16 = 0x0003;
pub const CONFIG_COMPOSITION_DATA_GET: u16 = 0x8008;
pub const CONFIG_MODEL_SUB_ADD: u16 = 0x801B;
pub const CONFIG_MODEL_APP_BIND: u16 = 0x803D;
pub const CONFIG_NODE_RESET: u16 = 0x8049;

// Status opcodes the server answers with.
pub const CONFIG_COMPOSITION_DATA_STATUS: u16 = 0x0002;
pub const CONFIG_APPKEY_STATUS: u16 = 0x8003;
pub const CONFIG_MODEL_PUB_STATUS: u16 = 0x8019;
pub const CONFIG_MODEL_SUB_STATUS: u16 = 0x801F;
pub const CONFIG_MODEL_APP_STATUS: u16 = 0x803E;
pub const CONFIG_NODE_RESET_STATUS: u16 = 0x804A;

/// A single request to a remote node's configuration server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigRequest {
    /// Deploy an application key (already created on the provisioner) to the node
    AppKeyAdd { netkey_index: KeyIndex, appkey_index: KeyIndex },
    /// Query the node's composition data page
    CompositionDataGet { page: u8 },
    /// Bind an application key to a SIG model on one element
    ModelAppBind { element_address: UnicastAddress, appkey_index: KeyIndex, model_id: u16 },
    /// Point a model's publications at an address
    ModelPubSet {
        element_address: UnicastAddress,
        publish_address: u16,
        appkey_index: KeyIndex,
        model_id: u16,
    },
    /// Subscribe a model to a group address
    ModelSubAdd { element_address: UnicastAddress, group_address: u16, model_id: u16 },
    /// Remove the node from the network
    NodeReset,
}

impl ConfigRequest {
    pub fn opcode(&self) -> u16 {
        match self {
            Self::AppKeyAdd { .. } => CONFIG_APPKEY_ADD,
            Self::CompositionDataGet { .. } => CONFIG_COMPOSITION_DATA_GET,
            Self::ModelAppBind { .. } => CONFIG_MODEL_APP_BIND,
            Self::ModelPubSet { .. } => CONFIG_MODEL_PUB_SET,
            Self::ModelSubAdd { .. } => CONFIG_MODEL_SUB_ADD,
            Self::NodeReset => CONFIG_NODE_RESET,
        }
    }

    /// Opcode of the status message that answers this request
    pub fn status_opcode(&self) -> u16 {
        match self {
            Self::AppKeyAdd { .. } => CONFIG_APPKEY_STATUS,
            Self::CompositionDataGet { .. } => CONFIG_COMPOSITION_DATA_STATUS,
            Self::ModelAppBind { .. } => CONFIG_MODEL_APP_STATUS,
            Self::ModelPubSet { .. } => CONFIG_MODEL_PUB_STATUS,
            Self::ModelSubAdd { .. } => CONFIG_MODEL_SUB_STATUS,
            Self::NodeReset => CONFIG_NODE_RESET_STATUS,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::AppKeyAdd { .. } => "appkey add",
            Self::CompositionDataGet { .. } => "composition data get",
            Self::ModelAppBind { .. } => "model app bind",
            Self::ModelPubSet { .. } => "model pub set",
            Self::ModelSubAdd { .. } => "model sub add",
            Self::NodeReset => "node reset",
        }
    }

    /// True for requests that only read remote state and are safe to reissue
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::CompositionDataGet { .. })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12);
        buf.extend_from_slice(&self.opcode().to_be_bytes());
        match self {
            Self::AppKeyAdd { netkey_index, appkey_index } => {
                buf.extend_from_slice(&netkey_index.to_le_bytes());
                buf.extend_from_slice(&appkey_index.to_le_bytes());
            }
            Self::CompositionDataGet { page } => {
                buf.push(*page);
            }
            Self::ModelAppBind { element_address, appkey_index, model_id } => {
                buf.extend_from_slice(&element_address.value().to_le_bytes());
                buf.extend_from_slice(&appkey_index.to_le_bytes());
                buf.extend_from_slice(&model_id.to_le_bytes());
            }
            Self::ModelPubSet { element_address, publish_address, appkey_index, model_id } => {
                buf.extend_from_slice(&element_address.value().to_le_bytes());
                buf.extend_from_slice(&publish_address.to_le_bytes());
                buf.extend_from_slice(&appkey_index.to_le_bytes());
                buf.extend_from_slice(&model_id.to_le_bytes());
            }
            Self::ModelSubAdd { element_address, group_address, model_id } => {
                buf.extend_from_slice(&element_address.value().to_le_bytes());
                buf.extend_from_slice(&group_address.to_le_bytes());
                buf.extend_from_slice(&model_id.to_le_bytes());
            }
            Self::NodeReset => {}
        }
        buf
    }
}

/// One element of a node's composition data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementDescriptor {
    pub location: u16,
    pub models: Vec<u16>,
}

/// Composition data page 0 - what the node is made of
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositionData {
    pub page: u8,
    pub company_id: u16,
    pub product_id: u16,
    pub version_id: u16,
    pub replay_cache_size: u16,
    pub features: u16,
    pub elements: Vec<ElementDescriptor>,
}

impl CompositionData {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(11 + self.elements.len() * 4);
        buf.push(self.page);
        buf.extend_from_slice(&self.company_id.to_le_bytes());
        buf.extend_from_slice(&self.product_id.to_le_bytes());
        buf.extend_from_slice(&self.version_id.to_le_bytes());
        buf.extend_from_slice(&self.replay_cache_size.to_le_bytes());
        buf.extend_from_slice(&self.features.to_le_bytes());
        for element in &self.elements {
            buf.extend_from_slice(&element.location.to_le_bytes());
            buf.push(element.models.len() as u8);
            for model in &element.models {
                buf.extend_from_slice(&model.to_le_bytes());
            }
        }
        buf
    }

    pub fn from_bytes(data: &[u8]) -> io::Result<Self> {
        if data.len() < 11 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "composition data too short"));
        }

        let page = data[0];
        let company_id = u16::from_le_bytes([data[1], data[2]]);
        let product_id = u16::from_le_bytes([data[3], data[4]]);
        let version_id = u16::from_le_bytes([data[5], data[6]]);
        let replay_cache_size = u16::from_le_bytes([data[7], data[8]]);
        let features = u16::from_le_bytes([data[9], data[10]]);

        let mut elements = Vec::new();
        let mut pos = 11;
        while pos < data.len() {
            if data.len() < pos + 3 {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "element header truncated"));
            }
            let location = u16::from_le_bytes([data[pos], data[pos + 1]]);
            let model_count = data[pos + 2] as usize;
            pos += 3;

            if data.len() < pos + model_count * 2 {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "model list truncated"));
            }
            let mut models = Vec::with_capacity(model_count);
            for i in 0..model_count {
                models.push(u16::from_le_bytes([data[pos + i * 2], data[pos + i * 2 + 1]]));
            }
            pos += model_count * 2;

            elements.push(ElementDescriptor { location, models });
        }

        Ok(Self {
            page,
            company_id,
            product_id,
            version_id,
            replay_cache_size,
            features,
            elements,
        })
    }

    pub fn element_count(&self) -> u8 {
        self.elements.len() as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_encodings_carry_their_opcode() {
        let req = ConfigRequest::AppKeyAdd { netkey_index: 0, appkey_index: 1 };
        let bytes = req.to_bytes();
        assert_eq!(&bytes[..2], &CONFIG_APPKEY_ADD.to_be_bytes());
        assert_eq!(&bytes[2..], &[0x00, 0x00, 0x01, 0x00]);

        assert_eq!(ConfigRequest::NodeReset.to_bytes(), CONFIG_NODE_RESET.to_be_bytes());
    }

    #[test]
    fn composition_data_survives_encoding() {
        let dcd = CompositionData {
            page: 0,
            company_id: 0x02FF,
            product_id: 0x0001,
            version_id: 0x0100,
            replay_cache_size: 32,
            features: 0x0003,
            elements: vec![
                ElementDescriptor { location: 0x0100, models: vec![0x0000, 0x1000] },
                ElementDescriptor { location: 0x0101, models: vec![0x1001] },
            ],
        };

        let parsed = CompositionData::from_bytes(&dcd.to_bytes()).unwrap();
        assert_eq!(parsed, dcd);
        assert_eq!(parsed.element_count(), 2);
    }

    #[test]
    fn truncated_composition_data_is_rejected() {
        let dcd = CompositionData {
            page: 0,
            company_id: 1,
            product_id: 2,
            version_id: 3,
            replay_cache_size: 4,
            features: 0,
            elements: vec![ElementDescriptor { location: 0, models: vec![0x1000] }],
        };
        let mut bytes = dcd.to_bytes();
        bytes.truncate(bytes.len() - 1);
        assert!(CompositionData::from_bytes(&bytes).is_err());
    }
}
