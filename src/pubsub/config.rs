//! Configuration structs for the PubSub entities.
//!
//! These are plain values handed to the engine by the host application. The
//! engine takes ownership at registration; entities reference each other by
//! handle, never by pointer.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::ExternalCell;
use crate::pubsub::DataSetId;
use crate::transport::mqtt::MqttOptions;
use crate::types::{BuiltInType, DataValue, NodeId, Variant};
use crate::uadp::{
    DataSetMessageContentMask, FieldEncoding, NetworkMessageContentMask, PublisherId,
};

/// OPC UA attribute id of a variable's value.
pub const ATTRIBUTE_VALUE: u32 = 13;

/// Realtime level of a writer or reader group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RtLevel {
    #[default]
    None,
    /// Every published message has an identical byte layout known at freeze
    /// time, enabling in-place patching.
    FixedSize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub name: String,
    /// Transport address: `opc.udp://host:port/`, `opc.mqtt://host:port/topic`
    /// or `opc.eth://iface`.
    pub address: String,
    pub publisher_id: PublisherId,
    /// Consulted for `opc.mqtt` addresses only.
    pub mqtt: Option<MqttOptions>,
}

impl ConnectionConfig {
    pub fn new(name: &str, address: &str, publisher_id: PublisherId) -> Self {
        Self {
            name: name.to_string(),
            address: address.to_string(),
            publisher_id,
            mqtt: None,
        }
    }
}

/// Version of a published dataset's field layout, carried in DataSetMessage
/// headers when the writer's content mask asks for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigVersion {
    pub major: u32,
    pub minor: u32,
}

impl Default for ConfigVersion {
    fn default() -> Self {
        Self { major: 1, minor: 0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedDataSetConfig {
    pub name: String,
    pub config_version: ConfigVersion,
}

impl PublishedDataSetConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            config_version: ConfigVersion::default(),
        }
    }
}

/// Where a published field's value comes from.
#[derive(Debug, Clone)]
pub enum FieldSource {
    /// Read through the variable store each tick.
    Node(NodeId),
    /// Caller-owned shared cell, read directly each tick. Required for
    /// fields under a fixed-size realtime group.
    Static(ExternalCell),
}

/// One published scalar.
#[derive(Debug, Clone)]
pub struct FieldConfig {
    pub alias: String,
    pub attribute_id: u32,
    pub source: FieldSource,
}

impl FieldConfig {
    /// Field backed by a caller-owned cell holding `initial`. Keep a clone
    /// of [`FieldConfig::static_cell`] to update the value between ticks.
    pub fn new_static(alias: &str, initial: Variant) -> Self {
        Self {
            alias: alias.to_string(),
            attribute_id: ATTRIBUTE_VALUE,
            source: FieldSource::Static(Rc::new(RefCell::new(DataValue::new(initial)))),
        }
    }

    /// Field sampled from a variable node each tick.
    pub fn new_node(alias: &str, node: NodeId) -> Self {
        Self {
            alias: alias.to_string(),
            attribute_id: ATTRIBUTE_VALUE,
            source: FieldSource::Node(node),
        }
    }

    pub fn static_cell(&self) -> Option<ExternalCell> {
        match &self.source {
            FieldSource::Static(cell) => Some(cell.clone()),
            FieldSource::Node(_) => None,
        }
    }
}

fn default_message_mask() -> NetworkMessageContentMask {
    NetworkMessageContentMask::PUBLISHER_ID
        | NetworkMessageContentMask::GROUP_HEADER
        | NetworkMessageContentMask::WRITER_GROUP_ID
        | NetworkMessageContentMask::SEQUENCE_NUMBER
        | NetworkMessageContentMask::PAYLOAD_HEADER
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriterGroupConfig {
    pub name: String,
    /// Protocol-visible group number, part of the subscriber match key.
    pub writer_group_id: u16,
    pub publishing_interval: Duration,
    pub group_version: u32,
    pub message_mask: NetworkMessageContentMask,
    pub dataset_class_id: Option<[u8; 16]>,
    pub rt_level: RtLevel,
}

impl WriterGroupConfig {
    pub fn new(name: &str, writer_group_id: u16) -> Self {
        Self {
            name: name.to_string(),
            writer_group_id,
            publishing_interval: Duration::from_millis(100),
            group_version: 0,
            message_mask: default_message_mask(),
            dataset_class_id: None,
            rt_level: RtLevel::None,
        }
    }

    pub fn realtime(mut self) -> Self {
        self.rt_level = RtLevel::FixedSize;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSetWriterConfig {
    pub name: String,
    /// Protocol-visible writer number, part of the subscriber match key.
    pub data_set_writer_id: u16,
    pub data_set: DataSetId,
    pub field_encoding: FieldEncoding,
    pub message_mask: DataSetMessageContentMask,
    pub enabled: bool,
}

impl DataSetWriterConfig {
    pub fn new(name: &str, data_set_writer_id: u16, data_set: DataSetId) -> Self {
        Self {
            name: name.to_string(),
            data_set_writer_id,
            data_set,
            field_encoding: FieldEncoding::Variant,
            message_mask: DataSetMessageContentMask::SEQUENCE_NUMBER,
            enabled: true,
        }
    }

    pub fn raw_encoded(mut self) -> Self {
        self.field_encoding = FieldEncoding::RawData;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaderGroupConfig {
    pub name: String,
    pub rt_level: RtLevel,
}

impl ReaderGroupConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rt_level: RtLevel::None,
        }
    }

    pub fn realtime(mut self) -> Self {
        self.rt_level = RtLevel::FixedSize;
        self
    }
}

/// Expected field layout of the messages a reader decodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSetMetaData {
    pub name: String,
    pub fields: Vec<FieldMetaData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMetaData {
    pub name: String,
    pub built_in_type: BuiltInType,
}

impl FieldMetaData {
    pub fn new(name: &str, built_in_type: BuiltInType) -> Self {
        Self {
            name: name.to_string(),
            built_in_type,
        }
    }
}

/// Binds one decoded field, by position, to a variable node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetVariable {
    pub node: NodeId,
    pub attribute_id: u32,
}

impl TargetVariable {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            attribute_id: ATTRIBUTE_VALUE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSetReaderConfig {
    pub name: String,
    /// Match key, compared against the received NetworkMessage header.
    pub publisher_id: PublisherId,
    pub writer_group_id: u16,
    pub data_set_writer_id: u16,
    /// Header layout this reader expects; meaningful for the frozen path.
    pub message_mask: NetworkMessageContentMask,
    pub dataset_mask: DataSetMessageContentMask,
    pub field_encoding: FieldEncoding,
    pub metadata: DataSetMetaData,
    /// One entry per metadata field, in field order.
    pub targets: Vec<TargetVariable>,
}

impl DataSetReaderConfig {
    pub fn new(
        name: &str,
        publisher_id: PublisherId,
        writer_group_id: u16,
        data_set_writer_id: u16,
        metadata: DataSetMetaData,
    ) -> Self {
        Self {
            name: name.to_string(),
            publisher_id,
            writer_group_id,
            data_set_writer_id,
            message_mask: default_message_mask(),
            dataset_mask: DataSetMessageContentMask::SEQUENCE_NUMBER,
            field_encoding: FieldEncoding::Variant,
            metadata,
            targets: Vec::new(),
        }
    }

    pub fn with_targets(mut self, targets: Vec<TargetVariable>) -> Self {
        self.targets = targets;
        self
    }

    pub fn raw_encoded(mut self) -> Self {
        self.field_encoding = FieldEncoding::RawData;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_config_serializes() {
        let cfg = DataSetReaderConfig::new(
            "reader",
            PublisherId::UInt16(2234),
            100,
            62541,
            DataSetMetaData {
                name: "demo".into(),
                fields: vec![FieldMetaData::new("speed", BuiltInType::UInt32)],
            },
        )
        .with_targets(vec![TargetVariable::new(NodeId(1))]);

        let json = serde_json::to_string(&cfg).unwrap();
        let back: DataSetReaderConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn test_static_field_shares_its_cell() {
        let field = FieldConfig::new_static("speed", Variant::UInt32(1));
        let cell = field.static_cell().unwrap();
        cell.borrow_mut().value = Variant::UInt32(2);
        match &field.source {
            FieldSource::Static(inner) => {
                assert_eq!(inner.borrow().value, Variant::UInt32(2));
            }
            FieldSource::Node(_) => unreachable!(),
        }
    }
}
