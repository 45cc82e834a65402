//! # uapub - OPC UA PubSub data plane
//!
//! A Rust implementation of the OPC UA Publish-Subscribe data plane over
//! the UADP binary message format, with a realtime fixed-offset mode.
//!
//! ## Features
//!
//! - UADP NetworkMessage/DataSetMessage encoding and decoding, little-endian
//!   and content-mask driven
//! - Publisher and subscriber pipelines, driven by host-owned ticks
//! - Realtime fixed-offset mode: freeze a group once, patch a pre-encoded
//!   buffer every cycle, never re-encode
//! - Pluggable transport channels: UDP unicast/multicast and MQTT 3.1.1
//!   (optional TLS behind the `tls` feature)
//! - External value backends binding published and subscribed fields to
//!   application-owned memory
//!
//! ## Example usage
//!
//! ```rust,no_run
//! use uapub::{
//!     ConnectionConfig, DataSetWriterConfig, FieldConfig, PubSub,
//!     PublishedDataSetConfig, PublisherId, Variant, WriterGroupConfig,
//! };
//!
//! fn main() -> uapub::Result<()> {
//!     let mut pubsub = PubSub::new();
//!
//!     let conn = pubsub.add_connection(ConnectionConfig::new(
//!         "udp connection",
//!         "opc.udp://224.0.0.22:4840/",
//!         PublisherId::UInt16(2234),
//!     ))?;
//!
//!     let ds = pubsub.add_published_data_set(PublishedDataSetConfig::new("demo"))?;
//!     let speed = FieldConfig::new_static("speed", Variant::UInt32(0));
//!     let cell = speed.static_cell().unwrap();
//!     pubsub.add_data_set_field(ds, speed)?;
//!
//!     let group = pubsub
//!         .add_writer_group(conn, WriterGroupConfig::new("group 1", 100).realtime())?;
//!     pubsub.add_data_set_writer(
//!         group,
//!         DataSetWriterConfig::new("writer 1", 62541, ds).raw_encoded(),
//!     )?;
//!     pubsub.freeze_writer_group(group)?;
//!
//!     loop {
//!         cell.borrow_mut().value = Variant::UInt32(1000);
//!         pubsub.publish_tick(group)?;
//!     }
//! }
//! ```

pub mod backend;
pub mod error;
pub mod pubsub;
pub mod transport;
pub mod types;
pub mod uadp;

pub use backend::{
    ExternalCell, ExternalValue, ReadNotify, ValueBackend, VariableStore, WriteNotify,
};
pub use error::{PubSubError, Result, StatusCode};
pub use pubsub::config::{
    ConfigVersion, ConnectionConfig, DataSetMetaData, DataSetReaderConfig, DataSetWriterConfig,
    FieldConfig, FieldMetaData, FieldSource, PublishedDataSetConfig, ReaderGroupConfig, RtLevel,
    TargetVariable, WriterGroupConfig,
};
pub use pubsub::{
    ConnectionId, DataSetId, PubSub, ReaderGroupId, ReaderId, WriterGroupId, WriterId,
};
pub use transport::{
    Channel, MqttChannel, MqttOptions, Qos, TlsOptions, TransportScheme, TransportUrl, UdpChannel,
};
pub use types::{BuiltInType, DataValue, NodeId, UtcTime, Variant};
pub use uadp::{
    DataSetMessage, DataSetMessageBody, DataSetMessageContentMask, DataSetMessageHeader,
    FieldEncoding, GroupHeader, NetworkMessage, NetworkMessageContentMask, OffsetBuffer,
    OffsetEntry, OffsetKind, OffsetTable, PublisherId,
};
