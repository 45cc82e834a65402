//! PubSub object store and engine.
//!
//! One [`PubSub`] instance owns the configured connections, published
//! datasets, groups, writers and readers, plus the variable store backing
//! node-sourced fields and subscriber targets. Everything runs on the
//! caller's thread: the host scheduler invokes [`PubSub::publish_tick`] per
//! writer group interval and [`PubSub::receive_tick`] per connection.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::{ExternalCell, VariableStore, WriteNotify};
use crate::error::{PubSubError, Result};
use crate::transport::{self, Channel, TransportUrl};
use crate::types::NodeId;
use crate::uadp::{
    DataSetMessageContentMask, NetworkMessageContentMask, OffsetBuffer, OffsetTable,
};

pub mod config;
mod freeze;
mod publisher;
mod subscriber;

use config::{
    ConnectionConfig, DataSetReaderConfig, DataSetWriterConfig, FieldConfig, PublishedDataSetConfig,
    ReaderGroupConfig, WriterGroupConfig,
};

/// Process-unique typed handles, generated by the store at registration.
macro_rules! impl_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(u32);
    };
}

impl_handle!(ConnectionId);
impl_handle!(DataSetId);
impl_handle!(WriterGroupId);
impl_handle!(WriterId);
impl_handle!(ReaderGroupId);
impl_handle!(ReaderId);

pub(crate) struct PublishedDataSet {
    pub(crate) id: DataSetId,
    pub(crate) cfg: PublishedDataSetConfig,
    pub(crate) fields: Vec<FieldConfig>,
}

pub(crate) struct DataSetWriter {
    pub(crate) id: WriterId,
    pub(crate) cfg: DataSetWriterConfig,
    pub(crate) sequence_number: u16,
}

/// Frozen state of a fixed-size realtime writer group: the pre-encoded
/// message and, per payload message, the writer handle plus its field
/// source cells in field order.
pub(crate) struct FrozenWriterGroup {
    pub(crate) buffer: OffsetBuffer,
    pub(crate) writers: Vec<(WriterId, Vec<ExternalCell>)>,
}

pub(crate) struct WriterGroup {
    pub(crate) id: WriterGroupId,
    pub(crate) cfg: WriterGroupConfig,
    pub(crate) writers: Vec<DataSetWriter>,
    pub(crate) sequence_number: u16,
    pub(crate) frozen: Option<FrozenWriterGroup>,
}

/// Frozen state of a realtime reader: the expected byte length of the
/// matched DataSetMessage, patch sites relative to its start, and the
/// captured target bindings in field order. A NetworkMessage from a
/// multi-writer group carries several such messages; each frozen reader
/// only constrains its own.
pub(crate) struct FrozenReader {
    pub(crate) message_len: usize,
    pub(crate) table: OffsetTable,
    pub(crate) targets: Vec<(NodeId, ExternalCell, Option<WriteNotify>)>,
}

pub(crate) struct DataSetReader {
    pub(crate) id: ReaderId,
    pub(crate) cfg: DataSetReaderConfig,
    pub(crate) frozen: Option<FrozenReader>,
    pub(crate) drops: u64,
}

pub(crate) struct ReaderGroup {
    pub(crate) id: ReaderGroupId,
    pub(crate) cfg: ReaderGroupConfig,
    pub(crate) readers: Vec<DataSetReader>,
    pub(crate) frozen: bool,
}

pub(crate) struct Connection {
    pub(crate) id: ConnectionId,
    pub(crate) cfg: ConnectionConfig,
    pub(crate) channel: Box<dyn Channel>,
    pub(crate) writer_groups: Vec<WriterGroup>,
    pub(crate) reader_groups: Vec<ReaderGroup>,
}

fn check_message_mask(mask: NetworkMessageContentMask) -> Result<()> {
    if mask.bits() & !NetworkMessageContentMask::all().bits() != 0 {
        return Err(PubSubError::InvalidArgument(
            "unknown network message content mask bits".into(),
        ));
    }
    Ok(())
}

fn check_dataset_mask(mask: DataSetMessageContentMask) -> Result<()> {
    if mask.bits() & !DataSetMessageContentMask::all().bits() != 0 {
        return Err(PubSubError::InvalidArgument(
            "unknown dataset message content mask bits".into(),
        ));
    }
    Ok(())
}

/// The PubSub configuration store and data-plane engine.
#[derive(Default)]
pub struct PubSub {
    next_id: u32,
    pub(crate) connections: Vec<Connection>,
    pub(crate) data_sets: Vec<PublishedDataSet>,
    pub(crate) variables: VariableStore,
}

impl PubSub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn variables(&self) -> &VariableStore {
        &self.variables
    }

    pub fn variables_mut(&mut self) -> &mut VariableStore {
        &mut self.variables
    }

    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    // -- connections --------------------------------------------------------

    /// Register a connection and open its channel. On failure nothing is
    /// stored and every resource acquired while connecting is released.
    pub fn add_connection(&mut self, cfg: ConnectionConfig) -> Result<ConnectionId> {
        let url = TransportUrl::parse(&cfg.address)?;
        let channel = transport::open_channel(&url, cfg.mqtt.as_ref())?;
        let id = ConnectionId(self.next_id());
        info!(name = %cfg.name, address = %cfg.address, "connection added");
        self.connections.push(Connection {
            id,
            cfg,
            channel,
            writer_groups: Vec::new(),
            reader_groups: Vec::new(),
        });
        Ok(id)
    }

    /// Tear the connection down, dropping its groups and closing the
    /// channel.
    pub fn remove_connection(&mut self, id: ConnectionId) -> Result<()> {
        let index = self.connection_index(id)?;
        let mut connection = self.connections.remove(index);
        info!(name = %connection.cfg.name, "connection removed");
        connection.channel.close()
    }

    // -- published datasets --------------------------------------------------

    pub fn add_published_data_set(&mut self, cfg: PublishedDataSetConfig) -> Result<DataSetId> {
        let id = DataSetId(self.next_id());
        self.data_sets.push(PublishedDataSet {
            id,
            cfg,
            fields: Vec::new(),
        });
        Ok(id)
    }

    /// Fails while any writer references the dataset.
    pub fn remove_published_data_set(&mut self, id: DataSetId) -> Result<()> {
        let index = self.data_set_index(id)?;
        if self.writers().any(|w| w.cfg.data_set == id) {
            return Err(PubSubError::Configuration(
                "published data set is referenced by a data set writer".into(),
            ));
        }
        self.data_sets.remove(index);
        Ok(())
    }

    /// Append a field to a published dataset. Fails with
    /// `ConfigurationLocked` while a frozen writer group publishes the
    /// dataset. Returns the new field's index.
    pub fn add_data_set_field(&mut self, id: DataSetId, field: FieldConfig) -> Result<usize> {
        if self.data_set_locked(id) {
            return Err(PubSubError::ConfigurationLocked);
        }
        let index = self.data_set_index(id)?;
        let data_set = &mut self.data_sets[index];
        data_set.fields.push(field);
        Ok(data_set.fields.len() - 1)
    }

    pub fn remove_data_set_field(&mut self, id: DataSetId, field_index: usize) -> Result<()> {
        if self.data_set_locked(id) {
            return Err(PubSubError::ConfigurationLocked);
        }
        let index = self.data_set_index(id)?;
        let data_set = &mut self.data_sets[index];
        if field_index >= data_set.fields.len() {
            return Err(PubSubError::InvalidArgument(format!(
                "field index {field_index} out of range"
            )));
        }
        data_set.fields.remove(field_index);
        Ok(())
    }

    // -- writer side ---------------------------------------------------------

    pub fn add_writer_group(
        &mut self,
        connection: ConnectionId,
        cfg: WriterGroupConfig,
    ) -> Result<WriterGroupId> {
        check_message_mask(cfg.message_mask)?;
        let id = WriterGroupId(self.next_id());
        let index = self.connection_index(connection)?;
        debug!(name = %cfg.name, writer_group_id = cfg.writer_group_id, "writer group added");
        self.connections[index].writer_groups.push(WriterGroup {
            id,
            cfg,
            writers: Vec::new(),
            sequence_number: 0,
            frozen: None,
        });
        Ok(id)
    }

    /// Fails while the group is frozen or still has an enabled writer.
    pub fn remove_writer_group(&mut self, id: WriterGroupId) -> Result<()> {
        let (ci, gi) = self.writer_group_position(id)?;
        let group = &self.connections[ci].writer_groups[gi];
        if group.frozen.is_some() {
            return Err(PubSubError::ConfigurationLocked);
        }
        if group.writers.iter().any(|w| w.cfg.enabled) {
            return Err(PubSubError::Configuration(
                "writer group still has enabled writers".into(),
            ));
        }
        self.connections[ci].writer_groups.remove(gi);
        Ok(())
    }

    pub fn add_data_set_writer(
        &mut self,
        group: WriterGroupId,
        cfg: DataSetWriterConfig,
    ) -> Result<WriterId> {
        check_dataset_mask(cfg.message_mask)?;
        self.data_set_index(cfg.data_set)?;
        let id = WriterId(self.next_id());
        let (ci, gi) = self.writer_group_position(group)?;
        let group = &mut self.connections[ci].writer_groups[gi];
        if group.frozen.is_some() {
            return Err(PubSubError::ConfigurationLocked);
        }
        group.writers.push(DataSetWriter {
            id,
            cfg,
            sequence_number: 0,
        });
        Ok(id)
    }

    pub fn remove_data_set_writer(&mut self, id: WriterId) -> Result<()> {
        let (ci, gi, wi) = self.writer_position(id)?;
        let group = &mut self.connections[ci].writer_groups[gi];
        if group.frozen.is_some() {
            return Err(PubSubError::ConfigurationLocked);
        }
        group.writers.remove(wi);
        Ok(())
    }

    pub fn set_data_set_writer_enabled(&mut self, id: WriterId, enabled: bool) -> Result<()> {
        let (ci, gi, wi) = self.writer_position(id)?;
        let group = &mut self.connections[ci].writer_groups[gi];
        if group.frozen.is_some() {
            return Err(PubSubError::ConfigurationLocked);
        }
        group.writers[wi].cfg.enabled = enabled;
        Ok(())
    }

    // -- reader side ---------------------------------------------------------

    pub fn add_reader_group(
        &mut self,
        connection: ConnectionId,
        cfg: ReaderGroupConfig,
    ) -> Result<ReaderGroupId> {
        let id = ReaderGroupId(self.next_id());
        let index = self.connection_index(connection)?;
        debug!(name = %cfg.name, "reader group added");
        self.connections[index].reader_groups.push(ReaderGroup {
            id,
            cfg,
            readers: Vec::new(),
            frozen: false,
        });
        Ok(id)
    }

    pub fn remove_reader_group(&mut self, id: ReaderGroupId) -> Result<()> {
        let (ci, gi) = self.reader_group_position(id)?;
        if self.connections[ci].reader_groups[gi].frozen {
            return Err(PubSubError::ConfigurationLocked);
        }
        self.connections[ci].reader_groups.remove(gi);
        Ok(())
    }

    pub fn add_data_set_reader(
        &mut self,
        group: ReaderGroupId,
        cfg: DataSetReaderConfig,
    ) -> Result<ReaderId> {
        check_message_mask(cfg.message_mask)?;
        check_dataset_mask(cfg.dataset_mask)?;
        if cfg.targets.len() != cfg.metadata.fields.len() {
            return Err(PubSubError::InvalidArgument(
                "one target variable per metadata field is required".into(),
            ));
        }
        let id = ReaderId(self.next_id());
        let (ci, gi) = self.reader_group_position(group)?;
        let group = &mut self.connections[ci].reader_groups[gi];
        if group.frozen {
            return Err(PubSubError::ConfigurationLocked);
        }
        group.readers.push(DataSetReader {
            id,
            cfg,
            frozen: None,
            drops: 0,
        });
        Ok(id)
    }

    pub fn remove_data_set_reader(&mut self, id: ReaderId) -> Result<()> {
        let (ci, gi, ri) = self.reader_position(id)?;
        let group = &mut self.connections[ci].reader_groups[gi];
        if group.frozen {
            return Err(PubSubError::ConfigurationLocked);
        }
        group.readers.remove(ri);
        Ok(())
    }

    /// Monotonic count of messages this reader matched but failed to
    /// decode or apply.
    pub fn reader_drops(&self, id: ReaderId) -> Result<u64> {
        let (ci, gi, ri) = self.reader_position(id)?;
        Ok(self.connections[ci].reader_groups[gi].readers[ri].drops)
    }

    // -- introspection -------------------------------------------------------

    pub fn connection_config(&self, id: ConnectionId) -> Result<&ConnectionConfig> {
        Ok(&self.connections[self.connection_index(id)?].cfg)
    }

    pub fn published_data_set_config(&self, id: DataSetId) -> Result<&PublishedDataSetConfig> {
        Ok(&self.data_sets[self.data_set_index(id)?].cfg)
    }

    pub fn writer_group_config(&self, id: WriterGroupId) -> Result<&WriterGroupConfig> {
        let (ci, gi) = self.writer_group_position(id)?;
        Ok(&self.connections[ci].writer_groups[gi].cfg)
    }

    pub fn data_set_writer_config(&self, id: WriterId) -> Result<&DataSetWriterConfig> {
        let (ci, gi, wi) = self.writer_position(id)?;
        Ok(&self.connections[ci].writer_groups[gi].writers[wi].cfg)
    }

    pub fn reader_group_config(&self, id: ReaderGroupId) -> Result<&ReaderGroupConfig> {
        let (ci, gi) = self.reader_group_position(id)?;
        Ok(&self.connections[ci].reader_groups[gi].cfg)
    }

    pub fn data_set_reader_config(&self, id: ReaderId) -> Result<&DataSetReaderConfig> {
        let (ci, gi, ri) = self.reader_position(id)?;
        Ok(&self.connections[ci].reader_groups[gi].readers[ri].cfg)
    }

    pub fn writer_group_frozen(&self, id: WriterGroupId) -> Result<bool> {
        let (ci, gi) = self.writer_group_position(id)?;
        Ok(self.connections[ci].writer_groups[gi].frozen.is_some())
    }

    pub fn reader_group_frozen(&self, id: ReaderGroupId) -> Result<bool> {
        let (ci, gi) = self.reader_group_position(id)?;
        Ok(self.connections[ci].reader_groups[gi].frozen)
    }

    /// The frozen message image of a writer group, when frozen.
    pub fn writer_group_offset_buffer(&self, id: WriterGroupId) -> Result<Option<&OffsetBuffer>> {
        let (ci, gi) = self.writer_group_position(id)?;
        Ok(self.connections[ci].writer_groups[gi]
            .frozen
            .as_ref()
            .map(|f| &f.buffer))
    }

    pub fn data_set_field_count(&self, id: DataSetId) -> Result<usize> {
        Ok(self.data_sets[self.data_set_index(id)?].fields.len())
    }

    // -- lookup helpers ------------------------------------------------------

    fn connection_index(&self, id: ConnectionId) -> Result<usize> {
        self.connections
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| PubSubError::InvalidArgument(format!("unknown connection {id:?}")))
    }

    fn data_set_index(&self, id: DataSetId) -> Result<usize> {
        self.data_sets
            .iter()
            .position(|d| d.id == id)
            .ok_or_else(|| PubSubError::InvalidArgument(format!("unknown published data set {id:?}")))
    }

    fn writer_group_position(&self, id: WriterGroupId) -> Result<(usize, usize)> {
        for (ci, connection) in self.connections.iter().enumerate() {
            if let Some(gi) = connection.writer_groups.iter().position(|g| g.id == id) {
                return Ok((ci, gi));
            }
        }
        Err(PubSubError::InvalidArgument(format!(
            "unknown writer group {id:?}"
        )))
    }

    fn writer_position(&self, id: WriterId) -> Result<(usize, usize, usize)> {
        for (ci, connection) in self.connections.iter().enumerate() {
            for (gi, group) in connection.writer_groups.iter().enumerate() {
                if let Some(wi) = group.writers.iter().position(|w| w.id == id) {
                    return Ok((ci, gi, wi));
                }
            }
        }
        Err(PubSubError::InvalidArgument(format!(
            "unknown data set writer {id:?}"
        )))
    }

    fn reader_group_position(&self, id: ReaderGroupId) -> Result<(usize, usize)> {
        for (ci, connection) in self.connections.iter().enumerate() {
            if let Some(gi) = connection.reader_groups.iter().position(|g| g.id == id) {
                return Ok((ci, gi));
            }
        }
        Err(PubSubError::InvalidArgument(format!(
            "unknown reader group {id:?}"
        )))
    }

    fn reader_position(&self, id: ReaderId) -> Result<(usize, usize, usize)> {
        for (ci, connection) in self.connections.iter().enumerate() {
            for (gi, group) in connection.reader_groups.iter().enumerate() {
                if let Some(ri) = group.readers.iter().position(|r| r.id == id) {
                    return Ok((ci, gi, ri));
                }
            }
        }
        Err(PubSubError::InvalidArgument(format!(
            "unknown data set reader {id:?}"
        )))
    }

    fn writers(&self) -> impl Iterator<Item = &DataSetWriter> {
        self.connections
            .iter()
            .flat_map(|c| c.writer_groups.iter())
            .flat_map(|g| g.writers.iter())
    }

    /// Whether a frozen writer group currently publishes the dataset.
    fn data_set_locked(&self, id: DataSetId) -> bool {
        self.connections
            .iter()
            .flat_map(|c| c.writer_groups.iter())
            .filter(|g| g.frozen.is_some())
            .flat_map(|g| g.writers.iter())
            .any(|w| w.cfg.data_set == id)
    }
}

#[cfg(test)]
#[path = "tests/engine.rs"]
mod tests;
