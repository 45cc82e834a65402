//! Publisher pipeline: one tick per writer group publishing interval.

use bytes::BytesMut;
use tracing::trace;

use crate::backend::VariableStore;
use crate::error::{PubSubError, Result};
use crate::types::datetime_now;
use crate::uadp::codec;
use crate::uadp::message::{
    DataSetMessage, DataSetMessageBody, DataSetMessageHeader, GroupHeader, NetworkMessage,
};
use crate::uadp::{DataSetMessageContentMask, NetworkMessageContentMask};

use super::config::{ConnectionConfig, FieldSource};
use super::{DataSetWriter, PubSub, PublishedDataSet, WriterGroup, WriterGroupId};

impl PubSub {
    /// Publish one cycle of a writer group.
    ///
    /// A frozen group never re-encodes: sequence numbers and field values
    /// are patched into the pre-encoded buffer at the offsets recorded at
    /// freeze time, and the same buffer is handed to the channel. An
    /// unfrozen group samples its fields and builds the message from
    /// scratch.
    pub fn publish_tick(&mut self, group_id: WriterGroupId) -> Result<()> {
        let (ci, gi) = self.writer_group_position(group_id)?;
        let Self {
            connections,
            data_sets,
            variables,
            ..
        } = self;
        let connection = &mut connections[ci];
        let group = &mut connection.writer_groups[gi];

        group.sequence_number = group.sequence_number.wrapping_add(1);
        let sequence_number = group.sequence_number;

        if let Some(frozen) = group.frozen.as_mut() {
            frozen.buffer.set_group_sequence_number(sequence_number);

            for (message, (writer_id, cells)) in frozen.writers.iter().enumerate() {
                let writer = group
                    .writers
                    .iter_mut()
                    .find(|w| w.id == *writer_id)
                    .ok_or_else(|| {
                        PubSubError::Configuration("frozen writer no longer exists".into())
                    })?;
                writer.sequence_number = writer.sequence_number.wrapping_add(1);
                frozen
                    .buffer
                    .set_message_sequence_number(message, writer.sequence_number);
                for (field, cell) in cells.iter().enumerate() {
                    frozen.buffer.write_field(message, field, &cell.borrow().value)?;
                }
            }

            trace!(group = ?group_id, bytes = frozen.buffer.len(), "realtime publish");
            return connection.channel.send(frozen.buffer.bytes());
        }

        if !group.writers.iter().any(|w| w.cfg.enabled) {
            trace!(group = ?group_id, "no enabled writers, nothing published");
            return Ok(());
        }
        for writer in group.writers.iter_mut().filter(|w| w.cfg.enabled) {
            writer.sequence_number = writer.sequence_number.wrapping_add(1);
        }

        let group = &connection.writer_groups[gi];
        let nm = assemble_network_message(&connection.cfg, group, data_sets, variables)?;
        let mut buf = BytesMut::new();
        codec::encode_network_message(&nm, &mut buf)?;
        trace!(group = ?group_id, bytes = buf.len(), "publish");
        connection.channel.send(&buf)
    }
}

/// Build the NetworkMessage a group's current state describes, using the
/// current sequence numbers. Shared between the per-tick build and the
/// one-shot encode at freeze time.
pub(super) fn assemble_network_message(
    conn_cfg: &ConnectionConfig,
    group: &WriterGroup,
    data_sets: &[PublishedDataSet],
    variables: &VariableStore,
) -> Result<NetworkMessage> {
    let mask = group.cfg.message_mask;
    if mask.contains(NetworkMessageContentMask::PROMOTED_FIELDS) {
        return Err(PubSubError::NotSupported("promoted fields".into()));
    }

    let mut nm = NetworkMessage::default();
    if mask.contains(NetworkMessageContentMask::PUBLISHER_ID) {
        nm.publisher_id = Some(conn_cfg.publisher_id);
    }
    if mask.contains(NetworkMessageContentMask::GROUP_HEADER) {
        nm.group_header = Some(GroupHeader {
            writer_group_id: mask
                .contains(NetworkMessageContentMask::WRITER_GROUP_ID)
                .then_some(group.cfg.writer_group_id),
            group_version: mask
                .contains(NetworkMessageContentMask::GROUP_VERSION)
                .then_some(group.cfg.group_version),
            network_message_number: mask
                .contains(NetworkMessageContentMask::NETWORK_MESSAGE_NUMBER)
                .then_some(1),
            sequence_number: mask
                .contains(NetworkMessageContentMask::SEQUENCE_NUMBER)
                .then_some(group.sequence_number),
        });
    }
    if mask.contains(NetworkMessageContentMask::TIMESTAMP) {
        nm.timestamp = Some(datetime_now());
    }
    if mask.contains(NetworkMessageContentMask::PICOSECONDS) {
        nm.picoseconds = Some(0);
    }
    if mask.contains(NetworkMessageContentMask::DATASET_CLASS_ID) {
        nm.dataset_class_id = Some(group.cfg.dataset_class_id.ok_or_else(|| {
            PubSubError::Configuration(
                "dataset class id requested by the content mask but not configured".into(),
            )
        })?);
    }

    let mut writer_ids = Vec::new();
    for writer in group.writers.iter().filter(|w| w.cfg.enabled) {
        let data_set = data_sets
            .iter()
            .find(|d| d.id == writer.cfg.data_set)
            .ok_or_else(|| {
                PubSubError::Configuration(
                    "writer references a removed published data set".into(),
                )
            })?;
        nm.messages
            .push(build_data_set_message(writer, data_set, variables)?);
        writer_ids.push(writer.cfg.data_set_writer_id);
    }
    if mask.contains(NetworkMessageContentMask::PAYLOAD_HEADER) {
        nm.payload_header = Some(writer_ids);
    }

    Ok(nm)
}

fn build_data_set_message(
    writer: &DataSetWriter,
    data_set: &PublishedDataSet,
    variables: &VariableStore,
) -> Result<DataSetMessage> {
    let mask = writer.cfg.message_mask;
    let header = DataSetMessageHeader {
        valid: true,
        field_encoding: writer.cfg.field_encoding,
        sequence_number: mask
            .contains(DataSetMessageContentMask::SEQUENCE_NUMBER)
            .then_some(writer.sequence_number),
        timestamp: mask
            .contains(DataSetMessageContentMask::TIMESTAMP)
            .then(datetime_now),
        picoseconds: mask
            .contains(DataSetMessageContentMask::PICOSECONDS)
            .then_some(0),
        status: mask.contains(DataSetMessageContentMask::STATUS).then_some(0),
        config_major_version: mask
            .contains(DataSetMessageContentMask::MAJOR_VERSION)
            .then_some(data_set.cfg.config_version.major),
        config_minor_version: mask
            .contains(DataSetMessageContentMask::MINOR_VERSION)
            .then_some(data_set.cfg.config_version.minor),
    };

    // A writer over an empty dataset announces liveness instead of data.
    if data_set.fields.is_empty() {
        return Ok(DataSetMessage {
            header,
            body: DataSetMessageBody::KeepAlive,
        });
    }

    let mut fields = Vec::with_capacity(data_set.fields.len());
    for field in &data_set.fields {
        let value = match &field.source {
            FieldSource::Static(cell) => cell.borrow().value.clone(),
            FieldSource::Node(node) => variables.read(*node)?.value,
        };
        fields.push(value);
    }

    Ok(DataSetMessage {
        header,
        body: DataSetMessageBody::KeyFrame { fields },
    })
}
