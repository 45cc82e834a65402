//! Realtime freeze engine.
//!
//! Freezing validates that a group's messages have a byte layout that is
//! fully known ahead of time, encodes the canonical message once and keeps
//! the resulting buffer plus patch offsets. From then on the periodic path
//! only patches; configuration mutations are rejected until the group is
//! unfrozen.

use bytes::BytesMut;
use tracing::info;

use crate::backend::{ExternalCell, VariableStore};
use crate::error::{PubSubError, Result};
use crate::types::Variant;
use crate::uadp::codec;
use crate::uadp::message::{
    DataSetMessage, DataSetMessageBody, DataSetMessageHeader, FieldEncoding,
};
use crate::uadp::{DataSetMessageContentMask, NetworkMessageContentMask, OffsetBuffer};

use super::config::{DataSetReaderConfig, FieldSource, RtLevel};
use super::publisher::assemble_network_message;
use super::{
    FrozenReader, FrozenWriterGroup, PubSub, ReaderGroupId, WriterGroupId, WriterId,
};

const RT_UNSUPPORTED_MASKS: &str =
    "timestamps and picoseconds cannot be patched in a frozen buffer";

impl PubSub {
    /// Freeze a fixed-size realtime writer group. Idempotent on an already
    /// frozen group.
    pub fn freeze_writer_group(&mut self, id: WriterGroupId) -> Result<()> {
        let (ci, gi) = self.writer_group_position(id)?;

        let sources: Vec<(WriterId, Vec<ExternalCell>)> = {
            let group = &self.connections[ci].writer_groups[gi];
            if group.frozen.is_some() {
                return Ok(());
            }
            if group.cfg.rt_level != RtLevel::FixedSize {
                return Err(PubSubError::Configuration(
                    "writer group is not configured for fixed-size realtime".into(),
                ));
            }
            if group.cfg.message_mask.intersects(
                NetworkMessageContentMask::TIMESTAMP | NetworkMessageContentMask::PICOSECONDS,
            ) {
                return Err(PubSubError::NotSupported(RT_UNSUPPORTED_MASKS.into()));
            }
            if !group.writers.iter().any(|w| w.cfg.enabled) {
                return Err(PubSubError::Configuration(
                    "realtime writer group has no enabled writers".into(),
                ));
            }

            let mut sources = Vec::new();
            for writer in group.writers.iter().filter(|w| w.cfg.enabled) {
                if writer.cfg.field_encoding != FieldEncoding::RawData {
                    return Err(PubSubError::NotSupported(
                        "realtime writers require raw-data field encoding".into(),
                    ));
                }
                if writer.cfg.message_mask.intersects(
                    DataSetMessageContentMask::TIMESTAMP | DataSetMessageContentMask::PICOSECONDS,
                ) {
                    return Err(PubSubError::NotSupported(RT_UNSUPPORTED_MASKS.into()));
                }
                let data_set = self
                    .data_sets
                    .iter()
                    .find(|d| d.id == writer.cfg.data_set)
                    .ok_or_else(|| {
                        PubSubError::Configuration(
                            "writer references a removed published data set".into(),
                        )
                    })?;

                let mut cells = Vec::with_capacity(data_set.fields.len());
                for field in &data_set.fields {
                    let cell = match &field.source {
                        FieldSource::Static(cell) => cell.clone(),
                        FieldSource::Node(_) => {
                            return Err(PubSubError::Configuration(format!(
                                "field '{}' has a dynamic node source; realtime fields \
                                 require a static value source",
                                field.alias
                            )))
                        }
                    };
                    let ty = cell.borrow().value.built_in_type();
                    if !ty.rt_patchable() {
                        return Err(PubSubError::NotSupported(format!(
                            "{ty:?} fields cannot be published from a frozen buffer"
                        )));
                    }
                    cells.push(cell);
                }
                sources.push((writer.id, cells));
            }
            sources
        };

        let connection = &self.connections[ci];
        let group = &connection.writer_groups[gi];
        let nm = assemble_network_message(&connection.cfg, group, &self.data_sets, &self.variables)?;
        let mut buf = BytesMut::new();
        let table = codec::compute_offsets(&nm, &mut buf)?;

        info!(group = ?id, bytes = buf.len(), patch_sites = table.entries.len(),
              "writer group frozen");
        self.connections[ci].writer_groups[gi].frozen = Some(FrozenWriterGroup {
            buffer: OffsetBuffer::new(buf, table),
            writers: sources,
        });
        Ok(())
    }

    /// Release a writer group's frozen state. Succeeds, and is a no-op, on
    /// a group that is not frozen.
    pub fn unfreeze_writer_group(&mut self, id: WriterGroupId) -> Result<()> {
        let (ci, gi) = self.writer_group_position(id)?;
        self.connections[ci].writer_groups[gi].frozen = None;
        Ok(())
    }

    /// Freeze a fixed-size realtime reader group. At most one reader per
    /// group is supported under realtime. Idempotent on a frozen group.
    pub fn freeze_reader_group(&mut self, id: ReaderGroupId) -> Result<()> {
        let (ci, gi) = self.reader_group_position(id)?;

        let frozen_reader = {
            let group = &self.connections[ci].reader_groups[gi];
            if group.frozen {
                return Ok(());
            }
            if group.cfg.rt_level != RtLevel::FixedSize {
                return Err(PubSubError::Configuration(
                    "reader group is not configured for fixed-size realtime".into(),
                ));
            }
            if group.readers.len() > 1 {
                return Err(PubSubError::NotImplemented(
                    "multiple data set readers in a realtime reader group",
                ));
            }
            match group.readers.first() {
                Some(reader) => Some(build_frozen_reader(&reader.cfg, &self.variables)?),
                None => None,
            }
        };

        let group = &mut self.connections[ci].reader_groups[gi];
        if let Some(frozen) = frozen_reader {
            info!(group = ?id, message_len = frozen.message_len, "reader group frozen");
            group.readers[0].frozen = Some(frozen);
        }
        group.frozen = true;
        Ok(())
    }

    /// Release a reader group's frozen state. Succeeds, and is a no-op, on
    /// a group that is not frozen.
    pub fn unfreeze_reader_group(&mut self, id: ReaderGroupId) -> Result<()> {
        let (ci, gi) = self.reader_group_position(id)?;
        let group = &mut self.connections[ci].reader_groups[gi];
        for reader in &mut group.readers {
            reader.frozen = None;
        }
        group.frozen = false;
        Ok(())
    }
}

/// Validate a reader's realtime preconditions and synthesize the byte
/// layout of the one DataSetMessage it expects. Offsets are relative to
/// the message start, so the reader works no matter how many sibling
/// messages share the received NetworkMessage.
fn build_frozen_reader(
    cfg: &DataSetReaderConfig,
    variables: &VariableStore,
) -> Result<FrozenReader> {
    if cfg.field_encoding != FieldEncoding::RawData {
        return Err(PubSubError::NotSupported(
            "realtime readers require raw-data field encoding".into(),
        ));
    }
    // Matching needs all three key fields on the wire.
    let required = NetworkMessageContentMask::PUBLISHER_ID
        | NetworkMessageContentMask::GROUP_HEADER
        | NetworkMessageContentMask::WRITER_GROUP_ID
        | NetworkMessageContentMask::PAYLOAD_HEADER;
    if !cfg.message_mask.contains(required) {
        return Err(PubSubError::Configuration(
            "realtime matching requires publisher id, writer group id and payload header \
             in the expected messages"
                .into(),
        ));
    }
    if cfg.message_mask.intersects(
        NetworkMessageContentMask::TIMESTAMP | NetworkMessageContentMask::PICOSECONDS,
    ) || cfg.dataset_mask.intersects(
        DataSetMessageContentMask::TIMESTAMP | DataSetMessageContentMask::PICOSECONDS,
    ) {
        return Err(PubSubError::NotSupported(RT_UNSUPPORTED_MASKS.into()));
    }

    let mut placeholders = Vec::with_capacity(cfg.metadata.fields.len());
    for field in &cfg.metadata.fields {
        let ty = field.built_in_type;
        if !ty.rt_patchable() {
            return Err(PubSubError::NotSupported(format!(
                "{ty:?} fields cannot be received into a frozen buffer"
            )));
        }
        placeholders.push(Variant::zero(ty));
    }

    let mut targets = Vec::with_capacity(cfg.targets.len());
    for target in &cfg.targets {
        let external = variables.external(target.node)?;
        targets.push((target.node, external.cell.clone(), external.on_write.clone()));
    }

    let dsm = DataSetMessage {
        header: DataSetMessageHeader {
            valid: true,
            field_encoding: FieldEncoding::RawData,
            sequence_number: cfg
                .dataset_mask
                .contains(DataSetMessageContentMask::SEQUENCE_NUMBER)
                .then_some(0),
            timestamp: None,
            picoseconds: None,
            status: cfg
                .dataset_mask
                .contains(DataSetMessageContentMask::STATUS)
                .then_some(0),
            config_major_version: cfg
                .dataset_mask
                .contains(DataSetMessageContentMask::MAJOR_VERSION)
                .then_some(0),
            config_minor_version: cfg
                .dataset_mask
                .contains(DataSetMessageContentMask::MINOR_VERSION)
                .then_some(0),
        },
        body: DataSetMessageBody::KeyFrame {
            fields: placeholders,
        },
    };

    let mut buf = BytesMut::new();
    let table = codec::compute_data_set_offsets(&dsm, &mut buf)?;
    Ok(FrozenReader {
        message_len: buf.len(),
        table,
        targets,
    })
}
