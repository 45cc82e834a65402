//! Subscriber pipeline: decode received buffers and update target
//! variables.

use std::time::Duration;

use tracing::{trace, warn};

use crate::backend::VariableStore;
use crate::error::{PubSubError, Result};
use crate::types::DataValue;
use crate::uadp::codec;
use crate::uadp::message::{DataSetMessageBody, NetworkMessage};
use crate::uadp::offsets::{read_scalar_at, OffsetKind};

use super::{ConnectionId, DataSetReader, PubSub, ReaderGroup};

impl PubSub {
    /// Pull pending buffers from the connection's channel and dispatch each
    /// one. Malformed messages are logged and dropped; the subscriber keeps
    /// running. Returns the number of buffers that decoded cleanly.
    pub fn receive_tick(&mut self, connection: ConnectionId, timeout: Duration) -> Result<usize> {
        let index = self.connection_index(connection)?;
        let mut buffers: Vec<Vec<u8>> = Vec::new();
        self.connections[index]
            .channel
            .receive(timeout, &mut |b| buffers.push(b.to_vec()))?;

        let mut dispatched = 0;
        for buffer in &buffers {
            match self.process_network_message(connection, buffer) {
                Ok(()) => dispatched += 1,
                Err(e) => warn!(error = %e, "dropping malformed network message"),
            }
        }
        Ok(dispatched)
    }

    /// Decode one received NetworkMessage and hand each payload message to
    /// the first matching reader on the connection. A payload message
    /// nothing matches is dropped without error.
    pub fn process_network_message(&mut self, connection: ConnectionId, buf: &[u8]) -> Result<()> {
        let index = self.connection_index(connection)?;
        let Self {
            connections,
            variables,
            ..
        } = self;
        let conn = &mut connections[index];

        let mut pos = 0;
        let header = codec::decode_header(buf, &mut pos)?;
        let count = header.message_count();

        for i in 0..count {
            if pos >= buf.len() {
                return Err(PubSubError::MalformedPayload(
                    "fewer payload messages than announced in the payload header",
                ));
            }
            let end = match &header.payload_sizes {
                Some(sizes) => pos + sizes[i] as usize,
                None => buf.len(),
            };
            let writer_id = header
                .nm
                .payload_header
                .as_ref()
                .and_then(|ids| ids.get(i).copied());

            match find_reader(&mut conn.reader_groups, &header.nm, writer_id) {
                Some(reader) => {
                    if let Err(e) = dispatch(reader, &buf[pos..end], variables) {
                        reader.drops += 1;
                        warn!(reader = ?reader.id, error = %e, "reader dropped a payload message");
                    }
                }
                None => {
                    trace!(?writer_id, "no matching reader, payload message dropped");
                }
            }
            pos = end;
        }
        Ok(())
    }
}

/// First matching reader wins; the scan order is group registration order,
/// then reader registration order, so the choice is stable across runs.
fn find_reader<'a>(
    groups: &'a mut [ReaderGroup],
    nm: &NetworkMessage,
    writer_id: Option<u16>,
) -> Option<&'a mut DataSetReader> {
    let (gi, ri) = groups.iter().enumerate().find_map(|(gi, group)| {
        group
            .readers
            .iter()
            .position(|r| reader_matches(r, nm, writer_id))
            .map(|ri| (gi, ri))
    })?;
    Some(&mut groups[gi].readers[ri])
}

/// Match iff publisher id, writer group id and dataSetWriterId all agree.
/// A header that omits any of the three matches nothing.
fn reader_matches(reader: &DataSetReader, nm: &NetworkMessage, writer_id: Option<u16>) -> bool {
    nm.publisher_id == Some(reader.cfg.publisher_id)
        && nm.group_header.as_ref().and_then(|g| g.writer_group_id)
            == Some(reader.cfg.writer_group_id)
        && writer_id == Some(reader.cfg.data_set_writer_id)
}

/// Apply one payload message to a reader. `message` spans exactly the
/// DataSetMessage's bytes within the received buffer.
fn dispatch(
    reader: &mut DataSetReader,
    message: &[u8],
    variables: &mut VariableStore,
) -> Result<()> {
    if let Some(frozen) = &reader.frozen {
        // Fixed-offset fast path. The identity already matched; the frozen
        // layout is validated by the message's byte length, then each
        // recorded field range is copied straight into the target's
        // external cell, in field-index order.
        if message.len() != frozen.message_len {
            return Err(PubSubError::MaskMismatch(
                "received message does not match the frozen layout",
            ));
        }
        for entry in &frozen.table.entries {
            let OffsetKind::Field { field, ty, .. } = entry.kind else {
                continue;
            };
            let value = read_scalar_at(message, entry.offset, ty)?;
            let (node, cell, on_write) = &frozen.targets[field];
            cell.borrow_mut().value = value;
            if let Some(on_write) = on_write {
                let current = cell.borrow();
                on_write(*node, &current);
            }
        }
        return Ok(());
    }

    let mut pos = 0;
    let dsm = codec::decode_data_set_message(message, &mut pos, Some(&reader.cfg.metadata))?;
    match dsm.body {
        DataSetMessageBody::KeyFrame { fields } => {
            if fields.len() != reader.cfg.targets.len() {
                return Err(PubSubError::MaskMismatch(
                    "keyframe field count does not match the reader metadata",
                ));
            }
            for (field, value) in fields.into_iter().enumerate() {
                variables.write(reader.cfg.targets[field].node, DataValue::new(value))?;
            }
        }
        DataSetMessageBody::DeltaFrame { fields } => {
            for (index, value) in fields {
                let target = reader.cfg.targets.get(index as usize).ok_or(
                    PubSubError::MalformedPayload("deltaframe field index out of range"),
                )?;
                variables.write(target.node, DataValue::new(value))?;
            }
        }
        DataSetMessageBody::KeepAlive => {
            trace!(reader = ?reader.id, "keepalive received");
        }
    }
    Ok(())
}
