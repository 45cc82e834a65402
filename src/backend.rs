//! Value backends: how a variable node binds to storage.
//!
//! The internal backend owns its value and copies on access. The external
//! backend is the zero-copy path: the value lives in a caller-owned shared
//! cell the engine reads or writes directly once per cycle, with optional
//! notification callbacks on either direction. Swapping the whole
//! `DataValue` through the cell is the supported way for the application to
//! update a published value; the engine never observes a half-written one
//! because every access goes through a single borrow.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use tracing::trace;

use crate::error::{PubSubError, Result};
use crate::types::{DataValue, NodeId};

/// Caller-owned storage cell of an external backend.
pub type ExternalCell = Rc<RefCell<DataValue>>;

/// Invoked after the engine writes a new value into an external cell.
pub type WriteNotify = Rc<dyn Fn(NodeId, &DataValue)>;

/// Invoked before the engine reads an external cell.
pub type ReadNotify = Rc<dyn Fn(NodeId)>;

#[derive(Clone)]
pub struct ExternalValue {
    pub cell: ExternalCell,
    pub on_write: Option<WriteNotify>,
    pub on_read: Option<ReadNotify>,
}

impl ExternalValue {
    pub fn new(cell: ExternalCell) -> Self {
        Self {
            cell,
            on_write: None,
            on_read: None,
        }
    }

    pub fn with_write_notify(mut self, notify: WriteNotify) -> Self {
        self.on_write = Some(notify);
        self
    }

    pub fn with_read_notify(mut self, notify: ReadNotify) -> Self {
        self.on_read = Some(notify);
        self
    }
}

impl std::fmt::Debug for ExternalValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalValue")
            .field("cell", &self.cell)
            .field("on_write", &self.on_write.is_some())
            .field("on_read", &self.on_read.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum ValueBackend {
    /// The store owns the value; reads and writes copy.
    Internal(DataValue),
    /// The application owns the value; the engine accesses it in place.
    External(ExternalValue),
}

impl ValueBackend {
    pub fn internal(value: DataValue) -> Self {
        ValueBackend::Internal(value)
    }

    pub fn external(external: ExternalValue) -> Self {
        ValueBackend::External(external)
    }

    pub fn is_external(&self) -> bool {
        matches!(self, ValueBackend::External(_))
    }
}

/// The minimal slice of an address space the data plane needs: variable
/// nodes with a value backend each.
#[derive(Debug, Default)]
pub struct VariableStore {
    nodes: BTreeMap<NodeId, ValueBackend>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, node: NodeId, backend: ValueBackend) -> Result<()> {
        if self.nodes.contains_key(&node) {
            return Err(PubSubError::InvalidArgument(format!(
                "node {node:?} is already registered"
            )));
        }
        self.nodes.insert(node, backend);
        Ok(())
    }

    pub fn unregister(&mut self, node: NodeId) -> Result<()> {
        self.nodes
            .remove(&node)
            .map(|_| ())
            .ok_or_else(|| PubSubError::InvalidArgument(format!("unknown node {node:?}")))
    }

    pub fn backend(&self, node: NodeId) -> Option<&ValueBackend> {
        self.nodes.get(&node)
    }

    /// Read the current value. Fires the read notification of an external
    /// backend first, so the application can refresh the cell.
    pub fn read(&self, node: NodeId) -> Result<DataValue> {
        match self.nodes.get(&node) {
            Some(ValueBackend::Internal(value)) => Ok(value.clone()),
            Some(ValueBackend::External(ext)) => {
                if let Some(on_read) = &ext.on_read {
                    on_read(node);
                }
                Ok(ext.cell.borrow().clone())
            }
            None => Err(PubSubError::InvalidArgument(format!(
                "unknown node {node:?}"
            ))),
        }
    }

    /// Replace the current value. Fires the write notification of an
    /// external backend after the cell is updated.
    pub fn write(&mut self, node: NodeId, value: DataValue) -> Result<()> {
        match self.nodes.get_mut(&node) {
            Some(ValueBackend::Internal(stored)) => {
                *stored = value;
                Ok(())
            }
            Some(ValueBackend::External(ext)) => {
                *ext.cell.borrow_mut() = value;
                trace!(?node, "external value updated");
                if let Some(on_write) = &ext.on_write {
                    let current = ext.cell.borrow();
                    on_write(node, &current);
                }
                Ok(())
            }
            None => Err(PubSubError::InvalidArgument(format!(
                "unknown node {node:?}"
            ))),
        }
    }

    /// The external binding of a node, for callers that patch the cell
    /// directly (the frozen subscriber path).
    pub(crate) fn external(&self, node: NodeId) -> Result<&ExternalValue> {
        match self.nodes.get(&node) {
            Some(ValueBackend::External(ext)) => Ok(ext),
            Some(ValueBackend::Internal(_)) => Err(PubSubError::Configuration(format!(
                "node {node:?} does not use an external value backend"
            ))),
            None => Err(PubSubError::InvalidArgument(format!(
                "unknown node {node:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Variant;
    use std::cell::Cell;

    #[test]
    fn test_internal_backend_copies() {
        let mut store = VariableStore::new();
        let node = NodeId(1);
        store
            .register(node, ValueBackend::internal(DataValue::new(Variant::UInt32(5))))
            .unwrap();

        store
            .write(node, DataValue::new(Variant::UInt32(6)))
            .unwrap();
        assert_eq!(store.read(node).unwrap().value, Variant::UInt32(6));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut store = VariableStore::new();
        let node = NodeId(1);
        store
            .register(node, ValueBackend::internal(DataValue::new(Variant::Byte(0))))
            .unwrap();
        let err = store
            .register(node, ValueBackend::internal(DataValue::new(Variant::Byte(0))))
            .unwrap_err();
        assert!(matches!(err, PubSubError::InvalidArgument(_)));
    }

    #[test]
    fn test_external_backend_shares_the_cell() {
        let mut store = VariableStore::new();
        let node = NodeId(7);
        let cell: ExternalCell = Rc::new(RefCell::new(DataValue::new(Variant::UInt32(0))));
        store
            .register(node, ValueBackend::external(ExternalValue::new(cell.clone())))
            .unwrap();

        // The application swaps the value; the store sees it immediately.
        *cell.borrow_mut() = DataValue::new(Variant::UInt32(42));
        assert_eq!(store.read(node).unwrap().value, Variant::UInt32(42));

        // The store writes; the application's cell holds the new value.
        store
            .write(node, DataValue::new(Variant::UInt32(43)))
            .unwrap();
        assert_eq!(cell.borrow().value, Variant::UInt32(43));
    }

    #[test]
    fn test_external_callbacks_fire() {
        let mut store = VariableStore::new();
        let node = NodeId(9);
        let cell: ExternalCell = Rc::new(RefCell::new(DataValue::new(Variant::Double(0.0))));

        let writes = Rc::new(Cell::new(0u32));
        let reads = Rc::new(Cell::new(0u32));
        let w = writes.clone();
        let r = reads.clone();

        let backend = ExternalValue::new(cell)
            .with_write_notify(Rc::new(move |_, _| w.set(w.get() + 1)))
            .with_read_notify(Rc::new(move |_| r.set(r.get() + 1)));
        store.register(node, ValueBackend::external(backend)).unwrap();

        store.read(node).unwrap();
        assert_eq!((reads.get(), writes.get()), (1, 0));

        store
            .write(node, DataValue::new(Variant::Double(1.0)))
            .unwrap();
        assert_eq!((reads.get(), writes.get()), (1, 1));
    }

    #[test]
    fn test_external_accessor_rejects_internal_backend() {
        let mut store = VariableStore::new();
        let node = NodeId(3);
        store
            .register(node, ValueBackend::internal(DataValue::new(Variant::Byte(1))))
            .unwrap();
        let err = store.external(node).unwrap_err();
        assert!(matches!(err, PubSubError::Configuration(_)));
    }
}
