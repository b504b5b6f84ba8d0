//! Per-worker registry of downstream connections.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::router::filter::DecoderFilterCallbacks;

/// Downstream connection id -> callbacks, for the worker `thread_id`.
pub struct DownstreamConnectionInfos {
    thread_id: String,
    connections: RefCell<HashMap<String, Rc<dyn DecoderFilterCallbacks>>>,
}

impl DownstreamConnectionInfos {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            connections: RefCell::new(HashMap::new()),
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn insert(&self, connection_id: impl Into<String>, callbacks: Rc<dyn DecoderFilterCallbacks>) {
        self.connections.borrow_mut().insert(connection_id.into(), callbacks);
    }

    pub fn get(&self, connection_id: &str) -> Option<Rc<dyn DecoderFilterCallbacks>> {
        self.connections.borrow().get(connection_id).cloned()
    }

    pub fn remove(&self, connection_id: &str) -> bool {
        self.connections.borrow_mut().remove(connection_id).is_some()
    }

    pub fn size(&self) -> usize {
        self.connections.borrow().len()
    }
}
