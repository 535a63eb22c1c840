//! Node-pin queue coupling the reconfigurator and the pod preprocessor
//!
//! Before evicting a pod from a device about to be re-sliced, the
//! reconfigurator records the pod's template hash against the node it ran
//! on. When the replacement pod with the same template hash appears, the
//! preprocessor pops the entry and pins the pod back to that node, so a
//! vertical scale decision survives the reconfiguration.
//!
//! Single writer (reconfigurator), single reader (preprocessor); entries
//! for one template hash drain in FIFO order.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// FIFO queues of node names keyed by pod-template hash
#[derive(Debug, Default)]
pub struct PinQueue {
    queues: Mutex<HashMap<String, VecDeque<String>>>,
}

impl PinQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a node pin for a template hash
    pub fn push(&self, template_hash: impl Into<String>, node: impl Into<String>) {
        let mut queues = self.queues.lock().unwrap();
        queues
            .entry(template_hash.into())
            .or_default()
            .push_back(node.into());
    }

    /// Peek at the oldest pinned node for a template hash
    pub fn first(&self, template_hash: &str) -> Option<String> {
        let queues = self.queues.lock().unwrap();
        queues
            .get(template_hash)
            .and_then(|queue| queue.front().cloned())
    }

    /// Remove and return the oldest pinned node for a template hash.
    /// The key disappears once its queue is empty.
    pub fn pop_first(&self, template_hash: &str) -> Option<String> {
        let mut queues = self.queues.lock().unwrap();
        let queue = queues.get_mut(template_hash)?;
        let node = queue.pop_front();
        if queue.is_empty() {
            queues.remove(template_hash);
        }
        node
    }

    /// Drop every pin recorded for a template hash
    pub fn remove(&self, template_hash: &str) {
        self.queues.lock().unwrap().remove(template_hash);
    }

    /// All template hashes with at least one pending pin
    pub fn keys(&self) -> Vec<String> {
        self.queues.lock().unwrap().keys().cloned().collect()
    }

    /// Whether any pin is pending
    pub fn is_empty(&self) -> bool {
        self.queues.lock().unwrap().is_empty()
    }
}
