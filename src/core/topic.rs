//! Named in-process notification queues.
//!
//! Controllers push payloads while they work (e.g. "this experiment needs a
//! rebuild") and the caller drains them once the operation is done.

use rustc_hash::FxHashMap;
use serde_json::Value;

#[derive(Debug, Default)]
pub struct Topics {
    queues: FxHashMap<String, Vec<Value>>,
}

impl Topics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, topic: &str, payload: Value) {
        self.queues.entry(topic.to_string()).or_default().push(payload);
    }

    /// Remove and return every payload queued on `topic`, in push order.
    pub fn pop(&mut self, topic: &str) -> Vec<Value> {
        self.queues.remove(topic).unwrap_or_default()
    }

    pub fn is_empty(&self, topic: &str) -> bool {
        self.queues.get(topic).is_none_or(Vec::is_empty)
    }
}
