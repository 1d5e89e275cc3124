//! Error sink for errors that are swallowed locally
//!
//! Background reader and accept tasks cannot return their errors to anyone,
//! so they report them here and keep going. The sink is handed to sockets
//! and the looper at construction time.

use std::{error::Error, sync::Arc};

use parking_lot::Mutex;
use tracing::warn;

pub trait ErrorSink: Send + Sync {
    fn err_in(&self, err: &dyn Error, context: &str);
}

pub type SharedSink = Arc<dyn ErrorSink>;

/// Forwards every error to `tracing` at warn level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ErrorSink for TracingSink {
    fn err_in(&self, err: &dyn Error, context: &str) {
        warn!(context, error = %err, "Swallowed error");
    }
}

/// Keeps `"context: error"` lines in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    entries: Mutex<Vec<String>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl ErrorSink for CollectingSink {
    fn err_in(&self, err: &dyn Error, context: &str) {
        self.entries.lock().push(format!("{}: {}", context, err));
    }
}

pub fn tracing_sink() -> SharedSink {
    Arc::new(TracingSink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;

    #[test]
    fn test_collecting_sink_records_context() {
        let sink = CollectingSink::new();
        sink.err_in(&TransportError::Closed, "subscriber reader");
        assert_eq!(sink.entries(), vec!["subscriber reader: socket is closed"]);
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_tracing_sink_is_object_safe() {
        let sink: SharedSink = tracing_sink();
        sink.err_in(&TransportError::NoPeers, "sender");
    }
}
