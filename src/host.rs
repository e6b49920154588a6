//! Host boundary: UI-facing event channel and progress reporting.

use serde_json::{json, Value};

/// Sink for UI-facing events (`postMessage(type, payload)`)
pub trait EventSink: Send + Sync {
    fn post_message(&self, kind: &str, payload: Value);

    /// Progress for long-running work (`report({message?, percent?})`)
    fn report(&self, message: Option<&str>, percent: Option<f32>) {
        self.post_message(
            "progress",
            json!({
                "message": message,
                "percent": percent,
            }),
        );
    }
}

/// Sink that only logs; used when no host is attached
pub struct LogSink;

impl EventSink for LogSink {
    fn post_message(&self, kind: &str, payload: Value) {
        tracing::debug!("event {}: {}", kind, payload);
    }
}

/// Editor focus hint supplied by the host
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EditorFocus {
    pub path: String,
    /// 1-based inclusive selection, when the host has one
    #[serde(default)]
    pub start_line: Option<usize>,
    #[serde(default)]
    pub end_line: Option<usize>,
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Captures every event for assertions
    #[derive(Default)]
    pub struct RecordingSink {
        pub events: Mutex<Vec<(String, Value)>>,
    }

    impl RecordingSink {
        pub fn kinds(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|(k, _)| k.clone())
                .collect()
        }

        pub fn payloads(&self, kind: &str) -> Vec<Value> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|(k, _)| k == kind)
                .map(|(_, v)| v.clone())
                .collect()
        }
    }

    impl EventSink for RecordingSink {
        fn post_message(&self, kind: &str, payload: Value) {
            self.events.lock().unwrap().push((kind.to_string(), payload));
        }
    }
}
