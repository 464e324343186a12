//! Workflow signals for external communication

use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Message delivered to a named, per-instance signal channel
///
/// Signals are buffered in history as `SignalReceived` events. A workflow
/// that calls `receive` on a channel gets the channel's signals in arrival
/// order, each exactly once, no matter whether they arrived before or after
/// the wait was registered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSignal {
    /// Channel name
    pub channel: String,

    /// Signal payload (JSON)
    pub payload: serde_json::Value,
}

impl WorkflowSignal {
    /// Create a new signal
    pub fn new(channel: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            channel: channel.into(),
            payload,
        }
    }

    /// Decode the payload into a typed value
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Done {
        processed: u32,
    }

    #[test]
    fn test_payload_as() {
        let signal = WorkflowSignal::new("processing_complete", json!({"processed": 5}));

        assert_eq!(signal.channel, "processing_complete");
        assert_eq!(signal.payload_as::<Done>().unwrap(), Done { processed: 5 });
        assert!(signal.payload_as::<String>().is_err());
    }
}
