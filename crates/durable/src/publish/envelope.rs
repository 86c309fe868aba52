//! Wire envelope for orchestration results

use uuid::Uuid;

/// A terminal output on its way to the broker
///
/// The payload is the UTF-8 JSON encoding of the output, sent without key or
/// headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishEnvelope {
    pub instance_id: Uuid,
    pub payload: Vec<u8>,
    /// Set once the broker acknowledged the send
    pub acknowledged: bool,
}

impl PublishEnvelope {
    /// Serialize `output` for publishing
    pub fn new(instance_id: Uuid, output: &serde_json::Value) -> Result<Self, serde_json::Error> {
        Ok(Self {
            instance_id,
            payload: serde_json::to_vec(output)?,
            acknowledged: false,
        })
    }

    pub fn acknowledge(&mut self) {
        self.acknowledged = true;
    }
}
