use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Contents of a lease file: who holds which endpoint slot, since when, and
/// for what.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseDescriptor {
    pub endpoint: String,
    pub slot: u32,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub purpose: String,
}

impl LeaseDescriptor {
    /// Descriptor for a lease taken now by the current process.
    pub fn new(endpoint: impl Into<String>, slot: u32, purpose: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            slot,
            pid: std::process::id(),
            acquired_at: Utc::now(),
            purpose: purpose.into(),
        }
    }

    pub fn is_own(&self) -> bool {
        self.pid == std::process::id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_json_has_expected_fields() {
        let descriptor = LeaseDescriptor::new("gpu-a", 1, "deduped:job-1");
        let value: serde_json::Value = serde_json::to_value(&descriptor).unwrap();

        assert_eq!(value["endpoint"], "gpu-a");
        assert_eq!(value["slot"], 1);
        assert_eq!(value["pid"], std::process::id());
        assert_eq!(value["purpose"], "deduped:job-1");
        assert!(value["acquired_at"].is_string());
        assert!(descriptor.is_own());
    }
}
