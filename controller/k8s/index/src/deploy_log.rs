use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;

/// The outcome of one configuration push to one data-plane instance.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRecord {
    pub timestamp: DateTime<Utc>,
    pub pod_name: String,
    pub pod_ip: String,
    pub success: bool,
    pub message: String,
}

/// A bounded ring buffer of deploy outcomes, drop-oldest.
#[derive(Debug)]
pub struct DeployLog {
    capacity: usize,
    entries: Mutex<VecDeque<DeployRecord>>,
}

// === impl DeployLog ===

impl DeployLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn append(&self, record: DeployRecord) {
        let mut entries = self.entries.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(record);
    }

    pub fn log_deploy(
        &self,
        pod_name: impl ToString,
        pod_ip: impl ToString,
        success: bool,
        message: impl ToString,
    ) {
        self.append(DeployRecord {
            timestamp: Utc::now(),
            pod_name: pod_name.to_string(),
            pod_ip: pod_ip.to_string(),
            success,
            message: message.to_string(),
        });
    }

    pub fn snapshot(&self) -> Vec<DeployRecord> {
        self.entries.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_oldest_at_capacity() {
        let log = DeployLog::new(3);
        for i in 0..5 {
            log.log_deploy(format!("pod-{}", i), "10.0.0.1", true, "");
        }

        let entries = log.snapshot();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].pod_name, "pod-2");
        assert_eq!(entries[2].pod_name, "pod-4");
    }

    #[test]
    fn snapshot_preserves_order_and_outcome() {
        let log = DeployLog::new(10);
        log.log_deploy("pod-a", "10.0.0.1", true, "");
        log.log_deploy("pod-b", "10.0.0.2", false, "received non-ok response code: 500");

        let entries = log.snapshot();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].success);
        assert!(!entries[1].success);
        assert_eq!(entries[1].message, "received non-ok response code: 500");
    }
}
