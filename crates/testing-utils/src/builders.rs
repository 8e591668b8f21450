//! Test data builders

use chrono::{DateTime, Utc};
use taskgate_core::{CapabilityCatalog, CapabilitySet, Task};

/// Builder for creating test Task entities
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new() -> Self {
        Self {
            task: Task::with_id(
                "task-1",
                CapabilitySet::new(),
                "default",
                serde_json::json!({}),
            ),
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.task.id = id.to_string();
        self
    }

    /// 通过目录解析能力标签，未声明的标签直接 panic
    pub fn with_capabilities(mut self, catalog: &CapabilityCatalog, tags: &[&str]) -> Self {
        self.task.required_capabilities = catalog
            .parse_set(tags)
            .expect("test capabilities must be declared in the catalog");
        self
    }

    pub fn with_capability_set(mut self, capabilities: CapabilitySet) -> Self {
        self.task.required_capabilities = capabilities;
        self
    }

    pub fn with_resource_key(mut self, resource_key: &str) -> Self {
        self.task.resource_key = resource_key.to_string();
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.task.payload = payload;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.task.attempts = attempts;
        self
    }

    pub fn with_submitted_at(mut self, submitted_at: DateTime<Utc>) -> Self {
        self.task.submitted_at = submitted_at;
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}
