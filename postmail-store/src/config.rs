use std::time::Duration;

use serde::Deserialize;

/// Behaviour of the in-memory queue.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// How long a claimed but unacknowledged entry stays invisible to other
    /// consumers before it can be claimed again.
    ///
    /// Default: 60 seconds
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
}

const fn default_visibility_timeout_secs() -> u64 {
    60
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: default_visibility_timeout_secs(),
        }
    }
}

impl QueueConfig {
    #[must_use]
    pub const fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }
}
