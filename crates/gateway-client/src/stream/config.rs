//! Subscription configuration.

use std::time::Duration;

/// Configuration for one push-stream subscription.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Stream endpoint URL.
    pub url: String,
    /// Fixed delay before each automatic reconnection.
    pub reconnect_interval: Duration,
    /// Automatic reconnections allowed before the subscription closes.
    pub max_reconnect_attempts: u32,
    /// Capacity of the command channel.
    pub command_channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            reconnect_interval: Duration::from_secs(3),
            max_reconnect_attempts: 5,
            command_channel_capacity: 64,
        }
    }
}

impl StreamConfig {
    /// Create a new configuration with the given URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Configuration for the progress stream of task `task_id`.
    #[must_use]
    pub fn for_task(base_url: &str, task_id: &str) -> Self {
        Self::new(format!(
            "{}/tasks/{task_id}/stream",
            base_url.trim_end_matches('/')
        ))
    }

    /// Set the reconnection delay.
    #[must_use]
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Set the maximum automatic reconnection attempts.
    #[must_use]
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Set the command channel capacity.
    #[must_use]
    pub fn command_channel_capacity(mut self, capacity: usize) -> Self {
        self.command_channel_capacity = capacity;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error message string if any field has an invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("URL cannot be empty".to_string());
        }
        if self.reconnect_interval.is_zero() {
            return Err("Reconnect interval must be > 0".to_string());
        }
        if self.command_channel_capacity == 0 {
            return Err("Command channel capacity must be > 0".to_string());
        }
        Ok(())
    }
}
