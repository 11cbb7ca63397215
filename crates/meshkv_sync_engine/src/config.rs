//! Configuration for the sync engine.

use meshkv_sync_protocol::DeviceId;
use std::time::Duration;

/// Packet-size budget for one page of sync data.
///
/// Pagination stops as soon as the serialized bytes exceed `block_size` or
/// the item count reaches `packet_size`, whichever comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataSizeSpec {
    /// Serialized byte budget per packet.
    pub block_size: usize,
    /// Item count cap per packet.
    pub packet_size: usize,
}

impl Default for DataSizeSpec {
    fn default() -> Self {
        Self {
            block_size: 1024 * 1024,
            packet_size: 100,
        }
    }
}

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Identity of the local device.
    pub device_id: DeviceId,
    /// Protocol version stamped on outgoing packets.
    pub protocol_version: u32,
    /// Software version advertised during the ability handshake.
    pub software_version: u32,
    /// Packet paging budget.
    pub data_size: DataSizeSpec,
    /// Items whose serialized value exceeds this are dropped from batches.
    pub max_value_size: usize,
    /// Window size for peers on a windowed protocol version.
    pub high_version_window_size: u32,
    /// Window size for peers on the base protocol version.
    pub low_version_window_size: u32,
    /// How long to wait for an ack before resending.
    pub ack_timeout: Duration,
    /// Retry policy for transient failures.
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Creates a configuration for the given device.
    pub fn new(device_id: impl Into<DeviceId>) -> Self {
        Self {
            device_id: device_id.into(),
            protocol_version: meshkv_sync_protocol::PROTOCOL_VERSION_CURRENT,
            software_version: 1,
            data_size: DataSizeSpec::default(),
            max_value_size: 4 * 1024 * 1024,
            high_version_window_size: 3,
            low_version_window_size: 1,
            ack_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }

    /// Sets the paging budget.
    pub fn with_data_size(mut self, spec: DataSizeSpec) -> Self {
        self.data_size = spec;
        self
    }

    /// Sets the oversized-value cutoff.
    pub fn with_max_value_size(mut self, size: usize) -> Self {
        self.max_value_size = size;
        self
    }

    /// Sets the ack timeout.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the sliding-window size for a peer protocol version.
    pub fn window_size_for(&self, peer_version: u32) -> u32 {
        if peer_version >= meshkv_sync_protocol::PROTOCOL_VERSION_WINDOWED {
            self.high_version_window_size
        } else {
            self.low_version_window_size
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("")
    }
}

/// Retry policy for transient failures within one task.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts per round, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
    /// Multiplier applied per retry.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Creates a retry policy.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }

    /// Creates a policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Sets the first-retry delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the delay cap.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        Duration::from_secs_f64(base.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
