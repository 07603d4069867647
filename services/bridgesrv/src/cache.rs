//! Live data cache.
//!
//! Single authoritative copy of the most recently observed PLC state.
//! Readers always get an atomic `Snapshot`; they never wait on the bus
//! and never observe a half-applied poll cycle.

use bridge_config::PollingSettings;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

/// Addressable PLC data regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    DiscreteInput,
    Coil,
    HoldingRegister,
}

/// One polled region: contiguous values starting at a fixed offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionValues<T> {
    pub start: u16,
    pub values: Vec<T>,
}

impl<T: Copy + Default> RegionValues<T> {
    fn sized(start: u16, count: u16) -> Self {
        Self {
            start,
            values: vec![T::default(); count as usize],
        }
    }

    /// Value at absolute device offset, `None` outside the polled range.
    pub fn get(&self, offset: u16) -> Option<T> {
        let index = offset.checked_sub(self.start)? as usize;
        self.values.get(index).copied()
    }

    /// Whether the absolute offset falls inside the polled range.
    pub fn covers(&self, offset: u16) -> bool {
        self.get(offset).is_some()
    }

    fn merge(&mut self, start: u16, values: &[T]) {
        for (i, value) in values.iter().enumerate() {
            let offset = start as usize + i;
            let Some(index) = offset.checked_sub(self.start as usize) else {
                continue;
            };
            if let Some(slot) = self.values.get_mut(index) {
                *slot = *value;
            }
        }
    }

    fn set(&mut self, offset: u16, value: T) -> bool {
        let Some(index) = offset.checked_sub(self.start) else {
            return false;
        };
        match self.values.get_mut(index as usize) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }
}

/// Atomic point-in-time copy of the cached PLC state.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub discrete_inputs: RegionValues<bool>,
    pub coils: RegionValues<bool>,
    pub registers: RegionValues<u16>,
    /// Completion time of the poll update this data came from,
    /// `None` until the first successful read
    pub captured_at: Option<DateTime<Utc>>,
    pub connected: bool,
    pub communication_error_count: u64,
}

impl Snapshot {
    /// Age of the cached data in seconds, `None` before the first read.
    pub fn data_age_seconds(&self) -> Option<f64> {
        let captured = self.captured_at?;
        let age = Utc::now().signed_duration_since(captured);
        Some((age.num_milliseconds().max(0) as f64) / 1000.0)
    }

    /// Data is fresh while younger than two poll intervals.
    pub fn is_fresh(&self, poll_interval_ms: u64) -> bool {
        match self.data_age_seconds() {
            Some(age) => age * 1000.0 < (poll_interval_ms * 2) as f64,
            None => false,
        }
    }
}

/// Connection health derived from consecutive poll outcomes.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionHealth {
    pub connected: bool,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub last_success_at: Option<DateTime<Utc>>,
}

struct CacheState {
    discrete_inputs: RegionValues<bool>,
    coils: RegionValues<bool>,
    registers: RegionValues<u16>,
    captured_at: Option<DateTime<Utc>>,
    connected: bool,
    consecutive_failures: u32,
    communication_error_count: u64,
    last_success_at: Option<DateTime<Utc>>,
}

/// Shared cache of PLC state plus connection health accounting.
pub struct LiveCache {
    state: RwLock<CacheState>,
    failure_threshold: u32,
}

impl LiveCache {
    pub fn new(polling: &PollingSettings) -> Self {
        Self {
            state: RwLock::new(CacheState {
                discrete_inputs: RegionValues::sized(
                    polling.discrete_inputs.start,
                    polling.discrete_inputs.count,
                ),
                coils: RegionValues::sized(polling.coils.start, polling.coils.count),
                registers: RegionValues::sized(polling.registers.start, polling.registers.count),
                captured_at: None,
                connected: false,
                consecutive_failures: 0,
                communication_error_count: 0,
                last_success_at: None,
            }),
            failure_threshold: polling.failure_threshold.max(1),
        }
    }

    pub async fn snapshot(&self) -> Snapshot {
        let state = self.state.read().await;
        Snapshot {
            discrete_inputs: state.discrete_inputs.clone(),
            coils: state.coils.clone(),
            registers: state.registers.clone(),
            captured_at: state.captured_at,
            connected: state.connected,
            communication_error_count: state.communication_error_count,
        }
    }

    /// Merge freshly read bit values into a region and stamp the data.
    pub async fn apply_bits(&self, region: Region, start: u16, values: &[bool]) {
        let mut state = self.state.write().await;
        match region {
            Region::DiscreteInput => state.discrete_inputs.merge(start, values),
            Region::Coil => state.coils.merge(start, values),
            Region::HoldingRegister => {
                debug!("Ignoring bit merge into register region");
                return;
            }
        }
        state.captured_at = Some(Utc::now());
    }

    /// Merge freshly read register values and stamp the data.
    pub async fn apply_words(&self, start: u16, values: &[u16]) {
        let mut state = self.state.write().await;
        state.registers.merge(start, values);
        state.captured_at = Some(Utc::now());
    }

    /// Optimistic overlay for a device-acknowledged coil write.
    ///
    /// Makes the new value visible immediately instead of one poll
    /// cycle later. Does not move `captured_at`.
    pub async fn apply_coil_ack(&self, offset: u16, value: bool) {
        let mut state = self.state.write().await;
        if !state.coils.set(offset, value) {
            debug!("Write ack for coil {} outside polled range", offset);
        }
    }

    /// Optimistic overlay for a device-acknowledged register write.
    pub async fn apply_register_ack(&self, offset: u16, value: u16) {
        let mut state = self.state.write().await;
        if !state.registers.set(offset, value) {
            debug!("Write ack for register {} outside polled range", offset);
        }
    }

    /// Coil ack from a script thread (`spawn_blocking` context only).
    pub fn apply_coil_ack_blocking(&self, offset: u16, value: bool) {
        let mut state = self.state.blocking_write();
        if !state.coils.set(offset, value) {
            debug!("Write ack for coil {} outside polled range", offset);
        }
    }

    /// Register ack from a script thread (`spawn_blocking` context only).
    pub fn apply_register_ack_blocking(&self, offset: u16, value: u16) {
        let mut state = self.state.blocking_write();
        if !state.registers.set(offset, value) {
            debug!("Write ack for register {} outside polled range", offset);
        }
    }

    /// Record a fully successful poll cycle.
    pub async fn record_success(&self) {
        let mut state = self.state.write().await;
        state.consecutive_failures = 0;
        state.connected = true;
        state.last_success_at = Some(Utc::now());
    }

    /// Record a failed poll cycle; flips `connected` at the threshold.
    pub async fn record_failure(&self) {
        let mut state = self.state.write().await;
        state.consecutive_failures += 1;
        state.communication_error_count += 1;
        if state.consecutive_failures >= self.failure_threshold {
            state.connected = false;
        }
    }

    pub async fn health(&self) -> ConnectionHealth {
        let state = self.state.read().await;
        ConnectionHealth {
            connected: state.connected,
            consecutive_failures: state.consecutive_failures,
            failure_threshold: self.failure_threshold,
            last_success_at: state.last_success_at,
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.state.read().await.connected
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use bridge_config::RegionRange;

    fn test_polling() -> PollingSettings {
        PollingSettings {
            poll_interval_ms: 1000,
            failure_threshold: 3,
            discrete_inputs: RegionRange { start: 0, count: 16 },
            coils: RegionRange { start: 0, count: 16 },
            registers: RegionRange { start: 0, count: 10 },
        }
    }

    #[tokio::test]
    async fn snapshot_reflects_full_merge() {
        let cache = LiveCache::new(&test_polling());
        assert!(cache.snapshot().await.captured_at.is_none());

        let bits: Vec<bool> = (0..16).map(|i| i % 2 == 0).collect();
        cache.apply_bits(Region::DiscreteInput, 0, &bits).await;
        cache.apply_words(0, &[7, 8, 9]).await;

        let snap = cache.snapshot().await;
        assert_eq!(snap.discrete_inputs.get(0), Some(true));
        assert_eq!(snap.discrete_inputs.get(1), Some(false));
        assert_eq!(snap.registers.get(1), Some(8));
        assert!(snap.captured_at.is_some());
        // Beyond the polled window
        assert_eq!(snap.registers.get(10), None);
    }

    #[tokio::test]
    async fn write_ack_visible_before_next_poll() {
        let cache = LiveCache::new(&test_polling());
        cache.apply_bits(Region::Coil, 0, &[false; 16]).await;
        let stamped = cache.snapshot().await.captured_at;

        cache.apply_coil_ack(3, true).await;
        cache.apply_register_ack(5, 1234).await;

        let snap = cache.snapshot().await;
        assert_eq!(snap.coils.get(3), Some(true));
        assert_eq!(snap.registers.get(5), Some(1234));
        // Optimistic acks do not move the poll timestamp
        assert_eq!(snap.captured_at, stamped);
    }

    #[tokio::test]
    async fn ack_outside_polled_range_is_ignored() {
        let cache = LiveCache::new(&test_polling());
        cache.apply_coil_ack(100, true).await;
        let snap = cache.snapshot().await;
        assert_eq!(snap.coils.get(100), None);
        assert_eq!(snap.coils.get(0), Some(false));
    }

    #[tokio::test]
    async fn connected_flips_at_threshold_and_resets_on_success() {
        let cache = LiveCache::new(&test_polling());
        cache.record_success().await;
        assert!(cache.is_connected().await);

        cache.record_failure().await;
        cache.record_failure().await;
        assert!(cache.is_connected().await, "below threshold stays up");

        cache.record_failure().await;
        let health = cache.health().await;
        assert!(!health.connected);
        assert_eq!(health.consecutive_failures, 3);
        assert_eq!(cache.snapshot().await.communication_error_count, 3);

        cache.record_success().await;
        let health = cache.health().await;
        assert!(health.connected);
        assert_eq!(health.consecutive_failures, 0);
        // Cumulative error count is never reset
        assert_eq!(cache.snapshot().await.communication_error_count, 3);
    }

    #[tokio::test]
    async fn offset_region_addressing() {
        let polling = PollingSettings {
            registers: RegionRange { start: 100, count: 4 },
            ..test_polling()
        };
        let cache = LiveCache::new(&polling);
        cache.apply_words(100, &[1, 2, 3, 4]).await;

        let snap = cache.snapshot().await;
        assert_eq!(snap.registers.get(100), Some(1));
        assert_eq!(snap.registers.get(103), Some(4));
        assert_eq!(snap.registers.get(99), None);
        assert_eq!(snap.registers.get(104), None);
    }

    #[test]
    fn freshness_window() {
        let snap = Snapshot {
            discrete_inputs: RegionValues::sized(0, 1),
            coils: RegionValues::sized(0, 1),
            registers: RegionValues::sized(0, 1),
            captured_at: Some(Utc::now()),
            connected: true,
            communication_error_count: 0,
        };
        assert!(snap.is_fresh(1000));

        let stale = Snapshot {
            captured_at: Some(Utc::now() - chrono::Duration::seconds(10)),
            ..snap.clone()
        };
        assert!(!stale.is_fresh(1000));

        let never = Snapshot {
            captured_at: None,
            ..snap
        };
        assert!(!never.is_fresh(1000));
    }
}
