//! Cyclic poll scheduler.
//!
//! Drives the three configured read regions through the transaction
//! queue at a fixed cadence and merges results into the live cache.
//! Cycles never overlap: if one overruns the interval, missed ticks
//! are skipped and the next cycle starts on the next scheduled edge.

use std::sync::Arc;
use std::time::Duration;

use bridge_config::PollingSettings;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{LiveCache, Region};
use crate::error::{BridgeError, Result};
use crate::transaction::{Transaction, TransactionHandle, TransactionReply};

pub struct PollScheduler {
    transactions: TransactionHandle,
    cache: Arc<LiveCache>,
    settings: PollingSettings,
}

impl PollScheduler {
    pub fn new(
        transactions: TransactionHandle,
        cache: Arc<LiveCache>,
        settings: PollingSettings,
    ) -> Self {
        Self {
            transactions,
            cache,
            settings,
        }
    }

    /// Spawn the poll loop; runs until the token is cancelled.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    async fn run(self, cancel: CancellationToken) {
        let period = Duration::from_millis(self.settings.poll_interval_ms);
        let mut next = Instant::now();

        info!(
            "Poll scheduler started: interval {}ms, {} inputs / {} coils / {} registers",
            self.settings.poll_interval_ms,
            self.settings.discrete_inputs.count,
            self.settings.coils.count,
            self.settings.registers.count
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Poll scheduler stopping");
                    return;
                }
                _ = tokio::time::sleep_until(next) => {}
            }

            match self.poll_cycle().await {
                Ok(()) => {
                    self.cache.record_success().await;
                    debug!("Poll cycle complete");
                }
                Err(e) => {
                    self.cache.record_failure().await;
                    warn!("Poll cycle failed: {}", e);
                }
            }

            // Next period edge; slots an overrunning cycle ran through
            // are skipped, never queued for back-to-back catch-up
            next += period;
            let now = Instant::now();
            while next <= now {
                next += period;
            }
        }
    }

    /// One full cycle: regions read sequentially, aborted on the first
    /// failed transaction. Partial results are still merged.
    async fn poll_cycle(&self) -> Result<()> {
        let regions = &self.settings;

        if regions.discrete_inputs.count > 0 {
            let bits = self
                .read_bits(Transaction::ReadDiscreteInputs {
                    start: regions.discrete_inputs.start,
                    count: regions.discrete_inputs.count,
                })
                .await?;
            self.cache
                .apply_bits(Region::DiscreteInput, regions.discrete_inputs.start, &bits)
                .await;
        }

        if regions.coils.count > 0 {
            let bits = self
                .read_bits(Transaction::ReadCoils {
                    start: regions.coils.start,
                    count: regions.coils.count,
                })
                .await?;
            self.cache
                .apply_bits(Region::Coil, regions.coils.start, &bits)
                .await;
        }

        if regions.registers.count > 0 {
            let words = self
                .read_words(Transaction::ReadHoldingRegisters {
                    start: regions.registers.start,
                    count: regions.registers.count,
                })
                .await?;
            self.cache
                .apply_words(regions.registers.start, &words)
                .await;
        }

        Ok(())
    }

    async fn read_bits(&self, transaction: Transaction) -> Result<Vec<bool>> {
        match self.transactions.execute(transaction).await? {
            TransactionReply::Bits(bits) => Ok(bits),
            other => Err(BridgeError::Protocol(format!(
                "Unexpected reply to bit read: {other:?}"
            ))),
        }
    }

    async fn read_words(&self, transaction: Transaction) -> Result<Vec<u16>> {
        match self.transactions.execute(transaction).await? {
            TransactionReply::Words(words) => Ok(words),
            other => Err(BridgeError::Protocol(format!(
                "Unexpected reply to register read: {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::modbus::frame::crc16;
    use crate::transaction::{RetryPolicy, TransactionManager};
    use crate::transport::RawTransport;
    use async_trait::async_trait;
    use bridge_config::RegionRange;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn rtu_frame(slave: u8, pdu: &[u8]) -> Vec<u8> {
        let mut frame = vec![slave];
        frame.extend_from_slice(pdu);
        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame
    }

    /// Answers any well-formed read request with zeroed data after an
    /// optional simulated bus delay. Optionally fails the first N
    /// requests with a timeout.
    struct SimDevice {
        delay: Duration,
        fail_first: AtomicU32,
        requests: AtomicU32,
    }

    impl SimDevice {
        fn new(delay: Duration, fail_first: u32) -> Self {
            Self {
                delay,
                fail_first: AtomicU32::new(fail_first),
                requests: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl RawTransport for &'static SimDevice {
        async fn write_then_read(
            &mut self,
            request: &[u8],
            _max_len: usize,
            _timeout: Duration,
        ) -> crate::error::Result<Vec<u8>> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            if self.delay > Duration::ZERO {
                tokio::time::sleep(self.delay).await;
            }
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(BridgeError::Timeout("simulated".into()));
            }

            let slave = request[0];
            let fc = request[1];
            let count = u16::from_be_bytes([request[4], request[5]]);
            let pdu = match fc {
                0x01 | 0x02 => {
                    let byte_count = count.div_ceil(8) as u8;
                    let mut pdu = vec![fc, byte_count];
                    pdu.extend(std::iter::repeat_n(0u8, byte_count as usize));
                    pdu
                }
                0x03 => {
                    let mut pdu = vec![fc, (count * 2) as u8];
                    pdu.extend(std::iter::repeat_n(0u8, count as usize * 2));
                    pdu
                }
                other => vec![other | 0x80, 0x01],
            };
            Ok(rtu_frame(slave, &pdu))
        }
    }

    fn settings(interval_ms: u64) -> PollingSettings {
        PollingSettings {
            poll_interval_ms: interval_ms,
            failure_threshold: 3,
            discrete_inputs: RegionRange { start: 0, count: 16 },
            coils: RegionRange { start: 0, count: 16 },
            registers: RegionRange { start: 0, count: 10 },
        }
    }

    fn leak(device: SimDevice) -> &'static SimDevice {
        Box::leak(Box::new(device))
    }

    fn spawn_scheduler(
        device: &'static SimDevice,
        polling: PollingSettings,
        max_attempts: u32,
    ) -> (Arc<LiveCache>, CancellationToken, JoinHandle<()>) {
        let cache = Arc::new(LiveCache::new(&polling));
        let policy = RetryPolicy {
            max_attempts,
            delay: Duration::from_millis(1),
            exponential: false,
        };
        let (handle, _worker) =
            TransactionManager::spawn(device, None, 1, Duration::from_millis(100), policy);
        let cancel = CancellationToken::new();
        let scheduler = PollScheduler::new(handle, Arc::clone(&cache), polling);
        let task = scheduler.spawn(cancel.clone());
        (cache, cancel, task)
    }

    #[tokio::test(start_paused = true)]
    async fn overrunning_cycle_skips_missed_ticks() {
        // 500ms per transaction, 3 transactions per cycle: each cycle
        // takes 1.5s against a 1s interval, so every cycle overruns
        // its own slot and the next one must wait for the 2s edge
        let device = leak(SimDevice::new(Duration::from_millis(500), 0));
        let (cache, cancel, task) = spawn_scheduler(device, settings(1000), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
        let _ = task.await;

        // Cycles start at t=0, 2s, 4s: three starts in 5s, never
        // back-to-back catch-up runs
        let cycles = device.requests.load(Ordering::SeqCst) / 3;
        assert!(
            cycles <= 3,
            "overrun slots must be skipped, got {cycles} cycles in 5s"
        );
        assert!(cycles >= 2, "scheduler must keep polling, got {cycles}");
        assert!(cache.snapshot().await.connected);
    }

    #[tokio::test(start_paused = true)]
    async fn health_flips_at_threshold_then_recovers() {
        // First 3 requests time out; with max_attempts 1 that is 3
        // failed cycles, exactly the threshold
        let device = leak(SimDevice::new(Duration::ZERO, 3));
        let (cache, cancel, task) = spawn_scheduler(device, settings(1000), 1);

        // Failed cycles run at t=0s, 1s, 2s
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let health = cache.health().await;
        assert!(!health.connected, "threshold reached, must be down");
        assert_eq!(health.consecutive_failures, 3);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let health = cache.health().await;
        assert!(health.connected, "successful cycle must restore health");
        assert_eq!(health.consecutive_failures, 0);

        cancel.cancel();
        let _ = task.await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_cycle_counts_once() {
        let device = leak(SimDevice::new(Duration::ZERO, 1));
        let (cache, cancel, task) = spawn_scheduler(device, settings(1000), 1);

        // One failed cycle, then successes
        tokio::time::sleep(Duration::from_millis(2500)).await;
        cancel.cancel();
        let _ = task.await;

        let snap = cache.snapshot().await;
        assert_eq!(snap.communication_error_count, 1);
        assert!(snap.connected);
    }
}
