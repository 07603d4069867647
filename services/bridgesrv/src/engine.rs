//! Bridge engine facade.
//!
//! Wires the transport, transaction worker, poll scheduler, cache,
//! script subsystem and network supervisor together and exposes the
//! narrow API the presentation layer consumes: snapshots, writes,
//! health, and script management.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bridge_config::BridgeConfig;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::{ConnectionHealth, LiveCache, Region, Snapshot};
use crate::error::{BridgeError, Result};
use crate::gpio::{OutputPins, SimulatedPins};
use crate::netwatch::{NetWatch, NetworkMode, WifiControl};
use crate::scheduler::PollScheduler;
use crate::scripts::{repository, ScriptContext, ScriptDefinition, ScriptScheduler};
use crate::transaction::{
    Reconnector, RetryPolicy, Transaction, TransactionHandle, TransactionManager,
};
use crate::transport::{RawTransport, Transport};

/// Value carried by a write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteValue {
    Bit(bool),
    Word(u16),
}

/// Outcome of a write submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Accepted,
    Rejected(String),
}

/// Running bridge engine.
///
/// Dropping the handle does not stop the engine; call [`shutdown`]
/// for an orderly stop.
///
/// [`shutdown`]: BridgeHandle::shutdown
pub struct BridgeHandle {
    cache: Arc<LiveCache>,
    transactions: TransactionHandle,
    scripts: Arc<ScriptScheduler>,
    pool: SqlitePool,
    pins: Arc<dyn OutputPins>,
    netwatch: Option<Arc<NetWatch>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct BridgeEngine;

impl BridgeEngine {
    /// Start the engine against the configured serial port.
    pub async fn start(config: BridgeConfig) -> Result<BridgeHandle> {
        let serial = config.serial.clone();
        let transport = Transport::open(&serial)?;
        let reconnect: Reconnector<Transport> = Box::new(move || Transport::open(&serial));
        Self::start_with_transport(config, transport, Some(reconnect), None).await
    }

    /// Start with an injected transport (test rigs, TCP bench setups)
    /// and optional WiFi control for constrained deployments.
    pub async fn start_with_transport<T>(
        config: BridgeConfig,
        transport: T,
        reconnect: Option<Reconnector<T>>,
        wifi: Option<Arc<dyn WifiControl>>,
    ) -> Result<BridgeHandle>
    where
        T: RawTransport + 'static,
    {
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let pool = repository::open_pool(Path::new(&config.scripts.db_path)).await?;
        repository::seed_default_scripts(&pool).await?;

        let cache = Arc::new(LiveCache::new(&config.polling));

        let (transactions, worker) = TransactionManager::spawn(
            transport,
            reconnect,
            config.modbus.device_address,
            Duration::from_millis(config.modbus.transaction_timeout_ms),
            RetryPolicy::from_settings(&config.modbus),
        );
        tasks.push(worker);

        let poller = PollScheduler::new(
            transactions.clone(),
            Arc::clone(&cache),
            config.polling.clone(),
        );
        tasks.push(poller.spawn(cancel.clone()));

        let pins: Arc<dyn OutputPins> = Arc::new(SimulatedPins::new());
        let ctx = ScriptContext {
            transactions: transactions.clone(),
            pins: Arc::clone(&pins),
            cache: Arc::clone(&cache),
            budget: Duration::from_millis(config.scripts.execution_budget_ms),
        };
        let scripts = Arc::new(ScriptScheduler::new(
            pool.clone(),
            ctx,
            config.scripts.tick_ms,
            config.polling.poll_interval_ms,
        ));
        scripts.reload().await?;
        tasks.push(Arc::clone(&scripts).spawn(cancel.clone()));

        let netwatch = wifi.map(|wifi| {
            let watch = Arc::new(NetWatch::new(wifi, pool.clone(), config.network.clone()));
            tasks.push(Arc::clone(&watch).spawn(cancel.clone()));
            watch
        });

        info!(
            "Bridge engine started: slave {} on a {}ms poll",
            config.modbus.device_address, config.polling.poll_interval_ms
        );

        Ok(BridgeHandle {
            cache,
            transactions,
            scripts,
            pool,
            pins,
            netwatch,
            cancel,
            tasks,
        })
    }
}

impl BridgeHandle {
    /// Atomic copy of the current PLC state.
    pub async fn snapshot(&self) -> Snapshot {
        self.cache.snapshot().await
    }

    pub async fn connection_health(&self) -> ConnectionHealth {
        self.cache.health().await
    }

    /// Submit a write to the device through the serialized bus path.
    ///
    /// Rejected outright while the device is considered disconnected:
    /// queueing writes against a dead bus would only replay stale
    /// commands on reconnect.
    pub async fn submit_write(
        &self,
        region: Region,
        offset: u16,
        value: WriteValue,
    ) -> WriteOutcome {
        if !self.cache.is_connected().await {
            return WriteOutcome::Rejected(BridgeError::NotConnected.to_string());
        }

        let transaction = match (region, value) {
            (Region::Coil, WriteValue::Bit(value)) => Transaction::WriteCoil { offset, value },
            (Region::HoldingRegister, WriteValue::Word(value)) => {
                Transaction::WriteRegister { offset, value }
            }
            (Region::DiscreteInput, _) => {
                return WriteOutcome::Rejected("Discrete inputs are read-only".to_string());
            }
            (Region::Coil, WriteValue::Word(_)) => {
                return WriteOutcome::Rejected("Coil writes take a bit value".to_string());
            }
            (Region::HoldingRegister, WriteValue::Bit(_)) => {
                return WriteOutcome::Rejected("Register writes take a word value".to_string());
            }
        };

        match self.transactions.execute(transaction).await {
            Ok(_) => {
                // Device acknowledged: reflect the value ahead of the
                // next poll cycle
                match transaction {
                    Transaction::WriteCoil { offset, value } => {
                        self.cache.apply_coil_ack(offset, value).await;
                    }
                    Transaction::WriteRegister { offset, value } => {
                        self.cache.apply_register_ack(offset, value).await;
                    }
                    _ => {}
                }
                WriteOutcome::Accepted
            }
            Err(e) => {
                warn!("Write to {:?} {} rejected: {}", region, offset, e);
                WriteOutcome::Rejected(e.to_string())
            }
        }
    }

    pub async fn list_scripts(&self) -> Result<Vec<ScriptDefinition>> {
        repository::list_scripts(&self.pool).await
    }

    pub async fn get_script(&self, id: &str) -> Result<ScriptDefinition> {
        repository::get_script(&self.pool, id).await
    }

    pub async fn upsert_script(&self, script: &ScriptDefinition) -> Result<()> {
        repository::upsert_script(&self.pool, script).await?;
        self.scripts.reload().await?;
        Ok(())
    }

    pub async fn set_script_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        repository::set_script_enabled(&self.pool, id, enabled).await?;
        self.scripts.reload().await?;
        Ok(())
    }

    pub async fn delete_script(&self, id: &str) -> Result<()> {
        repository::delete_script(&self.pool, id).await?;
        self.scripts.reload().await?;
        Ok(())
    }

    /// Last commanded state of the local output pins.
    pub fn output_pins(&self) -> std::collections::BTreeMap<u8, bool> {
        self.pins.pin_states()
    }

    /// Current network mode, `None` on deployments without WiFi
    /// supervision.
    pub async fn network_mode(&self) -> Option<NetworkMode> {
        match &self.netwatch {
            Some(watch) => Some(watch.mode().await),
            None => None,
        }
    }

    /// Stop every background task and wait for them to finish.
    pub async fn shutdown(self) {
        info!("Bridge engine shutting down");
        self.cancel.cancel();
        // The script scheduler holds its own submission handle; both
        // must go before the transaction worker can drain and exit
        drop(self.transactions);
        drop(self.scripts);
        for task in self.tasks {
            let _ = task.await;
        }
        self.pool.close().await;
    }
}
