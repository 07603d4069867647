//! Per-script cadence scheduler.
//!
//! A fixed tick loop checks every enabled script against its own
//! interval. At most one invocation of a given script is in flight;
//! a script still running when its next slot arrives is skipped.
//! Distinct scripts may overlap freely. Failures land in the script's
//! `last_error` and never touch the scheduler or other scripts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlx::SqlitePool;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::scripts::engine::{run_script, ScriptContext};
use crate::scripts::repository;
use crate::scripts::types::ScriptDefinition;

struct ScheduledScript {
    def: ScriptDefinition,
    last_started: Option<Instant>,
    in_flight: Arc<AtomicBool>,
}

pub struct ScriptScheduler {
    pool: SqlitePool,
    ctx: ScriptContext,
    scripts: RwLock<Vec<ScheduledScript>>,
    tick_ms: u64,
    /// Floor for script intervals; running faster than the poll cycle
    /// would only re-read identical snapshots
    min_interval_ms: u64,
}

impl ScriptScheduler {
    pub fn new(pool: SqlitePool, ctx: ScriptContext, tick_ms: u64, min_interval_ms: u64) -> Self {
        Self {
            pool,
            ctx,
            scripts: RwLock::new(Vec::new()),
            tick_ms: tick_ms.max(10),
            min_interval_ms,
        }
    }

    /// Reload the script list from the database.
    ///
    /// Called after every management operation; changes take effect on
    /// the next invocation, an in-flight run is never interrupted.
    pub async fn reload(&self) -> Result<usize> {
        let defs = repository::list_scripts(&self.pool).await?;
        let count = defs.len();

        let mut scripts = self.scripts.write().await;
        let previous: Vec<ScheduledScript> = std::mem::take(&mut *scripts);

        *scripts = defs
            .into_iter()
            .map(|def| {
                // Carry run state over for scripts that survived the edit
                let prior = previous.iter().find(|s| s.def.id == def.id);
                ScheduledScript {
                    last_started: prior.and_then(|s| s.last_started),
                    in_flight: prior
                        .map(|s| Arc::clone(&s.in_flight))
                        .unwrap_or_default(),
                    def,
                }
            })
            .collect();

        info!("Loaded {} scripts into scheduler", count);
        Ok(count)
    }

    /// Spawn the tick loop; runs until the token is cancelled.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let scheduler = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(scheduler.tick_ms));
            info!("Script scheduler started with {}ms tick", scheduler.tick_ms);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Script scheduler stopping");
                        return;
                    }
                    _ = ticker.tick() => scheduler.tick().await,
                }
            }
        })
    }

    async fn tick(&self) {
        let now = Instant::now();
        let mut scripts = self.scripts.write().await;

        for scheduled in scripts.iter_mut() {
            if !scheduled.def.enabled {
                continue;
            }

            let interval = scheduled.def.interval_ms.max(self.min_interval_ms);
            let due = match scheduled.last_started {
                None => true,
                Some(last) => now.duration_since(last) >= Duration::from_millis(interval),
            };
            if !due {
                continue;
            }

            // One in-flight invocation per script
            if scheduled.in_flight.swap(true, Ordering::SeqCst) {
                debug!("Script {} still running, skipping slot", scheduled.def.id);
                continue;
            }
            scheduled.last_started = Some(now);

            let id = scheduled.def.id.clone();
            let source = scheduled.def.source.clone();
            let ctx = self.ctx.clone();
            let cache = Arc::clone(&self.ctx.cache);
            let pool = self.pool.clone();
            let in_flight = Arc::clone(&scheduled.in_flight);

            tokio::spawn(async move {
                let snapshot = cache.snapshot().await;
                let outcome = run_script(ctx, snapshot, source).await;

                let error = match &outcome {
                    Ok(()) => None,
                    Err(e) => {
                        warn!("Script {} failed: {}", id, e);
                        Some(e.to_string())
                    }
                };
                if let Err(e) = repository::record_run(&pool, &id, error.as_deref()).await {
                    error!("Failed to record run of script {}: {}", id, e);
                }
                in_flight.store(false, Ordering::SeqCst);
            });
        }
    }

    pub async fn script_count(&self) -> usize {
        self.scripts.read().await.len()
    }
}
