//! Sandboxed script execution.
//!
//! Scripts run in a rhai engine with no module or eval access, hard
//! size limits, and a wall-clock budget enforced through the progress
//! hook. The scope a script sees is an immutable snapshot of the cache
//! plus the three write capabilities; nothing else of the process is
//! reachable.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rhai::{Dynamic, Engine, EvalAltResult, Position};

use crate::cache::{LiveCache, RegionValues, Snapshot};
use crate::error::{BridgeError, Result};
use crate::gpio::OutputPins;
use crate::transaction::{Transaction, TransactionHandle};

/// Shared capabilities handed to every script invocation.
#[derive(Clone)]
pub struct ScriptContext {
    pub transactions: TransactionHandle,
    pub pins: Arc<dyn OutputPins>,
    pub cache: Arc<LiveCache>,
    /// Wall-clock budget per invocation
    pub budget: Duration,
}

/// Run one script against a point-in-time snapshot.
///
/// Execution happens on a blocking thread; the async runtime only
/// waits for the outcome. A budget overrun terminates the script and
/// maps to `ScriptTimeout`; every other failure maps to
/// `ScriptRuntime`. Neither affects any other script.
pub async fn run_script(ctx: ScriptContext, snapshot: Snapshot, source: String) -> Result<()> {
    tokio::task::spawn_blocking(move || execute(&ctx, snapshot, &source))
        .await
        .map_err(|e| BridgeError::ScriptRuntime(format!("Script task panicked: {e}")))?
}

fn execute(ctx: &ScriptContext, snapshot: Snapshot, source: &str) -> Result<()> {
    let budget_ms = ctx.budget.as_millis() as u64;
    let engine = build_engine(ctx, snapshot);

    match engine.run(source) {
        Ok(()) => Ok(()),
        Err(e) if matches!(*e, EvalAltResult::ErrorTerminated(..)) => {
            Err(BridgeError::ScriptTimeout { budget_ms })
        }
        Err(e) => Err(BridgeError::ScriptRuntime(e.to_string())),
    }
}

fn build_engine(ctx: &ScriptContext, snapshot: Snapshot) -> Engine {
    let mut engine = Engine::new();

    // Sandbox limits
    engine.set_max_expr_depths(64, 64);
    engine.set_max_call_levels(32);
    engine.set_max_string_size(4096);
    engine.set_max_array_size(1024);
    engine.set_max_map_size(256);
    engine.set_max_modules(0);
    engine.disable_symbol("eval");

    // Wall-clock budget, checked on every operation
    let deadline = Instant::now() + ctx.budget;
    engine.on_progress(move |_ops| {
        if Instant::now() >= deadline {
            Some(Dynamic::UNIT)
        } else {
            None
        }
    });

    let snap = Arc::new(snapshot);

    let s = Arc::clone(&snap);
    engine.register_fn("input", move |n: i64| bit_point(&s.discrete_inputs, n, "input"));

    let s = Arc::clone(&snap);
    engine.register_fn("coil", move |n: i64| bit_point(&s.coils, n, "coil"));

    let s = Arc::clone(&snap);
    engine.register_fn(
        "register",
        move |n: i64| -> std::result::Result<i64, Box<EvalAltResult>> {
            let offset = checked_offset(n, "register")?;
            match s.registers.get(offset) {
                Some(value) => Ok(i64::from(value)),
                None => Err(out_of_range("register", n)),
            }
        },
    );

    let s = Arc::clone(&snap);
    engine.register_fn("connected", move || s.connected);

    // Writes follow the same rules as the external write path: rejected
    // outright while disconnected, acked into the cache on success
    let transactions = ctx.transactions.clone();
    let cache = Arc::clone(&ctx.cache);
    let s = Arc::clone(&snap);
    engine.register_fn(
        "write_coil",
        move |n: i64, value: bool| -> std::result::Result<(), Box<EvalAltResult>> {
            if !s.connected {
                return Err(runtime_error(BridgeError::NotConnected));
            }
            let offset = checked_offset(n, "coil")?;
            transactions
                .execute_blocking(Transaction::WriteCoil { offset, value })
                .map_err(runtime_error)?;
            cache.apply_coil_ack_blocking(offset, value);
            Ok(())
        },
    );

    let transactions = ctx.transactions.clone();
    let cache = Arc::clone(&ctx.cache);
    let s = Arc::clone(&snap);
    engine.register_fn(
        "write_register",
        move |n: i64, value: i64| -> std::result::Result<(), Box<EvalAltResult>> {
            if !s.connected {
                return Err(runtime_error(BridgeError::NotConnected));
            }
            let offset = checked_offset(n, "register")?;
            let value = u16::try_from(value).map_err(|_| {
                runtime_message(format!("Register value {value} outside 0..=65535"))
            })?;
            transactions
                .execute_blocking(Transaction::WriteRegister { offset, value })
                .map_err(runtime_error)?;
            cache.apply_register_ack_blocking(offset, value);
            Ok(())
        },
    );

    let pins = Arc::clone(&ctx.pins);
    engine.register_fn(
        "set_output_pin",
        move |pin: i64, state: bool| -> std::result::Result<(), Box<EvalAltResult>> {
            let pin = u8::try_from(pin)
                .map_err(|_| runtime_message(format!("Pin number {pin} outside 0..=255")))?;
            pins.set_pin(pin, state).map_err(runtime_error)?;
            Ok(())
        },
    );

    engine
}

fn bit_point(
    region: &RegionValues<bool>,
    n: i64,
    kind: &str,
) -> std::result::Result<bool, Box<EvalAltResult>> {
    let offset = checked_offset(n, kind)?;
    match region.get(offset) {
        Some(value) => Ok(value),
        None => Err(out_of_range(kind, n)),
    }
}

fn checked_offset(n: i64, kind: &str) -> std::result::Result<u16, Box<EvalAltResult>> {
    u16::try_from(n).map_err(|_| runtime_message(format!("Invalid {kind} offset {n}")))
}

fn out_of_range(kind: &str, n: i64) -> Box<EvalAltResult> {
    runtime_message(format!("{kind} {n} outside the polled range"))
}

fn runtime_error(e: BridgeError) -> Box<EvalAltResult> {
    runtime_message(e.to_string())
}

fn runtime_message(message: String) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(message.into(), Position::NONE))
}
