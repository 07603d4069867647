//! Modbus transaction manager.
//!
//! All callers (poll scheduler, script engine, write API) submit
//! transactions through one mpsc queue into a single worker task that
//! owns the transport. One request-response pair is on the wire at a
//! time, in submission order - the serialization is structural, not a
//! locking convention.

use std::time::Duration;

use bridge_config::ModbusSettings;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};
use crate::modbus::constants::{
    EXCEPTION_BIT, FC_READ_COILS, FC_READ_DISCRETE_INPUTS, FC_READ_HOLDING_REGISTERS,
    FC_WRITE_SINGLE_COIL, FC_WRITE_SINGLE_REGISTER, RESPONSE_BUFFER_SIZE,
};
use crate::modbus::frame::{build_frame, parse_frame};
use crate::modbus::pdu::{
    build_read_request, build_write_coil_request, build_write_register_request, decode_bits,
    decode_registers, expected_response_len, ModbusPdu,
};
use crate::transport::RawTransport;

/// A single request-response unit on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transaction {
    ReadDiscreteInputs { start: u16, count: u16 },
    ReadCoils { start: u16, count: u16 },
    ReadHoldingRegisters { start: u16, count: u16 },
    WriteCoil { offset: u16, value: bool },
    WriteRegister { offset: u16, value: u16 },
}

impl Transaction {
    /// Modbus function code for this transaction kind.
    pub fn function_code(&self) -> u8 {
        match self {
            Transaction::ReadDiscreteInputs { .. } => FC_READ_DISCRETE_INPUTS,
            Transaction::ReadCoils { .. } => FC_READ_COILS,
            Transaction::ReadHoldingRegisters { .. } => FC_READ_HOLDING_REGISTERS,
            Transaction::WriteCoil { .. } => FC_WRITE_SINGLE_COIL,
            Transaction::WriteRegister { .. } => FC_WRITE_SINGLE_REGISTER,
        }
    }

    fn request_pdu(&self) -> Result<ModbusPdu> {
        match *self {
            Transaction::ReadDiscreteInputs { start, count } => {
                build_read_request(FC_READ_DISCRETE_INPUTS, start, count)
            }
            Transaction::ReadCoils { start, count } => {
                build_read_request(FC_READ_COILS, start, count)
            }
            Transaction::ReadHoldingRegisters { start, count } => {
                build_read_request(FC_READ_HOLDING_REGISTERS, start, count)
            }
            Transaction::WriteCoil { offset, value } => build_write_coil_request(offset, value),
            Transaction::WriteRegister { offset, value } => {
                build_write_register_request(offset, value)
            }
        }
    }

    fn expected_pdu_len(&self) -> Result<usize> {
        let count = match *self {
            Transaction::ReadDiscreteInputs { count, .. }
            | Transaction::ReadCoils { count, .. }
            | Transaction::ReadHoldingRegisters { count, .. } => count,
            Transaction::WriteCoil { .. } | Transaction::WriteRegister { .. } => 0,
        };
        expected_response_len(self.function_code(), count)
    }

    fn decode(&self, pdu: &ModbusPdu) -> Result<TransactionReply> {
        match *self {
            Transaction::ReadDiscreteInputs { count, .. }
            | Transaction::ReadCoils { count, .. } => {
                Ok(TransactionReply::Bits(decode_bits(pdu, count)?))
            }
            Transaction::ReadHoldingRegisters { count, .. } => {
                Ok(TransactionReply::Words(decode_registers(pdu, count)?))
            }
            Transaction::WriteCoil { .. } | Transaction::WriteRegister { .. } => {
                Ok(TransactionReply::WriteAck)
            }
        }
    }
}

/// Decoded payload of a successful transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionReply {
    /// FC01/FC02 payload
    Bits(Vec<bool>),
    /// FC03 payload
    Words(Vec<u16>),
    /// FC05/FC06 echo accepted
    WriteAck,
}

/// Bounded retry policy for transient failures.
///
/// Kept independent of the I/O so the attempt accounting is testable
/// on its own.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per transaction (>= 1)
    pub max_attempts: u32,
    /// Base delay between attempts
    pub delay: Duration,
    /// Double the delay each failed attempt, capped at 10x base
    pub exponential: bool,
}

impl RetryPolicy {
    pub fn from_settings(settings: &ModbusSettings) -> Self {
        Self {
            max_attempts: settings.max_retries.max(1),
            delay: Duration::from_millis(settings.retry_backoff_ms),
            exponential: settings.exponential_backoff,
        }
    }

    /// Delay to apply after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if !self.exponential {
            return self.delay;
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1)).min(10);
        self.delay * factor
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(100),
            exponential: false,
        }
    }
}

struct Request {
    transaction: Transaction,
    reply: oneshot::Sender<Result<TransactionReply>>,
}

/// Cloneable submission handle into the transaction worker.
#[derive(Clone)]
pub struct TransactionHandle {
    tx: mpsc::Sender<Request>,
}

impl TransactionHandle {
    /// Execute one transaction through the serialized queue.
    ///
    /// Waits for the worker to run it; concurrent callers queue in
    /// submission order, they never race on the wire.
    pub async fn execute(&self, transaction: Transaction) -> Result<TransactionReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Request {
                transaction,
                reply: reply_tx,
            })
            .await
            .map_err(|_| BridgeError::Transport("Transaction worker stopped".into()))?;

        reply_rx
            .await
            .map_err(|_| BridgeError::Transport("Transaction worker dropped request".into()))?
    }

    /// Blocking variant for script threads (`spawn_blocking` context).
    pub fn execute_blocking(&self, transaction: Transaction) -> Result<TransactionReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .blocking_send(Request {
                transaction,
                reply: reply_tx,
            })
            .map_err(|_| BridgeError::Transport("Transaction worker stopped".into()))?;

        reply_rx
            .blocking_recv()
            .map_err(|_| BridgeError::Transport("Transaction worker dropped request".into()))?
    }
}

/// Factory invoked by the worker to re-establish a faulted transport.
pub type Reconnector<T> = Box<dyn FnMut() -> Result<T> + Send>;

/// Single-owner worker executing transactions against the transport.
pub struct TransactionManager;

impl TransactionManager {
    /// Spawn the worker task and return the submission handle.
    ///
    /// The worker runs until every handle is dropped. In-flight
    /// transactions are always drained to completion - a caller that
    /// gives up waiting (script timeout) does not leave the bus slot
    /// occupied.
    pub fn spawn<T>(
        transport: T,
        reconnect: Option<Reconnector<T>>,
        slave_id: u8,
        response_timeout: Duration,
        policy: RetryPolicy,
    ) -> (TransactionHandle, JoinHandle<()>)
    where
        T: RawTransport + 'static,
    {
        let (tx, rx) = mpsc::channel(32);
        let worker = Worker {
            transport,
            reconnect,
            slave_id,
            response_timeout,
            policy,
            needs_reconnect: false,
        };
        let handle = tokio::spawn(worker.run(rx));
        (TransactionHandle { tx }, handle)
    }
}

struct Worker<T: RawTransport> {
    transport: T,
    reconnect: Option<Reconnector<T>>,
    slave_id: u8,
    response_timeout: Duration,
    policy: RetryPolicy,
    needs_reconnect: bool,
}

impl<T: RawTransport> Worker<T> {
    async fn run(mut self, mut rx: mpsc::Receiver<Request>) {
        debug!("Transaction worker started for slave {}", self.slave_id);

        while let Some(request) = rx.recv().await {
            if self.needs_reconnect {
                self.try_reconnect();
            }

            let result = self.execute_with_retries(request.transaction).await;

            if matches!(result, Err(BridgeError::Transport(_))) {
                // Escalation: the connection owner reconnects rather
                // than retrying the same transaction
                self.needs_reconnect = true;
            }

            // Receiver may have given up waiting; the transaction was
            // still fully drained above
            let _ = request.reply.send(result);
        }

        debug!("Transaction worker stopped");
    }

    fn try_reconnect(&mut self) {
        let Some(reconnect) = self.reconnect.as_mut() else {
            return;
        };
        match reconnect() {
            Ok(transport) => {
                info!("Transport reconnected");
                self.transport = transport;
                self.needs_reconnect = false;
            }
            Err(e) => {
                warn!("Reconnect attempt failed: {}", e);
            }
        }
    }

    async fn execute_with_retries(&mut self, transaction: Transaction) -> Result<TransactionReply> {
        let mut last_error = BridgeError::Protocol("No attempt executed".into());

        for attempt in 1..=self.policy.max_attempts {
            match self.execute_once(transaction).await {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_transient() => {
                    warn!(
                        "Transaction attempt {}/{} failed: {}",
                        attempt, self.policy.max_attempts, e
                    );
                    last_error = e;
                    if attempt < self.policy.max_attempts {
                        tokio::time::sleep(self.policy.delay_for(attempt)).await;
                    }
                }
                // DeviceError and TransportError are never retried
                Err(e) => return Err(e),
            }
        }

        Err(last_error)
    }

    async fn execute_once(&mut self, transaction: Transaction) -> Result<TransactionReply> {
        let request_pdu = transaction.request_pdu()?;
        let frame = build_frame(self.slave_id, &request_pdu);

        let raw = self
            .transport
            .write_then_read(&frame, RESPONSE_BUFFER_SIZE, self.response_timeout)
            .await?;

        let (slave, pdu) = parse_frame(&raw)?;

        if slave != self.slave_id {
            return Err(BridgeError::Protocol(format!(
                "Slave address mismatch: sent {}, received {}",
                self.slave_id, slave
            )));
        }

        let function = transaction.function_code();
        match pdu.function_code() {
            Some(fc) if fc == function | EXCEPTION_BIT => {
                let code = pdu.exception_code().unwrap_or(0);
                return Err(BridgeError::Device { function, code });
            }
            Some(fc) if fc == function => {}
            Some(fc) => {
                return Err(BridgeError::Protocol(format!(
                    "Function code mismatch: sent {function:#04x}, received {fc:#04x}"
                )));
            }
            None => return Err(BridgeError::Protocol("Empty response PDU".into())),
        }

        let expected = transaction.expected_pdu_len()?;
        if pdu.len() != expected {
            return Err(BridgeError::Protocol(format!(
                "Response length mismatch: expected {expected} bytes, received {}",
                pdu.len()
            )));
        }

        transaction.decode(&pdu)
    }
}
