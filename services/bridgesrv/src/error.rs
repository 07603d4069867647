//! Error handling for the PLC bridge engine.

use thiserror::Error;

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Bridge engine error type.
///
/// `Timeout` and `Protocol` are transient and recovered by the
/// transaction manager's retry policy; `Device` and `Config` are never
/// retried; `Transport` forces a reconnect attempt by the connection
/// owner. Script errors are contained to the owning script definition.
#[derive(Error, Debug, Clone)]
pub enum BridgeError {
    /// No response within the transaction timeout window
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Malformed or mismatched response (bus noise suspected)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Explicit Modbus exception returned by the PLC
    #[error("Device exception on function {function:#04x}: {} ({code:#04x})", exception_description(*.code))]
    Device {
        /// Request function code
        function: u8,
        /// Modbus exception code
        code: u8,
    },

    /// Port closed or I/O fault on the connection
    #[error("Transport error: {0}")]
    Transport(String),

    /// The bridge is in a disconnected window; writes are rejected
    #[error("Not connected")]
    NotConnected,

    /// User script raised an error
    #[error("Script error: {0}")]
    ScriptRuntime(String),

    /// User script exceeded its execution budget
    #[error("Script exceeded execution budget of {budget_ms}ms")]
    ScriptTimeout {
        /// Configured budget in milliseconds
        budget_ms: u64,
    },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Script store access failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Requested script does not exist
    #[error("Script not found: {0}")]
    ScriptNotFound(String),

    /// Requested point is outside the configured regions
    #[error("Invalid point: {0}")]
    InvalidPoint(String),
}

impl BridgeError {
    /// Transient failures are retried by the transaction manager.
    pub fn is_transient(&self) -> bool {
        matches!(self, BridgeError::Timeout(_) | BridgeError::Protocol(_))
    }
}

/// Human-readable description for a Modbus exception code.
pub fn exception_description(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Server Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Server Device Busy",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Failed To Respond",
        _ => "Unknown Exception",
    }
}

impl From<bridge_config::ConfigError> for BridgeError {
    fn from(err: bridge_config::ConfigError) -> Self {
        BridgeError::Config(err.to_string())
    }
}

impl From<sqlx::Error> for BridgeError {
    fn from(err: sqlx::Error) -> Self {
        BridgeError::Storage(err.to_string())
    }
}
