//! Transport layer: a bounded-timeout byte pipe to the PLC.
//!
//! The transport has no framing knowledge; it writes a request and
//! reads back whatever arrives within the timeout. Exactly one
//! transaction manager owns a transport at a time - the serial bus is
//! half-duplex and a single PLC cannot process overlapping requests.

use std::time::Duration;

use async_trait::async_trait;
use bridge_config::SerialSettings;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};

/// Byte pipe abstraction over the physical link.
///
/// The mock transport used by the transaction manager tests implements
/// this seam; production code uses [`Transport`].
#[async_trait]
pub trait RawTransport: Send {
    /// Write a request frame, then read the response within `timeout`.
    ///
    /// Returns the raw bytes read. Timeouts and I/O faults are typed
    /// errors, never swallowed; retry policy belongs to the caller.
    async fn write_then_read(
        &mut self,
        request: &[u8],
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>>;
}

/// Physical connection to the PLC.
#[derive(Debug)]
pub enum Transport {
    /// Serial RTU link
    Serial(SerialStream),
    /// TCP byte pipe (RTU-over-TCP bench rigs); framing stays RTU
    Tcp(TcpStream),
}

impl Transport {
    /// Open the serial port described by `settings`.
    pub fn open(settings: &SerialSettings) -> Result<Self> {
        info!(
            "Opening serial port {} at {} baud",
            settings.port, settings.baud_rate
        );

        let parity = match settings.parity.as_str() {
            "even" => tokio_serial::Parity::Even,
            "odd" => tokio_serial::Parity::Odd,
            _ => tokio_serial::Parity::None,
        };

        let data_bits = match settings.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };

        let stop_bits = match settings.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };

        let stream = tokio_serial::new(&settings.port, settings.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .open_native_async()
            .map_err(|e| {
                warn!("Failed to open serial port {}: {}", settings.port, e);
                BridgeError::Transport(format!(
                    "Failed to open serial port {}: {}",
                    settings.port, e
                ))
            })?;

        info!("Serial port {} opened", settings.port);
        Ok(Transport::Serial(stream))
    }

    /// Connect a TCP byte pipe (used by hardware-in-the-loop rigs).
    pub async fn connect_tcp(addr: &str, connect_timeout: Duration) -> Result<Self> {
        info!("Connecting to {}", addr);
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY: {}", e);
                }
                Ok(Transport::Tcp(stream))
            }
            Ok(Err(e)) => Err(BridgeError::Transport(format!(
                "Failed to connect to {addr}: {e}"
            ))),
            Err(_) => Err(BridgeError::Timeout(format!(
                "Connection to {addr} timed out"
            ))),
        }
    }
}

#[async_trait]
impl RawTransport for Transport {
    async fn write_then_read(
        &mut self,
        request: &[u8],
        max_len: usize,
        response_timeout: Duration,
    ) -> Result<Vec<u8>> {
        match self {
            Transport::Serial(stream) => {
                write_all(stream, request).await?;
                read_some(stream, max_len, response_timeout).await
            }
            Transport::Tcp(stream) => {
                write_all(stream, request).await?;
                read_some(stream, max_len, response_timeout).await
            }
        }
    }
}

async fn write_all<W: AsyncWriteExt + Unpin>(writer: &mut W, data: &[u8]) -> Result<()> {
    writer
        .write_all(data)
        .await
        .map_err(|e| BridgeError::Transport(format!("Write failed: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| BridgeError::Transport(format!("Flush failed: {e}")))?;
    debug!("Sent {} bytes", data.len());
    Ok(())
}

/// Quiet gap treated as end-of-frame once bytes have arrived.
/// Generous stand-in for the RTU 3.5-character silence at 9600 baud.
const INTER_FRAME_GAP: Duration = Duration::from_millis(20);

async fn read_some<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_len: usize,
    response_timeout: Duration,
) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; max_len];

    // First chunk gets the full response window
    let mut filled = match timeout(response_timeout, reader.read(&mut buf)).await {
        Ok(Ok(0)) => return Err(BridgeError::Transport("Connection closed by peer".into())),
        Ok(Ok(n)) => n,
        Ok(Err(e)) => return Err(BridgeError::Transport(format!("Read failed: {e}"))),
        Err(_) => {
            return Err(BridgeError::Timeout(format!(
                "No response within {}ms",
                response_timeout.as_millis()
            )))
        }
    };

    // Drain trailing chunks until the line goes quiet or the buffer fills
    while filled < max_len {
        match timeout(INTER_FRAME_GAP, reader.read(&mut buf[filled..])).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => filled += n,
            Ok(Err(e)) => return Err(BridgeError::Transport(format!("Read failed: {e}"))),
        }
    }

    buf.truncate(filled);
    debug!("Received {} bytes", filled);
    Ok(buf)
}
