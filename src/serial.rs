//! Serial transport primitives.
//!
//! The driver talks to any `AsyncRead + AsyncWrite` byte stream. In production that is
//! a `tokio_serial::SerialStream` (feature `instrument_serial`); in tests it is a
//! [`crate::mock_serial::MockSerialPort`] or a `tokio::io::DuplexStream`.
//!
//! The transport contract the protocol layer relies on is three operations:
//!
//! - [`write_all_flush`]: write one frame and flush it.
//! - [`read_line_timeout`]: read one `\n`-terminated line, bounded by a timeout.
//! - [`reset_input`]: discard everything unread, including bytes already buffered.
//!
//! # Example
//!
//! ```rust,ignore
//! use force_stage::serial::{open_serial_async, wrap_shared};
//!
//! let port = open_serial_async("/dev/ttyACM0", 115200).await?;
//! let shared = wrap_shared(Box::new(port));
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::sync::Mutex;

use crate::error::{DriverError, DriverResult};

/// Trait alias for async serial port I/O.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Buffered port as owned by one exchange.
pub type BufferedPort = BufReader<DynSerial>;

/// Thread-safe shared serial port with buffered reading.
///
/// The mutex is the exchange lock: whoever holds it owns the request/response cycle.
pub type SharedPort = Arc<Mutex<BufferedPort>>;

/// Create a [`SharedPort`] from a type-erased serial port.
pub fn wrap_shared(port: DynSerial) -> SharedPort {
    Arc::new(Mutex::new(BufReader::new(port)))
}

/// Open a serial port asynchronously using spawn_blocking.
///
/// Standard settings are applied: 8N1, no flow control.
///
/// # Errors
///
/// Returns an error if the port cannot be opened or spawn_blocking fails.
#[cfg(feature = "instrument_serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
) -> anyhow::Result<tokio_serial::SerialStream> {
    use anyhow::Context;
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .context(format!("Failed to open force stage serial port: {}", port_path_owned))
    })
    .await
    .context("spawn_blocking for serial port opening failed")?
}

/// Write a complete frame and flush it.
pub async fn write_all_flush<W: AsyncWrite + Unpin>(port: &mut W, bytes: &[u8]) -> DriverResult<()> {
    port.write_all(bytes).await?;
    port.flush().await?;
    Ok(())
}

/// Read one line, waiting at most `timeout`.
///
/// The returned string still carries its terminator. A closed stream is reported as
/// `UnexpectedEof`, a line that is not valid UTF-8 as a decode error.
pub async fn read_line_timeout<R: AsyncBufRead + Unpin>(
    port: &mut R,
    timeout: Duration,
) -> DriverResult<String> {
    let mut raw = Vec::new();
    let n = tokio::time::timeout(timeout, port.read_until(b'\n', &mut raw))
        .await
        .map_err(|_| DriverError::Timeout { waited: timeout })??;
    if n == 0 {
        return Err(DriverError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "serial port closed",
        )));
    }
    String::from_utf8(raw).map_err(|e| {
        let lossy = String::from_utf8_lossy(e.as_bytes()).trim().to_string();
        DriverError::decode("line", &lossy, "response is not valid UTF-8")
    })
}

/// Drain stale data from a serial port buffer.
///
/// Reads and discards until nothing arrives for the rest of `window`. Returns the
/// number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, window: Duration) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + window;
    let mut total_discarded = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }

        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break, // EOF
            Ok(Ok(n)) => total_discarded += n,
            Ok(Err(_)) => break,
            Err(_) => break, // Timeout, no more immediate data
        }
    }

    total_discarded
}

/// Discard everything unread: the `BufReader` contents first, then the device side.
pub async fn reset_input(port: &mut BufferedPort, window: Duration) -> usize {
    let buffered = port.buffer().len();
    port.consume(buffered);
    let drained = drain_serial_buffer(port.get_mut(), window).await;
    let total = buffered + drained;
    if total > 0 {
        tracing::debug!(bytes = total, "Discarded stale input");
    }
    total
}
