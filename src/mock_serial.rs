//! In-memory serial port for exercising the driver without hardware.
//!
//! [`MockSerialPort`] implements `AsyncRead`/`AsyncWrite` and is handed to the driver.
//! [`MockDeviceHarness`] stays with the test (or the simulator) and plays the
//! instrument: it receives the frames the driver writes and sends response lines back.
//!
//! # Example
//!
//! ```rust,ignore
//! let (port, mut device) = mock_serial::new();
//! let stage = ForceStage::new(wrap_shared(Box::new(port)), &DriverConfig::default())?;
//!
//! let task = tokio::spawn(async move { stage.get_position().await });
//! device.expect_frame("#GP;").await;
//! device.send_line("Position: 12").unwrap();
//! assert_eq!(task.await.unwrap().unwrap(), 12);
//! ```

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// How long the harness waits for the driver to write before giving up.
const WRITE_WAIT: Duration = Duration::from_secs(2);

/// Driver-facing end of the mock port.
#[derive(Debug)]
pub struct MockSerialPort {
    writes_tx: UnboundedSender<Vec<u8>>,
    reads_rx: UnboundedReceiver<Vec<u8>>,
    read_buffer: VecDeque<u8>,
}

/// Device-facing end of the mock port.
#[derive(Debug)]
pub struct MockDeviceHarness {
    writes_rx: UnboundedReceiver<Vec<u8>>,
    reads_tx: Option<UnboundedSender<Vec<u8>>>,
    write_buffer: Vec<u8>,
}

/// Create a connected port/harness pair.
pub fn new() -> (MockSerialPort, MockDeviceHarness) {
    let (writes_tx, writes_rx) = mpsc::unbounded_channel();
    let (reads_tx, reads_rx) = mpsc::unbounded_channel();

    let port = MockSerialPort {
        writes_tx,
        reads_rx,
        read_buffer: VecDeque::new(),
    };
    let harness = MockDeviceHarness {
        writes_rx,
        reads_tx: Some(reads_tx),
        write_buffer: Vec::new(),
    };
    (port, harness)
}

impl MockSerialPort {
    fn fill(&mut self, buf: &mut ReadBuf<'_>) {
        let n = buf.remaining().min(self.read_buffer.len());
        let chunk: Vec<u8> = self.read_buffer.drain(..n).collect();
        buf.put_slice(&chunk);
    }
}

impl AsyncRead for MockSerialPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.read_buffer.is_empty() {
            match self.reads_rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => self.read_buffer.extend(chunk),
                // Harness closed: end of file.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        self.fill(buf);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockSerialPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.writes_tx.send(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock device disconnected",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl MockDeviceHarness {
    /// Send raw bytes to the driver.
    ///
    /// # Errors
    /// Fails if the driver side was dropped or the harness was closed.
    pub fn send_bytes(&self, data: &[u8]) -> Result<(), &'static str> {
        self.reads_tx
            .as_ref()
            .ok_or("mock device closed")?
            .send(data.to_vec())
            .map_err(|_| "driver port disconnected")
    }

    /// Send one response line; `\r\n` is appended.
    pub fn send_line(&self, line: &str) -> Result<(), &'static str> {
        self.send_bytes(format!("{}\r\n", line).as_bytes())
    }

    /// Send several response lines in order.
    pub fn send_lines<'a, I>(&self, lines: I) -> Result<(), &'static str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        lines.into_iter().try_for_each(|line| self.send_line(line))
    }

    /// Simulate the device disappearing: the driver sees end-of-file.
    pub fn close(&mut self) {
        self.reads_tx = None;
    }

    /// Wait for the next complete frame ending in `end`.
    ///
    /// Returns `None` once the driver side has been dropped and every buffered frame
    /// has been consumed.
    pub async fn next_frame(&mut self, end: u8) -> Option<String> {
        loop {
            if let Some(pos) = self.write_buffer.iter().position(|b| *b == end) {
                let frame: Vec<u8> = self.write_buffer.drain(..=pos).collect();
                return Some(String::from_utf8_lossy(&frame).into_owned());
            }
            let chunk = self.writes_rx.recv().await?;
            self.write_buffer.extend_from_slice(&chunk);
        }
    }

    /// Assert that the driver writes exactly `expected` next.
    ///
    /// # Panics
    /// On mismatch or if nothing is written within two seconds.
    pub async fn expect_frame(&mut self, expected: &str) {
        let end = expected.as_bytes().last().copied().unwrap_or(b';');
        match tokio::time::timeout(WRITE_WAIT, self.next_frame(end)).await {
            Ok(Some(actual)) => assert_eq!(actual, expected, "unexpected frame from driver"),
            Ok(None) => panic!("driver disconnected while waiting for {:?}", expected),
            Err(_) => panic!("timed out waiting for frame {:?}", expected),
        }
    }

    /// Expect a frame and answer it with one line.
    pub async fn expect_and_respond(&mut self, expected: &str, response: &str) {
        self.expect_frame(expected).await;
        if let Err(e) = self.send_line(response) {
            panic!("failed to respond to {:?}: {}", expected, e);
        }
    }

    /// True if the driver wrote nothing within `window`.
    pub async fn is_silent(&mut self, window: Duration) -> bool {
        if !self.write_buffer.is_empty() {
            return false;
        }
        match tokio::time::timeout(window, self.writes_rx.recv()).await {
            Ok(Some(chunk)) => {
                self.write_buffer.extend_from_slice(&chunk);
                false
            }
            Ok(None) | Err(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn frames_split_on_end_delimiter() {
        let (port, mut device) = new();
        let mut port = BufReader::new(port);

        port.write_all(b"#GP;#SP").await.unwrap();
        port.write_all(b" 4;").await.unwrap();

        assert_eq!(device.next_frame(b';').await.as_deref(), Some("#GP;"));
        assert_eq!(device.next_frame(b';').await.as_deref(), Some("#SP 4;"));
    }

    #[tokio::test]
    async fn lines_reach_the_driver() {
        let (port, mut device) = new();
        let mut port = BufReader::new(port);

        let app = tokio::spawn(async move {
            port.write_all(b"#VR;").await.unwrap();
            let mut line = String::new();
            port.read_line(&mut line).await.unwrap();
            line
        });

        device.expect_and_respond("#VR;", "Version: 2.1").await;
        assert_eq!(app.await.unwrap(), "Version: 2.1\r\n");
    }

    #[tokio::test]
    async fn closing_the_device_gives_eof() {
        let (port, mut device) = new();
        let mut port = BufReader::new(port);
        device.close();
        let mut line = String::new();
        assert_eq!(port.read_line(&mut line).await.unwrap(), 0);
        assert!(device.send_line("late").is_err());
    }
}
