//! Shared serial-port plumbing for the instrument drivers.
//!
//! Drivers hold their port as a [`SharedPort`], an `Arc<Mutex<..>>` around a
//! boxed async stream, so one transaction owns the port at a time and tests
//! can substitute `tokio::io::duplex` for real hardware.
//!
//! A missing or truncated reply is reported as `DeviceError::Parse`: these
//! controllers routinely drop a reply under load, and settle-polling retries
//! parse failures. Write failures are transport failures.

use crate::error::{DeviceError, DeviceResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Trait alias for any async byte stream usable as a serial port.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Boxed serial stream.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Port shared between the methods of one driver.
pub type SharedPort = Arc<Mutex<DynSerial>>;

/// Wrap any stream as a [`SharedPort`].
pub fn shared<T: SerialPortIO + 'static>(stream: T) -> SharedPort {
    Arc::new(Mutex::new(Box::new(stream)))
}

/// Line settings for opening a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSettings {
    /// Baud rate.
    pub baud_rate: u32,
    /// Two stop bits instead of one.
    pub two_stop_bits: bool,
}

impl PortSettings {
    /// 8N1 at `baud_rate`.
    pub const fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            two_stop_bits: false,
        }
    }

    /// 8N2 at `baud_rate`.
    pub const fn two_stop_bits(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            two_stop_bits: true,
        }
    }
}

/// Open a serial port and wrap it as a [`SharedPort`].
///
/// Opening happens on the blocking pool; some USB adapters stall for seconds.
pub async fn open_port(path: &str, settings: PortSettings) -> DeviceResult<SharedPort> {
    let path_owned = path.to_string();
    let stream = tokio::task::spawn_blocking(move || {
        use tokio_serial::SerialPortBuilderExt;

        let stop_bits = if settings.two_stop_bits {
            tokio_serial::StopBits::Two
        } else {
            tokio_serial::StopBits::One
        };
        tokio_serial::new(&path_owned, settings.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(stop_bits)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
    })
    .await
    .map_err(|e| DeviceError::Transport(format!("port open task failed: {}", e)))?
    .map_err(|e| DeviceError::Transport(format!("failed to open {}: {}", path, e)))?;

    tracing::info!(port = path, baud = settings.baud_rate, "opened serial port");
    Ok(shared(stream))
}

/// Names of the serial ports present on this machine.
pub fn list_ports() -> DeviceResult<Vec<String>> {
    let ports = tokio_serial::available_ports()
        .map_err(|e| DeviceError::Transport(format!("port enumeration failed: {}", e)))?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

/// Write `command` and flush.
pub async fn write_command(port: &mut DynSerial, command: &[u8]) -> DeviceResult<()> {
    port.write_all(command).await?;
    port.flush().await?;
    Ok(())
}

/// Read one line terminated by `\r` or `\n`, skipping empty lines.
pub async fn read_line(port: &mut DynSerial, timeout: Duration) -> DeviceResult<String> {
    let read = async {
        let mut line = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            let n = port.read(&mut byte).await?;
            if n == 0 {
                return Err(DeviceError::Disconnected);
            }
            match byte[0] {
                b'\r' | b'\n' if line.is_empty() => continue,
                b'\r' | b'\n' => break,
                b => line.push(b),
            }
        }
        Ok(String::from_utf8_lossy(&line).trim().to_string())
    };
    tokio::time::timeout(timeout, read)
        .await
        .map_err(|_| DeviceError::Parse(format!("no reply within {:?}", timeout)))?
}

/// Read exactly `len` bytes.
pub async fn read_exact(
    port: &mut DynSerial,
    len: usize,
    timeout: Duration,
) -> DeviceResult<String> {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(timeout, port.read_exact(&mut buf))
        .await
        .map_err(|_| DeviceError::Parse(format!("short reply within {:?}", timeout)))??;
    Ok(String::from_utf8_lossy(&buf).to_string())
}

/// Discard whatever is waiting in the receive buffer.
pub async fn drain(port: &mut DynSerial) {
    let mut discard = [0u8; 256];
    loop {
        match tokio::time::timeout(Duration::from_millis(5), port.read(&mut discard)).await {
            Ok(Ok(n)) if n > 0 => continue,
            _ => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_line_skips_blank_lines() {
        let (mut host, device) = tokio::io::duplex(64);
        let port = shared(device);
        host.write_all(b"\r\n12000\r").await.unwrap();

        let mut guard = port.lock().await;
        let line = read_line(&mut guard, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(line, "12000");
    }

    #[tokio::test]
    async fn silence_is_a_parse_failure() {
        let (_host, device) = tokio::io::duplex(64);
        let port = shared(device);
        let mut guard = port.lock().await;
        let err = read_line(&mut guard, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::Parse(_)));
    }

    #[tokio::test]
    async fn closed_peer_is_a_disconnect() {
        let (host, device) = tokio::io::duplex(64);
        drop(host);
        let port = shared(device);
        let mut guard = port.lock().await;
        let err = read_line(&mut guard, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err, DeviceError::Disconnected);
    }
}
