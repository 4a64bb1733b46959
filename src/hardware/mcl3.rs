//! Märzhäuser MCL-3 stage controller driver.
//!
//! Protocol notes:
//! - 8N2 serial, commands terminated by `\r`
//! - Positions are reported in motor units, 4000 units per centimetre
//! - `UC\r\r` / `UD\r\r` query X / Y
//! - Moves are relative: `U\x07v\r` selects the move mode, `U\x00<dx>\r` and
//!   `U\x01<dy>\r` load the deltas, `UP\r` starts the motion
//! - `UF\r\r` returns a status word
//!
//! The controller must be in "auto" mode on its front panel.

use crate::error::{DeviceError, DeviceResult};
use crate::hardware::capabilities::Positionable;
use crate::hardware::serial::{self, PortSettings, SharedPort};
use async_trait::async_trait;
use std::time::Duration;

/// Motor units per centimetre.
pub const UNITS_PER_CM: f64 = 4000.0;

/// Position queries tried before a standalone `move_to` gives up.
const PRE_MOVE_READS: u32 = 5;

/// MCL-3 two-axis stage in centimetres.
pub struct Mcl3Driver {
    port: SharedPort,
    timeout: Duration,
}

impl Mcl3Driver {
    /// Open the controller and query its status.
    pub async fn open(path: &str) -> DeviceResult<Self> {
        let port = serial::open_port(path, PortSettings::two_stop_bits(9600)).await?;
        let driver = Self::with_port(port);
        let status = driver.status().await?;
        tracing::info!(port = path, %status, "MCL-3 stage connected");
        Ok(driver)
    }

    /// Wrap an already open port.
    pub fn with_port(port: SharedPort) -> Self {
        Self {
            port,
            timeout: Duration::from_secs(1),
        }
    }

    /// Controller status word.
    pub async fn status(&self) -> DeviceResult<String> {
        let mut port = self.port.lock().await;
        serial::drain(&mut port).await;
        serial::write_command(&mut port, b"UF\r\r").await?;
        serial::read_line(&mut port, self.timeout).await
    }

    async fn read_axis(&self, query: &[u8]) -> DeviceResult<f64> {
        let mut port = self.port.lock().await;
        serial::drain(&mut port).await;
        serial::write_command(&mut port, query).await?;
        let reply = serial::read_line(&mut port, self.timeout).await?;
        parse_units(&reply)
    }
}

/// Convert a position reply in motor units to centimetres, rounded to 0.01.
pub fn parse_units(reply: &str) -> DeviceResult<f64> {
    let units: f64 = reply
        .trim()
        .parse()
        .map_err(|_| DeviceError::Parse(format!("stage position '{}'", reply)))?;
    Ok((units / UNITS_PER_CM * 100.0).round() / 100.0)
}

/// Relative move command for deltas in centimetres.
pub fn move_command(dx_cm: f64, dy_cm: f64) -> Vec<u8> {
    let dx = (dx_cm * UNITS_PER_CM).round() as i64;
    let dy = (dy_cm * UNITS_PER_CM).round() as i64;
    format!("U\x07v\rU\x00{}\rU\x01{}\rUP\r", dx, dy).into_bytes()
}

#[async_trait]
impl Positionable for Mcl3Driver {
    async fn move_to(&self, x: f64, y: f64) -> DeviceResult<()> {
        let mut attempt = 1;
        let current = loop {
            match self.read_position().await {
                Ok(position) => break position,
                Err(DeviceError::Parse(reply)) if attempt < PRE_MOVE_READS => {
                    tracing::debug!(attempt, %reply, "MCL-3 position unreadable, asking again");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };
        self.move_from(current, x, y).await
    }

    async fn move_from(&self, from: (f64, f64), x: f64, y: f64) -> DeviceResult<()> {
        let dx = ((x - from.0) * 100.0).round() / 100.0;
        let dy = ((y - from.1) * 100.0).round() / 100.0;
        if dx == 0.0 && dy == 0.0 {
            return Ok(());
        }
        tracing::debug!(x, y, dx, dy, "MCL-3 relative move");
        let mut port = self.port.lock().await;
        serial::write_command(&mut port, &move_command(dx, dy)).await?;
        serial::drain(&mut port).await;
        Ok(())
    }

    async fn read_position(&self) -> DeviceResult<(f64, f64)> {
        let x = self.read_axis(b"UC\r\r").await?;
        let y = self.read_axis(b"UD\r\r").await?;
        Ok((x, y))
    }
}
