//! PI C-867 PILine rotation controller driver (GCS ASCII protocol).
//!
//! Axis `1` only. Connection turns the servo on, identifies the controller and
//! runs a reference move (`FRF 1`), which takes several seconds. Queries are
//! answered as `<axis>=<value>`.

use crate::error::{DeviceError, DeviceResult};
use crate::hardware::capabilities::Rotatable;
use crate::hardware::serial::{self, PortSettings, SharedPort};
use async_trait::async_trait;
use std::time::Duration;

/// Time the controller needs to finish a reference move.
const REFERENCE_WAIT: Duration = Duration::from_secs(6);

/// PI C-867 single-axis rotation stage in degrees.
pub struct PilineDriver {
    port: SharedPort,
    timeout: Duration,
}

impl PilineDriver {
    /// Open the controller at 115200 baud, enable the servo and reference axis 1.
    pub async fn open(path: &str) -> DeviceResult<Self> {
        let port = serial::open_port(path, PortSettings::new(115200)).await?;
        let driver = Self::with_port(port);
        driver.command("SVO 1 1").await?;
        let id = driver.query("*IDN?").await?;
        tracing::info!(port = path, id = %id, "PI C-867 connected, referencing");
        driver.command("FRF 1").await?;
        tokio::time::sleep(REFERENCE_WAIT).await;
        if !driver.is_referenced().await? {
            return Err(DeviceError::Transport(
                "PI C-867 reference move did not complete".into(),
            ));
        }
        Ok(driver)
    }

    /// Wrap an already open port.
    pub fn with_port(port: SharedPort) -> Self {
        Self {
            port,
            timeout: Duration::from_secs(2),
        }
    }

    /// Whether the last reference move succeeded.
    pub async fn is_referenced(&self) -> DeviceResult<bool> {
        let reply = self.query("FRF? 1").await?;
        Ok(parse_axis_value(&reply)? != 0.0)
    }

    async fn command(&self, cmd: &str) -> DeviceResult<()> {
        let mut port = self.port.lock().await;
        serial::write_command(&mut port, format!("{}\n", cmd).as_bytes()).await
    }

    async fn query(&self, cmd: &str) -> DeviceResult<String> {
        let mut port = self.port.lock().await;
        serial::drain(&mut port).await;
        serial::write_command(&mut port, format!("{}\n", cmd).as_bytes()).await?;
        serial::read_line(&mut port, self.timeout).await
    }
}

/// Value of a `<axis>=<value>` reply.
pub fn parse_axis_value(reply: &str) -> DeviceResult<f64> {
    reply
        .split_once('=')
        .and_then(|(_, value)| value.trim().parse().ok())
        .ok_or_else(|| DeviceError::Parse(format!("PI reply '{}'", reply)))
}

#[async_trait]
impl Rotatable for PilineDriver {
    async fn rotate_to(&self, degrees: f64) -> DeviceResult<()> {
        self.command(&format!("MOV 1 {}", degrees)).await
    }

    async fn read_angle(&self) -> DeviceResult<f64> {
        let reply = self.query("POS?").await?;
        parse_axis_value(&reply)
    }
}
