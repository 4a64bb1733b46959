//! Laseroptik AVACS variable attenuator driver.
//!
//! The attenuator is set by angle in tenths of a degree (`A380\r` = 38.0°)
//! after switching to remote mode with `MR\r`. Each `A` command is answered
//! with an 11-byte status frame whose third `;`-separated field is the current
//! angle in tenths of a degree. There is no separate position query, so a
//! readback re-sends the last setpoint and parses the frame.
//!
//! Power requests are converted to angles through [`AttenuatorCalibration`].

use crate::error::{DeviceError, DeviceResult};
use crate::hardware::calibration::AttenuatorCalibration;
use crate::hardware::capabilities::PowerSettable;
use crate::hardware::serial::{self, PortSettings, SharedPort};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;

const FRAME_LEN: usize = 11;

/// AVACS attenuator driven in percent transmission.
pub struct AvacsDriver {
    port: SharedPort,
    calibration: AttenuatorCalibration,
    setpoint_deg: Mutex<f64>,
    timeout: Duration,
}

impl AvacsDriver {
    /// Open the attenuator at 19200 baud and put it in remote mode.
    pub async fn open(path: &str, calibration: AttenuatorCalibration) -> DeviceResult<Self> {
        let port = serial::open_port(path, PortSettings::new(19200)).await?;
        let driver = Self::with_port(port, calibration);
        driver.remote_mode().await?;
        tracing::info!(port = path, "AVACS attenuator connected");
        Ok(driver)
    }

    /// Wrap an already open port.
    pub fn with_port(port: SharedPort, calibration: AttenuatorCalibration) -> Self {
        Self {
            port,
            calibration,
            setpoint_deg: Mutex::new(calibration.min_angle),
            timeout: Duration::from_secs(2),
        }
    }

    async fn remote_mode(&self) -> DeviceResult<()> {
        let mut port = self.port.lock().await;
        serial::write_command(&mut port, b"MR\r").await
    }

    /// Send an angle setpoint and return the angle reported in the reply.
    async fn send_angle(&self, degrees: f64) -> DeviceResult<f64> {
        let mut port = self.port.lock().await;
        serial::drain(&mut port).await;
        serial::write_command(&mut port, angle_command(degrees).as_bytes()).await?;
        let frame = serial::read_exact(&mut port, FRAME_LEN, self.timeout).await?;
        parse_frame(&frame)
    }

    /// Current angle in degrees.
    pub async fn read_angle(&self) -> DeviceResult<f64> {
        let setpoint = *self.setpoint_deg.lock().await;
        self.send_angle(setpoint).await
    }
}

/// `A<tenths>\r` for an angle rounded to 0.1°.
pub fn angle_command(degrees: f64) -> String {
    format!("A{}\r", (degrees * 10.0).round() as i64)
}

/// Angle in degrees from an AVACS status frame.
pub fn parse_frame(frame: &str) -> DeviceResult<f64> {
    let field = frame
        .split(';')
        .nth(2)
        .ok_or_else(|| DeviceError::Parse(format!("attenuator frame '{}'", frame.trim())))?;
    let tenths: f64 = field
        .trim()
        .parse()
        .map_err(|_| DeviceError::Parse(format!("attenuator angle '{}'", field.trim())))?;
    Ok(tenths.round() / 10.0)
}

#[async_trait]
impl PowerSettable for AvacsDriver {
    async fn set_power(&self, percent: f64) -> DeviceResult<()> {
        let angle = self.calibration.angle_for(percent);
        tracing::debug!(percent, angle, "AVACS setpoint");
        *self.setpoint_deg.lock().await = angle;
        self.send_angle(angle).await.map(|_| ())
    }

    async fn read_power(&self) -> DeviceResult<f64> {
        let angle = self.read_angle().await?;
        Ok(self.calibration.percent_at(angle))
    }

    fn quantize(&self, percent: f64) -> f64 {
        self.calibration.achievable_percent(percent)
    }
}
