//! SRS DG645 digital delay generator driver.
//!
//! Used as the laser trigger: each burst configures a single-shot trigger
//! source, the AB pulse width and output amplitude, then issues `*TRG` once
//! per pulse with the requested spacing.

use crate::error::{DeviceError, DeviceResult};
use crate::hardware::capabilities::{PulseBurst, PulseTrigger};
use crate::hardware::serial::{self, PortSettings, SharedPort};
use async_trait::async_trait;
use std::time::Duration;

const VENDOR: &str = "Stanford Research Systems";

/// DG645 pulse generator.
pub struct Dg645Driver {
    port: SharedPort,
    timeout: Duration,
}

impl Dg645Driver {
    /// Open the generator and check its identity.
    pub async fn open(path: &str) -> DeviceResult<Self> {
        let port = serial::open_port(path, PortSettings::new(9600)).await?;
        let driver = Self::with_port(port);
        let id = driver.identify().await?;
        if !id.contains(VENDOR) {
            return Err(DeviceError::Transport(format!(
                "unexpected identity '{}' on {}",
                id, path
            )));
        }
        tracing::info!(port = path, id = %id, "DG645 connected");
        Ok(driver)
    }

    /// Wrap an already open port.
    pub fn with_port(port: SharedPort) -> Self {
        Self {
            port,
            timeout: Duration::from_secs(2),
        }
    }

    /// `*IDN?` reply.
    pub async fn identify(&self) -> DeviceResult<String> {
        let mut port = self.port.lock().await;
        serial::drain(&mut port).await;
        serial::write_command(&mut port, b"*IDN?\r").await?;
        serial::read_line(&mut port, self.timeout).await
    }
}

/// Commands that arm the generator for `burst`.
pub fn setup_commands(burst: &PulseBurst) -> Vec<String> {
    vec![
        "TSRC5\r".to_string(),
        "DLAY2,0,0\r".to_string(),
        format!("DLAY3,2,{}\r", burst.width_ms / 1e3),
        format!("LAMP1,{}\r", burst.amplitude_v),
    ]
}

#[async_trait]
impl PulseTrigger for Dg645Driver {
    async fn fire_burst(&self, burst: &PulseBurst) -> DeviceResult<u32> {
        let spacing = Duration::from_secs_f64((burst.delay_ms / 1e3).max(0.0));
        let mut port = self.port.lock().await;
        for cmd in setup_commands(burst) {
            serial::write_command(&mut port, cmd.as_bytes()).await?;
        }
        let mut fired = 0u32;
        for _ in 0..burst.number {
            serial::write_command(&mut port, b"*TRG\r").await?;
            fired += 1;
            tokio::time::sleep(spacing).await;
        }
        tracing::debug!(fired, "pulse burst complete");
        Ok(fired)
    }
}
