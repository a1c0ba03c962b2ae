//! Reading the CPU temperature that the client reports to the server.

use std::fmt::Debug;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::ProbeConfig;

/// Source of the temperature reading. The production implementation shells out
///  to `vcgencmd measure_temp` (or whatever is configured), tests substitute a
///  mock.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TemperatureProbe: Debug + Send + Sync {
    /// Never fails: a probe that cannot produce a reading returns a fallback
    ///  value instead.
    async fn read_temperature(&self) -> String;
}

/// Runs a configured shell command and takes the first line of its output as
///  the reading. The command is killed when it exceeds its timeout, and any
///  failure degrades to the configured fallback string.
#[derive(Debug)]
pub struct CommandProbe {
    config: ProbeConfig,
}

impl CommandProbe {
    pub fn new(config: ProbeConfig) -> anyhow::Result<CommandProbe> {
        config.validate()?;
        Ok(CommandProbe { config })
    }

    async fn run_command(&self) -> anyhow::Result<String> {
        let mut command = Command::new("sh");
        command.arg("-c").arg(&self.config.command).kill_on_drop(true);

        let output = tokio::time::timeout(self.config.timeout, command.output())
            .await
            .map_err(|_| anyhow!("'{}' did not finish within {:?}",
                                 self.config.command, self.config.timeout))??;

        if !output.status.success() {
            bail!("'{}' exited with {}", self.config.command, output.status);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let reading = match stdout.lines().next() {
            Some(line) => line.trim_end(),
            None => "",
        };
        if reading.is_empty() {
            bail!("'{}' produced no output", self.config.command);
        }
        Ok(reading.to_string())
    }
}

#[async_trait]
impl TemperatureProbe for CommandProbe {
    async fn read_temperature(&self) -> String {
        match self.run_command().await {
            Ok(reading) => {
                debug!("temperature reading: {}", reading);
                reading
            }
            Err(e) => {
                warn!("temperature probe failed: {:#} - using the fallback reading", e);
                self.config.fallback.clone()
            }
        }
    }
}
