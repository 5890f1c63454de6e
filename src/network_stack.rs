use anyhow::{Context, Result, ensure};
use log::{debug, info};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use serde::{Deserialize, Serialize};
use serde_valid::Validate;
use std::{net::IpAddr, time::Duration};
use tokio::process::Command;
use trait_variant::make;

/// Credentials of the external network the device joins
///
/// Persisted as `{"ssid": ..., "pass": ...}`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize, Validate)]
pub struct NetworkCredentials {
    #[validate(min_length = 1)]
    pub ssid: String,
    #[serde(rename = "pass", default)]
    pub passphrase: String,
}

impl NetworkCredentials {
    pub fn new(ssid: impl Into<String>, passphrase: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            passphrase: passphrase.into(),
        }
    }
}

/// Radio capability of the platform
#[make(Send)]
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait NetworkStack {
    /// Start joining the external network described by `credentials`
    async fn join(&self, credentials: &NetworkCredentials) -> Result<()>;
    /// Currently acquired station address, if any
    async fn address(&self) -> Result<Option<IpAddr>>;
    /// Host an isolated local network and return the hub's own address
    async fn start_hub(&self, name: &str, passphrase: &str) -> Result<IpAddr>;
    /// Hardware address of the wireless interface
    async fn hardware_address(&self) -> Result<String>;
}

/// [`NetworkStack`] backed by NetworkManager's `nmcli`
#[derive(Clone, Debug)]
pub struct NmcliNetworkStack {
    interface: String,
    join_wait: Duration,
}

impl NmcliNetworkStack {
    const NMCLI: &str = "nmcli";

    pub fn new(interface: impl Into<String>, join_wait: Duration) -> Self {
        Self {
            interface: interface.into(),
            join_wait,
        }
    }

    async fn nmcli(&self, args: &[&str]) -> Result<String> {
        debug!("{} {}", Self::NMCLI, args.join(" "));

        let output = Command::new(Self::NMCLI)
            .args(args)
            .output()
            .await
            .context("failed to run nmcli")?;

        ensure!(
            output.status.success(),
            "nmcli {} failed with {}: {}",
            args.first().unwrap_or(&""),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );

        String::from_utf8(output.stdout).context("failed to read nmcli output")
    }

    async fn device_field(&self, field: &str) -> Result<String> {
        self.nmcli(&["-g", field, "device", "show", &self.interface])
            .await
    }
}

impl NetworkStack for NmcliNetworkStack {
    async fn join(&self, credentials: &NetworkCredentials) -> Result<()> {
        let wait = self.join_wait.as_secs().max(1).to_string();
        let mut args = vec![
            "--wait",
            wait.as_str(),
            "device",
            "wifi",
            "connect",
            credentials.ssid.as_str(),
        ];

        if !credentials.passphrase.is_empty() {
            args.extend(["password", credentials.passphrase.as_str()]);
        }

        args.extend(["ifname", self.interface.as_str()]);

        self.nmcli(&args).await?;
        Ok(())
    }

    async fn address(&self) -> Result<Option<IpAddr>> {
        let output = self.device_field("IP4.ADDRESS").await?;
        parse_address(&output)
    }

    async fn start_hub(&self, name: &str, passphrase: &str) -> Result<IpAddr> {
        self.nmcli(&[
            "device",
            "wifi",
            "hotspot",
            "ifname",
            &self.interface,
            "ssid",
            name,
            "password",
            passphrase,
        ])
        .await?;

        let address = self
            .address()
            .await?
            .context("failed to get hub address")?;

        info!("hub {name} is up at {address}");
        Ok(address)
    }

    async fn hardware_address(&self) -> Result<String> {
        let output = self.device_field("GENERAL.HWADDR").await?;
        parse_hardware_address(&output)
    }
}

/// Parse the first `IP4.ADDRESS` line, e.g. `192.168.1.20/24`
fn parse_address(output: &str) -> Result<Option<IpAddr>> {
    let Some(line) = output.lines().map(str::trim).find(|l| !l.is_empty()) else {
        return Ok(None);
    };

    let address = line.split('/').next().unwrap_or(line);

    address
        .parse::<IpAddr>()
        .map(Some)
        .context(format!("failed to parse address {line:?}"))
}

/// `nmcli -g` escapes the colons of hardware addresses
fn parse_hardware_address(output: &str) -> Result<String> {
    let address = output.trim().replace("\\:", ":");
    ensure!(!address.is_empty(), "failed to get hardware address");
    Ok(address)
}
