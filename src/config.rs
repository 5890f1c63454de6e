use crate::network_stack::NetworkCredentials;
use anyhow::{Context, Result};
use std::{env, path::PathBuf, str::FromStr, sync::OnceLock, time::Duration};

/// Construction inputs of the device core
#[derive(Clone, Debug)]
pub struct DeviceSettings {
    /// Display name; prefix of the hub name and `<name>.local` host name
    pub name: String,
    /// Credentials used while none are persisted
    pub fallback_credentials: NetworkCredentials,
    /// Upper bound of a parsed or serialized state document in bytes
    pub state_doc_size: usize,
    /// Passphrase protecting the local hub
    pub hub_passphrase: String,
}

impl DeviceSettings {
    pub fn new(name: impl Into<String>, fallback_credentials: NetworkCredentials) -> Self {
        Self {
            name: name.into(),
            fallback_credentials,
            state_doc_size: 1024,
            hub_passphrase: String::from("12345678"),
        }
    }

    /// Host name the device advertises on the local network
    pub fn advertised_name(&self) -> String {
        format!("{}.local", self.name)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timing {
    /// Overall bound of the network join wait
    pub join_timeout: Duration,
    /// Interval between address checks while joining
    pub join_poll: Duration,
    /// Delay between the portal confirmation and the restart
    pub restart_grace: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_millis(10000),
            join_poll: Duration::from_millis(500),
            restart_grace: Duration::from_millis(1000),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Ports {
    pub sync: u16,
    pub portal: u16,
    pub dns: u16,
    pub update: u16,
}

impl Default for Ports {
    fn default() -> Self {
        Self {
            sync: 81,
            portal: 80,
            dns: 53,
            update: 8266,
        }
    }
}

/// Application configuration loaded at startup
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub device: DeviceSettings,
    pub timing: Timing,
    pub ports: Ports,
    /// Root of the non-volatile storage
    pub storage_path: PathBuf,
    /// Wireless interface handled by NetworkManager
    pub interface: String,
}

impl AppConfig {
    /// Get or load the application configuration
    ///
    /// # Panics
    /// Panics if configuration loading fails. The device cannot run without a
    /// valid configuration.
    pub fn get() -> &'static Self {
        static APP_CONFIG: OnceLock<AppConfig> = OnceLock::new();
        APP_CONFIG.get_or_init(|| Self::load().expect("failed to load application configuration"))
    }

    fn load() -> Result<Self> {
        let fallback_credentials = NetworkCredentials::new(
            env::var("FALLBACK_SSID").unwrap_or_default(),
            env::var("FALLBACK_PASS").unwrap_or_default(),
        );

        let device = DeviceSettings {
            name: env::var("DEVICE_NAME").unwrap_or_else(|_| env!("CARGO_PKG_NAME").to_string()),
            fallback_credentials,
            state_doc_size: parse_var("STATE_DOC_SIZE", "1024")?,
            hub_passphrase: env::var("HUB_PASSPHRASE").unwrap_or_else(|_| "12345678".to_string()),
        };

        let timing = Timing {
            join_timeout: Duration::from_millis(parse_var("JOIN_TIMEOUT_MS", "10000")?),
            join_poll: Duration::from_millis(parse_var("JOIN_POLL_MS", "500")?),
            restart_grace: Duration::from_millis(parse_var("RESTART_GRACE_MS", "1000")?),
        };

        let ports = Ports {
            sync: parse_var("SYNC_PORT", "81")?,
            portal: parse_var("PORTAL_PORT", "80")?,
            dns: parse_var("DNS_PORT", "53")?,
            update: parse_var("UPDATE_PORT", "8266")?,
        };

        let storage_path = env::var("STORAGE_PATH")
            .unwrap_or_else(|_| "/data".to_string())
            .into();

        let interface = env::var("WIFI_INTERFACE").unwrap_or_else(|_| "wlan0".to_string());

        Ok(Self {
            device,
            timing,
            ports,
            storage_path,
            interface,
        })
    }
}

fn parse_var<T>(name: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse::<T>()
        .context(format!("failed to parse {name}: invalid format"))
}
