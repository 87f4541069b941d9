use crate::service::ServiceRecord;
use serde::Deserialize;
use std::path::Path;

/// Gateway settings, immutable after construction
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Base host for subdomain matching; `orders.example.com` routes to the
    /// `orders` service when this is `example.com`
    pub base_host: String,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Listen port (default: 8001)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Pub/sub channel carrying service records (default: services)
    #[serde(default = "default_channel_name")]
    pub channel_name: String,

    /// Services registered before the gateway starts accepting traffic
    #[serde(default)]
    pub services: Vec<ServiceRecord>,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8001
}

fn default_channel_name() -> String {
    "services".to_string()
}

impl Settings {
    pub fn new(base_host: impl Into<String>) -> Self {
        Self {
            base_host: base_host.into(),
            bind: default_bind(),
            port: default_port(),
            channel_name: default_channel_name(),
            services: Vec::new(),
        }
    }

    /// Set the listen port (builder pattern)
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the pub/sub channel name (builder pattern)
    pub fn with_channel_name(mut self, name: impl Into<String>) -> Self {
        self.channel_name = name.into();
        self
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.base_host.is_empty() {
            anyhow::bail!("'base_host' must not be empty");
        }
        if self.channel_name.is_empty() {
            anyhow::bail!("'channel_name' must not be empty");
        }
        Ok(())
    }

    /// The address the listener binds
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
