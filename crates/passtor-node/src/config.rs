//! Node configuration

use passtor_dht::DhtConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name of this instance, the node ID is derived from it
    pub name: String,

    /// Address for peer-to-peer traffic (UDP)
    pub addr: SocketAddr,

    /// Address clients connect to (TCP)
    pub client_addr: SocketAddr,

    /// Bootstrap peers
    pub peers: Vec<SocketAddr>,

    /// 0 = warnings only, 1 = info, 2 and above = debug
    pub verbosity: u8,

    /// DHT parameters
    pub dht: DhtSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtSettings {
    /// K parameter (nodes per bucket)
    pub k: usize,
    /// Alpha parameter (lookup parallelism)
    pub alpha: usize,
    /// Replicas requested for every client push
    pub replication: u32,
    /// Fraction of replicas that must agree on a pull
    pub threshold: f64,
    /// Reply timeout in milliseconds
    pub timeout_ms: u64,
    pub max_retries: u32,
    /// Base republish interval in seconds
    pub republish_interval_secs: u64,
    pub republish: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: String::new(),
            addr: SocketAddr::from(([127, 0, 0, 1], 5000)),
            client_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            peers: Vec::new(),
            verbosity: 1,
            dht: DhtSettings::default(),
        }
    }
}

impl Default for DhtSettings {
    fn default() -> Self {
        let dht = DhtConfig::default();
        Self {
            k: dht.k,
            alpha: dht.alpha,
            replication: dht.replication,
            threshold: dht.threshold,
            timeout_ms: dht.timeout.as_millis() as u64,
            max_retries: dht.max_retries,
            republish_interval_secs: dht.republish_interval.as_secs(),
            republish: dht.republish,
        }
    }
}

impl From<&DhtSettings> for DhtConfig {
    fn from(settings: &DhtSettings) -> Self {
        DhtConfig {
            k: settings.k,
            alpha: settings.alpha,
            replication: settings.replication,
            threshold: settings.threshold,
            timeout: Duration::from_millis(settings.timeout_ms),
            max_retries: settings.max_retries,
            republish_interval: Duration::from_secs(settings.republish_interval_secs),
            republish: settings.republish,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject parameter combinations the DHT cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.dht.k == 0 {
            anyhow::bail!("dht.k must be at least 1");
        }
        if self.dht.alpha == 0 {
            anyhow::bail!("dht.alpha must be at least 1");
        }
        if self.dht.replication == 0 {
            anyhow::bail!("dht.replication must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.dht.threshold) {
            anyhow::bail!("dht.threshold must be between 0 and 1");
        }
        Ok(())
    }

    pub fn dht_config(&self) -> DhtConfig {
        DhtConfig::from(&self.dht)
    }

    /// Name the node goes by; the peer address when none was given
    pub fn node_name(&self) -> String {
        if self.name.is_empty() {
            self.addr.to_string()
        } else {
            self.name.clone()
        }
    }
}
