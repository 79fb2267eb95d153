use std::collections::HashMap;

use serde::Deserialize;

use crate::model::{ChannelCoordinates, EncoderKind};

/// Which tuner-control backend to speak to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    EdcbLike,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

/// The complete configuration surface the core recognises (spec.md §6): no
/// other source of truth exists for these values.
#[derive(Debug, Clone, Deserialize)]
pub struct TunerConfig {
    pub backend: BackendKind,
    pub backend_endpoint: String,
    #[serde(default)]
    pub always_use_http_backend_for_tv: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncodingConfig {
    pub encoder: EncoderKind,
    #[serde(default = "default_max_alive_time_sec")]
    pub max_alive_time_sec: u64,
}

fn default_max_alive_time_sec() -> u64 {
    10
}

/// One entry of the channel directory. The channel metadata database proper
/// is out of scope (spec.md §1); this is the minimal static stand-in a
/// deployment supplies directly in its config file.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelEntry {
    pub network_id: u16,
    pub transport_stream_id: u16,
    pub service_id: u16,
    #[serde(default)]
    pub dual_mono: bool,
}

impl From<&ChannelEntry> for ChannelCoordinates {
    fn from(entry: &ChannelEntry) -> Self {
        ChannelCoordinates {
            network_id: entry.network_id,
            transport_stream_id: entry.transport_stream_id,
            service_id: entry.service_id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerConfig,
    pub tuner: TunerConfig,
    pub encoding: EncodingConfig,
    #[serde(default)]
    pub monitoring: crate::metrics::MonitoringConfig,
    #[serde(default)]
    pub channels: HashMap<String, ChannelEntry>,
}

impl Settings {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn channel_directory(&self) -> crate::model::StaticChannelDirectory {
        let channels = self
            .channels
            .iter()
            .map(|(id, entry)| (id.clone(), (ChannelCoordinates::from(entry), entry.dual_mono)))
            .collect();
        crate::model::StaticChannelDirectory::with_dual_mono(channels)
    }
}
