use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
};

use anyhow::{Context, bail};

use crate::model::registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePreference {
    /// GPU when one is available, CPU otherwise.
    Auto,
    Cpu,
    Cuda(usize),
}

impl FromStr for DevicePreference {
    type Err = std::convert::Infallible;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let lower = raw.trim().to_lowercase();
        let preference = if lower == "cpu" {
            DevicePreference::Cpu
        } else if lower.starts_with("cuda") || lower.starts_with("gpu") {
            let idx = lower
                .split(':')
                .nth(1)
                .and_then(|s| s.parse::<usize>().ok())
                .unwrap_or(0);
            DevicePreference::Cuda(idx)
        } else {
            DevicePreference::Auto
        };
        Ok(preference)
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub models_dir: PathBuf,
    pub device: DevicePreference,
    pub hf_token: Option<String>,
    pub offline: bool,
    pub preload_models: Vec<String>,
    pub max_sequence_length: usize,
    pub libtorch_path: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8000),
            models_dir: PathBuf::from("./models"),
            device: DevicePreference::Auto,
            hf_token: None,
            offline: false,
            preload_models: Vec::new(),
            max_sequence_length: 512,
            libtorch_path: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup; `from_env` passes
    /// the process environment.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let listen_addr = lookup("SERVER_ADDR")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.listen_addr);

        let models_dir = lookup("MODELS_DIR")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.models_dir);

        let device = lookup("DEVICE")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.device);

        let hf_token = lookup("HF_TOKEN").filter(|v| !v.is_empty());
        let offline = lookup("HF_HUB_OFFLINE")
            .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let preload_models = match lookup("PRELOAD_MODELS") {
            Some(raw) => parse_model_list(&raw)?,
            None => Vec::new(),
        };

        let max_sequence_length = match lookup("MAX_SEQUENCE_LENGTH") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .with_context(|| format!("MAX_SEQUENCE_LENGTH must be an integer, got {raw:?}"))?,
            None => defaults.max_sequence_length,
        };
        if max_sequence_length < 2 {
            bail!("MAX_SEQUENCE_LENGTH must leave room for special tokens");
        }

        let libtorch_path = lookup("LIBTORCH").map(PathBuf::from);

        Ok(Self {
            listen_addr,
            models_dir,
            device,
            hf_token,
            offline,
            preload_models,
            max_sequence_length,
            libtorch_path,
        })
    }
}

fn parse_model_list(raw: &str) -> anyhow::Result<Vec<String>> {
    let mut models = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let descriptor = registry::resolve(name)
            .map_err(|err| anyhow::anyhow!("PRELOAD_MODELS: {err}"))?;
        if !models.iter().any(|m| m == descriptor.short_id) {
            models.push(descriptor.short_id.to_string());
        }
    }
    Ok(models)
}
