//! Server configuration.
//!
//! Loaded once at startup from a YAML file and handed down to the server and
//! connection constructors. Nothing here mutates after load.

use std::path::PathBuf;

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,

    #[serde(default)]
    pub limits: Limits,

    #[serde(default)]
    pub upload: UploadConfig,

    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: String,

    /// Name of the host entry that answers requests for unregistered
    /// hostnames. Optional; without it unmatched hosts get a 404.
    #[serde(default)]
    pub default_host: Option<String>,
}

/// Per-connection tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct Limits {
    /// Read/relay chunk size, and the cap on a request head.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Largest body delivered to a handler in-message; anything bigger is
    /// streamed to the upload temp store instead.
    #[serde(default = "default_max_content_length")]
    pub max_content_length: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            max_content_length: default_max_content_length(),
        }
    }
}

fn default_buffer_size() -> usize {
    4 * 1024
}

fn default_max_content_length() -> usize {
    20 * 1024
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UploadConfig {
    /// `mkstemp`-style template for large-upload files, e.g.
    /// `/tmp/outpost.upload.XXXXXX`. Uploads over the content-length limit
    /// are rejected with 413 when unset.
    #[serde(default)]
    pub temp_store: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    pub name: String,

    /// Route entries, matched against the request path in the order given.
    #[serde(default)]
    pub routes: Vec<RouteConfig>,

    /// Backend that answers paths no route pattern matches.
    #[serde(default)]
    pub default: Option<TargetConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    pub pattern: String,

    #[serde(flatten)]
    pub target: TargetConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetConfig {
    Handler {
        ident: String,
        send_addr: String,
    },
    Directory {
        root: PathBuf,
        #[serde(default = "default_index_file")]
        index_file: String,
    },
    Proxy {
        url: String,
    },
}

fn default_index_file() -> String {
    "index.html".to_string()
}

impl Config {
    /// Reads the config file named by `OUTPOST_CONFIG` (default
    /// `outpost.yaml`).
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("OUTPOST_CONFIG").unwrap_or_else(|_| "outpost.yaml".to_string());

        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {path}"))?;

        Self::from_yaml(&text).with_context(|| format!("Invalid config file {path}"))
    }

    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        let cfg: Config = serde_yaml::from_str(text)?;
        Ok(cfg)
    }
}
