//! Host and path routing.
//!
//! The route table maps a hostname to a virtual [`Host`] by longest-suffix
//! match, and each host maps a request path to a [`Backend`] by first-match
//! over its route patterns. Built once from configuration; read-only and
//! shared across all connection tasks afterwards.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};

use crate::config::{Config, HostConfig, TargetConfig};

/// A routing target. Immutable after construction.
#[derive(Debug)]
pub enum Backend {
    Handler(HandlerSpec),
    Dir(DirSpec),
    Proxy(ProxySpec),
}

impl Backend {
    pub fn kind(&self) -> &'static str {
        match self {
            Backend::Handler(_) => "handler",
            Backend::Dir(_) => "directory",
            Backend::Proxy(_) => "proxy",
        }
    }
}

/// An external handler process, addressed over the messaging transport.
#[derive(Debug, Clone)]
pub struct HandlerSpec {
    /// Identity token delivered with every payload.
    pub ident: String,
    /// Where the transport delivers frames for this handler.
    pub send_addr: String,
}

/// A static file directory.
#[derive(Debug, Clone)]
pub struct DirSpec {
    pub root: PathBuf,
    pub index_file: String,
}

/// An upstream HTTP server to reverse-proxy.
#[derive(Debug, Clone)]
pub struct ProxySpec {
    pub host: String,
    pub port: u16,
}

impl TryFrom<&TargetConfig> for Backend {
    type Error = anyhow::Error;

    fn try_from(target: &TargetConfig) -> anyhow::Result<Self> {
        match target {
            TargetConfig::Handler { ident, send_addr } => Ok(Backend::Handler(HandlerSpec {
                ident: ident.clone(),
                send_addr: send_addr.clone(),
            })),
            TargetConfig::Directory { root, index_file } => Ok(Backend::Dir(DirSpec {
                root: root.clone(),
                index_file: index_file.clone(),
            })),
            TargetConfig::Proxy { url } => {
                let parsed = url::Url::parse(url).context("Invalid proxy URL")?;
                let host = parsed
                    .host_str()
                    .context("Proxy URL missing host")?
                    .to_string();
                let port = parsed.port().unwrap_or(80);
                Ok(Backend::Proxy(ProxySpec { host, port }))
            }
        }
    }
}

/// A named virtual host: an ordered set of path-routed backends plus an
/// optional default backend.
#[derive(Debug)]
pub struct Host {
    pub name: String,
    routes: Vec<(String, Arc<Backend>)>,
    default: Option<Arc<Backend>>,
}

impl Host {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            routes: Vec::new(),
            default: None,
        }
    }

    pub fn add_route(&mut self, pattern: impl Into<String>, backend: Arc<Backend>) {
        self.routes.push((pattern.into(), backend));
    }

    pub fn set_default(&mut self, backend: Arc<Backend>) {
        self.default = Some(backend);
    }

    /// Finds the backend for `path`: patterns are prefix-matched in
    /// registration order, first match wins. Falls back to the default
    /// backend if one is set.
    pub fn resolve_backend(&self, path: &str) -> Option<(Arc<Backend>, &str)> {
        for (pattern, backend) in &self.routes {
            if path.starts_with(pattern.as_str()) {
                return Some((backend.clone(), pattern.as_str()));
            }
        }

        self.default.as_ref().map(|b| (b.clone(), ""))
    }

    fn from_config(cfg: &HostConfig) -> anyhow::Result<Self> {
        let mut host = Host::new(&cfg.name);

        for route in &cfg.routes {
            let backend = Backend::try_from(&route.target)
                .with_context(|| format!("Bad route {} for host {}", route.pattern, cfg.name))?;
            host.add_route(&route.pattern, Arc::new(backend));
        }

        if let Some(target) = &cfg.default {
            let backend = Backend::try_from(target)
                .with_context(|| format!("Bad default backend for host {}", cfg.name))?;
            host.set_default(Arc::new(backend));
        }

        Ok(host)
    }
}

/// Maps hostnames to virtual hosts.
#[derive(Debug)]
pub struct RouteTable {
    /// Registered (suffix, host) pairs in registration order.
    hosts: Vec<(String, Arc<Host>)>,
    default_host: Option<Arc<Host>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            hosts: Vec::new(),
            default_host: None,
        }
    }

    pub fn add_host(&mut self, host: Host) -> Arc<Host> {
        let host = Arc::new(host);
        self.hosts.push((host.name.clone(), host.clone()));
        host
    }

    pub fn set_default_host(&mut self, host: Arc<Host>) {
        self.default_host = Some(host);
    }

    pub fn default_host(&self) -> Option<Arc<Host>> {
        self.default_host.clone()
    }

    /// Longest-suffix hostname match: `mail.example.com` matches a
    /// registered `example.com`. Ties go to the earliest registration.
    /// Falls back to the default host; `None` only when there is none.
    pub fn resolve_host(&self, hostname: &str) -> Option<Arc<Host>> {
        let mut found: Option<(usize, &Arc<Host>)> = None;

        for (suffix, host) in &self.hosts {
            if !suffix_matches(hostname, suffix) {
                continue;
            }

            let labels = suffix.split('.').count();
            match found {
                Some((best, _)) if best >= labels => {}
                _ => found = Some((labels, host)),
            }
        }

        found
            .map(|(_, host)| host.clone())
            .or_else(|| self.default_host.clone())
    }

    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let mut table = RouteTable::new();

        for host_cfg in &cfg.hosts {
            let host = Host::from_config(host_cfg)?;
            table.add_host(host);
        }

        if let Some(name) = &cfg.server.default_host {
            let found = table
                .hosts
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, h)| h.clone());

            match found {
                Some(host) => table.set_default_host(host),
                None => bail!("default_host {name} names no configured host"),
            }
        }

        Ok(table)
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Label-aligned suffix test: equal, or ends with `.suffix`.
fn suffix_matches(hostname: &str, suffix: &str) -> bool {
    if hostname == suffix {
        return true;
    }

    hostname.len() > suffix.len()
        && hostname.ends_with(suffix)
        && hostname.as_bytes()[hostname.len() - suffix.len() - 1] == b'.'
}
