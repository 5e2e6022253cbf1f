//! Admission policy for peer upgrades.
//!
//! Peers must connect from an allow-listed address when the list is enabled.
//! The list comes from configuration plus an optional file (one address per
//! line, `#` comments) that is re-read whenever its modification time changes.

use std::{
    collections::HashSet,
    io,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub trait IpPolicy: Send + Sync {
    /// `client_ip` may be a comma-separated forwarding chain; any listed hop
    /// admits the request.
    fn is_allowed(&self, client_ip: &str) -> bool;
}

/// Admits everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl IpPolicy for AllowAll {
    fn is_allowed(&self, _client_ip: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct AllowListConfig {
    pub enabled: bool,
    pub entries: Vec<String>,
    pub file: Option<PathBuf>,
}

pub struct IpAllowList {
    enabled: bool,
    configured: Vec<IpAddr>,
    file: Option<PathBuf>,
    allowed: RwLock<HashSet<IpAddr>>,
}

impl IpAllowList {
    pub fn new(config: &AllowListConfig) -> io::Result<Self> {
        let configured: Vec<IpAddr> = config
            .entries
            .iter()
            .filter_map(|entry| {
                let parsed = parse_address(entry);
                if parsed.is_none() {
                    warn!(entry = %entry, "ignoring unparsable allow-list entry");
                }
                parsed
            })
            .collect();

        let list = Self {
            enabled: config.enabled,
            configured,
            file: config.file.clone(),
            allowed: RwLock::new(HashSet::new()),
        };

        let from_file = match &list.file {
            Some(path) if list.enabled => parse_entries(&std::fs::read_to_string(path)?),
            _ => Vec::new(),
        };
        list.replace_file_entries(from_file);
        Ok(list)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn len(&self) -> usize {
        self.allowed.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-read the allow-list file. Returns the number of admitted addresses.
    pub async fn reload(&self) -> io::Result<usize> {
        let Some(path) = &self.file else {
            return Ok(self.len());
        };
        let content = tokio::fs::read_to_string(path).await?;
        let entries = parse_entries(&content);
        self.replace_file_entries(entries);
        Ok(self.len())
    }

    /// Poll the allow-list file and reload it when it changes. Returns `None`
    /// when there is nothing to watch.
    pub fn spawn_reloader(self: &Arc<Self>, interval: Duration) -> Option<JoinHandle<()>> {
        if !self.enabled {
            return None;
        }
        let path = self.file.clone()?;
        let list = Arc::clone(self);
        let mut ticker = tokio::time::interval(interval);
        Some(tokio::spawn(async move {
            let mut last_seen = modified_at(&path).await;
            loop {
                ticker.tick().await;
                let current = modified_at(&path).await;
                if current.is_none() {
                    if last_seen.is_some() {
                        warn!(path = %path.display(), "allow-list file disappeared; keeping last list");
                    }
                    last_seen = None;
                    continue;
                }
                if current == last_seen {
                    continue;
                }
                last_seen = current;
                match list.reload().await {
                    Ok(count) => info!(path = %path.display(), count, "allow-list reloaded"),
                    Err(err) => warn!(path = %path.display(), error = %err, "failed to reload allow-list"),
                }
            }
        }))
    }

    fn replace_file_entries(&self, from_file: Vec<IpAddr>) {
        let mut allowed: HashSet<IpAddr> = self.configured.iter().copied().collect();
        allowed.extend(from_file);
        *self.allowed.write() = allowed;
    }
}

impl IpPolicy for IpAllowList {
    fn is_allowed(&self, client_ip: &str) -> bool {
        if !self.enabled {
            return true;
        }
        let allowed = self.allowed.read();
        client_ip
            .split(',')
            .filter_map(parse_address)
            .any(|ip| allowed.contains(&ip))
    }
}

async fn modified_at(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

fn parse_entries(content: &str) -> Vec<IpAddr> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let parsed = parse_address(line);
            if parsed.is_none() {
                debug!(line = %line, "skipping allow-list line");
            }
            parsed
        })
        .collect()
}

/// Accepts `ip`, `ip:port`, `[v6]` and `[v6]:port`.
fn parse_address(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return Some(ip);
    }
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return Some(addr.ip());
    }
    raw.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .ok()
}
