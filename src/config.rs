//! Session configuration parsed from environment variables.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{SmError, SmResult};

pub const DEFAULT_SERVER_PORT: u16 = 11111;
pub const DEFAULT_NUM_PROCESSES: u32 = 1;
pub const DEFAULT_ID_BLOCK_SIZE: u32 = 1000;
pub const DEFAULT_REVERSE_CONNECT_POLL_MS: u64 = 100;

/// Where a session's server processes live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerUrl {
    /// In-process server sharing the client's address space.
    Builtin,
    /// Client connects out to `host:port`.
    Tcp { host: String, port: u16 },
    /// Client listens on `port` and the server connects back.
    ReverseTcp { port: u16 },
}

impl FromStr for ServerUrl {
    type Err = SmError;

    /// Accepts `builtin:`, `cs://host[:port]`, `tcp://host[:port]` and `csrc://[host:]port`.
    fn from_str(raw: &str) -> SmResult<Self> {
        let raw = raw.trim();
        if raw == "builtin:" || raw == "builtin" {
            return Ok(Self::Builtin);
        }
        let Some((scheme, rest)) = raw.split_once("://") else {
            return Err(SmError::Config(format!("server url without scheme: {raw}")));
        };
        match scheme {
            "cs" | "tcp" => {
                let (host, port) = split_host_port(rest)?;
                if host.is_empty() {
                    return Err(SmError::Config(format!("server url without host: {raw}")));
                }
                Ok(Self::Tcp { host: host.to_owned(), port })
            }
            "csrc" => {
                let port = match rest.rsplit_once(':') {
                    Some((_, port)) => parse_port(port)?,
                    None if rest.is_empty() => DEFAULT_SERVER_PORT,
                    None => parse_port(rest)?,
                };
                Ok(Self::ReverseTcp { port })
            }
            other => Err(SmError::Config(format!("unsupported server url scheme: {other}"))),
        }
    }
}

impl fmt::Display for ServerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Builtin => write!(f, "builtin:"),
            Self::Tcp { host, port } => write!(f, "cs://{host}:{port}"),
            Self::ReverseTcp { port } => write!(f, "csrc://{port}"),
        }
    }
}

fn split_host_port(rest: &str) -> SmResult<(&str, u16)> {
    match rest.rsplit_once(':') {
        Some((host, port)) => Ok((host, parse_port(port)?)),
        None => Ok((rest, DEFAULT_SERVER_PORT)),
    }
}

fn parse_port(raw: &str) -> SmResult<u16> {
    raw.parse().map_err(|_| SmError::Config(format!("invalid port: {raw}")))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub server_url: ServerUrl,
    pub plugin_paths: Vec<PathBuf>,
    pub num_processes: u32,
    pub id_block_size: u32,
    pub reverse_connect_poll_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: ServerUrl::Builtin,
            plugin_paths: Vec::new(),
            num_processes: DEFAULT_NUM_PROCESSES,
            id_block_size: DEFAULT_ID_BLOCK_SIZE,
            reverse_connect_poll_ms: DEFAULT_REVERSE_CONNECT_POLL_MS,
        }
    }
}

impl SessionConfig {
    /// Build typed session config from environment variables.
    ///
    /// Optional:
    /// - `SM_SERVER_URL`: `builtin:` (default), `cs://host:port`, `csrc://port`
    /// - `SM_PLUGIN_PATH`: search paths separated by the platform path separator
    /// - `SM_NUM_PROCESSES`: default 1
    /// - `SM_ID_BLOCK_SIZE`: default 1000
    /// - `SM_REVERSE_CONNECT_POLL_MS`: default 100
    ///
    /// # Errors
    ///
    /// Returns [`SmError::Config`] when a variable is present but invalid.
    pub fn from_env() -> SmResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SessionConfig::from_env`], reading values through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`SmError::Config`] when a value is present but invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> SmResult<Self> {
        let defaults = Self::default();
        let server_url = match lookup("SM_SERVER_URL") {
            Some(raw) if !raw.trim().is_empty() => raw.parse()?,
            _ => defaults.server_url,
        };
        let plugin_paths = lookup("SM_PLUGIN_PATH")
            .map(|raw| std::env::split_paths(&raw).filter(|p| !p.as_os_str().is_empty()).collect())
            .unwrap_or_default();
        let num_processes = parse_var(&lookup, "SM_NUM_PROCESSES", defaults.num_processes)?;
        if num_processes == 0 {
            return Err(SmError::Config("SM_NUM_PROCESSES must be at least 1".into()));
        }
        let id_block_size = parse_var(&lookup, "SM_ID_BLOCK_SIZE", defaults.id_block_size)?;
        if id_block_size == 0 {
            return Err(SmError::Config("SM_ID_BLOCK_SIZE must be at least 1".into()));
        }
        let reverse_connect_poll_ms =
            parse_var(&lookup, "SM_REVERSE_CONNECT_POLL_MS", defaults.reverse_connect_poll_ms)?;

        Ok(Self { server_url, plugin_paths, num_processes, id_block_size, reverse_connect_poll_ms })
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> SmResult<T> {
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| SmError::Config(format!("invalid {key}: {raw}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
