use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{Error, Result};

/// What a connection does with each request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Serve locally only.
    #[default]
    Normal,
    /// Forward every frame to the shadow upstream and relay its reply.
    Proxy,
    /// Reply locally, then compare with the upstream reply.
    DiffNormal,
    /// Reply with the upstream result, compared against the local one.
    DiffProxy,
}

impl Mode {
    pub const ALL: [Mode; 4] = [Mode::Normal, Mode::Proxy, Mode::DiffNormal, Mode::DiffProxy];

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Normal => "normal",
            Mode::Proxy => "proxy",
            Mode::DiffNormal => "diff-normal",
            Mode::DiffProxy => "diff-proxy",
        }
    }

    pub fn uses_shadow(self) -> bool {
        !matches!(self, Mode::Normal)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Mode::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = Mode::ALL.iter().map(|m| m.as_str()).collect();
                Error::Config(format!("unknown mode {s:?}, expected one of {known:?}"))
            })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShadowCompareOptions {
    /// Dotted paths left out of the comparison; `*` matches any single key.
    pub ignore_fields: Vec<String>,
    /// Treat int32, int64 and double holding the same number as equal.
    pub numeric_equivalence: bool,
}

impl Default for ShadowCompareOptions {
    fn default() -> Self {
        Self {
            ignore_fields: vec![
                "localTime".to_string(),
                "$clusterTime".to_string(),
                "operationTime".to_string(),
                "connectionId".to_string(),
            ],
            numeric_equivalence: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShadowConfig {
    /// Upstream MongoDB for proxy and diff modes.
    pub addr: String,
    pub timeout_ms: u64,
    pub compare: ShadowCompareOptions,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:37017".to_string(),
            timeout_ms: 1500,
            compare: ShadowCompareOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    pub postgres_url: String,
    pub pool_size: usize,
    pub mode: Mode,
    pub shadow: ShadowConfig,
    /// Upper bound on waiting for connections at shutdown; unbounded when unset.
    pub shutdown_timeout_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Default to Mongo's standard port locally
            listen_addr: "127.0.0.1:27017".to_string(),
            postgres_url: "postgres://postgres@127.0.0.1:5432/ferrodoc".to_string(),
            pool_size: 16,
            mode: Mode::Normal,
            shadow: ShadowConfig::default(),
            shutdown_timeout_secs: None,
        }
    }
}

impl Config {
    /// Priority: explicit file, `FERRODOC_CONFIG` or ./config.toml → env → defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut cfg = match explicit {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = std::env::var("FERRODOC_CONFIG")
                    .unwrap_or_else(|_| "config.toml".to_string());
                if Path::new(&path).exists() {
                    Self::from_file(Path::new(&path))?
                } else {
                    Config::default()
                }
            }
        };
        cfg.apply_env(|key| std::env::var(key).ok())?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml(&contents)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))
    }

    pub fn from_toml(contents: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Applies `FERRODOC_*` overrides read through `get`.
    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(addr) = get("FERRODOC_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Some(pg) = get("FERRODOC_POSTGRES_URL") {
            self.postgres_url = pg;
        }
        if let Some(n) = get("FERRODOC_POOL_SIZE") {
            self.pool_size = n
                .parse()
                .map_err(|_| Error::Config(format!("FERRODOC_POOL_SIZE: invalid number {n:?}")))?;
        }
        if let Some(mode) = get("FERRODOC_MODE") {
            self.mode = mode.parse()?;
        }
        if let Some(addr) = get("FERRODOC_SHADOW_ADDR") {
            self.shadow.addr = addr;
        }
        if let Some(ms) = get("FERRODOC_SHADOW_TIMEOUT_MS") {
            self.shadow.timeout_ms = ms.parse().map_err(|_| {
                Error::Config(format!("FERRODOC_SHADOW_TIMEOUT_MS: invalid number {ms:?}"))
            })?;
        }
        if let Some(secs) = get("FERRODOC_SHUTDOWN_TIMEOUT_SECS") {
            let secs = secs.parse().map_err(|_| {
                Error::Config(format!(
                    "FERRODOC_SHUTDOWN_TIMEOUT_SECS: invalid number {secs:?}"
                ))
            })?;
            self.shutdown_timeout_secs = Some(secs);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.trim().is_empty() {
            return Err(Error::Config("listen_addr must not be empty".into()));
        }
        if self.pool_size == 0 {
            return Err(Error::Config("pool_size must be at least 1".into()));
        }
        if self.mode.uses_shadow() && self.shadow.addr.trim().is_empty() {
            return Err(Error::Config(format!(
                "mode {} requires shadow.addr",
                self.mode
            )));
        }
        Ok(())
    }
}
