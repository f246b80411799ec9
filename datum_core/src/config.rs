//! Workspace configuration (`.datum/config`).
//!
//! Same `key=value` syntax as the cache store config:
//!
//! ```text
//! version=1
//! algo=blake3-256
//! jobs=8
//! remote.default=origin
//! remote.origin.url=/mnt/shared/datum
//! ```

use crate::error::{Error, Result};
use crate::hash::Algorithm;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Upper bound for the default worker count.
pub const MAX_DEFAULT_JOBS: usize = 16;

/// A named remote location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub name: String,
    pub url: PathBuf,
}

/// Parsed workspace configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub algorithm: Algorithm,
    jobs: Option<usize>,
    default_remote: Option<String>,
    remotes: BTreeMap<String, PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Algorithm::default())
    }
}

impl Config {
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            jobs: None,
            default_remote: None,
            remotes: BTreeMap::new(),
        }
    }

    /// Read a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Atomically write the config file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| Error::invalid_config("config path has no parent directory"))?;
        let mut temp = tempfile::NamedTempFile::new_in(parent)?;
        temp.write_all(self.to_text().as_bytes())?;
        temp.persist(path)?;
        Ok(())
    }

    /// Parse config text.
    ///
    /// Unknown keys are ignored; lines without `=` are rejected.
    pub fn parse(content: &str) -> Result<Self> {
        let mut version = None;
        let mut config = Config::default();

        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| {
                Error::invalid_config(format!("line {}: expected key=value", index + 1))
            })?;
            let (key, value) = (key.trim(), value.trim());

            match key {
                "version" => version = Some(value.to_string()),
                "algo" => config.algorithm = Algorithm::parse(value)?,
                "jobs" => {
                    let jobs: usize = value.parse().map_err(|_| {
                        Error::invalid_config(format!("jobs must be a positive integer: {}", value))
                    })?;
                    if jobs == 0 {
                        return Err(Error::invalid_config("jobs must be at least 1"));
                    }
                    config.jobs = Some(jobs);
                }
                "remote.default" => config.default_remote = Some(value.to_string()),
                _ => {
                    if let Some(name) = key
                        .strip_prefix("remote.")
                        .and_then(|rest| rest.strip_suffix(".url"))
                    {
                        validate_remote_name(name)?;
                        config.remotes.insert(name.to_string(), PathBuf::from(value));
                    }
                }
            }
        }

        if version.as_deref() != Some("1") {
            return Err(Error::invalid_config(format!(
                "Unsupported config version: {:?}",
                version
            )));
        }

        Ok(config)
    }

    /// Render as config text.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "version=1");
        let _ = writeln!(out, "algo={}", self.algorithm);
        if let Some(jobs) = self.jobs {
            let _ = writeln!(out, "jobs={}", jobs);
        }
        if let Some(name) = &self.default_remote {
            let _ = writeln!(out, "remote.default={}", name);
        }
        for (name, url) in &self.remotes {
            let _ = writeln!(out, "remote.{}.url={}", name, url.display());
        }
        out
    }

    /// Worker count for hashing and transfers.
    pub fn jobs(&self) -> usize {
        self.jobs.unwrap_or_else(default_jobs)
    }

    pub fn set_jobs(&mut self, jobs: usize) -> Result<()> {
        if jobs == 0 {
            return Err(Error::invalid_config("jobs must be at least 1"));
        }
        self.jobs = Some(jobs);
        Ok(())
    }

    /// Add or replace a remote. The first remote added becomes the default.
    pub fn add_remote(&mut self, name: &str, url: impl Into<PathBuf>) -> Result<()> {
        validate_remote_name(name)?;
        self.remotes.insert(name.to_string(), url.into());
        if self.default_remote.is_none() {
            self.default_remote = Some(name.to_string());
        }
        Ok(())
    }

    pub fn set_default_remote(&mut self, name: &str) -> Result<()> {
        if !self.remotes.contains_key(name) {
            return Err(Error::invalid_remote(format!("unknown remote: {}", name)));
        }
        self.default_remote = Some(name.to_string());
        Ok(())
    }

    /// Look up a remote by name.
    pub fn remote(&self, name: &str) -> Result<RemoteConfig> {
        self.remotes
            .get(name)
            .map(|url| RemoteConfig {
                name: name.to_string(),
                url: url.clone(),
            })
            .ok_or_else(|| Error::invalid_remote(format!("unknown remote: {}", name)))
    }

    /// The default remote.
    pub fn default_remote(&self) -> Result<RemoteConfig> {
        let name = self
            .default_remote
            .as_deref()
            .ok_or_else(|| Error::invalid_remote("no default remote configured"))?;
        self.remote(name)
    }

    pub fn remotes(&self) -> impl Iterator<Item = RemoteConfig> + '_ {
        self.remotes.iter().map(|(name, url)| RemoteConfig {
            name: name.clone(),
            url: url.clone(),
        })
    }
}

fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(MAX_DEFAULT_JOBS)
}

fn validate_remote_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(Error::invalid_remote(format!(
            "Invalid remote name: {:?} (use letters, digits, '-' or '_')",
            name
        )));
    }
    Ok(())
}
