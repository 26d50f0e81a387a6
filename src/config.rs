//! Process configuration: an optional TOML file, overridden by CLI flags.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::asynclog::LevelFilter;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    pub worker_threads: usize,
    pub high_water_mark: usize,
    pub log_basename: String,
    pub log_roll_size: u64,
    pub log_flush_interval_secs: u64,
    pub log_level: String,
    pub db_pool_min_size: usize,
    pub db_pool_max_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_addr: "127.0.0.1:9981".to_string(),
            worker_threads: num_cpus(),
            high_water_mark: crate::connection::DEFAULT_HIGH_WATER_MARK,
            log_basename: "loopnet".to_string(),
            log_roll_size: 500 * 1024 * 1024,
            log_flush_interval_secs: 3,
            log_level: "info".to_string(),
            db_pool_min_size: 4,
            db_pool_max_size: 16,
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Config {
    /// Loads defaults, then overlays a TOML file if `path` is given.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let mut cfg = Config::default();
        if let Some(path) = path {
            let text = std::fs::read_to_string(path).map_err(Error::Io)?;
            cfg = toml::from_str(&text)
                .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        }
        Ok(cfg)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen_addr
            .parse()
            .map_err(|e| Error::Config(format!("invalid listen_addr {:?}: {e}", self.listen_addr)))
    }

    pub fn log_flush_interval(&self) -> Duration {
        Duration::from_secs(self.log_flush_interval_secs)
    }

    pub fn log_level(&self) -> LevelFilter {
        self.log_level.parse().unwrap_or(LevelFilter::Info)
    }
}

/// Shared CLI flags for the demo binaries. Flags override fields already
/// loaded from a config file.
#[derive(Debug, clap::Parser)]
pub struct CliArgs {
    /// Path to a TOML configuration file.
    #[arg(long)]
    pub config: Option<std::path::PathBuf>,

    /// Overrides `listen_addr`.
    #[arg(long)]
    pub listen: Option<String>,

    /// Overrides `worker_threads`.
    #[arg(long)]
    pub threads: Option<usize>,
}

impl CliArgs {
    pub fn resolve(&self) -> Result<Config> {
        let mut cfg = Config::load(self.config.as_deref())?;
        if let Some(listen) = &self.listen {
            cfg.listen_addr = listen.clone();
        }
        if let Some(threads) = self.threads {
            cfg.worker_threads = threads;
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_parses_its_own_listen_addr() {
        let cfg = Config::default();
        assert!(cfg.listen_addr().is_ok());
    }

    #[test]
    fn load_overlays_only_fields_present_in_file() {
        let dir = std::env::temp_dir().join(format!("loopnet-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("loopnet.toml");
        std::fs::write(&path, "listen_addr = \"0.0.0.0:8080\"\n").unwrap();

        let cfg = Config::load(Some(&path)).unwrap();
        assert_eq!(cfg.listen_addr, "0.0.0.0:8080");
        assert_eq!(cfg.worker_threads, Config::default().worker_threads);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
