//! Load the scanner's configuration from defaults, files, and the command
//! line.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tor_bwprobe::{Destination, DestinationConfig, ProbeConfig};
use tor_bwscan::{PrioritizerConfig, ScannerConfig};
use tor_relaylist::RelayListConfig;

use crate::cfgpath::{self, CfgPath};

/// Default options to use for our configuration.
pub(crate) const BWSCANNER_DEFAULTS: &str = include_str!("./bwscanner_defaults.toml");

/// Port to assume when no destination is configured.
const DEFAULT_PORT: u16 = 443;

/// Everything the `bwscanner` tool can be configured with.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub(crate) struct BwScannerConfig {
    /// How we log.
    pub(crate) logging: LoggingConfig,
    /// Where we keep things on disk.
    pub(crate) storage: StorageConfig,
    /// How measurement rounds run.
    pub(crate) scanner: ScannerConfig,
    /// How the relay list is kept.
    pub(crate) relays: RelayListConfig,
    /// How many relays each round measures.
    pub(crate) prioritizer: PrioritizerConfig,
    /// How relays are probed.
    pub(crate) probe: ProbeConfig,
    /// Files to download from.
    #[serde(default)]
    pub(crate) destinations: Vec<DestinationConfig>,
}

/// Logging options.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub(crate) struct LoggingConfig {
    /// Whether to log at trace level.
    pub(crate) trace: bool,
}

/// Locations on disk.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub(crate) struct StorageConfig {
    /// Scanner state.
    pub(crate) state_dir: CfgPath,
    /// Measurement results, as written by a result dump.
    pub(crate) results_dir: CfgPath,
    /// The consensus to read relays from.
    pub(crate) consensus_file: CfgPath,
}

impl StorageConfig {
    /// Return the expanded path of the consensus file.
    pub(crate) fn consensus_file(&self) -> Result<PathBuf> {
        expand(&self.consensus_file)
    }
    /// Return the expanded path of the results directory.
    pub(crate) fn results_dir(&self) -> Result<PathBuf> {
        expand(&self.results_dir)
    }
    /// Return the expanded path of the state directory.
    pub(crate) fn state_dir(&self) -> Result<PathBuf> {
        expand(&self.state_dir)
    }
}

/// Expand `p`, explaining failures.
fn expand(p: &CfgPath) -> Result<PathBuf> {
    p.path()
        .map_err(|e| anyhow::anyhow!("{}", e))
        .with_context(|| format!("can't expand path {}", p))
}

impl BwScannerConfig {
    /// Check every section, as the scanner would at startup.
    pub(crate) fn validate(&self) -> Result<()> {
        self.scanner.validate().context("[scanner]")?;
        self.prioritizer.validate().context("[prioritizer]")?;
        self.probe.validate().context("[probe]")?;
        for d in &self.destinations {
            Destination::new(&d.url, d.content_length, d.verify)
                .with_context(|| format!("destination {}", d.url))?;
        }
        Ok(())
    }

    /// Return the port our destinations listen on.
    ///
    /// That is the port of the first enabled destination, or 443.
    pub(crate) fn destination_port(&self) -> u16 {
        self.destinations
            .iter()
            .filter(|d| d.enabled)
            .find_map(|d| Destination::new(&d.url, d.content_length, d.verify).ok())
            .map_or(DEFAULT_PORT, |d| d.port())
    }
}

/// Return the default location of the user's configuration file.
pub(crate) fn default_config_file() -> Option<PathBuf> {
    Some(cfgpath::project_dirs().ok()?.config_dir().join("bwscanner.toml"))
}

/// Turn a `-c` option into a line of TOML.
///
/// With "key=bareword", the bareword is quoted.
fn override_line(opt: &str) -> String {
    if toml::from_str::<toml::Value>(opt).is_ok() {
        return opt.to_string();
    }
    match opt.split_once('=') {
        Some((k, v)) => format!("{}={:?}", k.trim(), v.trim()),
        None => opt.to_string(),
    }
}

/// Load our configuration.
///
/// Start from the defaults, then merge `files` in order, or the default
/// file (if it exists) when `files` is empty, then every override in
/// `opts`.
pub(crate) fn load<P: AsRef<Path>>(
    default_path: Option<&Path>,
    files: &[P],
    opts: &[String],
) -> Result<BwScannerConfig> {
    let mut cfg = config::Config::new();
    cfg.merge(config::File::from_str(
        BWSCANNER_DEFAULTS,
        config::FileFormat::Toml,
    ))?;

    let mut missing_ok = false;
    let mut search: Vec<&Path> = files.iter().map(|p| p.as_ref()).collect();
    if search.is_empty() {
        if let Some(p) = default_path {
            search.push(p);
            missing_ok = true;
        }
    }
    for p in search {
        let f: config::File<_> = p.into();
        cfg.merge(f.format(config::FileFormat::Toml).required(!missing_ok))
            .with_context(|| format!("can't load {}", p.display()))?;
    }

    if !opts.is_empty() {
        let lines: Vec<String> = opts.iter().map(|o| override_line(o)).collect();
        cfg.merge(config::File::from_str(
            &lines.join("\n"),
            config::FileFormat::Toml,
        ))
        .context("bad command-line option")?;
    }

    Ok(cfg.try_into()?)
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use std::time::Duration;

    #[test]
    fn load_default_config() -> Result<()> {
        let none: &[&str] = &[];
        let cfg = load(None, none, &[])?;
        cfg.validate()?;
        assert!(!cfg.logging.trace);
        assert_eq!(cfg.scanner.measurement_threads(), 3);
        assert_eq!(cfg.scanner.socket_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.scanner.measurement_timeout(), Duration::from_secs(600));
        assert_eq!(cfg.relays.refresh_interval(), Duration::from_secs(3600));
        assert_eq!(cfg.probe.num_downloads(), 5);
        assert!(cfg.destinations.is_empty());
        assert_eq!(cfg.destination_port(), 443);
        Ok(())
    }

    #[test]
    fn files_and_overrides() -> Result<()> {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("bwscanner.toml");
        std::fs::write(
            &file,
            r#"
[scanner]
nickname = "scanner-from-file"

[[destinations]]
url = "http://dest.example.com:8080/1GiB"
"#,
        )
        .unwrap();
        let cfg = load(
            None,
            &[&file],
            &[
                "logging.trace=true".to_string(),
                "scanner.nickname=scanner-from-cmdline".to_string(),
            ],
        )?;
        assert!(cfg.logging.trace);
        assert_eq!(cfg.scanner.nickname(), "scanner-from-cmdline");
        assert_eq!(cfg.destinations.len(), 1);
        assert_eq!(cfg.destination_port(), 8080);

        // The default file may be missing; a named one may not.
        let missing = dir.path().join("missing.toml");
        assert!(load(Some(missing.as_path()), &[] as &[&str], &[]).is_ok());
        assert!(load(None, &[&missing], &[]).is_err());
        Ok(())
    }

    #[test]
    fn bad_values() {
        let none: &[&str] = &[];
        let cfg = load(None, none, &["scanner.measurement_threads=0".to_string()]).unwrap();
        assert!(cfg.validate().is_err());
        assert!(load(None, none, &["no_such_section.x=1".to_string()]).is_err());
    }

    #[test]
    fn bareword() {
        assert_eq!(override_line("a.b=3"), "a.b=3");
        assert_eq!(override_line("a.b=hello"), "a.b=\"hello\"");
        assert_eq!(override_line("a.b = \"x\""), "a.b = \"x\"");
    }
}
