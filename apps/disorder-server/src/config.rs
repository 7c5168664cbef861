//! Configuration loading for `disorderd`.
//!
//! Layers four sources in increasing priority: [`disorder_core::Config`]'s
//! built-in defaults, an optional YAML file, environment variables (via
//! `clap`'s `env = "..."` attributes on [`Args`]), then explicit CLI
//! flags.

use anyhow::{Context, Result};
use disorder_core::Config;

use crate::Args;

/// Builds the effective [`Config`] for this run: the YAML file named by
/// `--config` (if any) over the built-in defaults, then `Args`' CLI/env
/// overrides applied on top.
pub fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file: {}", path.display()))?;
            serde_yaml::from_str(&contents)
                .with_context(|| format!("parsing config file: {}", path.display()))?
        }
        None => Config::default(),
    };

    if let Some(root) = &args.root {
        config.root = root.clone();
    }
    if let Some(home) = &args.home {
        config.home = home.clone();
    }
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(broadcast) = args.broadcast {
        config.broadcast = Some(broadcast);
    }

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn base_args() -> Args {
        Args {
            config: None,
            log_level: "info".to_string(),
            root: None,
            home: None,
            listen: None,
            broadcast: None,
        }
    }

    #[test]
    fn defaults_load_without_a_config_file() {
        let config = load_config(&base_args()).unwrap();
        assert_eq!(config.listen, Config::default().listen);
    }

    #[test]
    fn cli_flags_override_the_default_root() {
        let mut args = base_args();
        args.root = Some(PathBuf::from("/music"));
        let config = load_config(&args).unwrap();
        assert_eq!(config.root, PathBuf::from("/music"));
    }

    #[test]
    fn config_file_values_are_applied_then_overridden_by_cli() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disorder.yaml");
        std::fs::write(&path, "root: /from-file\nhome: /from-file-home\n").unwrap();

        let mut args = base_args();
        args.config = Some(path);
        let config = load_config(&args).unwrap();
        assert_eq!(config.root, PathBuf::from("/from-file"));

        args.root = Some(PathBuf::from("/from-cli"));
        let config = load_config(&args).unwrap();
        assert_eq!(config.root, PathBuf::from("/from-cli"));
    }
}
