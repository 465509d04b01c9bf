//! Config command handlers

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use tasksync_core::Config;

use crate::output::{Output, OutputFormat};

const VALID_KEYS: &str = "data_dir, remote_url, remote_key, remote_table, sync_enabled, \
                          storage, max_retries, retry_delay_secs, poll_interval_secs, \
                          probe_interval_secs, log_file";

/// Show current configuration
pub fn show(config_path: Option<&Path>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "data_dir": config.data_dir,
                    "remote_url": config.remote_url,
                    "remote_key_set": config.remote_key.is_some(),
                    "remote_table": config.remote_table,
                    "sync_enabled": config.sync_enabled,
                    "storage": config.storage,
                    "max_retries": config.max_retries,
                    "retry_delay_secs": config.retry_delay_secs,
                    "poll_interval_secs": config.poll_interval_secs,
                    "probe_interval_secs": config.probe_interval_secs,
                    "log_file": config.log_file
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .map(Path::to_path_buf)
                .unwrap_or_else(Config::config_file_path);
            println!("Configuration:");
            println!("  data_dir:            {}", config.data_dir.display());
            println!(
                "  remote_url:          {}",
                config.remote_url.as_deref().unwrap_or("(not set)")
            );
            println!(
                "  remote_key:          {}",
                if config.remote_key.is_some() {
                    "(set)"
                } else {
                    "(not set)"
                }
            );
            println!("  remote_table:        {}", config.remote_table);
            println!("  sync_enabled:        {}", config.sync_enabled);
            println!("  storage:             {:?}", config.storage);
            println!("  max_retries:         {}", config.max_retries);
            println!("  retry_delay_secs:    {}", config.retry_delay_secs);
            println!("  poll_interval_secs:  {}", config.poll_interval_secs);
            println!("  probe_interval_secs: {}", config.probe_interval_secs);
            println!(
                "  log_file:            {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(key: String, value: String, config_path: Option<&Path>, output: &Output) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    apply_setting(&mut config, &key, &value)?;

    // Save to the CLI-specified path or default
    let save_path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    let shown = if key == "remote_key" {
        "(hidden)"
    } else {
        value.as_str()
    };
    output.success(&format!("Set {} = {}", key, shown));

    Ok(())
}

fn apply_setting(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        "data_dir" => config.data_dir = PathBuf::from(value),
        "remote_url" => config.remote_url = optional(value),
        "remote_key" => config.remote_key = optional(value),
        "remote_table" => {
            if value.trim().is_empty() {
                bail!("remote_table cannot be empty");
            }
            config.remote_table = value.trim().to_string();
        }
        "sync_enabled" => {
            config.sync_enabled = value
                .parse()
                .context("Invalid value for sync_enabled. Use 'true' or 'false'.")?;
        }
        "storage" => {
            config.storage = value.parse().map_err(anyhow::Error::msg)?;
        }
        "max_retries" => config.max_retries = parse_number(key, value)?,
        "retry_delay_secs" => config.retry_delay_secs = parse_number(key, value)?,
        "poll_interval_secs" => config.poll_interval_secs = parse_number(key, value)?,
        "probe_interval_secs" => config.probe_interval_secs = parse_number(key, value)?,
        "log_file" => config.log_file = optional(value).map(PathBuf::from),
        _ => {
            bail!(
                "Unknown configuration key: '{}'\nValid keys: {}",
                key,
                VALID_KEYS
            );
        }
    }
    Ok(())
}

/// Empty or "none" clears an optional value
fn optional(value: &str) -> Option<String> {
    if value.is_empty() || value == "none" {
        None
    } else {
        Some(value.to_string())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    match value.trim().parse() {
        Ok(n) => Ok(n),
        Err(_) => bail!("Invalid value for {}: expected a number", key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tasksync_core::StorageBackend;

    #[test]
    fn test_apply_setting() {
        let mut config = Config::default();

        apply_setting(&mut config, "remote_url", "https://example.test").unwrap();
        apply_setting(&mut config, "sync_enabled", "true").unwrap();
        apply_setting(&mut config, "storage", "sqlite").unwrap();
        apply_setting(&mut config, "max_retries", "5").unwrap();

        assert_eq!(config.remote_url.as_deref(), Some("https://example.test"));
        assert!(config.sync_enabled);
        assert_eq!(config.storage, StorageBackend::Sqlite);
        assert_eq!(config.max_retries, 5);

        apply_setting(&mut config, "remote_url", "none").unwrap();
        assert!(config.remote_url.is_none());
    }

    #[test]
    fn test_apply_setting_rejects_bad_input() {
        let mut config = Config::default();
        assert!(apply_setting(&mut config, "nope", "1").is_err());
        assert!(apply_setting(&mut config, "sync_enabled", "maybe").is_err());
        assert!(apply_setting(&mut config, "retry_delay_secs", "soon").is_err());
        assert!(apply_setting(&mut config, "storage", "xml").is_err());
        assert!(apply_setting(&mut config, "remote_table", " ").is_err());
    }

    #[test]
    fn test_set_writes_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let data_dir = dir.path().join("data");
        std::fs::write(&path, format!("data_dir = {:?}\n", data_dir.display().to_string())).unwrap();
        let output = Output::new(OutputFormat::Quiet);

        set(
            "remote_table".to_string(),
            "todos".to_string(),
            Some(path.as_path()),
            &output,
        )
        .unwrap();

        let saved = Config::load_from_path(&path).unwrap();
        assert_eq!(saved.remote_table, "todos");
        assert_eq!(saved.data_dir, data_dir);
    }
}
