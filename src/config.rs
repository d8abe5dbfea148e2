use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::conversation::ConversationAggregator;

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub formatting: FormattingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Holds `<user>/chats/<entity>/<chat>.jsonl` and `<user>/stats.json`
    pub data_root: PathBuf,
    pub default_user: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct StatsConfig {
    /// Seconds between saves of changed stats while watching
    pub flush_debounce_secs: u64,
    pub clamp_negative_response_time: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct FormattingConfig {
    pub number_comma: bool,
    pub number_human: bool,
    pub locale: String,
    pub decimal_places: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_root = dirs::data_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chatstats");
        Self {
            data_root,
            default_user: "default-user".to_string(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            flush_debounce_secs: 5,
            clamp_negative_response_time: true,
        }
    }
}

impl Default for FormattingConfig {
    fn default() -> Self {
        Self {
            number_comma: false,
            number_human: false,
            locale: "en".to_string(),
            decimal_places: 2,
        }
    }
}

thread_local! {
    static TEST_CONFIG_PATH: RefCell<Option<PathBuf>> = const { RefCell::new(None) };
}

#[cfg(test)]
pub fn set_test_config_path(path: PathBuf) {
    TEST_CONFIG_PATH.with(|p| *p.borrow_mut() = Some(path));
}

impl Config {
    pub fn config_path() -> Result<PathBuf> {
        #[cfg(test)]
        {
            if let Some(path) = TEST_CONFIG_PATH.with(|p| p.borrow().clone()) {
                return Ok(path);
            }
        }

        Ok(dirs::home_dir()
            .context("Could not find home directory")?
            .join(".chatstats.toml"))
    }

    pub fn load() -> Result<Option<Config>> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&config_path).context("Failed to read config file")?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;

        Ok(Some(config))
    }

    /// Configuration on disk, or the defaults when there is none.
    pub fn load_or_default() -> Result<Config> {
        Ok(Self::load()?.unwrap_or_default())
    }

    pub fn save(&self, silent: bool) -> Result<()> {
        let config_path = Self::config_path()?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&config_path, content).context("Failed to write config file")?;

        if !silent {
            println!("✅ Configuration saved to: {}", config_path.display());
        }

        Ok(())
    }

    pub fn aggregator(&self) -> ConversationAggregator {
        ConversationAggregator::new(self.stats.clamp_negative_response_time)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.stats.flush_debounce_secs.max(1))
    }
}

// CLI helper functions
pub fn create_default_config(overwrite: bool) -> Result<()> {
    let config = Config::default();
    if !std::fs::exists(Config::config_path()?)? || overwrite {
        config.save(true)?;

        println!("📝 Created default configuration file.");
        println!("📍 Transcripts are read from:");
        println!("   {}/<user>/chats", config.storage.data_root.display());
        println!("   Change it with: chatstats config set data-root ...");
        println!("or edit");
        println!("   {}", Config::config_path()?.display());
    } else {
        println!("Configuration already exists.  Pass `--overwrite` to overwrite.");
    }

    Ok(())
}

pub fn show_config() -> Result<()> {
    match Config::load()? {
        Some(config) => {
            println!("🔧 Current configuration:");
            println!("   Data Root: {}", config.storage.data_root.display());
            println!("   Default User: {}", config.storage.default_user);
            println!("   Flush Debounce: {}s", config.stats.flush_debounce_secs);
            println!(
                "   Clamp Negative Response Time: {}",
                config.stats.clamp_negative_response_time
            );
            println!("   Number Comma: {}", config.formatting.number_comma);
            println!("   Number Human: {}", config.formatting.number_human);
            println!("   Locale: {}", config.formatting.locale);
            println!("   Decimal Places: {}", config.formatting.decimal_places);
        }
        None => {
            println!("❌ No configuration file found.");
            println!("   Run 'chatstats config init' to create one.");
        }
    }
    Ok(())
}

fn parse_bool(value: &str) -> Result<bool> {
    value
        .parse::<bool>()
        .context("Invalid boolean value. Use 'true' or 'false'")
}

pub fn set_config_value(key: &str, value: &str) -> Result<()> {
    let mut config = Config::load()?.unwrap_or_default();

    match key {
        "data-root" => config.storage.data_root = PathBuf::from(value),
        "default-user" => {
            crate::source::check_component(value)?;
            config.storage.default_user = value.to_string();
        }
        "flush-debounce" => {
            config.stats.flush_debounce_secs =
                value.parse::<u64>().context("Invalid number value")?;
        }
        "clamp-negative-response-time" => {
            config.stats.clamp_negative_response_time = parse_bool(value)?;
        }
        "number-comma" => config.formatting.number_comma = parse_bool(value)?,
        "number-human" => config.formatting.number_human = parse_bool(value)?,
        "locale" => {
            config.formatting.locale = value.to_string();
        }
        "decimal-places" => {
            let places = value.parse::<usize>().context("Invalid number value")?;
            config.formatting.decimal_places = places;
        }
        _ => anyhow::bail!("Unknown config key: {}", key),
    }

    config.save(false)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_test_config() -> (TempDir, PathBuf) {
        let dir = TempDir::new().expect("tempdir");
        let config_path = dir.path().join(".chatstats.toml");
        set_test_config_path(config_path.clone());
        (dir, config_path)
    }

    #[test]
    fn default_config_round_trip() {
        let (_dir, _path) = setup_test_config();
        create_default_config(true).expect("create_default_config");

        let loaded = Config::load()
            .expect("load config")
            .expect("config should exist");

        assert_eq!(loaded, Config::default());
        assert_eq!(loaded.stats.flush_debounce_secs, 5);
        assert!(loaded.stats.clamp_negative_response_time);
        assert_eq!(loaded.formatting.locale, "en");
    }

    #[test]
    fn partial_files_fall_back_to_defaults() {
        let (_dir, path) = setup_test_config();
        fs::write(&path, "[stats]\nflush_debounce_secs = 30\n").unwrap();

        let cfg = Config::load_or_default().expect("load");
        assert_eq!(cfg.stats.flush_debounce_secs, 30);
        assert!(cfg.stats.clamp_negative_response_time);
        assert_eq!(cfg.storage, StorageConfig::default());
        assert_eq!(cfg.flush_interval(), Duration::from_secs(30));
    }

    #[test]
    fn missing_file_loads_as_none() {
        let (_dir, _path) = setup_test_config();
        assert!(Config::load().expect("load").is_none());
        assert_eq!(Config::load_or_default().expect("load"), Config::default());
    }

    #[test]
    fn set_config_value_behaviour() {
        let (dir, _path) = setup_test_config();
        create_default_config(true).expect("create_default_config");

        let root = dir.path().join("data");
        set_config_value("data-root", root.to_str().unwrap()).expect("set data-root");
        set_config_value("default-user", "alice").expect("set default-user");
        set_config_value("flush-debounce", "0").expect("set flush-debounce");
        set_config_value("clamp-negative-response-time", "false").expect("set clamp");
        set_config_value("number-comma", "true").expect("set number-comma");
        set_config_value("number-human", "true").expect("set number-human");
        set_config_value("locale", "de").expect("set locale");
        set_config_value("decimal-places", "3").expect("set decimal-places");

        let cfg = Config::load()
            .expect("load config")
            .expect("config should exist");

        assert_eq!(cfg.storage.data_root, root);
        assert_eq!(cfg.storage.default_user, "alice");
        assert_eq!(cfg.stats.flush_debounce_secs, 0);
        assert_eq!(cfg.flush_interval(), Duration::from_secs(1));
        assert!(!cfg.aggregator().clamp_negative_response_time);
        assert!(cfg.formatting.number_comma);
        assert!(cfg.formatting.number_human);
        assert_eq!(cfg.formatting.locale, "de");
        assert_eq!(cfg.formatting.decimal_places, 3);

        let err = set_config_value("unknown-key", "value").unwrap_err();
        let msg = format!("{err}");
        assert!(
            msg.contains("Unknown config key"),
            "unexpected error message: {msg}"
        );
        let err = set_config_value("number-comma", "not-a-bool").unwrap_err();
        let msg = format!("{err}");
        assert!(
            msg.contains("Invalid boolean value"),
            "unexpected error message: {msg}"
        );
        assert!(set_config_value("default-user", "../x").is_err());
    }
}
