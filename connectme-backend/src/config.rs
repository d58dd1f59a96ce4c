use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable names - single source of truth
pub mod env_vars {
    pub const DATA_DIR: &str = "CONNECTME_DATA_DIR";
    /// Debounce window (ms) applied per collection before a save hits disk
    pub const SAVE_DEBOUNCE_MS: &str = "CONNECTME_SAVE_DEBOUNCE_MS";
    /// Set to "true" or "1" to run the consistency repair right after loading
    pub const REPAIR_ON_LOAD: &str = "CONNECTME_REPAIR_ON_LOAD";
    pub const EVENT_CAPACITY: &str = "CONNECTME_EVENT_CAPACITY";
}

/// Default values
pub mod defaults {
    pub const DATA_DIR: &str = "./data";
    pub const SAVE_DEBOUNCE_MS: u64 = 500;
    pub const REPAIR_ON_LOAD: bool = false;
    pub const EVENT_CAPACITY: usize = 256;
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding `persons.json` and `tags.json`
    pub data_dir: PathBuf,
    pub save_debounce: Duration,
    pub repair_on_load: bool,
    pub event_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(defaults::DATA_DIR),
            save_debounce: Duration::from_millis(defaults::SAVE_DEBOUNCE_MS),
            repair_on_load: defaults::REPAIR_ON_LOAD,
            event_capacity: defaults::EVENT_CAPACITY,
        }
    }
}

impl StoreConfig {
    /// Config rooted at `data_dir` with every other knob at its default
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable values fall back to the
    /// default with a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = lookup(env_vars::DATA_DIR)
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| defaults::DATA_DIR.to_string());

        let debounce_ms = parse_or_default(
            &lookup,
            env_vars::SAVE_DEBOUNCE_MS,
            defaults::SAVE_DEBOUNCE_MS,
            |s| s.parse::<u64>().ok(),
        );

        let repair_on_load = parse_or_default(
            &lookup,
            env_vars::REPAIR_ON_LOAD,
            defaults::REPAIR_ON_LOAD,
            parse_bool,
        );

        let event_capacity = parse_or_default(
            &lookup,
            env_vars::EVENT_CAPACITY,
            defaults::EVENT_CAPACITY,
            |s| s.parse::<usize>().ok().filter(|n| *n > 0),
        );

        Self {
            data_dir: PathBuf::from(data_dir),
            save_debounce: Duration::from_millis(debounce_ms),
            repair_on_load,
            event_capacity,
        }
    }
}

fn parse_or_default<T, F, P>(lookup: &F, key: &str, default: T, parse: P) -> T
where
    F: Fn(&str) -> Option<String>,
    P: Fn(&str) -> Option<T>,
    T: std::fmt::Debug,
{
    match lookup(key) {
        Some(raw) => match parse(raw.trim()) {
            Some(v) => v,
            None => {
                log::warn!("Invalid value {:?} for {}, using default {:?}", raw, key, default);
                default
            }
        },
        None => default,
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
