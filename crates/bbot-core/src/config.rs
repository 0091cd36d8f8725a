use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, Result};

/// Typed runtime configuration, injected through the environment.
#[derive(Clone, Debug)]
pub struct Config {
    // Storage
    pub data_dir: PathBuf,
    pub store_timeout: Duration,
    pub open_retries: u32,
    pub open_backoff: Duration,

    // Run loop
    pub workers: usize,
    pub queue_capacity: usize,
    pub handler_timeout: Duration,
    pub reply_timeout: Duration,
    pub drain_timeout: Duration,
    pub lane_idle: Duration,

    // Built-in handlers
    pub leaderboard_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/data"),
            store_timeout: Duration::from_millis(5_000),
            open_retries: 5,
            open_backoff: Duration::from_millis(200),
            workers: 4,
            queue_capacity: 256,
            handler_timeout: Duration::from_millis(30_000),
            reply_timeout: Duration::from_millis(5_000),
            drain_timeout: Duration::from_millis(10_000),
            lane_idle: Duration::from_millis(30_000),
            leaderboard_size: 5,
        }
    }
}

impl Config {
    /// Load from the process environment (plus `.env` if present) and validate.
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup. Unset variables take defaults;
    /// set-but-invalid ones are rejected.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).and_then(non_empty);

        // PERSISTENT_DIR is what the container volume recipe exports.
        let data_dir = var("BBOT_DATA_DIR")
            .or_else(|| var("PERSISTENT_DIR"))
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let cfg = Self {
            data_dir,
            store_timeout: millis(&var, "BBOT_STORE_TIMEOUT_MS")?.unwrap_or(defaults.store_timeout),
            open_retries: positive_as(&var, "BBOT_OPEN_RETRIES")?
                .unwrap_or(defaults.open_retries),
            open_backoff: millis(&var, "BBOT_OPEN_BACKOFF_MS")?.unwrap_or(defaults.open_backoff),
            workers: positive_as(&var, "BBOT_WORKERS")?.unwrap_or(defaults.workers),
            queue_capacity: positive_as(&var, "BBOT_QUEUE_CAPACITY")?
                .unwrap_or(defaults.queue_capacity),
            handler_timeout: millis(&var, "BBOT_HANDLER_TIMEOUT_MS")?
                .unwrap_or(defaults.handler_timeout),
            reply_timeout: millis(&var, "BBOT_REPLY_TIMEOUT_MS")?.unwrap_or(defaults.reply_timeout),
            drain_timeout: millis(&var, "BBOT_DRAIN_TIMEOUT_MS")?.unwrap_or(defaults.drain_timeout),
            lane_idle: millis(&var, "BBOT_LANE_IDLE_MS")?.unwrap_or(defaults.lane_idle),
            leaderboard_size: positive_as(&var, "BBOT_LEADERBOARD_SIZE")?
                .unwrap_or(defaults.leaderboard_size),
        };

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(Error::Config("data directory must not be empty".to_string()));
        }
        if self.data_dir.exists() && !self.data_dir.is_dir() {
            return Err(Error::Config(format!(
                "data directory {} is not a directory",
                self.data_dir.display()
            )));
        }
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Config("queue capacity must be at least 1".to_string()));
        }
        if self.open_retries == 0 {
            return Err(Error::Config("open retries must be at least 1".to_string()));
        }
        for (name, d) in [
            ("store timeout", self.store_timeout),
            ("handler timeout", self.handler_timeout),
            ("reply timeout", self.reply_timeout),
            ("drain timeout", self.drain_timeout),
            ("lane idle", self.lane_idle),
        ] {
            if d.is_zero() {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        env::set_var(key, strip_quotes(v.trim()));
    }
}

fn strip_quotes(val: &str) -> &str {
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        &val[1..val.len() - 1]
    } else {
        val
    }
}

fn parse_u64(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>> {
    let Some(raw) = var(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|_| Error::Config(format!("{key} must be a non-negative integer, got {raw:?}")))
}

fn positive(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>> {
    match parse_u64(var, key)? {
        Some(0) => Err(Error::Config(format!("{key} must be greater than zero"))),
        other => Ok(other),
    }
}

fn positive_as<T: TryFrom<u64>>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    positive(var, key)?
        .map(|n| {
            T::try_from(n).map_err(|_| Error::Config(format!("{key} is out of range, got {n}")))
        })
        .transpose()
}

fn millis(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<Duration>> {
    Ok(positive(var, key)?.map(Duration::from_millis))
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
