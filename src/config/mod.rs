//! # Runtime Configuration
//!
//! A flat string key→value store with typed accessors. Keys live in two
//! namespaces: `sm.*` parameters are consumed by the storage manager and
//! validated on set; `vfs.*` parameters are retained verbatim and forwarded
//! to the VFS. Setting an unrecognized `sm.*` key is an error: typos in
//! tuning parameters should fail loudly, not silently fall back to
//! defaults.
//!
//! Thread counts default to 0, which the storage manager resolves to the
//! hardware concurrency at pool construction.

pub mod constants;

pub use constants::*;

use eyre::{Result, WrapErr};
use hashbrown::HashMap;

use crate::error::StorageError;

const SM_KEYS: &[&str] = &[
    "sm.tile_cache_size",
    "sm.num_async_threads",
    "sm.num_reader_threads",
    "sm.num_writer_threads",
    "sm.consolidation.steps",
    "sm.consolidation.step_min_frags",
    "sm.consolidation.step_max_frags",
    "sm.consolidation.step_size_ratio",
];

/// Flat key→value configuration store.
#[derive(Debug, Clone, Default)]
pub struct Config {
    params: HashMap<String, String>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a parameter. `sm.*` keys must be recognized; `vfs.*` and other
    /// namespaces are stored untouched.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        if key.starts_with("sm.") && !SM_KEYS.contains(&key) {
            eyre::bail!(StorageError::InvalidArgument(format!(
                "unrecognized storage manager parameter '{key}'"
            )));
        }
        self.params.insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// All `vfs.*` parameters, for forwarding to the VFS.
    pub fn vfs_params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params
            .iter()
            .filter(|(k, _)| k.starts_with("vfs."))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn tile_cache_size(&self) -> Result<u64> {
        self.parse_or("sm.tile_cache_size", DEFAULT_TILE_CACHE_SIZE)
    }

    /// 0 means "use hardware concurrency".
    pub fn num_async_threads(&self) -> Result<usize> {
        self.parse_or("sm.num_async_threads", 0usize)
    }

    pub fn num_reader_threads(&self) -> Result<usize> {
        self.parse_or("sm.num_reader_threads", 0usize)
    }

    pub fn num_writer_threads(&self) -> Result<usize> {
        self.parse_or("sm.num_writer_threads", 0usize)
    }

    pub fn consolidation_steps(&self) -> Result<u32> {
        self.parse_or("sm.consolidation.steps", DEFAULT_CONSOLIDATION_STEPS)
    }

    pub fn consolidation_step_min_frags(&self) -> Result<u32> {
        self.parse_or(
            "sm.consolidation.step_min_frags",
            DEFAULT_CONSOLIDATION_STEP_MIN_FRAGS,
        )
    }

    pub fn consolidation_step_max_frags(&self) -> Result<u32> {
        self.parse_or(
            "sm.consolidation.step_max_frags",
            DEFAULT_CONSOLIDATION_STEP_MAX_FRAGS,
        )
    }

    pub fn consolidation_step_size_ratio(&self) -> Result<f64> {
        self.parse_or(
            "sm.consolidation.step_size_ratio",
            DEFAULT_CONSOLIDATION_STEP_SIZE_RATIO,
        )
    }

    fn parse_or<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T>
    where
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.params.get(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse::<T>()
                .wrap_err_with(|| format!("invalid value '{raw}' for config key '{key}'")),
        }
    }
}
