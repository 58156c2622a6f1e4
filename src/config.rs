//! Mod-map configuration: the static table of `{key, primary_function,
//! secondary_function}` rows plus `max_delay_ms`, loadable from a TOML file
//! or from the compiled-in canonical default.

use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;
use evdev_rs::enums::{EventCode, EventType, EV_KEY};
use serde::Deserialize;
use thiserror::Error;

use crate::core::ModKeyConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid key `{0}`; use `janus-remap list-keys` to see possible keys")]
    InvalidKey(String),

    #[error("duplicate row for key `{0}` (invariant: at most one row per key)")]
    DuplicateKey(String),

    #[error(
        "row `{0}`: secondary_function must not equal the row's own key or primary_function"
    )]
    ZeroSecondaryInconsistency(String),
}

/// One row as written in a TOML config file, before key names are resolved
/// to raw codes.
#[derive(Debug, Deserialize)]
struct RowConfig {
    key: String,
    #[serde(default)]
    primary_function: Option<String>,
    #[serde(default)]
    secondary_function: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    max_delay_ms: u64,
    #[serde(rename = "row", default)]
    rows: Vec<RowConfig>,
}

/// A fully resolved mod map ready to hand to `core::Engine`.
///
/// `enabled_codes` carries every `EventCode` the config referenced (as a
/// key, a primary function, or a secondary function); the `device` adapter
/// uses it to enable those codes on the cloned uinput device and to seed
/// its `u16 -> EventCode` lookup table, since the engine itself only ever
/// deals in raw `u16`s.
#[derive(Debug, Clone)]
pub struct Config {
    pub rows: Vec<ModKeyConfig>,
    pub max_delay_ms: u64,
    pub enabled_codes: Vec<EventCode>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml_data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        Self::from_toml_str(&toml_data)
            .with_context(|| format!("parsing config from {}", path.display()))
    }

    pub fn from_toml_str(toml_data: &str) -> anyhow::Result<Self> {
        let file: ConfigFile = toml::from_str(toml_data).context("parsing TOML")?;
        let mut rows = Vec::with_capacity(file.rows.len());
        let mut enabled_codes = Vec::new();

        for row in file.rows {
            let (key, key_code) = resolve_key(&row.key)?;
            enabled_codes.push(key_code);

            let primary_function = match row.primary_function {
                Some(s) => {
                    let (code, ec) = resolve_key(&s)?;
                    enabled_codes.push(ec);
                    code
                }
                None => 0,
            };
            let secondary_function = match row.secondary_function {
                Some(s) => {
                    let (code, ec) = resolve_key(&s)?;
                    enabled_codes.push(ec);
                    code
                }
                None => 0,
            };
            rows.push(ModKeyConfig {
                key,
                primary_function,
                secondary_function,
            });
        }

        let config = Config {
            rows,
            max_delay_ms: file.max_delay_ms,
            enabled_codes,
        };
        config.validate()?;
        Ok(config)
    }

    /// The canonical example from `original_source/config.h`: Caps Lock
    /// taps Escape, holds Left Alt, 300ms delay.
    pub fn default_caps_lock() -> Self {
        Config {
            rows: vec![ModKeyConfig {
                key: EV_KEY::KEY_CAPSLOCK as u16,
                primary_function: EV_KEY::KEY_ESC as u16,
                secondary_function: EV_KEY::KEY_LEFTALT as u16,
            }],
            max_delay_ms: 300,
            enabled_codes: vec![
                EventCode::EV_KEY(EV_KEY::KEY_CAPSLOCK),
                EventCode::EV_KEY(EV_KEY::KEY_ESC),
                EventCode::EV_KEY(EV_KEY::KEY_LEFTALT),
            ],
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen: HashSet<u16> = HashSet::new();
        for row in &self.rows {
            if !seen.insert(row.key) {
                return Err(ConfigError::DuplicateKey(row.key.to_string()));
            }
            if row.secondary_function != 0
                && (row.secondary_function == row.key || row.secondary_function == row.primary_function)
            {
                return Err(ConfigError::ZeroSecondaryInconsistency(row.key.to_string()));
            }
        }
        Ok(())
    }
}

/// Resolves a `KEY_*`/`BTN_*` name to its raw `u16` code and its
/// `EventCode`. Plain decimal codes aren't accepted: without a name there
/// is no `EventCode` to enable on the cloned uinput device.
fn resolve_key(name: &str) -> Result<(u16, EventCode), ConfigError> {
    match EventCode::from_str(&EventType::EV_KEY, name) {
        Some(EventCode::EV_KEY(k)) => Ok((k as u16, EventCode::EV_KEY(k))),
        _ => Err(ConfigError::InvalidKey(name.to_string())),
    }
}
