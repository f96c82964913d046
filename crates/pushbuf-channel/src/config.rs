use std::sync::OnceLock;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{ChannelError, Result};
use crate::semaphore::{SemaphoreTables, DEFAULT_RESTORE_ITERATION_LIMIT};

pub const WRAPPERS_ENV: &str = "PUSHBUF_WRAPPERS";
pub const RESTORE_LIMIT_ENV: &str = "PUSHBUF_SEMAPHORE_RESTORE_LIMIT";

bitflags! {
    /// Wrapper layers requested for new channels.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct WrapperLayers: u8 {
        const ATOM = 1 << 0;
        const SEMAPHORE = 1 << 1;
        const RUNLIST = 1 << 2;
    }
}

impl Default for WrapperLayers {
    fn default() -> Self {
        Self::all()
    }
}

impl WrapperLayers {
    /// Parse a comma-separated list such as `atom,semaphore`. `none` selects no layer.
    pub fn parse_list(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("none") {
            return Ok(Self::empty());
        }

        let mut layers = Self::empty();
        for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            layers |= match name.to_ascii_lowercase().as_str() {
                "atom" => Self::ATOM,
                "semaphore" => Self::SEMAPHORE,
                "runlist" => Self::RUNLIST,
                _ => {
                    return Err(ChannelError::InvalidConfig(format!(
                        "unknown wrapper layer {name:?}"
                    )))
                }
            };
        }
        if layers.is_empty() {
            return Err(ChannelError::InvalidConfig(format!(
                "{WRAPPERS_ENV} lists no layers; use \"none\" to disable wrapping"
            )));
        }
        Ok(layers)
    }

    /// Add the layers the requested ones depend on.
    pub fn with_dependencies(self) -> Self {
        let mut layers = self;
        if layers.contains(Self::RUNLIST) {
            layers |= Self::SEMAPHORE;
        }
        if layers.intersects(Self::SEMAPHORE | Self::RUNLIST) {
            layers |= Self::ATOM;
        }
        layers
    }
}

/// How channels get wrapped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WrapperConfig {
    pub layers: WrapperLayers,
    pub restore_iteration_limit: u32,
    pub semaphore: SemaphoreTables,
}

impl Default for WrapperConfig {
    fn default() -> Self {
        Self {
            layers: WrapperLayers::default(),
            restore_iteration_limit: DEFAULT_RESTORE_ITERATION_LIMIT,
            semaphore: SemaphoreTables::default(),
        }
    }
}

impl WrapperConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from defaults overridden by the variables `lookup` returns.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(raw) = lookup(WRAPPERS_ENV) {
            config.layers = WrapperLayers::parse_list(&raw)?;
        }
        if let Some(raw) = lookup(RESTORE_LIMIT_ENV) {
            config.restore_iteration_limit = raw.trim().parse().map_err(|_| {
                ChannelError::InvalidConfig(format!(
                    "invalid value for {RESTORE_LIMIT_ENV}: {raw:?}"
                ))
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| ChannelError::InvalidConfig(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.restore_iteration_limit == 0 {
            return Err(ChannelError::InvalidConfig(
                "restore_iteration_limit must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Process-wide default, resolved from the environment on first use.
    ///
    /// An invalid environment falls back to the built-in defaults (and says so once).
    pub fn global() -> &'static WrapperConfig {
        static GLOBAL: OnceLock<WrapperConfig> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            Self::from_env().unwrap_or_else(|err| {
                tracing::warn!(%err, "ignoring invalid wrapper environment");
                Self::default()
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_enable_every_layer() {
        let config = WrapperConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.layers, WrapperLayers::all());
        assert_eq!(config.restore_iteration_limit, 8);
        assert_eq!(config.semaphore.host_method_limit, 0x100);
    }

    #[test]
    fn parses_layer_lists() {
        let config = WrapperConfig::from_lookup(lookup(&[
            (WRAPPERS_ENV, " Atom , semaphore "),
            (RESTORE_LIMIT_ENV, "3"),
        ]))
        .unwrap();
        assert_eq!(config.layers, WrapperLayers::ATOM | WrapperLayers::SEMAPHORE);
        assert_eq!(config.restore_iteration_limit, 3);

        let none = WrapperConfig::from_lookup(lookup(&[(WRAPPERS_ENV, "none")])).unwrap();
        assert!(none.layers.is_empty());
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            WrapperConfig::from_lookup(lookup(&[(WRAPPERS_ENV, "atom,bogus")])),
            Err(ChannelError::InvalidConfig(_))
        ));
        assert!(matches!(
            WrapperConfig::from_lookup(lookup(&[(WRAPPERS_ENV, ",")])),
            Err(ChannelError::InvalidConfig(_))
        ));
        assert!(matches!(
            WrapperConfig::from_lookup(lookup(&[(RESTORE_LIMIT_ENV, "0")])),
            Err(ChannelError::InvalidConfig(_))
        ));
    }

    #[test]
    fn dependencies_pull_in_lower_layers() {
        assert_eq!(WrapperLayers::RUNLIST.with_dependencies(), WrapperLayers::all());
        assert_eq!(
            WrapperLayers::SEMAPHORE.with_dependencies(),
            WrapperLayers::ATOM | WrapperLayers::SEMAPHORE
        );
        assert_eq!(WrapperLayers::ATOM.with_dependencies(), WrapperLayers::ATOM);
    }

    #[test]
    fn json_config_fills_missing_fields_with_defaults() {
        let config = WrapperConfig::from_json(r#"{"restore_iteration_limit": 2}"#).unwrap();
        assert_eq!(config.restore_iteration_limit, 2);
        assert_eq!(config.layers, WrapperLayers::all());
        assert_eq!(config.semaphore, SemaphoreTables::default());
    }
}
