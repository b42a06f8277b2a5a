//! Profile loading: engine configuration, named connectors and profile-scope
//! variables.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sqlflow_parser::error::{Error, WithErrorInfo};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    #[serde(default)]
    pub engines: Engines,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub connectors: BTreeMap<String, ConnectorDef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Engines {
    #[serde(default)]
    pub duckdb: EngineConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub mode: EngineMode,
    /// Database file; required when `mode` is `persistent`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// E.g. `2GB`; passed to the engine verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    #[default]
    Memory,
    Persistent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorDef {
    #[serde(rename = "type")]
    pub type_tag: String,
    #[serde(default = "empty_object")]
    pub params: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl Profile {
    pub fn from_yaml(text: &str) -> Result<Profile, Error> {
        let profile: Profile = serde_yaml::from_str(text)
            .map_err(|e| Error::new_simple(format!("malformed profile: {e}")))?;
        profile.check()?;
        Ok(profile)
    }

    fn check(&self) -> Result<(), Error> {
        if self.engines.duckdb.mode == EngineMode::Persistent && self.engines.duckdb.path.is_none()
        {
            return Err(Error::new_simple(
                "`engines.duckdb.path` is required when mode is `persistent`",
            )
            .push_hint("set a database file path, or switch to `mode: memory`"));
        }
        Ok(())
    }
}
