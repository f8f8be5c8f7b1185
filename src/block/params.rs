use std::collections::BTreeMap;
use std::str::FromStr;

use parking_lot::RwLock;

use crate::error::{PipelineError, Result};

pub type BlockParams = BTreeMap<String, String>;

/// Thread-safe string parameter map. Unknown keys read as empty so newer
/// configuration files still load on older blocks.
#[derive(Debug, Default)]
pub struct ParamStore {
    values: RwLock<BlockParams>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values.write().insert(key.into(), value.into());
    }

    pub fn extend(&self, params: &BlockParams) {
        let mut values = self.values.write();
        for (k, v) in params {
            values.insert(k.clone(), v.clone());
        }
    }

    pub fn get(&self, key: &str) -> String {
        self.values.read().get(key).cloned().unwrap_or_default()
    }

    /// `None` for missing or blank values.
    pub fn get_opt(&self, key: &str) -> Option<String> {
        self.values
            .read()
            .get(key)
            .filter(|v| !v.trim().is_empty())
            .cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.read().contains_key(key)
    }

    pub fn snapshot(&self) -> BlockParams {
        self.values.read().clone()
    }

    pub fn parse<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get_opt(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|e| PipelineError::InvalidParameter {
                    key: key.to_string(),
                    reason: format!("'{raw}': {e}"),
                }),
        }
    }

    pub fn parse_bool(&self, key: &str) -> Result<Option<bool>> {
        let Some(raw) = self.get_opt(key) else {
            return Ok(None);
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            _ => Err(PipelineError::InvalidParameter {
                key: key.to_string(),
                reason: format!("'{raw}' is not a boolean"),
            }),
        }
    }
}
