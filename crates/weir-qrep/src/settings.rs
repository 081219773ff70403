//! Dynamic setting resolution
//!
//! Settings are resolved in order: catalog row, the flow's env map, the
//! process environment, then the typed default. Parse failures surface as
//! configuration errors rather than silently falling back.
//!
//! Callers look settings up once per cycle; no caching layer sits in
//! between, so a catalog change takes effect at the next cycle boundary.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{FlowError, Result};

/// When true, OVERWRITE-mode flows rewrite the full table every cycle
/// instead of advancing the watermark cursor.
pub const QREP_OVERWRITE_FULL_REFRESH_MODE: &str = "WEIR_QREP_OVERWRITE_FULL_REFRESH_MODE";

/// Catalog-side lookup of dynamic settings.
#[async_trait]
pub trait SettingCatalog: Send + Sync {
    /// Returns the configured value, or `None` when the catalog has no row.
    async fn get_setting(&self, name: &str) -> Result<Option<String>>;
}

/// Catalog with no rows; resolution falls through to the environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSettingCatalog;

#[async_trait]
impl SettingCatalog for NullSettingCatalog {
    async fn get_setting(&self, _name: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// In-memory catalog for tests and embedded runs.
#[derive(Default)]
pub struct MemorySettingCatalog {
    settings: RwLock<HashMap<String, String>>,
}

impl MemorySettingCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, name: impl Into<String>, value: impl Into<String>) {
        self.settings.write().await.insert(name.into(), value.into());
    }
}

#[async_trait]
impl SettingCatalog for MemorySettingCatalog {
    async fn get_setting(&self, name: &str) -> Result<Option<String>> {
        Ok(self.settings.read().await.get(name).cloned())
    }
}

/// Typed view over [`SettingCatalog`] with env fallback.
#[derive(Clone)]
pub struct SettingOracle {
    catalog: Arc<dyn SettingCatalog>,
}

impl SettingOracle {
    pub fn new(catalog: Arc<dyn SettingCatalog>) -> Self {
        Self { catalog }
    }

    /// Defaults-only oracle: no catalog, environment fallback still applies.
    pub fn null() -> Self {
        Self::new(Arc::new(NullSettingCatalog))
    }

    async fn lookup(&self, env: &HashMap<String, String>, name: &str) -> Result<Option<String>> {
        if let Some(value) = self.catalog.get_setting(name).await? {
            debug!(setting = name, "resolved setting from catalog");
            return Ok(Some(value));
        }
        if let Some(value) = env.get(name) {
            return Ok(Some(value.clone()));
        }
        Ok(std::env::var(name).ok())
    }

    /// Resolve a boolean setting.
    pub async fn get_bool(
        &self,
        env: &HashMap<String, String>,
        name: &str,
        default: bool,
    ) -> Result<bool> {
        match self.lookup(env, name).await? {
            Some(value) => value
                .trim()
                .parse::<bool>()
                .map_err(|_| FlowError::config(format!("setting {name}: {value:?} is not a bool"))),
            None => Ok(default),
        }
    }

    /// Resolve an unsigned setting.
    pub async fn get_u32(
        &self,
        env: &HashMap<String, String>,
        name: &str,
        default: u32,
    ) -> Result<u32> {
        match self.lookup(env, name).await? {
            Some(value) => value.trim().parse::<u32>().map_err(|_| {
                FlowError::config(format!("setting {name}: {value:?} is not an unsigned integer"))
            }),
            None => Ok(default),
        }
    }

    /// Resolve a signed setting.
    pub async fn get_i64(
        &self,
        env: &HashMap<String, String>,
        name: &str,
        default: i64,
    ) -> Result<i64> {
        match self.lookup(env, name).await? {
            Some(value) => value.trim().parse::<i64>().map_err(|_| {
                FlowError::config(format!("setting {name}: {value:?} is not an integer"))
            }),
            None => Ok(default),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_default_when_unset() {
        let oracle = SettingOracle::null();
        let empty = HashMap::new();
        assert!(!oracle
            .get_bool(&empty, "WEIR_TEST_UNSET_SETTING", false)
            .await
            .unwrap());
        assert_eq!(
            oracle.get_u32(&empty, "WEIR_TEST_UNSET_SETTING", 7).await.unwrap(),
            7
        );
        assert_eq!(
            oracle.get_i64(&empty, "WEIR_TEST_UNSET_SETTING", -3).await.unwrap(),
            -3
        );
    }

    #[tokio::test]
    async fn test_catalog_takes_precedence_over_env_map() {
        let catalog = Arc::new(MemorySettingCatalog::new());
        catalog.set(QREP_OVERWRITE_FULL_REFRESH_MODE, "true").await;
        let oracle = SettingOracle::new(catalog);

        let flow_env = env(&[(QREP_OVERWRITE_FULL_REFRESH_MODE, "false")]);
        assert!(oracle
            .get_bool(&flow_env, QREP_OVERWRITE_FULL_REFRESH_MODE, false)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_env_map_fallback() {
        let oracle = SettingOracle::null();
        let flow_env = env(&[("WEIR_TEST_WORKERS", "12")]);
        assert_eq!(
            oracle.get_u32(&flow_env, "WEIR_TEST_WORKERS", 1).await.unwrap(),
            12
        );
    }

    #[tokio::test]
    async fn test_parse_failure_is_config_error() {
        let oracle = SettingOracle::null();
        let flow_env = env(&[("WEIR_TEST_BAD_BOOL", "yep")]);
        let err = oracle
            .get_bool(&flow_env, "WEIR_TEST_BAD_BOOL", false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }
}
