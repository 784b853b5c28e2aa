// # Connection Descriptors
//
// A descriptor names one backend instance and everything needed to reach it.
// Credentials stay a vault reference; plaintext is resolved only inside
// `Backend::connect`. Identity is the stable name: the pool manager owns the
// descriptor from `register` to `unregister`.

use crate::client::BackendKind;
use crate::common::validate_identifier;
use crate::error::{DbError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Pool sizing and timing parameters carried by each descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolParams {
    /// Connections kept open even when idle
    pub min_size: usize,

    /// Hard ceiling on open connections
    pub max_size: usize,

    /// How long an acquire may wait before POOL_EXHAUSTED_TIMEOUT
    #[serde(with = "millis")]
    pub acquire_timeout: Duration,

    /// Idle connections above min are reaped after this long
    #[serde(with = "millis")]
    pub idle_timeout: Duration,

    /// Interval between health probes on idle connections
    #[serde(with = "millis")]
    pub probe_interval: Duration,
}

impl Default for PoolParams {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            probe_interval: Duration::from_secs(30),
        }
    }
}

impl PoolParams {
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(DbError::Configuration(
                "pool max_size must be positive".to_string(),
            ));
        }
        if self.min_size > self.max_size {
            return Err(DbError::Configuration(format!(
                "pool min_size {} exceeds max_size {}",
                self.min_size, self.max_size
            )));
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// A named backend instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    /// Stable identity
    pub name: String,

    /// Backend kind; decides request shapes and driver-code tables
    pub kind: BackendKind,

    pub host: String,
    pub port: u16,
    pub database: String,

    /// Vault key holding the credentials; never plaintext
    pub credentials_ref: Option<String>,

    pub pool: PoolParams,

    pub tls: bool,

    /// Tag marking production resources; DDL against these is CRITICAL
    #[serde(default)]
    pub production: bool,

    /// Driver-specific options, preserved opaquely
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
}

impl ConnectionDescriptor {
    pub fn new(name: &str, kind: BackendKind, host: &str, port: u16, database: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            host: host.to_string(),
            port,
            database: database.to_string(),
            credentials_ref: None,
            pool: PoolParams::default(),
            tls: false,
            production: false,
            options: HashMap::new(),
        }
    }

    pub fn with_credentials_ref(mut self, vault_key: &str) -> Self {
        self.credentials_ref = Some(vault_key.to_string());
        self
    }

    pub fn with_pool(mut self, pool: PoolParams) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn production(mut self) -> Self {
        self.production = true;
        self
    }

    pub fn with_option(mut self, key: &str, value: serde_json::Value) -> Self {
        self.options.insert(key.to_string(), value);
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.name)?;
        if self.host.is_empty() {
            return Err(DbError::Configuration(format!(
                "descriptor '{}' has an empty host",
                self.name
            )));
        }
        if let Some(cred) = &self.credentials_ref {
            validate_identifier(cred)?;
        }
        self.pool.validate()
    }

    /// Display form with no credential material.
    pub fn summary(&self) -> String {
        format!(
            "{} ({}://{}:{}/{})",
            self.name, self.kind, self.host, self.port, self.database
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_rules() {
        let good = ConnectionDescriptor::new("prod", BackendKind::Postgres, "db1", 5432, "app");
        assert!(good.validate().is_ok());

        let mut bad = good.clone();
        bad.name = "has space".into();
        assert!(bad.validate().is_err());

        let mut bad_pool = good.clone();
        bad_pool.pool.min_size = 5;
        bad_pool.pool.max_size = 2;
        assert!(bad_pool.validate().is_err());
    }

    #[test]
    fn summary_never_contains_credentials() {
        let d = ConnectionDescriptor::new("prod", BackendKind::Postgres, "db1", 5432, "app")
            .with_credentials_ref("pg-prod-password");
        assert!(!d.summary().contains("password"));
    }

    #[test]
    fn wire_form_roundtrip() {
        let d = ConnectionDescriptor::new("kv1", BackendKind::Redis, "cache", 6379, "0")
            .with_tls(true)
            .with_option("cluster", serde_json::json!(false));
        let s = serde_json::to_string(&d).unwrap();
        let back: ConnectionDescriptor = serde_json::from_str(&s).unwrap();
        assert_eq!(back.name, "kv1");
        assert_eq!(back.kind, BackendKind::Redis);
        assert!(back.tls);
        assert_eq!(back.pool.max_size, 10);
    }
}
