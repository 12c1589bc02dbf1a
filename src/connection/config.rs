use crate::core::{OrmError, Result};
use serde::Deserialize;
use std::time::Duration;

/// Connection pool configuration
///
/// Durations are written in milliseconds when loaded from JSON
/// (`connect_timeout_ms`, `query_timeout_ms`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Database name, used in log output only
    pub database: String,

    /// How long `acquire` waits for a free connection
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,

    /// Per-statement timeout
    #[serde(rename = "query_timeout_ms", with = "millis")]
    pub query_timeout: Duration,

    /// Maximum number of connections in pool
    pub max_connections: usize,

    /// Connections opened eagerly when the pool is created
    pub min_connections: usize,
}

impl ConnectionConfig {
    pub fn new(database: &str) -> Self {
        Self {
            database: database.to_string(),
            connect_timeout: Duration::from_secs(30),
            query_timeout: Duration::from_secs(60),
            max_connections: 10,
            min_connections: 1,
        }
    }

    pub fn database(mut self, database: &str) -> Self {
        self.database = database.to_string();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn min_connections(mut self, min: usize) -> Self {
        self.min_connections = min;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(OrmError::Configuration("max_connections must be > 0".into()));
        }

        if self.min_connections > self.max_connections {
            return Err(OrmError::Configuration(
                "min_connections cannot exceed max_connections".into(),
            ));
        }

        if self.query_timeout.is_zero() {
            return Err(OrmError::Configuration("query_timeout must be > 0".into()));
        }

        Ok(())
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new("relmap")
    }
}

pub(crate) mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_pattern() {
        let config = ConnectionConfig::new("orders")
            .max_connections(20)
            .min_connections(2)
            .query_timeout(Duration::from_millis(250));

        assert_eq!(config.database, "orders");
        assert_eq!(config.max_connections, 20);
        assert_eq!(config.min_connections, 2);
        assert_eq!(config.query_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_validate() {
        assert!(ConnectionConfig::default().validate().is_ok());

        let no_connections = ConnectionConfig::default().max_connections(0);
        assert!(no_connections.validate().is_err());

        let invalid_min_max = ConnectionConfig::default()
            .min_connections(10)
            .max_connections(5);
        assert!(matches!(
            invalid_min_max.validate(),
            Err(OrmError::Configuration(_))
        ));
    }

    #[test]
    fn test_deserialize_millis() {
        let config: ConnectionConfig =
            serde_json::from_str(r#"{"database": "jobs", "query_timeout_ms": 1500}"#).unwrap();
        assert_eq!(config.database, "jobs");
        assert_eq!(config.query_timeout, Duration::from_millis(1500));
        assert_eq!(config.max_connections, 10);
    }
}
