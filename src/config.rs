use crate::connection::ConnectionConfig;
use crate::core::{OrmError, Result};
use serde::Deserialize;

/// Engine-wide settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub connection: ConnectionConfig,

    /// Longest `IN` list sent in one statement
    pub max_in_clause: usize,

    /// Root-table column stamped whenever root-level fields change
    pub last_modified_column: String,

    /// Root-table column naming each row's concrete class
    pub discriminator_column: String,
}

impl EngineConfig {
    pub fn new(connection: ConnectionConfig) -> Self {
        Self {
            connection,
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| OrmError::Configuration(format!("Invalid engine config: {}", err)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn max_in_clause(mut self, max: usize) -> Self {
        self.max_in_clause = max;
        self
    }

    pub fn last_modified_column(mut self, column: &str) -> Self {
        self.last_modified_column = column.to_string();
        self
    }

    pub fn discriminator_column(mut self, column: &str) -> Self {
        self.discriminator_column = column.to_string();
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.connection.validate()?;

        if self.max_in_clause == 0 {
            return Err(OrmError::Configuration("max_in_clause must be > 0".into()));
        }

        if self.last_modified_column.is_empty() || self.discriminator_column.is_empty() {
            return Err(OrmError::Configuration(
                "bookkeeping column names cannot be empty".into(),
            ));
        }

        if self.last_modified_column == self.discriminator_column {
            return Err(OrmError::Configuration(
                "last_modified_column and discriminator_column must differ".into(),
            ));
        }

        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            max_in_clause: 1000,
            last_modified_column: "last_modified".to_string(),
            discriminator_column: "class_name".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_from_json_fills_defaults() {
        let config = EngineConfig::from_json(
            r#"{"max_in_clause": 50, "connection": {"max_connections": 4, "connect_timeout_ms": 200}}"#,
        )
        .unwrap();
        assert_eq!(config.max_in_clause, 50);
        assert_eq!(config.discriminator_column, "class_name");
        assert_eq!(config.connection.max_connections, 4);
        assert_eq!(config.connection.connect_timeout, Duration::from_millis(200));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        assert!(matches!(
            EngineConfig::from_json(r#"{"max_in_clause": 0}"#),
            Err(OrmError::Configuration(_))
        ));
        assert!(EngineConfig::from_json("not json").is_err());
        assert!(
            EngineConfig::default()
                .discriminator_column("last_modified")
                .validate()
                .is_err()
        );
    }
}
