use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

#[derive(Debug, Clone, Args)]
pub struct DatabaseArgs {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,
    #[arg(long, env = "DB_MAX_CONNECTIONS", default_value_t = 5)]
    pub max_connections: u32,
}

impl DatabaseArgs {
    pub async fn connect(&self) -> anyhow::Result<PgPool> {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .connect(&self.database_url)
            .await
            .context("failed to connect to Postgres")
    }
}

fn default_platform_category() -> String {
    "Python".to_string()
}

fn default_platform_version() -> String {
    "3.11".to_string()
}

fn default_poll_interval_secs() -> u64 {
    5
}

/// Settings for provisioning a hosting environment, read from a JSON file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionConfig {
    pub region: String,
    pub deployment_key_name: String,
    pub instance_type: String,
    pub system_administrator_email: String,
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
    #[serde(default = "default_platform_category")]
    pub platform_category: String,
    #[serde(default = "default_platform_version")]
    pub platform_version: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// No limit when unset.
    #[serde(default)]
    pub max_wait_secs: Option<u64>,
}

impl ProvisionConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("invalid config in {}", path.display()))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait_secs.map(Duration::from_secs)
    }

    /// Environment variables as the comma separated `key=value` list the
    /// control plane expects.
    pub fn environment_variable_string(&self) -> String {
        self.environment_variables
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}
