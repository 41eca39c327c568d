use scylla::client::session::Session;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};

/// Applies the versioned CQL scripts under `schema_path/<version>/`.
///
/// A fresh keyspace (version 0) runs `init_schema.cql` of the first version
/// it reaches; later versions run `update_schema.cql`. Every `{}` in a script
/// is replaced with the keyspace name.
pub struct MigrationTool {
    keyspace: String,
    schema_path: PathBuf,
}

impl MigrationTool {
    pub fn new(keyspace: String, schema_path: PathBuf) -> Self {
        debug!("Migration tool for keyspace {}", keyspace);
        Self { keyspace, schema_path }
    }

    pub async fn ensure_keyspace(&self, session: &Session, replication_factor: u32) -> Result<()> {
        let cql = format!(
            "CREATE KEYSPACE IF NOT EXISTS {} WITH replication = \
             {{'class': 'SimpleStrategy', 'replication_factor': {}}}",
            self.keyspace, replication_factor
        );
        session.query_unpaged(cql, &[]).await?;
        Ok(())
    }

    async fn ensure_migration_table(&self, session: &Session) -> Result<()> {
        let create_table = format!(
            "CREATE TABLE IF NOT EXISTS {}.schema_version (
                version int,
                applied_at timestamp,
                db int primary key
            )",
            self.keyspace
        );
        session.query_unpaged(create_table, &[]).await?;
        Ok(())
    }

    pub async fn current_version(&self, session: &Session) -> Result<i32> {
        let select = format!("SELECT version FROM {}.schema_version LIMIT 1", self.keyspace);
        let rows = session.query_unpaged(select, &[]).await?.into_rows_result()?;
        // No row yet means nothing has been applied.
        Ok(rows.maybe_first_row::<(i32,)>()?.map(|(v,)| v).unwrap_or(0))
    }

    async fn set_version(&self, session: &Session, version: i32) -> Result<()> {
        let cql = format!(
            "INSERT INTO {}.schema_version (version, applied_at, db) VALUES (?, toTimestamp(now()), 0)",
            self.keyspace
        );
        session.query_unpaged(cql, (version,)).await?;
        Ok(())
    }

    /// Version directories found under the schema path, ascending.
    pub fn available_versions(&self) -> Result<Vec<i32>> {
        let entries = fs::read_dir(&self.schema_path).map_err(|e| {
            AppError::Internal(format!("Unable to read schema directory {:?}: {}", self.schema_path, e))
        })?;
        let mut versions: Vec<i32> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .filter_map(|path| path.file_name()?.to_string_lossy().parse::<i32>().ok())
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    pub fn latest_version(&self) -> Result<i32> {
        Ok(self.available_versions()?.last().copied().unwrap_or(0))
    }

    /// Splits a script into statements and substitutes the keyspace.
    fn statements(&self, contents: &str) -> Vec<String> {
        contents
            .split(';')
            .map(|s| {
                s.lines()
                    .filter(|line| !line.trim_start().starts_with("--"))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .map(|s| s.trim().replace("{}", &self.keyspace))
            .filter(|s| !s.is_empty())
            .collect()
    }

    async fn execute_cql_file(&self, session: &Session, file_path: &Path) -> Result<()> {
        let contents = fs::read_to_string(file_path)
            .map_err(|e| AppError::Internal(format!("Failed to read {:?}: {}", file_path, e)))?;
        for stmt in self.statements(&contents) {
            debug!("cql: {}", stmt);
            session.query_unpaged(stmt, &[]).await?;
        }
        Ok(())
    }

    /// Migrates from the current version up to `target_version`.
    pub async fn migrate_to_version(&self, session: &Session, target_version: i32) -> Result<i32> {
        self.ensure_migration_table(session).await?;

        let mut current_version = self.current_version(session).await?;
        info!("Current schema version of {} is {}", self.keyspace, current_version);

        for v in self.available_versions()? {
            if v <= current_version || v > target_version {
                continue;
            }
            let version_path = self.schema_path.join(v.to_string());
            let script = if current_version == 0 {
                version_path.join("init_schema.cql")
            } else {
                version_path.join("update_schema.cql")
            };
            if script.exists() {
                info!("Applying {:?}", script);
                self.execute_cql_file(session, &script).await?;
            } else {
                warn!("No migration script for version {} at {:?}, skipping", v, script);
            }
            self.set_version(session, v).await?;
            current_version = v;
        }

        if current_version < target_version {
            warn!(
                "Target version {} requested but scripts stop at version {}",
                target_version, current_version
            );
        } else {
            info!("Schema of {} is at version {}", self.keyspace, current_version);
        }
        Ok(current_version)
    }
}
