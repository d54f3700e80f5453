use rusqlite::{Connection, params};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

const REQUIRED_TABLES: [&str; 2] = ["repository", "workspace"];

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS repository (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS repository_path_unique ON repository (path);

CREATE TABLE IF NOT EXISTS workspace (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repository_id INTEGER NOT NULL REFERENCES repository (id) ON DELETE CASCADE,
    brand TEXT NOT NULL,
    relative_path TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS workspace_relative_path_unique ON workspace (relative_path);
CREATE UNIQUE INDEX IF NOT EXISTS workspace_repo_brand_path_unique
    ON workspace (repository_id, brand, relative_path);
";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to create {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Database is not migrated.")]
    NotMigrated,
    #[error("Repository path is required.")]
    EmptyPath,
    #[error("Repository path must be absolute.")]
    RelativePath,
    #[error("Repository path already exists.")]
    DuplicatePath,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Repository {
    pub id: i64,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStatus {
    pub migrated: bool,
    pub missing_tables: Vec<String>,
}

/// Repositories the dashboard tracks, stored in a small SQLite file.
pub struct Registry {
    conn: Connection,
}

impl Registry {
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| RegistryError::CreateDir {
                path: parent.display().to_string(),
                source,
            })?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, RegistryError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, RegistryError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self { conn })
    }

    fn table_names(&self) -> Result<HashSet<String>, RegistryError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(names)
    }

    pub fn status(&self) -> Result<RegistryStatus, RegistryError> {
        let tables = self.table_names()?;
        let missing_tables: Vec<String> = REQUIRED_TABLES
            .iter()
            .filter(|name| !tables.contains(**name))
            .map(|name| name.to_string())
            .collect();
        Ok(RegistryStatus {
            migrated: missing_tables.is_empty(),
            missing_tables,
        })
    }

    pub fn migrate(&self) -> Result<(), RegistryError> {
        self.conn.execute_batch(SCHEMA)?;
        tracing::info!("registry schema migrated");
        Ok(())
    }

    fn ensure_migrated(&self) -> Result<(), RegistryError> {
        if self.status()?.migrated {
            Ok(())
        } else {
            Err(RegistryError::NotMigrated)
        }
    }

    /// Registered repositories ordered by path. An unmigrated store has none.
    pub fn list(&self) -> Result<Vec<Repository>, RegistryError> {
        if !self.status()?.migrated {
            return Ok(Vec::new());
        }
        let mut stmt = self
            .conn
            .prepare("SELECT id, path FROM repository ORDER BY path ASC")?;
        let repos = stmt
            .query_map([], |row| {
                Ok(Repository {
                    id: row.get(0)?,
                    path: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(repos)
    }

    pub fn add(&self, path: &str) -> Result<Repository, RegistryError> {
        self.ensure_migrated()?;

        let path = path.trim();
        if path.is_empty() {
            return Err(RegistryError::EmptyPath);
        }
        if !Path::new(path).is_absolute() {
            return Err(RegistryError::RelativePath);
        }

        let wanted = path.to_lowercase();
        if self
            .list()?
            .iter()
            .any(|repo| repo.path.to_lowercase() == wanted)
        {
            return Err(RegistryError::DuplicatePath);
        }

        self.conn
            .execute("INSERT INTO repository (path) VALUES (?1)", params![path])?;
        Ok(Repository {
            id: self.conn.last_insert_rowid(),
            path: path.to_string(),
        })
    }

    /// Removes a repository by id. Unknown ids are not an error.
    pub fn remove(&self, id: i64) -> Result<(), RegistryError> {
        self.ensure_migrated()?;
        self.conn
            .execute("DELETE FROM repository WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Drops every user table, leaving the store unmigrated.
    pub fn reset(&self) -> Result<(), RegistryError> {
        let tables: Vec<String> = self
            .table_names()?
            .into_iter()
            .filter(|name| !name.starts_with("sqlite_"))
            .collect();

        self.conn.execute_batch("PRAGMA foreign_keys = OFF;")?;
        let dropped = tables.iter().try_for_each(|table| {
            let escaped = table.replace('"', "\"\"");
            self.conn
                .execute_batch(&format!("DROP TABLE IF EXISTS \"{escaped}\";"))
        });
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        dropped?;

        tracing::info!(tables = tables.len(), "registry reset");
        Ok(())
    }

    /// Paths of every registered repository.
    pub fn repository_paths(&self) -> Result<Vec<String>, RegistryError> {
        Ok(self.list()?.into_iter().map(|repo| repo.path).collect())
    }
}
