use std::collections::BTreeMap;
use std::path::PathBuf;

use log::{info, warn};

use crate::db::Database;
use crate::error::RowPulseError;

/// Named target databases that alerts can watch.
///
/// Populated once at startup; alerts refer to a database by name and the
/// engine resolves the name here on every tick.
#[derive(Clone, Default)]
pub struct DataSources {
    databases: BTreeMap<String, Database>,
}

impl DataSources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open every configured `name -> path` pair. A source that cannot be
    /// opened is skipped with a warning so one bad path does not stop the
    /// engine; alerts on it fail with "not found".
    pub fn open_all(paths: &BTreeMap<String, PathBuf>, pool_size: u32) -> Self {
        let mut sources = Self::new();
        for (name, path) in paths {
            match Database::open(path, pool_size) {
                Ok(db) => {
                    info!("Data source '{}' -> {}", name, path.display());
                    sources.register(name, db);
                }
                Err(e) => warn!(
                    "Skipping data source '{}' ({}): {}",
                    name,
                    path.display(),
                    e
                ),
            }
        }
        sources
    }

    pub fn register(&mut self, name: &str, db: Database) {
        self.databases.insert(name.to_string(), db);
    }

    pub fn get(&self, name: &str) -> Result<&Database, RowPulseError> {
        self.databases
            .get(name)
            .ok_or_else(|| RowPulseError::NotFound(format!("Database '{}' not found", name)))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.databases.keys().map(String::as_str)
    }
}
