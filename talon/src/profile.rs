use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use toml::value::{Array, Table, Value};

use crate::error::{Error, Result};

pub const SECTION_CONNECTION: &str = "connection";
pub const SECTION_PROFILE: &str = "profile";
pub const SECTION_SCRIPT: &str = "script";
pub const SECTION_REPOSITORY: &str = "repository";

/// Persisted operator profile store.
///
/// A TOML document with one array-of-tables per section (`connection`,
/// `profile`, `script`, `repository`); each entry is an opaque key/value
/// bag. Loaded at startup, flushed to disk synchronously after every
/// mutation.
pub struct ProfileStore {
    path: PathBuf,
    doc: Mutex<Table>,
}

impl ProfileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let doc = match fs::read_to_string(&path) {
            Ok(content) => content
                .parse::<Table>()
                .map_err(|e| Error::Protocol(format!("failed to parse profile store: {}", e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Table::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(ProfileStore {
            path,
            doc: Mutex::new(doc),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Append an entry to a section.
    pub fn insert(&self, section: &str, entry: Table) -> Result<()> {
        let mut doc = self.doc.lock().unwrap();

        match doc
            .entry(section.to_string())
            .or_insert_with(|| Value::Array(Array::new()))
        {
            Value::Array(entries) => entries.push(Value::Table(entry)),
            other => {
                return Err(Error::Protocol(format!(
                    "profile section '{}' is not an array: {}",
                    section, other
                )))
            }
        }

        self.save(&doc)
    }

    /// All entries of a section, in stored order.
    pub fn query(&self, section: &str) -> Vec<Table> {
        let doc = self.doc.lock().unwrap();

        match doc.get(section) {
            Some(Value::Array(entries)) => entries
                .iter()
                .filter_map(|e| e.as_table().cloned())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Delete the entry at `index` within a section. Returns whether an
    /// entry was removed.
    pub fn delete(&self, section: &str, index: usize) -> Result<bool> {
        let mut doc = self.doc.lock().unwrap();

        let removed = match doc.get_mut(section) {
            Some(Value::Array(entries)) if index < entries.len() => {
                entries.remove(index);
                true
            }
            _ => false,
        };

        if removed {
            self.save(&doc)?;
        }

        Ok(removed)
    }

    /// Drop a whole section.
    pub fn delete_all(&self, section: &str) -> Result<()> {
        let mut doc = self.doc.lock().unwrap();

        if doc.remove(section).is_some() {
            self.save(&doc)?;
        }

        Ok(())
    }

    fn save(&self, doc: &Table) -> Result<()> {
        let content = toml::to_string_pretty(doc)
            .map_err(|e| Error::Protocol(format!("failed to serialize profile store: {}", e)))?;

        fs::write(&self.path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str) -> Table {
        let mut table = Table::new();
        table.insert("name".to_string(), Value::String(name.to_string()));
        table
    }

    #[test]
    fn test_insert_query_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::open(dir.path().join("client.toml")).unwrap();

        store.insert(SECTION_CONNECTION, entry("teamserver-1")).unwrap();
        store.insert(SECTION_CONNECTION, entry("teamserver-2")).unwrap();
        store.insert(SECTION_SCRIPT, entry("loader")).unwrap();

        assert_eq!(store.query(SECTION_CONNECTION).len(), 2);
        assert_eq!(store.query(SECTION_SCRIPT).len(), 1);
        assert_eq!(store.query(SECTION_REPOSITORY).len(), 0);

        assert!(store.delete(SECTION_CONNECTION, 0).unwrap());
        let remaining = store.query(SECTION_CONNECTION);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0]["name"].as_str(), Some("teamserver-2"));

        assert!(!store.delete(SECTION_CONNECTION, 9).unwrap());
    }

    #[test]
    fn test_mutations_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");

        {
            let store = ProfileStore::open(&path).unwrap();
            store.insert(SECTION_PROFILE, entry("stage-1")).unwrap();
            store.insert(SECTION_PROFILE, entry("stage-2")).unwrap();
            store.delete_all(SECTION_SCRIPT).unwrap();
        }

        let store = ProfileStore::open(&path).unwrap();
        let profiles = store.query(SECTION_PROFILE);
        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[1]["name"].as_str(), Some("stage-2"));
    }

    #[test]
    fn test_delete_all_clears_section() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::open(dir.path().join("client.toml")).unwrap();

        store.insert(SECTION_REPOSITORY, entry("ext-repo")).unwrap();
        store.delete_all(SECTION_REPOSITORY).unwrap();

        assert!(store.query(SECTION_REPOSITORY).is_empty());
    }
}
