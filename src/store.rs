//! Durable JSON store
//!
//! Each collection is one JSON file holding an ordered array of records.
//! Writes are atomic (tmp file + rename) and flushed on every mutation; ids
//! are dense and monotonic. Files are owner-rw only and the mode is repaired
//! on load if an existing file is more permissive.
//!
//! The store itself is not synchronized — all mutators run inside the single
//! state critical section owned by [`crate::core::state::AppState`].

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};
use crate::logger::log;

/// A record that can live in a [`Collection`].
pub trait Record: Serialize + DeserializeOwned + Clone {
    fn id(&self) -> i64;
    fn set_id(&mut self, id: i64);
}

/// Ordered sequence of records of one shape, backed by a JSON file.
pub struct Collection<T: Record> {
    path: PathBuf,
    records: Vec<T>,
}

impl<T: Record> Collection<T> {
    /// Load the collection from `path`, creating an empty one if the file is
    /// missing. A corrupt or unparseable file is replaced with defaults; the
    /// event is logged rather than propagated.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = if path.exists() {
            restrict_file_mode(&path)?;
            match fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str::<Vec<T>>(&content) {
                    Ok(records) => records,
                    Err(e) => {
                        log::warn!(
                            path = %path.display(),
                            error = %e,
                            "Collection file corrupt, replacing with defaults"
                        );
                        Vec::new()
                    }
                },
                Err(e) => {
                    log::warn!(
                        path = %path.display(),
                        error = %e,
                        "Collection file unreadable, replacing with defaults"
                    );
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        Ok(Self { path, records })
    }

    /// Atomically persist the collection: serialize to `<path>.tmp`, then
    /// rename over the target. On rename failure the tmp file is removed and
    /// the error propagates.
    pub fn save(&self) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(&self.records)?;
        fs::write(&tmp, content)
            .map_err(|e| AppError::Store(format!("write {}: {}", tmp.display(), e)))?;
        restrict_file_mode(&tmp)?;

        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(AppError::Store(format!(
                "rename {} -> {}: {}",
                tmp.display(),
                self.path.display(),
                e
            )));
        }
        Ok(())
    }

    /// Insert a record, assigning the next dense id, and flush.
    pub fn insert(&mut self, mut record: T) -> Result<T> {
        let next_id = self.records.iter().map(|r| r.id()).max().unwrap_or(0) + 1;
        record.set_id(next_id);
        self.records.push(record.clone());
        self.save()?;
        Ok(record)
    }

    /// Apply `patch` to the record with `id` and flush. Returns the patched
    /// record, or `None` if no record matches.
    pub fn update(&mut self, id: i64, patch: impl FnOnce(&mut T)) -> Result<Option<T>> {
        let Some(record) = self.records.iter_mut().find(|r| r.id() == id) else {
            return Ok(None);
        };
        patch(record);
        let updated = record.clone();
        self.save()?;
        Ok(Some(updated))
    }

    /// Remove the record with `id` and flush. Returns whether one was removed.
    pub fn delete(&mut self, id: i64) -> Result<bool> {
        let before = self.records.len();
        self.records.retain(|r| r.id() != id);
        if self.records.len() == before {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    pub fn find_by_id(&self, id: i64) -> Option<&T> {
        self.records.iter().find(|r| r.id() == id)
    }

    pub fn find_by(&self, pred: impl Fn(&T) -> bool) -> Option<&T> {
        self.records.iter().find(|r| pred(r))
    }

    pub fn filter(&self, pred: impl Fn(&T) -> bool) -> Vec<&T> {
        self.records.iter().filter(|r| pred(r)).collect()
    }

    pub fn all(&self) -> &[T] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Create `dir` if missing and force owner-rwx-only mode on it.
pub fn ensure_data_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .map_err(|e| AppError::Store(format!("create {}: {}", dir.display(), e)))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(dir)?.permissions();
        if perms.mode() & 0o777 != 0o700 {
            perms.set_mode(0o700);
            fs::set_permissions(dir, perms)?;
        }
    }
    Ok(())
}

/// Force owner-rw-only mode on an existing file.
pub fn restrict_file_mode(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        if perms.mode() & 0o777 != 0o600 {
            perms.set_mode(0o600);
            fs::set_permissions(path, perms)?;
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct TestRecord {
        id: i64,
        name: String,
    }

    impl Record for TestRecord {
        fn id(&self) -> i64 {
            self.id
        }
        fn set_id(&mut self, id: i64) {
            self.id = id;
        }
    }

    fn rec(name: &str) -> TestRecord {
        TestRecord {
            id: 0,
            name: name.to_string(),
        }
    }

    #[test]
    fn test_insert_assigns_dense_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mut col = Collection::load(dir.path().join("t.json")).unwrap();

        let a = col.insert(rec("a")).unwrap();
        let b = col.insert(rec("b")).unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
    }

    #[test]
    fn test_id_monotonic_after_delete() {
        let dir = tempfile::tempdir().unwrap();
        let mut col = Collection::load(dir.path().join("t.json")).unwrap();

        col.insert(rec("a")).unwrap();
        let b = col.insert(rec("b")).unwrap();
        col.delete(1).unwrap();
        let c = col.insert(rec("c")).unwrap();
        // max(existing) + 1, not a reused id
        assert_eq!(c.id, b.id + 1);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.json");

        let mut col = Collection::load(&path).unwrap();
        col.insert(rec("alpha")).unwrap();
        col.insert(rec("beta")).unwrap();

        let reloaded: Collection<TestRecord> = Collection::load(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.find_by_id(1).unwrap().name, "alpha");
        assert_eq!(reloaded.find_by_id(2).unwrap().name, "beta");
    }

    #[test]
    fn test_corrupt_file_replaced_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.json");
        fs::write(&path, "{not json at all").unwrap();

        let col: Collection<TestRecord> = Collection::load(&path).unwrap();
        assert!(col.is_empty());
    }

    #[test]
    fn test_update_patches_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.json");

        let mut col = Collection::load(&path).unwrap();
        col.insert(rec("old")).unwrap();
        let updated = col.update(1, |r| r.name = "new".to_string()).unwrap();
        assert_eq!(updated.unwrap().name, "new");

        let reloaded: Collection<TestRecord> = Collection::load(&path).unwrap();
        assert_eq!(reloaded.find_by_id(1).unwrap().name, "new");
    }

    #[test]
    fn test_update_missing_id_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut col: Collection<TestRecord> =
            Collection::load(dir.path().join("t.json")).unwrap();
        assert!(col.update(99, |_| {}).unwrap().is_none());
    }

    #[test]
    fn test_filter_and_find_by() {
        let dir = tempfile::tempdir().unwrap();
        let mut col = Collection::load(dir.path().join("t.json")).unwrap();
        col.insert(rec("x")).unwrap();
        col.insert(rec("y")).unwrap();
        col.insert(rec("x")).unwrap();

        assert_eq!(col.filter(|r| r.name == "x").len(), 2);
        assert_eq!(col.find_by(|r| r.name == "y").unwrap().id, 2);
        assert!(col.find_by(|r| r.name == "z").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_file_mode_is_owner_rw_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.json");
        let mut col = Collection::load(&path).unwrap();
        col.insert(rec("a")).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn test_existing_file_mode_repaired_on_load() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.json");
        fs::write(&path, "[]").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let _col: Collection<TestRecord> = Collection::load(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn test_ensure_data_dir_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        ensure_data_dir(&data).unwrap();
        let mode = fs::metadata(&data).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_no_tmp_file_left_after_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.json");
        let mut col = Collection::load(&path).unwrap();
        col.insert(rec("a")).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
    }
}
