//! On-disk configuration store
//!
//! Owns the config file set under the workdir:
//! - `config.yml` — active configuration
//! - `config.prepare.yml` — proposed configuration, created exclusively
//!   during the prepare phase of 2PC
//! - `config.backup.yml` — previous active configuration
//!
//! At any moment the set is one of {}, {active}, {active, prepare},
//! {active, prepare, backup}, {active, backup}. A leftover prepare file
//! means a round is in flight or crashed mid-round.

use serde_yaml::Value;
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::common::{Error, Result};

/// Load a YAML config file and inline external file references.
///
/// Any mapping node whose sole key is `__file` is replaced by the raw
/// contents of the referenced file, resolved relative to the config file's
/// directory.
pub fn load(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path)
        .map_err(|e| Error::ConfigLoad(format!("failed to read {}: {}", path.display(), e)))?;
    if content.trim().is_empty() {
        return Err(Error::ConfigLoad(format!("{} is empty", path.display())));
    }

    let mut doc: Value = serde_yaml::from_str(&content)
        .map_err(|e| Error::ConfigLoad(format!("failed to parse {}: {}", path.display(), e)))?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    inline_files(&mut doc, base)?;

    Ok(doc)
}

/// Serialize a document to YAML text.
pub fn to_yaml_string(doc: &Value) -> Result<String> {
    serde_yaml::to_string(doc).map_err(|e| Error::Internal(format!("YAML encode error: {}", e)))
}

/// Write a document to `path`, replacing any previous contents.
pub fn save(path: &Path, doc: &Value) -> Result<()> {
    let yaml = to_yaml_string(doc)?;
    fs::write(path, yaml)?;
    Ok(())
}

/// Create `path` exclusively and write the document to it.
///
/// Fails if the file already exists. This is the prepare-phase lock: a
/// leftover file from a crashed round makes the next round fail fast until
/// an operator removes it.
pub fn write_exclusive(path: &Path, doc: &Value) -> Result<()> {
    let yaml = to_yaml_string(doc)?;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                Error::ConfigApply(format!("{} already exists", path.display()))
            } else {
                Error::ConfigApply(format!("failed to create {}: {}", path.display(), e))
            }
        })?;
    file.write_all(yaml.as_bytes())?;
    Ok(())
}

/// Move a prepared config into place.
///
/// Unlinks the backup, hard-links active to backup (best-effort), then
/// renames prepare over active. The rename is the commit point.
pub fn promote(prepare: &Path, active: &Path, backup: &Path) -> Result<()> {
    if let Err(e) = fs::remove_file(backup) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Failed to unlink {}: {}", backup.display(), e);
        }
    }

    if active.exists() {
        if let Err(e) = fs::hard_link(active, backup) {
            tracing::warn!(
                "Failed to back up {} to {}: {}",
                active.display(),
                backup.display(),
                e
            );
        }
    }

    fs::rename(prepare, active).map_err(|e| {
        Error::ConfigApply(format!(
            "failed to move {} into place: {}",
            prepare.display(),
            e
        ))
    })
}

/// Remove a file, succeeding if it is already gone.
pub fn unlink(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn file_reference(value: &Value) -> Option<String> {
    let mapping = value.as_mapping()?;
    if mapping.len() != 1 {
        return None;
    }
    mapping.get("__file")?.as_str().map(|s| s.to_string())
}

fn inline_files(value: &mut Value, base: &Path) -> Result<()> {
    if let Some(rel) = file_reference(value) {
        let full = base.join(&rel);
        let contents = fs::read_to_string(&full).map_err(|e| {
            Error::ConfigLoad(format!("failed to read inlined file {}: {}", full.display(), e))
        })?;
        *value = Value::String(contents);
        return Ok(());
    }

    match value {
        Value::Mapping(mapping) => {
            for (_, v) in mapping.iter_mut() {
                inline_files(v, base)?;
            }
        }
        Value::Sequence(seq) => {
            for v in seq.iter_mut() {
                inline_files(v, base)?;
            }
        }
        _ => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn parse(yaml: &str) -> Value {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yml");

        let doc = parse("topology:\n  failover: true\nvshard:\n  bucket_count: 3000\n");
        save(&path, &doc).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded, doc);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let err = load(&dir.path().join("nope.yml")).unwrap_err();
        assert!(matches!(err, Error::ConfigLoad(_)));
    }

    #[test]
    fn test_load_empty_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(&path, "  \n").unwrap();
        let err = load(&path).unwrap_err();
        assert!(matches!(err, Error::ConfigLoad(_)));
    }

    #[test]
    fn test_load_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(&path, "topology: [unclosed\n").unwrap();
        let err = load(&path).unwrap_err();
        assert!(matches!(err, Error::ConfigLoad(_)));
    }

    #[test]
    fn test_inline_file_reference() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("schema.txt"), "space: memtx").unwrap();

        let path = dir.path().join("config.yml");
        fs::write(
            &path,
            "myrole:\n  schema:\n    __file: schema.txt\n  items:\n    - __file: schema.txt\n",
        )
        .unwrap();

        let doc = load(&path).unwrap();
        let role = doc.get("myrole").unwrap();
        assert_eq!(role.get("schema").unwrap().as_str(), Some("space: memtx"));
        assert_eq!(
            role.get("items").unwrap().as_sequence().unwrap()[0].as_str(),
            Some("space: memtx")
        );
    }

    #[test]
    fn test_inline_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(&path, "myrole:\n  schema:\n    __file: gone.txt\n").unwrap();

        let err = load(&path).unwrap_err();
        assert!(matches!(err, Error::ConfigLoad(_)));
    }

    #[test]
    fn test_multi_key_mapping_is_not_a_reference() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(&path, "myrole:\n  __file: keep.txt\n  other: 1\n").unwrap();

        // Two keys: the marker is literal data, nothing is inlined.
        let doc = load(&path).unwrap();
        assert_eq!(
            doc.get("myrole").unwrap().get("__file").unwrap().as_str(),
            Some("keep.txt")
        );
    }

    #[test]
    fn test_write_exclusive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.prepare.yml");
        let doc = parse("a: 1\n");

        write_exclusive(&path, &doc).unwrap();
        let err = write_exclusive(&path, &doc).unwrap_err();
        assert!(matches!(err, Error::ConfigApply(_)));
    }

    #[test]
    fn test_promote_file_set() {
        let dir = tempdir().unwrap();
        let active = dir.path().join("config.yml");
        let prepare = dir.path().join("config.prepare.yml");
        let backup = dir.path().join("config.backup.yml");

        // First commit: no active yet, so no backup is produced.
        write_exclusive(&prepare, &parse("rev: 1\n")).unwrap();
        promote(&prepare, &active, &backup).unwrap();
        assert!(active.exists());
        assert!(!prepare.exists());
        assert!(!backup.exists());

        // Second commit: previous active becomes the backup.
        write_exclusive(&prepare, &parse("rev: 2\n")).unwrap();
        promote(&prepare, &active, &backup).unwrap();
        assert_eq!(load(&active).unwrap(), parse("rev: 2\n"));
        assert_eq!(load(&backup).unwrap(), parse("rev: 1\n"));
        assert!(!prepare.exists());
    }

    #[test]
    fn test_unlink_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.prepare.yml");
        fs::write(&path, "a: 1\n").unwrap();

        unlink(&path).unwrap();
        unlink(&path).unwrap();
        assert!(!path.exists());
    }
}
