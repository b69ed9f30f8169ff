//! File-backed persistence for the command store, following the same
//! read/write-whole-file pattern as [`crate::config`].

use std::fs;
use std::path::Path;

use crate::error::GatewayError;
use crate::store::Store;

/// Load commands from `path` into `store`. Returns the number of bytes
/// read, or `0` if the file doesn't exist yet.
pub fn load_commands(store: &mut Store, path: &Path) -> Result<i64, GatewayError> {
    if !path.exists() {
        return Ok(0);
    }
    let content = fs::read_to_string(path)?;
    let len = content.len() as i64;
    store.load_from_json(&content)?;
    Ok(len)
}

/// Serialize `store` to `path`. Returns the number of bytes written.
pub fn save_commands(store: &Store, path: &Path) -> Result<i64, GatewayError> {
    let json = store.to_json()?;
    let len = json.len() as i64;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, json)?;
    Ok(len)
}

/// Clear the in-memory store and remove the backing file. Returns the
/// number of bytes freed (the size the file had before removal).
pub fn wipe_commands(store: &mut Store, path: &Path) -> Result<i64, GatewayError> {
    store.wipe();
    if path.exists() {
        let len = fs::metadata(path)?.len() as i64;
        fs::remove_file(path)?;
        Ok(len)
    } else {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::datatypes::Datatype;

    fn sample() -> Command {
        Command {
            key: "a".into(),
            name: "A".into(),
            read_cmd: vec![0xB5, 0x09, 0x02, 0x00],
            write_cmd: vec![],
            active: true,
            interval: 60,
            master: false,
            position: 1,
            datatype: Datatype::Uint8,
            divider: 1.0,
            min: None,
            max: None,
            digits: 0,
            unit: String::new(),
            presentation: serde_json::Value::Null,
            last: 0,
            data: vec![],
        }
    }

    #[test]
    fn round_trips_through_a_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("commands.json");

        let mut store = Store::new();
        store.insert(sample());
        let written = save_commands(&store, &path).unwrap();
        assert!(written > 0);

        let mut loaded = Store::new();
        let read = load_commands(&mut loaded, &path).unwrap();
        assert_eq!(read, written);
        assert!(loaded.find("a").is_some());
    }

    #[test]
    fn load_missing_file_returns_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let mut store = Store::new();
        assert_eq!(load_commands(&mut store, &path).unwrap(), 0);
    }

    #[test]
    fn wipe_clears_store_and_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("commands.json");
        let mut store = Store::new();
        store.insert(sample());
        save_commands(&store, &path).unwrap();

        let freed = wipe_commands(&mut store, &path).unwrap();
        assert!(freed > 0);
        assert!(!path.exists());
        assert_eq!(store.active_count(), 0);
    }
}
