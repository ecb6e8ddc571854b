//! Backup command.
//!
//! Opens the database, runs a checkpoint with a backup requested and shuts
//! down again. The backup is the committed snapshot, named
//! `<name>.<yy-mm-dd-HH-MM-SS>` inside the output directory.

use std::path::Path;
use std::sync::Arc;
use tabula_core::{Config, Database};
use tabula_storage::FileStorage;
use tracing::info;

/// Creates a backup of the database at `db_path`.
pub fn run(db_path: &Path, output_dir: &Path, name: &str) -> Result<(), Box<dyn std::error::Error>> {
    info!("Creating backup of {:?}", db_path);

    let storage = Arc::new(FileStorage::open(db_path)?);
    let config = Config::default().backup_dir(output_dir).db_name(name);
    let db = Database::startup(storage, config)?;

    db.backup_next_checkpoint();
    let report = db.checkpoint()?;
    db.shutdown()?;

    let path = report.backup.ok_or("checkpoint did not write a backup")?;
    let size = std::fs::metadata(&path)?.len();
    println!("Backup created");
    println!("  Path: {}", path.display());
    println!("  Size: {} bytes", size);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabula_storage::Snapshot;

    #[test]
    fn backup_of_empty_database_is_readable() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("db");
        let out = dir.path().join("out");

        run(&db_path, &out, "empty").unwrap();

        let files: Vec<_> = std::fs::read_dir(&out).unwrap().collect();
        assert_eq!(files.len(), 1);
        let file = files[0].as_ref().unwrap().path();
        assert!(file.file_name().unwrap().to_string_lossy().starts_with("empty."));
        let snapshot = Snapshot::decode(&std::fs::read(file).unwrap()).unwrap();
        assert_eq!(snapshot.entry_count(), 0);
    }
}
