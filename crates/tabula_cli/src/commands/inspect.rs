//! Inspect command implementation.

use serde::Serialize;
use std::fs;
use std::path::Path;
use tabula_storage::{Snapshot, DATA_FILE};

/// Snapshot inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Inspected file.
    pub path: String,
    /// File size in bytes.
    pub file_size: u64,
    /// Number of tables.
    pub table_count: usize,
    /// Number of records across all tables.
    pub record_count: usize,
    /// Per-table details (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tables: Option<Vec<TableSummary>>,
}

/// Summary of a single table.
#[derive(Debug, Serialize)]
pub struct TableSummary {
    /// Table id.
    pub id: u32,
    /// Table name.
    pub name: String,
    /// Number of records.
    pub record_count: usize,
    /// Key and value bytes.
    pub data_size: usize,
    /// Saved auto-increment counter.
    pub id_counter: u64,
}

/// Runs the inspect command.
///
/// `path` is either a database directory or a snapshot file such as a backup.
pub fn run(path: &Path, show_tables: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let file = if path.is_dir() { path.join(DATA_FILE) } else { path.to_path_buf() };
    if !file.exists() {
        return Err(format!("No snapshot found at {:?}", file).into());
    }

    let bytes = fs::read(&file)?;
    let snapshot = Snapshot::decode(&bytes)?;
    let result = summarize(&file, bytes.len() as u64, &snapshot, show_tables);

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn summarize(file: &Path, file_size: u64, snapshot: &Snapshot, show_tables: bool) -> InspectResult {
    let tables = show_tables.then(|| {
        snapshot
            .tables
            .iter()
            .map(|t| TableSummary {
                id: t.id,
                name: t.name.clone(),
                record_count: t.entries.len(),
                data_size: t.entries.iter().map(|(k, v)| k.len() + v.len()).sum(),
                id_counter: t.id_counter,
            })
            .collect()
    });

    InspectResult {
        path: file.display().to_string(),
        file_size,
        table_count: snapshot.tables.len(),
        record_count: snapshot.entry_count(),
        tables,
    }
}

fn print_text_output(result: &InspectResult) {
    println!("Tabula Snapshot Inspection");
    println!("==========================");
    println!();
    println!("Path: {}", result.path);
    println!("Size: {}", format_size(result.file_size));
    println!();
    println!("Tables:  {}", result.table_count);
    println!("Records: {}", result.record_count);

    if let Some(tables) = &result.tables {
        println!();
        for table in tables {
            println!(
                "  [{}] {}: {} records, {}, id counter {}",
                table.id,
                table.name,
                table.record_count,
                format_size(table.data_size as u64),
                table.id_counter
            );
        }
    }
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} bytes", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
