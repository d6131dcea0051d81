// JSONL file operations

use chrono::DateTime;
use eyre::{Context, Result};
use fs2::FileExt;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use tracing::{info, warn};

/// Append one record as a JSON line, holding an exclusive lock on the file while writing
pub fn append_jsonl<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context("Failed to open JSONL file for appending")?;

    file.lock_exclusive().context("Failed to acquire file lock")?;

    let json = serde_json::to_string(record).context("Failed to serialize record")?;
    writeln!(file, "{}", json)?;
    file.sync_all()?;

    // Lock is released when file is dropped
    Ok(())
}

/// Tombstone line marking `id` as deleted at `updated_at` (ms)
pub fn tombstone(id: &str, updated_at: i64) -> Value {
    serde_json::json!({
        "id": id,
        "deleted": true,
        "updated_at": updated_at,
    })
}

pub fn is_tombstone(value: &Value) -> bool {
    value.get("deleted").and_then(|v| v.as_bool()).unwrap_or(false)
}

/// Read `updated_at` as milliseconds since epoch
///
/// Accepts either an integer (tombstones) or an RFC 3339 string (chrono-serialized records).
pub fn updated_at_ms(value: &Value) -> Option<i64> {
    match value.get("updated_at")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.timestamp_millis()),
        _ => None,
    }
}

/// Read all lines from a JSONL file, returning the latest version per ID
///
/// The line with the highest `updated_at` wins; on a tie the later line wins.
/// Tombstones are returned as-is so callers can drop deleted records.
pub fn read_jsonl_latest(path: &Path) -> Result<HashMap<String, Value>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }

    let file = File::open(path).context("Failed to open JSONL file")?;
    let reader = BufReader::new(file);
    let mut records: HashMap<String, Value> = HashMap::new();

    for (line_num, line) in reader.lines().enumerate() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                warn!(
                    file = ?path,
                    line = line_num + 1,
                    error = ?e,
                    "Failed to read line, skipping"
                );
                continue;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let value: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    file = ?path,
                    line = line_num + 1,
                    error = ?e,
                    "Failed to parse JSON, skipping"
                );
                continue;
            }
        };

        let Some(id) = value.get("id").and_then(|v| v.as_str()).map(str::to_string) else {
            warn!(file = ?path, line = line_num + 1, "Line has no id, skipping");
            continue;
        };

        let updated_at = updated_at_ms(&value).unwrap_or(0);
        let newer = records
            .get(&id)
            .is_none_or(|existing| updated_at >= updated_at_ms(existing).unwrap_or(0));
        if newer {
            records.insert(id, value);
        }
    }

    info!(
        file = ?path,
        count = records.len(),
        "Loaded latest records from JSONL"
    );

    Ok(records)
}
