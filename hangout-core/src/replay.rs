//! Captured snapshots and change streams
//!
//! A snapshot is a JSON object mapping domain names to arrays of rows, the
//! shape a full REST fetch of every table produces. A change stream is JSONL,
//! one [`WireChange`] per line. Bad lines are reported as warnings and
//! skipped; they never abort a replay.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::{ChangeEvent, Domain, Record, WireChange};

/// Result of reading a change stream
#[derive(Debug, Default)]
pub struct ChangeLog {
    pub events: Vec<ChangeEvent>,
    /// One message per skipped line
    pub warnings: Vec<String>,
}

/// Load a snapshot file into per-domain rows
pub fn load_snapshot(path: &Path) -> Result<BTreeMap<Domain, Vec<Record>>> {
    let file = File::open(path)?;
    let raw: BTreeMap<String, Vec<Value>> = serde_json::from_reader(BufReader::new(file))?;

    let mut snapshot = BTreeMap::new();
    for (name, rows) in raw {
        let domain: Domain = name.parse()?;
        let total = rows.len();
        let records: Vec<Record> = rows.into_iter().filter_map(Record::from_row).collect();
        if records.len() < total {
            tracing::warn!(
                domain = %domain,
                skipped = total - records.len(),
                "Snapshot rows without a usable id"
            );
        }
        snapshot.insert(domain, records);
    }
    Ok(snapshot)
}

/// Read a JSONL change stream
pub fn load_changes(path: &Path) -> Result<ChangeLog> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut log = ChangeLog::default();

    for (index, line_result) in reader.lines().enumerate() {
        let line_number = index + 1;
        let line = match line_result {
            Ok(l) => l,
            Err(e) => {
                log.warnings
                    .push(format!("Line {}: read error: {}", line_number, e));
                continue;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        match parse_change(&line) {
            Ok(event) => log.events.push(event),
            Err(e) => log.warnings.push(format!("Line {}: {}", line_number, e)),
        }
    }

    Ok(log)
}

fn parse_change(line: &str) -> Result<ChangeEvent> {
    let wire: WireChange = serde_json::from_str(line)?;
    ChangeEvent::try_from(wire)
}

/// Parse a `--domain` style argument list ("plans,friends")
pub fn parse_domains(list: &str) -> Result<Vec<Domain>> {
    let domains = list
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::parse)
        .collect::<Result<Vec<Domain>>>()?;
    if domains.is_empty() {
        return Err(Error::Config("no domains given".to_string()));
    }
    Ok(domains)
}
