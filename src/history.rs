//! Narration history and reporting.
//!
//! Stores one JSONL record per narration at
//! ~/.tutor-narrator-history/{date}-narration.jsonl.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub fn default_history_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".tutor-narrator-history"))
}

fn history_file(dir: &Path, date: &str) -> PathBuf {
    dir.join(format!("{date}-narration.jsonl"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NarrationRecord {
    pub timestamp: String,
    pub mode: String,
    /// Message id (single) or batch fingerprint (bulk).
    pub subject: String,
    pub text_chars: usize,
    pub cache_hit: bool,
    pub synth_latency_ms: i64,
    pub outcome: String,
}

impl NarrationRecord {
    pub fn now(mode: &str, subject: &str, text_chars: usize) -> Self {
        Self {
            timestamp: Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
            mode: mode.to_string(),
            subject: subject.to_string(),
            text_chars,
            cache_hit: false,
            synth_latency_ms: 0,
            outcome: String::new(),
        }
    }

    fn date(&self) -> &str {
        self.timestamp.get(..10).unwrap_or("unknown")
    }
}

pub fn save_record(dir: &Path, record: &NarrationRecord) {
    if let Err(e) = fs::create_dir_all(dir) {
        warn!("Failed to create narration history dir: {e}");
        return;
    }

    let path = history_file(dir, record.date());
    let mut file = match fs::OpenOptions::new().create(true).append(true).open(&path) {
        Ok(f) => f,
        Err(e) => {
            warn!("Failed to open narration history file: {e}");
            return;
        }
    };

    match serde_json::to_string(record) {
        Ok(line) => {
            if let Err(e) = writeln!(file, "{line}") {
                warn!("Failed to write narration record: {e}");
            }
        }
        Err(e) => warn!("Failed to serialize narration record: {e}"),
    }
}

pub fn load_records(dir: &Path, date: &str) -> Vec<NarrationRecord> {
    let contents = match fs::read_to_string(history_file(dir, date)) {
        Ok(c) => c,
        Err(_) => return Vec::new(),
    };

    contents
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

pub fn list_dates(dir: &Path) -> Vec<String> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return Vec::new(),
    };

    let mut dates: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            name.strip_suffix("-narration.jsonl").map(str::to_string)
        })
        .collect();
    dates.sort();
    dates
}

pub fn generate_report(dir: &Path, date: &str) -> String {
    let records = load_records(dir, date);
    if records.is_empty() {
        return format!("No narration records for {date}.");
    }

    let total = records.len();
    let cache_hits = records.iter().filter(|r| r.cache_hit).count();
    let failed = records.iter().filter(|r| r.outcome == "failed").count();
    let avg_synth: f64 =
        records.iter().map(|r| r.synth_latency_ms as f64).sum::<f64>() / total as f64;

    let mut outcome_counts = std::collections::BTreeMap::new();
    for r in &records {
        *outcome_counts.entry(r.outcome.as_str()).or_insert(0) += 1;
    }

    let mut report = format!(
        "# Narration Report for {date}\n\n\
        - Total narrations: {total}\n\
        - Cache hits: {cache_hits}\n\
        - Failed: {failed}\n\
        - Avg synthesis latency: {avg_synth:.0}ms\n\n\
        ## Outcomes\n"
    );

    for (outcome, count) in &outcome_counts {
        report.push_str(&format!("- {outcome}: {count}\n"));
    }

    report
}
