use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One file as listed by the server.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub name: String,
    pub size: u64,
    pub upload_date: String,
}

impl FileRecord {
    pub fn new(name: impl Into<String>, size: u64, uploaded_at: DateTime<Utc>) -> FileRecord {
        FileRecord {
            name: name.into(),
            size,
            upload_date: uploaded_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    pub fn uploaded_at(&self) -> Option<DateTime<FixedOffset>> {
        DateTime::parse_from_rfc3339(&self.upload_date).ok()
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Decode("file record with empty name".to_string()));
        }
        if self.uploaded_at().is_none() {
            return Err(Error::Decode(format!(
                "file record {} has invalid uploadDate {:?}",
                self.name, self.upload_date
            )));
        }
        Ok(())
    }
}

/// Decode a `/api/files` body. A JSON `null` is an empty listing.
pub fn decode_listing(body: &[u8]) -> Result<Vec<FileRecord>> {
    let records: Option<Vec<FileRecord>> = serde_json::from_slice(body)
        .map_err(|e| Error::Decode(format!("file listing: {}", e)))?;
    let records = records.unwrap_or_default();
    for record in &records {
        record.validate()?;
    }
    Ok(records)
}

/// The file list currently shown, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileListSnapshot {
    records: BTreeMap<String, FileRecord>,
}

impl FileListSnapshot {
    /// Build a snapshot, keeping the most recently uploaded record for each name.
    /// On equal upload times the later record in `records` wins.
    pub fn from_records<I>(records: I) -> FileListSnapshot
    where
        I: IntoIterator<Item = FileRecord>,
    {
        let mut snapshot = FileListSnapshot::default();
        for record in records {
            snapshot.insert(record);
        }
        snapshot
    }

    fn insert(&mut self, record: FileRecord) {
        if let Some(existing) = self.records.get(&record.name) {
            if record.uploaded_at() < existing.uploaded_at() {
                return;
            }
        }
        self.records.insert(record.name.clone(), record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&FileRecord> {
        self.records.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileRecord> {
        self.records.values()
    }

    pub fn names(&self) -> Vec<&str> {
        self.records.keys().map(String::as_str).collect()
    }

    pub fn to_records(&self) -> Vec<FileRecord> {
        self.records.values().cloned().collect()
    }
}

pub fn human_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    if bytes < KB {
        format!("{} B", bytes)
    } else if bytes < MB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    }
}

/// Short date such as `Oct 19, 2026`, falling back to the raw text.
pub fn short_date(record: &FileRecord) -> String {
    match record.uploaded_at() {
        Some(date) => date.format("%b %-d, %Y").to_string(),
        None => record.upload_date.clone(),
    }
}
