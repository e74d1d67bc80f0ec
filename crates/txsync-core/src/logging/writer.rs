//! Append-only JSONL files, one per node per day

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::entry::JsonLogEntry;

/// Appends entries to `<logs>/raw/<date>_<node>.jsonl`.
///
/// Every line is flushed as soon as it is written so a crashed node still
/// leaves a readable log behind.
pub struct NodeLogWriter {
    node: String,
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl NodeLogWriter {
    /// Open (or create) today's file for `node` under `logs_dir/raw`
    pub fn new(logs_dir: impl AsRef<Path>, node: impl Into<String>) -> io::Result<Self> {
        let node = node.into();
        let raw_dir = logs_dir.as_ref().join("raw");
        fs::create_dir_all(&raw_dir)?;

        let date = chrono::Local::now().format("%Y-%m-%d");
        let path = raw_dir.join(format!("{date}_{node}.jsonl"));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            node,
            writer: Mutex::new(BufWriter::new(file)),
            path,
        })
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, entry: &JsonLogEntry) -> io::Result<()> {
        let line = entry
            .to_json_line()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut writer = self.writer.lock();
        writeln!(writer, "{line}")?;
        writer.flush()
    }

    /// Write an unstructured line tagged with this node
    pub fn write_raw(&self, level: &str, target: &str, message: &str) -> io::Result<()> {
        self.write(&JsonLogEntry::new(level, &self.node, target, message))
    }

    pub fn flush(&self) -> io::Result<()> {
        self.writer.lock().flush()
    }
}

impl Drop for NodeLogWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Read every entry under `logs_dir/raw`, optionally only one node's files.
///
/// Entries come back ordered by timestamp. Lines that fail to parse are
/// skipped.
pub fn read_entries(logs_dir: impl AsRef<Path>, node: Option<&str>) -> io::Result<Vec<JsonLogEntry>> {
    let raw_dir = logs_dir.as_ref().join("raw");
    if !raw_dir.exists() {
        return Ok(Vec::new());
    }

    let suffix = node.map(|node| format!("_{node}.jsonl"));
    let mut entries = Vec::new();
    for dir_entry in fs::read_dir(&raw_dir)? {
        let path = dir_entry?.path();
        let Some(filename) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        let wanted = match &suffix {
            Some(suffix) => filename.ends_with(suffix.as_str()),
            None => filename.ends_with(".jsonl"),
        };
        if !wanted {
            continue;
        }

        let content = fs::read_to_string(&path)?;
        entries.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .filter_map(|line| JsonLogEntry::from_json_line(line).ok()),
        );
    }

    entries.sort_by(|a, b| a.ts.cmp(&b.ts));
    Ok(entries)
}

/// Everything logged inside one context's worker, across all nodes
pub fn read_entries_for_context(
    logs_dir: impl AsRef<Path>,
    context: &str,
) -> io::Result<Vec<JsonLogEntry>> {
    Ok(read_entries(logs_dir, None)?
        .into_iter()
        .filter(|entry| entry.context.as_deref() == Some(context))
        .collect())
}
