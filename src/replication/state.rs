// ABOUTME: Watermark store - the human-editable INI-style replication state document
// ABOUTME: Updates are surgical line edits written atomically through a temp file and rename

use crate::error::RunError;
use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const RUN_SECTION: &str = "run";
pub const TABLE_SECTION_PREFIX: &str = "table.";

pub const KEY_LAST_ID: &str = "last_id";
pub const KEY_LAST_PARTITION: &str = "last_partition";
pub const KEY_COLUMNS: &str = "columns";
pub const KEY_EXCLUDE: &str = "exclude";
pub const KEY_SYNCED_AT: &str = "synced_at";
pub const KEY_ROWS: &str = "rows";

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const PARTITION_FORMAT: &str = "%Y%m%d";

#[derive(Debug, Clone, PartialEq, Eq)]
enum LineKind {
    Blank,
    Comment,
    Section(String),
    Entry {
        key: String,
        value_start: usize,
        value_end: usize,
    },
    Other,
}

#[derive(Debug, Clone)]
struct Line {
    /// Raw text including its terminator.
    raw: String,
    kind: LineKind,
}

impl Line {
    fn parse(raw: String) -> Self {
        let content = raw.trim_end_matches(['\n', '\r']);
        let trimmed = content.trim();
        let kind = if trimmed.is_empty() {
            LineKind::Blank
        } else if trimmed.starts_with('#') || trimmed.starts_with(';') {
            LineKind::Comment
        } else if trimmed.starts_with('[') && trimmed.ends_with(']') {
            LineKind::Section(trimmed[1..trimmed.len() - 1].trim().to_string())
        } else if let Some(eq) = content.find('=') {
            let key = content[..eq].trim().to_string();
            if key.is_empty() {
                LineKind::Other
            } else {
                let after = eq + 1;
                let rest = &content[after..];
                let value_start = after + (rest.len() - rest.trim_start().len());
                let value_end = content.trim_end().len().max(value_start);
                LineKind::Entry {
                    key,
                    value_start,
                    value_end,
                }
            }
        } else {
            LineKind::Other
        };
        Self { raw, kind }
    }

    fn value(&self) -> Option<&str> {
        match &self.kind {
            LineKind::Entry {
                value_start,
                value_end,
                ..
            } => Some(&self.raw[*value_start..*value_end]),
            _ => None,
        }
    }

    fn ends_with_newline(&self) -> bool {
        self.raw.ends_with('\n')
    }
}

/// In-memory view of the state document that remembers every byte it was parsed from.
///
/// Edits replace only the value bytes of the touched key; comments, blank lines,
/// ordering, spacing and line terminators elsewhere survive unchanged.
#[derive(Debug, Clone, Default)]
pub struct StateDocument {
    lines: Vec<Line>,
}

impl StateDocument {
    pub fn parse(text: &str) -> Self {
        Self {
            lines: text
                .split_inclusive('\n')
                .map(|l| Line::parse(l.to_string()))
                .collect(),
        }
    }

    pub fn render(&self) -> String {
        self.lines.iter().map(|l| l.raw.as_str()).collect()
    }

    fn newline(&self) -> &'static str {
        if self.lines.iter().any(|l| l.raw.ends_with("\r\n")) {
            "\r\n"
        } else {
            "\n"
        }
    }

    /// Index of the section header and the end (exclusive) of its body.
    fn section_range(&self, section: &str) -> Option<(usize, usize)> {
        let header = self
            .lines
            .iter()
            .position(|l| matches!(&l.kind, LineKind::Section(name) if name == section))?;
        let end = self.lines[header + 1..]
            .iter()
            .position(|l| matches!(l.kind, LineKind::Section(_)))
            .map_or(self.lines.len(), |offset| header + 1 + offset);
        Some((header, end))
    }

    pub fn sections(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|l| match &l.kind {
            LineKind::Section(name) => Some(name.as_str()),
            _ => None,
        })
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.section_range(section).is_some()
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        let (header, end) = self.section_range(section)?;
        self.lines[header + 1..end]
            .iter()
            .find(|l| matches!(&l.kind, LineKind::Entry { key: k, .. } if k == key))
            .and_then(Line::value)
    }

    /// Like [`get`](Self::get) but treats an empty value as absent.
    pub fn get_non_empty(&self, section: &str, key: &str) -> Option<&str> {
        self.get(section, key).filter(|v| !v.is_empty())
    }

    /// Append an empty section if it does not exist yet.
    pub fn ensure_section(&mut self, section: &str) {
        if self.has_section(section) {
            return;
        }
        let nl = self.newline();
        if let Some(last) = self.lines.last_mut() {
            if !last.ends_with_newline() {
                last.raw.push_str(nl);
            }
        }
        if self
            .lines
            .last()
            .is_some_and(|l| l.kind != LineKind::Blank)
        {
            self.lines.push(Line::parse(nl.to_string()));
        }
        self.lines.push(Line::parse(format!("[{}]{}", section, nl)));
    }

    /// Set `key` in `section`, creating either when missing.
    pub fn set(&mut self, section: &str, key: &str, value: &str) {
        let value: String = value.chars().map(|c| if c == '\n' || c == '\r' { ' ' } else { c }).collect();
        self.ensure_section(section);
        let Some((header, end)) = self.section_range(section) else {
            return;
        };

        if let Some(line) = self.lines[header + 1..end]
            .iter_mut()
            .find(|l| matches!(&l.kind, LineKind::Entry { key: k, .. } if k == key))
        {
            if let LineKind::Entry {
                value_start,
                value_end,
                ..
            } = line.kind
            {
                let prefix = &line.raw[..value_start];
                let separator = if value_start == value_end
                    && !value.is_empty()
                    && !prefix.ends_with(char::is_whitespace)
                {
                    " "
                } else {
                    ""
                };
                let raw = format!("{}{}{}{}", prefix, separator, value, &line.raw[value_end..]);
                *line = Line::parse(raw);
            }
            return;
        }

        let insert_at = self.lines[header + 1..end]
            .iter()
            .rposition(|l| matches!(l.kind, LineKind::Entry { .. }))
            .map_or(header + 1, |offset| header + 1 + offset + 1);
        let nl = self.newline();
        if let Some(previous) = self.lines.get_mut(insert_at - 1) {
            if !previous.ends_with_newline() {
                previous.raw.push_str(nl);
            }
        }
        let raw = if value.is_empty() {
            format!("{} ={}", key, nl)
        } else {
            format!("{} = {}{}", key, value, nl)
        };
        self.lines.insert(insert_at, Line::parse(raw));
    }
}

/// Persisted replication progress for one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Watermark {
    /// Last replicated surrogate key.
    Key(i64),
    /// Last fully replicated load-date partition.
    Partition(NaiveDate),
}

impl Watermark {
    fn state_key(&self) -> &'static str {
        match self {
            Watermark::Key(_) => KEY_LAST_ID,
            Watermark::Partition(_) => KEY_LAST_PARTITION,
        }
    }

    fn render(&self) -> String {
        match self {
            Watermark::Key(id) => id.to_string(),
            Watermark::Partition(date) => date.format(PARTITION_FORMAT).to_string(),
        }
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.state_key(), self.render())
    }
}

/// One `[table.NAME]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableState {
    pub name: String,
    pub watermark: Option<Watermark>,
    /// Explicit column allow-list; `None` means every remote column.
    pub columns: Option<Vec<String>>,
    /// Raw exclusion rule text, parsed when the table is processed.
    pub exclude: Option<String>,
    pub synced_at: Option<String>,
    pub rows: Option<u64>,
}

impl TableState {
    fn from_document(doc: &StateDocument, name: &str) -> Result<Self> {
        let section = format!("{}{}", TABLE_SECTION_PREFIX, name);

        let last_id = doc
            .get_non_empty(&section, KEY_LAST_ID)
            .map(|v| {
                v.parse::<i64>()
                    .with_context(|| format!("Invalid {} '{}' in [{}]", KEY_LAST_ID, v, section))
            })
            .transpose()?;
        let last_partition = doc
            .get_non_empty(&section, KEY_LAST_PARTITION)
            .map(|v| {
                NaiveDate::parse_from_str(v, PARTITION_FORMAT).with_context(|| {
                    format!(
                        "Invalid {} '{}' in [{}], expected yyyyMMdd",
                        KEY_LAST_PARTITION, v, section
                    )
                })
            })
            .transpose()?;

        let watermark = match (last_id, last_partition) {
            (Some(_), Some(_)) => bail!(
                "[{}] sets both {} and {}; keep exactly one",
                section,
                KEY_LAST_ID,
                KEY_LAST_PARTITION
            ),
            (Some(id), None) => Some(Watermark::Key(id)),
            (None, Some(date)) => Some(Watermark::Partition(date)),
            (None, None) => None,
        };

        let columns = doc.get_non_empty(&section, KEY_COLUMNS).map(|v| {
            v.split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect::<Vec<_>>()
        });

        Ok(Self {
            name: name.to_string(),
            watermark,
            columns: columns.filter(|c| !c.is_empty()),
            exclude: doc.get_non_empty(&section, KEY_EXCLUDE).map(str::to_string),
            synced_at: doc.get_non_empty(&section, KEY_SYNCED_AT).map(str::to_string),
            rows: doc
                .get_non_empty(&section, KEY_ROWS)
                .and_then(|v| v.parse().ok()),
        })
    }
}

/// File-backed store for the state document. Single writer.
#[derive(Debug, Clone)]
pub struct WatermarkStore {
    path: PathBuf,
}

impl WatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the document. A missing file is an empty document.
    pub fn load(&self) -> Result<StateDocument> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(StateDocument::parse(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StateDocument::default()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to read state document {}", self.path.display())),
        }
    }

    fn write(&self, doc: &StateDocument) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
        tmp.write_all(doc.render().as_bytes())
            .context("Failed to write state document")?;
        tmp.as_file()
            .sync_all()
            .context("Failed to flush state document")?;
        tmp.persist(&self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }

    /// Read, edit and atomically rewrite the document.
    ///
    /// Failures are reported as [`RunError::StatePersistence`] so the driver can
    /// treat them as fatal.
    pub fn update<T>(&self, edit: impl FnOnce(&mut StateDocument) -> Result<T>) -> Result<T> {
        self.edit_and_write(edit).map_err(|e| {
            RunError::StatePersistence(format!("{}: {:#}", self.path.display(), e)).into()
        })
    }

    fn edit_and_write<T>(&self, edit: impl FnOnce(&mut StateDocument) -> Result<T>) -> Result<T> {
        let mut doc = self.load()?;
        let before = doc.render();
        let out = edit(&mut doc)?;
        if doc.render() != before {
            self.write(&doc)?;
        }
        Ok(out)
    }

    /// All `[table.NAME]` sections, in document order.
    pub fn tables(&self) -> Result<Vec<TableState>> {
        let doc = self.load()?;
        let names: Vec<String> = doc
            .sections()
            .filter_map(|s| s.strip_prefix(TABLE_SECTION_PREFIX))
            .filter(|name| !name.trim().is_empty())
            .map(str::to_string)
            .collect();
        names
            .iter()
            .map(|name| TableState::from_document(&doc, name))
            .collect()
    }

    pub fn table(&self, name: &str) -> Result<Option<TableState>> {
        Ok(self
            .tables()?
            .into_iter()
            .find(|t| t.name.eq_ignore_ascii_case(name)))
    }

    /// Add an empty `[table.NAME]` section unless one exists.
    pub fn ensure_table(&self, name: &str) -> Result<()> {
        let section = format!("{}{}", TABLE_SECTION_PREFIX, name);
        self.update(|doc| {
            doc.ensure_section(&section);
            Ok(())
        })
    }

    /// Move a table's watermark forward. Returns `false` when the stored
    /// watermark is already at or past `watermark`.
    ///
    /// A watermark never regresses and never changes kind.
    pub fn advance_watermark(
        &self,
        table: &str,
        watermark: Watermark,
        rows: u64,
        at: NaiveDateTime,
    ) -> Result<bool> {
        let section = format!("{}{}", TABLE_SECTION_PREFIX, table);
        self.update(|doc| {
            let current = TableState::from_document(doc, table)?.watermark;
            let advances = match (current, watermark) {
                (None, _) => true,
                (Some(Watermark::Key(old)), Watermark::Key(new)) => new > old,
                (Some(Watermark::Partition(old)), Watermark::Partition(new)) => new > old,
                (Some(old), new) => bail!(
                    "Refusing to replace {} with {} for {}",
                    old,
                    new,
                    table
                ),
            };
            if advances {
                doc.set(&section, watermark.state_key(), &watermark.render());
                doc.set(&section, KEY_SYNCED_AT, &at.format(TIMESTAMP_FORMAT).to_string());
                doc.set(&section, KEY_ROWS, &rows.to_string());
            }
            Ok(advances)
        })
    }
}
