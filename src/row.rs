//! Tabular contact rows and the keyed, ordered set they are merged in.
//!
//! A stored line is `key\tfull_name\tphone\temail\torganization`. The first
//! column carries the contact identity; the rest follow [`COLUMNS`].

use std::collections::HashMap;
use std::fmt;

use sha1::{Digest, Sha1};

/// Data columns of a row, in file order, after the identity column.
pub const COLUMNS: [&str; 4] = ["full_name", "phone", "email", "organization"];

/// Number of data columns every row carries.
pub const WIDTH: usize = COLUMNS.len();

/// Stable identity of a contact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RowKey {
    /// The card UID, or the remote href for cards without one.
    Id(String),
    /// Synthesized from the full stored line when its identity column is empty.
    Content(String),
}

impl RowKey {
    /// Build an identity key. Returns `None` for values that are blank once
    /// sanitized.
    pub fn id(value: &str) -> Option<Self> {
        let value = sanitize_field(value);
        if value.is_empty() {
            None
        } else {
            Some(RowKey::Id(value))
        }
    }

    fn from_content(line: &str) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(line.as_bytes());
        let digest = hasher.finalize();
        let hex: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
        RowKey::Content(format!("sha1:{hex}"))
    }

    /// Value written to the identity column. Content keys are never stored.
    fn stored(&self) -> &str {
        match self {
            RowKey::Id(id) => id,
            RowKey::Content(_) => "",
        }
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowKey::Id(id) => f.write_str(id),
            RowKey::Content(hash) => f.write_str(hash),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RowError {
    #[error("expected {expected} columns, found {found}")]
    Width { expected: usize, found: usize },
}

/// One contact, flattened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    key: RowKey,
    fields: Vec<String>,
}

impl Row {
    /// Create a row; field values are sanitized so they cannot break the
    /// line format.
    pub fn new<I, S>(key: RowKey, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let fields = fields
            .into_iter()
            .map(|field| sanitize_field(field.as_ref()))
            .collect();
        Self { key, fields }
    }

    pub fn key(&self) -> &RowKey {
        &self.key
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// A row with no data in any field. Never stored.
    pub fn is_empty(&self) -> bool {
        self.fields.iter().all(|field| field.is_empty())
    }

    /// Render the row as a file line, without the terminator.
    pub fn to_line(&self) -> String {
        let mut line = String::from(self.key.stored());
        for field in &self.fields {
            line.push('\t');
            line.push_str(field);
        }
        line
    }

    /// Parse a stored line carrying `width` data columns.
    pub fn from_line(line: &str, width: usize) -> Result<Self, RowError> {
        let columns: Vec<&str> = line.split('\t').collect();
        if columns.len() != width + 1 {
            return Err(RowError::Width {
                expected: width + 1,
                found: columns.len(),
            });
        }

        let key = RowKey::id(columns[0]).unwrap_or_else(|| RowKey::from_content(line));
        Ok(Row::new(key, &columns[1..]))
    }
}

/// Replace characters the line format cannot carry and trim the result.
pub fn sanitize_field(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| match c {
            '\t' | '\r' | '\n' => ' ',
            other => other,
        })
        .collect();
    cleaned.trim().to_string()
}

/// Outcome of [`RowSet::upsert`].
#[derive(Debug, PartialEq, Eq)]
pub enum Upserted {
    Added,
    /// The key existed; holds the row that was replaced.
    Replaced(Row),
    /// Empty rows are refused.
    Refused,
}

/// Rows keyed by identity, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowSet {
    rows: Vec<Row>,
    index: HashMap<RowKey, usize>,
}

impl RowSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: &RowKey) -> Option<&Row> {
        self.index.get(key).map(|&idx| &self.rows[idx])
    }

    pub fn contains(&self, key: &RowKey) -> bool {
        self.index.contains_key(key)
    }

    /// Insert a row. An existing key is replaced in place, keeping its
    /// position.
    pub fn upsert(&mut self, row: Row) -> Upserted {
        if row.is_empty() {
            return Upserted::Refused;
        }
        match self.index.get(row.key()) {
            Some(&idx) => Upserted::Replaced(std::mem::replace(&mut self.rows[idx], row)),
            None => {
                self.index.insert(row.key().clone(), self.rows.len());
                self.rows.push(row);
                Upserted::Added
            }
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &RowKey> {
        self.rows.iter().map(Row::key)
    }
}

impl FromIterator<Row> for RowSet {
    fn from_iter<T: IntoIterator<Item = Row>>(iter: T) -> Self {
        let mut set = RowSet::new();
        for row in iter {
            set.upsert(row);
        }
        set
    }
}

impl IntoIterator for RowSet {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

impl<'a> IntoIterator for &'a RowSet {
    type Item = &'a Row;
    type IntoIter = std::slice::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

#[cfg(test)]
pub(crate) fn row(key: &str, fields: &[&str]) -> Row {
    Row::new(RowKey::id(key).unwrap(), fields)
}
