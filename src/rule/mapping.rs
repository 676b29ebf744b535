//! Column mapping: rule variables to dataset columns.

use crate::dataset::Record;
use crate::expr::Bindings;
use crate::value::Value;
use std::collections::BTreeMap;

/// Resolved variable → column mapping for one rule.
///
/// Column references may be qualified (`table.column`); only the part after
/// the last `.` names the dataset column.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ColumnMapping {
    entries: Vec<(String, String)>,
}

impl ColumnMapping {
    /// Build a mapping, resolving qualified column references.
    #[must_use]
    pub fn new<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        // A variable mapped twice keeps its last column.
        let resolved: BTreeMap<String, String> = pairs
            .into_iter()
            .map(|(var, col)| (var.into(), resolve_column(col.as_ref()).to_string()))
            .collect();
        Self {
            entries: resolved.into_iter().collect(),
        }
    }

    /// Declared variables, sorted.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(v, _)| v.as_str())
    }

    /// Resolved dataset column for a variable.
    #[must_use]
    pub fn column_for(&self, variable: &str) -> Option<&str> {
        self.entries
            .binary_search_by(|(v, _)| v.as_str().cmp(variable))
            .ok()
            .map(|i| self.entries[i].1.as_str())
    }

    /// Distinct dataset columns the mapping needs.
    #[must_use]
    pub fn columns(&self) -> Vec<&str> {
        let mut cols: Vec<&str> = self.entries.iter().map(|(_, c)| c.as_str()).collect();
        cols.sort_unstable();
        cols.dedup();
        cols
    }

    /// Number of declared variables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no variables are declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bind every declared variable for one record.
    ///
    /// Columns absent from the record bind to [`Value::Null`].
    #[must_use]
    pub fn bind<R: Record + ?Sized>(&self, record: &R) -> Bindings {
        let mut bindings = Bindings::default();
        bindings.reserve(self.entries.len());
        for (var, col) in &self.entries {
            bindings.insert(var.clone(), record.get(col).unwrap_or(Value::Null));
        }
        bindings
    }

    /// Mapping as written back to definitions.
    #[must_use]
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.entries.iter().cloned().collect()
    }
}

/// Strip a `table.` qualifier from a column reference.
#[must_use]
pub fn resolve_column(reference: &str) -> &str {
    reference
        .rsplit_once('.')
        .map_or(reference, |(_, col)| col)
        .trim()
}
