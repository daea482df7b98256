//! Typed metadata predicates for retrieval.
//!
//! A [`MetadataFilter`] is a conjunction of equality constraints over a closed
//! set of denormalized chunk fields. Because the fields are enumerated, every
//! store backend can translate a filter statically (SQL column names come from
//! [`FilterField::column`], never from user input).

use serde::Serialize;

use crate::models::ChunkMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterField {
    AdvisorId,
    ClientId,
    DocType,
}

impl FilterField {
    pub fn column(self) -> &'static str {
        match self {
            FilterField::AdvisorId => "advisor_id",
            FilterField::ClientId => "client_id",
            FilterField::DocType => "doc_type",
        }
    }

    fn value_of(self, meta: &ChunkMetadata) -> &str {
        match self {
            FilterField::AdvisorId => &meta.advisor_id,
            FilterField::ClientId => &meta.client_id,
            FilterField::DocType => &meta.doc_type,
        }
    }
}

/// Conjunction of `field == value` clauses. An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetadataFilter {
    clauses: Vec<(FilterField, String)>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an equality clause. A later clause on the same field replaces the
    /// earlier one.
    pub fn with(mut self, field: FilterField, value: impl Into<String>) -> Self {
        let value = value.into();
        match self.clauses.iter_mut().find(|(f, _)| *f == field) {
            Some(existing) => existing.1 = value,
            None => self.clauses.push((field, value)),
        }
        self
    }

    /// Build from optional CLI/request parameters; `None` and blank values are ignored.
    pub fn from_options(
        advisor_id: Option<&str>,
        client_id: Option<&str>,
        doc_type: Option<&str>,
    ) -> Self {
        let mut filter = Self::new();
        for (field, value) in [
            (FilterField::AdvisorId, advisor_id),
            (FilterField::ClientId, client_id),
            (FilterField::DocType, doc_type),
        ] {
            if let Some(v) = value.map(str::trim).filter(|v| !v.is_empty()) {
                filter = filter.with(field, v);
            }
        }
        filter
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn clauses(&self) -> &[(FilterField, String)] {
        &self.clauses
    }

    pub fn matches(&self, meta: &ChunkMetadata) -> bool {
        self.clauses
            .iter()
            .all(|(field, value)| field.value_of(meta) == value)
    }
}
