//! Search requests and results

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Query {
    /// Exact, unanalyzed term
    Term { field: String, term: String },
    /// Text analyzed with the field's analyzer; every token must match
    Match { field: String, text: String },
    /// Terms starting with `prefix`
    Prefix { field: String, prefix: String },
    MatchAll,
    /// Every sub-query must match
    Conjunction(Vec<Query>),
    /// At least one sub-query must match
    Disjunction(Vec<Query>),
}

impl Query {
    pub fn term(field: impl Into<String>, term: impl Into<String>) -> Self {
        Query::Term { field: field.into(), term: term.into() }
    }

    pub fn matching(field: impl Into<String>, text: impl Into<String>) -> Self {
        Query::Match { field: field.into(), text: text.into() }
    }

    pub fn prefix(field: impl Into<String>, prefix: impl Into<String>) -> Self {
        Query::Prefix { field: field.into(), prefix: prefix.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: Query,
    pub size: usize,
    pub from: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl SearchRequest {
    pub const DEFAULT_SIZE: usize = 10;

    pub fn new(query: Query) -> Self {
        Self { query, size: Self::DEFAULT_SIZE, from: 0, timeout: None }
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn with_from(mut self, from: usize) -> Self {
        self.from = from;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Matching documents before paging
    pub total: usize,
    /// Highest score first, ties by id
    pub hits: Vec<SearchHit>,
    pub took: Duration,
}

impl SearchResult {
    pub fn ids(&self) -> Vec<&str> {
        self.hits.iter().map(|hit| hit.id.as_str()).collect()
    }
}
