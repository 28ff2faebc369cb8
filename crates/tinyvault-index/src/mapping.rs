//! Which document fields are indexed, and how

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::analysis::Analyzer;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Dotted path into the JSON document, e.g. `address.city`
    pub path: String,
    #[serde(default)]
    pub analyzer: Analyzer,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMapping {
    pub fields: Vec<FieldMapping>,
}

impl IndexMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, path: impl Into<String>, analyzer: Analyzer) -> Self {
        self.fields.push(FieldMapping { path: path.into(), analyzer });
        self
    }

    pub fn field(&self, path: &str) -> Option<&FieldMapping> {
        self.fields.iter().find(|field| field.path == path)
    }

    /// Analyzer of `path`, `Keyword` when the field is not mapped.
    pub fn analyzer_for(&self, path: &str) -> Analyzer {
        self.field(path).map(|field| field.analyzer).unwrap_or_default()
    }

    /// `(field, term)` pairs of `doc`, one entry per occurrence.
    pub fn extract(&self, doc: &Value) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for field in &self.fields {
            let mut texts = Vec::new();
            collect_texts(lookup(doc, &field.path), &mut texts);
            for text in texts {
                for term in field.analyzer.analyze(&text) {
                    out.push((field.path.clone(), term));
                }
            }
        }
        out
    }
}

fn lookup<'v>(doc: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.').try_fold(doc, |value, segment| value.get(segment))
}

fn collect_texts(value: Option<&Value>, out: &mut Vec<String>) {
    match value {
        Some(Value::String(s)) => out.push(s.clone()),
        Some(Value::Number(n)) => out.push(n.to_string()),
        Some(Value::Bool(b)) => out.push(b.to_string()),
        Some(Value::Array(items)) => {
            for item in items {
                collect_texts(Some(item), out);
            }
        }
        Some(Value::Null) | Some(Value::Object(_)) | None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_nested_and_arrays() {
        let mapping = IndexMapping::new()
            .with_field("address.city", Analyzer::Keyword)
            .with_field("tags", Analyzer::Standard)
            .with_field("age", Analyzer::Keyword);
        let doc = json!({
            "address": {"city": "Oslo"},
            "tags": ["Red Fox", "blue"],
            "age": 42,
        });

        let mut terms = mapping.extract(&doc);
        terms.sort();
        assert_eq!(
            terms,
            vec![
                ("address.city".to_string(), "Oslo".to_string()),
                ("age".to_string(), "42".to_string()),
                ("tags".to_string(), "blue".to_string()),
                ("tags".to_string(), "fox".to_string()),
                ("tags".to_string(), "red".to_string()),
            ]
        );
    }

    #[test]
    fn test_missing_field_yields_nothing() {
        let mapping = IndexMapping::new().with_field("email", Analyzer::Keyword);
        assert!(mapping.extract(&json!({"name": "x"})).is_empty());
        assert!(mapping.extract(&json!("not an object")).is_empty());
    }

    #[test]
    fn test_mapping_serde() {
        let mapping = IndexMapping::new().with_field("email", Analyzer::Standard);
        let json = serde_json::to_string(&mapping).unwrap();
        assert_eq!(serde_json::from_str::<IndexMapping>(&json).unwrap(), mapping);
    }
}
