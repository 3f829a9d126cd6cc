//! Dotted field paths (`stats.daily.count`) for updates and transforms.

use crate::error::{FirestoreError, FirestoreResult};
use crate::value::{FieldValue, Fields};

/// A parsed, non-empty field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    /// Parse a dotted path. Empty paths and empty segments are rejected.
    pub fn parse(path: &str) -> FirestoreResult<Self> {
        if path.trim().is_empty() {
            return Err(FirestoreError::validation("field path must not be empty"));
        }

        let segments: Vec<String> = path.split('.').map(str::to_string).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(FirestoreError::validation(format!(
                "field path {:?} has an empty segment",
                path
            )));
        }

        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Top-level field name.
    pub fn root(&self) -> &str {
        &self.segments[0]
    }

    /// Path as used in `updateMask.fieldPaths` and `fieldTransforms`.
    ///
    /// Segments that are not plain identifiers are back-quoted.
    pub fn to_mask(&self) -> String {
        self.segments
            .iter()
            .map(|s| quote_segment(s))
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Set `value` at this path inside `fields`, creating intermediate maps.
    ///
    /// A non-map value in the way is replaced by a map.
    pub fn set_in(&self, fields: &mut Fields, value: FieldValue) {
        let (last, parents) = match self.segments.split_last() {
            Some(split) => split,
            None => return,
        };

        let mut current = fields;
        for segment in parents {
            let entry = current
                .entry(segment.clone())
                .or_insert_with(|| FieldValue::Map(Fields::new()));
            if !matches!(entry, FieldValue::Map(_)) {
                *entry = FieldValue::Map(Fields::new());
            }
            current = match entry {
                FieldValue::Map(map) => map,
                _ => return,
            };
        }
        current.insert(last.clone(), value);
    }

    /// Read the value at this path.
    pub fn get_in<'a>(&self, fields: &'a Fields) -> Option<&'a FieldValue> {
        let (first, rest) = self.segments.split_first()?;
        fields.get(first)?.get_path(rest)
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

fn is_simple_identifier(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn quote_segment(segment: &str) -> String {
    if is_simple_identifier(segment) {
        segment.to_string()
    } else {
        format!("`{}`", segment.replace('\\', "\\\\").replace('`', "\\`"))
    }
}

/// Build the nested field map for a set of dotted updates, plus the mask paths.
pub fn nest_updates<'a, I>(updates: I) -> FirestoreResult<(Fields, Vec<String>)>
where
    I: IntoIterator<Item = (&'a str, &'a FieldValue)>,
{
    let mut fields = Fields::new();
    let mut mask = Vec::new();
    for (path, value) in updates {
        let path = FieldPath::parse(path)?;
        path.set_in(&mut fields, value.clone());
        mask.push(path.to_mask());
    }
    Ok((fields, mask))
}

/// Validate a document id or collection segment.
pub(crate) fn check_document_id(id: &str) -> FirestoreResult<()> {
    if id.trim().is_empty() {
        return Err(FirestoreError::validation("document id must not be empty"));
    }
    if id.contains('/') {
        return Err(FirestoreError::validation(format!(
            "document id {:?} must not contain '/'",
            id
        )));
    }
    Ok(())
}

pub(crate) fn check_collection(collection: &str) -> FirestoreResult<()> {
    if collection.trim().is_empty() || collection.split('/').any(str::is_empty) {
        return Err(FirestoreError::validation(format!(
            "invalid collection path {:?}",
            collection
        )));
    }
    // Collection paths alternate collection/doc and end on a collection.
    if collection.split('/').count() % 2 == 0 {
        return Err(FirestoreError::validation(format!(
            "{:?} names a document, not a collection",
            collection
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rejects_empty() {
        assert!(FieldPath::parse("").is_err());
        assert!(FieldPath::parse("a..b").is_err());
        assert!(FieldPath::parse(".a").is_err());
    }

    #[test]
    fn test_mask_quotes_non_identifiers() {
        assert_eq!(FieldPath::parse("usageCount").unwrap().to_mask(), "usageCount");
        assert_eq!(
            FieldPath::parse("stats.2024-05.count").unwrap().to_mask(),
            "stats.`2024-05`.count"
        );
        assert_eq!(FieldPath::parse("a b").unwrap().to_mask(), "`a b`");
    }

    #[test]
    fn test_set_in_creates_nested_maps() {
        let mut fields = Fields::new();
        fields.insert("stats".into(), FieldValue::Int(1));

        FieldPath::parse("stats.daily.count")
            .unwrap()
            .set_in(&mut fields, FieldValue::Int(9));

        let path = FieldPath::parse("stats.daily.count").unwrap();
        assert_eq!(path.get_in(&fields), Some(&FieldValue::Int(9)));
    }

    #[test]
    fn test_nest_updates() {
        let one = FieldValue::Int(1);
        let name = FieldValue::from("x");
        let (fields, mask) = nest_updates([("a.b", &one), ("name", &name)]).unwrap();

        assert_eq!(mask, vec!["a.b".to_string(), "name".to_string()]);
        assert_eq!(
            fields["a"].as_map().unwrap().get("b"),
            Some(&FieldValue::Int(1))
        );
    }

    #[test]
    fn test_collection_paths() {
        assert!(check_collection("coupons").is_ok());
        assert!(check_collection("orders/o1/guards").is_ok());
        assert!(check_collection("orders/o1").is_err());
        assert!(check_collection("orders//guards").is_err());
        assert!(check_document_id("a/b").is_err());
    }
}
