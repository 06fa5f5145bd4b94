//! Cypher string literals and agtype decoding.
//!
//! AGE does not accept bind parameters inside the cypher body without an
//! extra agtype argument, so idents are rendered as string literals. Every
//! rendered string escapes `$` so no payload can close the `$age$` dollar
//! quote. Property maps never go through cypher; they are written as agtype
//! text by the label-table update.

use std::fmt::Write as _;

use anyhow::anyhow;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::{LibError, Result};
use crate::models::{InternalId, PropertyMap};

/// Vertex as AGE prints it, annotation removed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgVertex {
    pub id: i64,
    pub label: String,
    #[serde(default)]
    pub properties: PropertyMap,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgEdge {
    pub id: i64,
    pub label: String,
    pub start_id: i64,
    pub end_id: i64,
    #[serde(default)]
    pub properties: PropertyMap,
}

impl AgVertex {
    pub fn internal_id(&self) -> InternalId {
        InternalId(self.id)
    }
}

impl AgEdge {
    pub fn internal_id(&self) -> InternalId {
        InternalId(self.id)
    }
}

pub fn string_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    write_string(&mut out, value);
    out
}

fn write_string(out: &mut String, value: &str) {
    out.push('\'');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '$' => out.push_str("\\u0024"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('\'');
}

/// Removes `::vertex`, `::edge`, `::path` and `::numeric` style annotations
/// that appear outside of string literals.
pub fn strip_annotations(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            ':' if chars.peek() == Some(&':') => {
                chars.next();
                while chars.peek().is_some_and(|next| next.is_ascii_alphabetic()) {
                    chars.next();
                }
            }
            c => out.push(c),
        }
    }
    out
}

pub fn decode_as<T: DeserializeOwned>(text: &str) -> Result<T> {
    let cleaned = strip_annotations(text.trim());
    serde_json::from_str(&cleaned).map_err(|err| {
        LibError::unknown(
            "Graph store returned an unreadable value",
            anyhow!("failed to decode agtype '{}': {}", text, err),
        )
    })
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;

    #[test]
    fn string_literals_escape_quotes_and_dollar_signs() {
        assert_eq!(string_literal("it's"), r"'it\'s'");
        assert_eq!(string_literal(r"a\b"), r"'a\\b'");
        assert_eq!(string_literal("$age$"), r"'\u0024age\u0024'");
        assert_eq!(string_literal("line\nbreak\u{1}"), r"'line\nbreak\u0001'");
    }

    #[test]
    fn annotations_are_stripped_outside_strings_only() {
        let text = r#"[{"id": 1, "label": "N", "properties": {"note": "a::vertex \" b"}}::vertex, 3.5::numeric]"#;
        assert_eq!(
            decode_as::<Value>(text).expect("decodes"),
            json!([{"id": 1, "label": "N", "properties": {"note": "a::vertex \" b"}}, 3.5])
        );
    }

    #[test]
    fn vertices_and_edges_decode_into_typed_records() {
        let vertex: AgVertex = decode_as(
            r#"{"id": 844424930131969, "label": "Person", "properties": {"__ident": "v1"}}::vertex"#,
        )
        .expect("vertex");
        assert_eq!(vertex.internal_id(), InternalId(844424930131969));
        assert_eq!(vertex.properties.get("__ident"), Some(&json!("v1")));

        let edge: AgEdge = decode_as(
            r#"{"id": 1125899906842625, "label": "KNOWS", "end_id": 2, "start_id": 1, "properties": {}}::edge"#,
        )
        .expect("edge");
        assert_eq!((edge.start_id, edge.end_id), (1, 2));
    }

    #[test]
    fn unreadable_values_are_reported() {
        let err = decode_as::<Value>("{not json").expect_err("invalid agtype");
        assert_eq!(err.public, "Graph store returned an unreadable value");
    }
}
