//! Reference resolution substrate (C1).
//!
//! Turns a symbolic manifest -- one that may embed schema references or expression
//! placeholders -- into a concrete one by walking it against a user-supplied spec. The
//! manifest stays plain `serde_json::Value` data; references are tracked in a closed
//! `Value` variant rather than as hidden properties, per the host-language rendering of
//! the source's non-enumerable reference objects.

use std::collections::HashSet;

use serde_json::{Map, Value as Json};

/// A single substitution site discovered while walking a manifest.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// An already-concrete value; never rewritten.
    Literal(Json),
    /// `spec.<name1>.<name2>...` -- resolves to the value at that dotted path in the spec.
    SchemaRef { path: String },
    /// An opaque template containing zero or more `schema.spec.<field>` occurrences, to be
    /// evaluated as an arithmetic/string-concatenation expression at deploy time.
    Expr { template: String },
}

const SCHEMA_REF_PREFIX: &str = "spec.";
const EXPR_OPEN: &str = "${";
const EXPR_CLOSE: &str = "}";

impl Value {
    /// Parses a raw manifest string, recognizing `${...}` expression placeholders. Bare
    /// `spec.foo.bar` strings are schema references only when the whole string is the
    /// reference (so "literal spec.foo" prose is not misdetected); embedding a reference
    /// inside other text requires the `${...}` form.
    pub fn parse(raw: &str) -> Value {
        if let Some(inner) = raw
            .strip_prefix(EXPR_OPEN)
            .and_then(|s| s.strip_suffix(EXPR_CLOSE))
        {
            let trimmed = inner.trim();
            if let Some(path) = trimmed.strip_prefix("schema.").and_then(|s| {
                if s.starts_with(SCHEMA_REF_PREFIX) {
                    Some(s.to_owned())
                } else {
                    None
                }
            }) {
                // sole reference inside the placeholder with nothing else to evaluate
                if !trimmed.contains(char::is_whitespace)
                    && !"+-*/()".chars().any(|c| trimmed.contains(c))
                {
                    return Value::SchemaRef { path };
                }
            }
            return Value::Expr {
                template: trimmed.to_owned(),
            };
        }
        if let Some(path) = raw.strip_prefix(SCHEMA_REF_PREFIX) {
            return Value::SchemaRef {
                path: format!("spec.{path}"),
            };
        }
        Value::Literal(Json::String(raw.to_owned()))
    }
}

/// Walks `spec.<path>` against the spec document, returning `None` if any segment is
/// missing. The root segment `spec` is implicit; callers pass the full dotted path
/// including it, matching §3's "root path `spec` then dotted subpath".
fn lookup_schema_path<'a>(spec: &'a Json, path: &str) -> Option<&'a Json> {
    let mut segments = path.split('.');
    // first segment is always the literal "spec"
    if segments.next() != Some("spec") {
        return None;
    }
    let mut current = spec;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Resolves a single reference against a spec document. Missing schema references are
/// returned unchanged (never fabricated); failing expressions fall back to their literal
/// (post-substitution) text.
pub fn resolve_value(value: &Value, spec: &Json) -> Json {
    match value {
        Value::Literal(v) => v.clone(),
        Value::SchemaRef { path } => match lookup_schema_path(spec, path) {
            Some(v) => v.clone(),
            None => Json::String(path.clone()),
        },
        Value::Expr { template } => {
            let substituted = substitute_schema_refs(template, spec);
            match crate::expr::evaluate(&substituted) {
                Ok(result) => result,
                Err(_) => Json::String(substituted),
            }
        }
    }
}

/// Replaces every `schema.spec.<field...>` occurrence in `template` with a literal
/// rendering of the spec value at that path (strings quoted, numbers/booleans verbatim,
/// objects JSON-encoded). Occurrences that don't resolve are left as-is so the expression
/// evaluator (or the final literal-text fallback) still sees them.
fn substitute_schema_refs(template: &str, spec: &Json) -> String {
    const MARKER: &str = "schema.spec.";
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(pos) = rest.find(MARKER) {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + MARKER.len()..];
        let end = after
            .find(|c: char| !(c.is_alphanumeric() || c == '_' || c == '.'))
            .unwrap_or(after.len());
        let field = &after[..end];
        let path = format!("spec.{field}");
        match lookup_schema_path(spec, &path) {
            Some(v) => out.push_str(&render_literal(v)),
            None => out.push_str(&format!("schema.{path}")),
        }
        rest = &after[end..];
    }
    out.push_str(rest);
    out
}

fn render_literal(v: &Json) -> String {
    match v {
        Json::String(s) => format!("'{s}'"),
        Json::Number(n) => n.to_string(),
        Json::Bool(b) => b.to_string(),
        Json::Null => "null".to_owned(),
        other => other.to_string(),
    }
}

/// Recursively walks any JSON value, replacing strings that parse as a [`Value`] reference
/// with their resolved form, and leaving every other shape (arrays, objects, numbers,
/// booleans, null) structurally intact. Rejects cyclic inputs -- serde_json::Value cannot
/// itself contain a cycle, so this guards only against pathological recursion depth.
pub fn resolve_json(input: &Json, spec: &Json) -> crate::error::Result<Json> {
    resolve_json_inner(input, spec, 0)
}

const MAX_DEPTH: usize = 256;

fn resolve_json_inner(input: &Json, spec: &Json, depth: usize) -> crate::error::Result<Json> {
    if depth > MAX_DEPTH {
        return Err(crate::error::Error::CyclicInput {
            path: "<manifest>".to_owned(),
        });
    }
    match input {
        Json::String(s) => Ok(resolve_value(&Value::parse(s), spec)),
        Json::Array(items) => {
            let resolved = items
                .iter()
                .map(|v| resolve_json_inner(v, spec, depth + 1))
                .collect::<crate::error::Result<Vec<_>>>()?;
            Ok(Json::Array(resolved))
        }
        Json::Object(map) => {
            let mut resolved = Map::with_capacity(map.len());
            for (k, v) in map {
                resolved.insert(k.clone(), resolve_json_inner(v, spec, depth + 1)?);
            }
            Ok(Json::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

/// Resolving an already-resolved value is the identity (§8 idempotence invariant): once a
/// string no longer parses as a schema reference or expression placeholder, a second pass
/// returns it unchanged.
pub fn is_fully_resolved(input: &Json) -> bool {
    match input {
        Json::String(s) => !matches!(Value::parse(s), Value::SchemaRef { .. } | Value::Expr { .. }),
        Json::Array(items) => items.iter().all(is_fully_resolved),
        Json::Object(map) => map.values().all(is_fully_resolved),
        _ => true,
    }
}

/// Detects whether a set of resources (keyed by id) that reference each other by id forms
/// a cycle among the reference strings themselves -- used by the graph builder before
/// handing resolved manifests to [`crate::graph::DependencyGraph`].
pub fn referenced_ids(raw: &str, known_ids: &HashSet<String>) -> Vec<String> {
    known_ids
        .iter()
        .filter(|id| raw.contains(id.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec() -> Json {
        json!({
            "name": "test-app",
            "image": {"repository": "nginx", "tag": "alpine"},
            "replicas": 2
        })
    }

    #[test]
    fn schema_ref_resolves_nested_path() {
        let value = Value::parse("spec.image.tag");
        assert_eq!(resolve_value(&value, &spec()), json!("alpine"));
    }

    #[test]
    fn schema_ref_preserves_type() {
        let value = Value::parse("spec.replicas");
        assert_eq!(resolve_value(&value, &spec()), json!(2));
    }

    #[test]
    fn missing_schema_ref_returned_unchanged() {
        let value = Value::parse("spec.missingField");
        assert_eq!(resolve_value(&value, &spec()), json!("spec.missingField"));
    }

    #[test]
    fn expr_placeholder_substitutes_and_concatenates() {
        let value = Value::parse("${schema.spec.name + '-svc'}");
        assert_eq!(resolve_value(&value, &spec()), json!("test-app-svc"));
    }

    #[test]
    fn expr_placeholder_missing_field_falls_back_to_literal_text() {
        let value = Value::parse("${schema.spec.missingField}");
        match &value {
            Value::Expr { .. } => {}
            other => panic!("expected Expr, got {other:?}"),
        }
        assert_eq!(
            resolve_value(&value, &spec()),
            json!("schema.spec.missingField")
        );
    }

    #[test]
    fn unparseable_expression_falls_back_to_literal_expression_text() {
        let value = Value::parse("${schema.spec.name == 'x' ? 1 : 2}");
        let resolved = resolve_value(&value, &spec());
        assert_eq!(resolved, json!("'test-app' == 'x' ? 1 : 2"));
    }

    #[test]
    fn plain_literal_untouched() {
        let value = Value::parse("nginx:alpine");
        assert_eq!(resolve_value(&value, &spec()), json!("nginx:alpine"));
    }

    #[test]
    fn resolve_json_recurses_into_objects_and_arrays() {
        let manifest = json!({
            "metadata": {"name": "${schema.spec.name}"},
            "env": ["${schema.spec.image.tag}", "literal"]
        });
        let resolved = resolve_json(&manifest, &spec()).unwrap();
        assert_eq!(resolved["metadata"]["name"], json!("test-app"));
        assert_eq!(resolved["env"][0], json!("alpine"));
        assert_eq!(resolved["env"][1], json!("literal"));
    }

    #[test]
    fn resolution_is_idempotent() {
        let manifest = json!({"name": "${schema.spec.name}"});
        let once = resolve_json(&manifest, &spec()).unwrap();
        let twice = resolve_json(&once, &spec()).unwrap();
        assert_eq!(once, twice);
        assert!(is_fully_resolved(&twice));
    }
}
