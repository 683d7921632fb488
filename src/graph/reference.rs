//! Reference markers linking declared resources.
//!
//! Attribute strings may embed `${type.name.attribute}` markers pointing at
//! attributes of other declared resources. This module parses markers out
//! of attribute values, and resolves them against live attribute maps when
//! a plan is applied. `$${` escapes a literal `${`.

use crate::config::{AttrMap, ResourceId};
use serde_json::Value;
use std::fmt;

/// A parsed reference to another resource's attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    /// Identity of the referenced resource.
    pub target: ResourceId,
    /// Attribute path on the referenced resource, one entry per dot.
    pub path: Vec<String>,
}

/// A reference marker that could not be parsed.
#[derive(Debug, Clone)]
pub struct RefParseError {
    /// The malformed marker text.
    pub marker: String,
    /// Why the marker could not be parsed.
    pub reason: String,
}

/// A reference that could not be resolved against live attributes.
#[derive(Debug, Clone)]
pub struct ResolveError {
    /// The reference that failed, rendered as a marker.
    pub reference: String,
    /// Why resolution failed.
    pub reason: String,
}

/// One parsed piece of an attribute string: literal text or a reference.
#[derive(Debug, Clone)]
enum Piece {
    Literal(String),
    Ref(Reference),
}

impl Reference {
    /// Collects every reference embedded in an attribute value, walking
    /// nested arrays and objects.
    ///
    /// # Errors
    ///
    /// Returns an error if any marker is malformed.
    pub fn scan_value(value: &Value) -> Result<Vec<Self>, RefParseError> {
        let mut refs = Vec::new();
        collect_refs(value, &mut refs)?;
        Ok(refs)
    }

    /// Parses the text between `${` and `}`.
    fn parse_marker(inner: &str) -> Result<Self, String> {
        if inner.trim().is_empty() {
            return Err(String::from("empty reference"));
        }

        let parts: Vec<&str> = inner.split('.').collect();
        if parts.len() < 3 {
            return Err(String::from(
                "expected ${type.name.attribute} with at least three segments",
            ));
        }
        if parts.iter().any(|p| p.is_empty()) {
            return Err(String::from("reference contains an empty segment"));
        }

        Ok(Self {
            target: ResourceId::new(parts[0], parts[1]),
            path: parts[2..].iter().map(|p| (*p).to_string()).collect(),
        })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}.{}}}", self.target, self.path.join("."))
    }
}

impl fmt::Display for RefParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.marker, self.reason)
    }
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reference, self.reason)
    }
}

/// Splits an attribute string into literal and reference pieces,
/// unescaping `$${` along the way.
fn parse_pieces(s: &str) -> Result<Vec<Piece>, RefParseError> {
    let mut pieces = Vec::new();
    let mut literal = String::new();
    let mut rest = s;

    loop {
        let Some(pos) = rest.find('$') else {
            literal.push_str(rest);
            break;
        };

        literal.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(tail) = after.strip_prefix("${") {
            // "$${" escape
            literal.push_str("${");
            rest = tail;
        } else if let Some(tail) = after.strip_prefix('{') {
            let Some(end) = tail.find('}') else {
                return Err(RefParseError {
                    marker: format!("${{{tail}"),
                    reason: String::from("unterminated reference marker"),
                });
            };
            let inner = &tail[..end];
            let reference = Reference::parse_marker(inner).map_err(|reason| RefParseError {
                marker: format!("${{{inner}}}"),
                reason,
            })?;

            if !literal.is_empty() {
                pieces.push(Piece::Literal(std::mem::take(&mut literal)));
            }
            pieces.push(Piece::Ref(reference));
            rest = &tail[end + 1..];
        } else {
            literal.push('$');
            rest = after;
        }
    }

    if !literal.is_empty() {
        pieces.push(Piece::Literal(literal));
    }

    Ok(pieces)
}

/// Walks a value tree collecting references from every string.
fn collect_refs(value: &Value, refs: &mut Vec<Reference>) -> Result<(), RefParseError> {
    match value {
        Value::String(s) => {
            for piece in parse_pieces(s)? {
                if let Piece::Ref(reference) = piece {
                    refs.push(reference);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_refs(item, refs)?;
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_refs(item, refs)?;
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
    Ok(())
}

/// Resolves every reference in an attribute value against live attributes.
///
/// A string that consists of exactly one marker resolves to the target
/// value with its type preserved; markers mixed with literal text
/// interpolate scalar targets into the surrounding string.
///
/// # Errors
///
/// Returns an error if a reference's target attribute is missing or a
/// non-scalar value is interpolated into a string.
pub fn resolve_value(
    value: &Value,
    lookup: &dyn Fn(&Reference) -> Option<Value>,
) -> Result<Value, ResolveError> {
    match value {
        Value::String(s) => resolve_string(s, lookup),
        Value::Array(items) => {
            let mut resolved = Vec::with_capacity(items.len());
            for item in items {
                resolved.push(resolve_value(item, lookup)?);
            }
            Ok(Value::Array(resolved))
        }
        Value::Object(map) => {
            let mut resolved = serde_json::Map::new();
            for (key, item) in map {
                resolved.insert(key.clone(), resolve_value(item, lookup)?);
            }
            Ok(Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

/// Resolves a single attribute string.
fn resolve_string(
    s: &str,
    lookup: &dyn Fn(&Reference) -> Option<Value>,
) -> Result<Value, ResolveError> {
    let pieces = parse_pieces(s).map_err(|e| ResolveError {
        reference: e.marker,
        reason: e.reason,
    })?;

    // A string that is exactly one marker keeps the target's type.
    if let [Piece::Ref(reference)] = pieces.as_slice() {
        return lookup(reference).ok_or_else(|| ResolveError {
            reference: reference.to_string(),
            reason: String::from("no such attribute on the referenced resource"),
        });
    }

    let mut rendered = String::new();
    for piece in pieces {
        match piece {
            Piece::Literal(text) => rendered.push_str(&text),
            Piece::Ref(reference) => {
                let target = lookup(&reference).ok_or_else(|| ResolveError {
                    reference: reference.to_string(),
                    reason: String::from("no such attribute on the referenced resource"),
                })?;
                match target {
                    Value::String(text) => rendered.push_str(&text),
                    Value::Number(n) => rendered.push_str(&n.to_string()),
                    Value::Bool(b) => rendered.push_str(if b { "true" } else { "false" }),
                    Value::Null | Value::Array(_) | Value::Object(_) => {
                        return Err(ResolveError {
                            reference: reference.to_string(),
                            reason: String::from("cannot interpolate a non-scalar value"),
                        });
                    }
                }
            }
        }
    }

    Ok(Value::String(rendered))
}

/// Navigates an attribute map along a dotted reference path.
#[must_use]
pub fn lookup_path<'a>(attrs: &'a AttrMap, path: &[String]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let mut current = attrs.get(first)?;

    for segment in rest {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scan_whole_reference() {
        let refs = Reference::scan_value(&json!("${gateway.edge.path}")).unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].target, ResourceId::new("gateway", "edge"));
        assert_eq!(refs[0].path, vec!["path"]);
    }

    #[test]
    fn test_scan_interpolated() {
        let refs =
            Reference::scan_value(&json!("segment ${segment.web.id} on ${gateway.edge.path}"))
                .unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[1].target, ResourceId::new("gateway", "edge"));
    }

    #[test]
    fn test_scan_nested_values() {
        let value = json!({
            "rules": [
                { "source": "${security-group.web.id}" },
                { "source": "10.0.0.0/8" }
            ]
        });
        let refs = Reference::scan_value(&value).unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].target, ResourceId::new("security-group", "web"));
    }

    #[test]
    fn test_scan_escaped_marker() {
        let refs = Reference::scan_value(&json!("literal $${not.a.ref} here")).unwrap();
        assert!(refs.is_empty());
    }

    #[test]
    fn test_scan_unterminated() {
        let err = Reference::scan_value(&json!("${gateway.edge.path")).unwrap_err();
        assert!(err.reason.contains("unterminated"));
    }

    #[test]
    fn test_scan_too_few_segments() {
        let err = Reference::scan_value(&json!("${gateway.edge}")).unwrap_err();
        assert!(err.reason.contains("three segments"));
    }

    #[test]
    fn test_reference_display() {
        let refs = Reference::scan_value(&json!("${vm.web-0.ip.0}")).unwrap();
        assert_eq!(refs[0].to_string(), "${vm.web-0.ip.0}");
    }

    #[test]
    fn test_resolve_preserves_type() {
        let lookup = |r: &Reference| {
            (r.target == ResourceId::new("segment", "web") && r.path == ["vlan"])
                .then(|| json!(120))
        };
        let resolved = resolve_value(&json!("${segment.web.vlan}"), &lookup).unwrap();
        assert_eq!(resolved, json!(120));
    }

    #[test]
    fn test_resolve_interpolation() {
        let lookup = |r: &Reference| (r.path == ["id"]).then(|| json!("seg-42"));
        let resolved = resolve_value(&json!("attached to ${segment.web.id}!"), &lookup).unwrap();
        assert_eq!(resolved, json!("attached to seg-42!"));
    }

    #[test]
    fn test_resolve_unescapes_literal() {
        let lookup = |_: &Reference| None;
        let resolved = resolve_value(&json!("keep $${this.as.is}"), &lookup).unwrap();
        assert_eq!(resolved, json!("keep ${this.as.is}"));
    }

    #[test]
    fn test_resolve_missing_attribute() {
        let lookup = |_: &Reference| None;
        let err = resolve_value(&json!("${segment.web.id}"), &lookup).unwrap_err();
        assert_eq!(err.reference, "${segment.web.id}");
    }

    #[test]
    fn test_resolve_rejects_non_scalar_interpolation() {
        let lookup = |_: &Reference| Some(json!(["a", "b"]));
        let err = resolve_value(&json!("list: ${vm.web-0.ips}"), &lookup).unwrap_err();
        assert!(err.reason.contains("non-scalar"));
    }

    #[test]
    fn test_lookup_path_nested() {
        let mut attrs = AttrMap::new();
        attrs.insert(
            String::from("ports"),
            json!({ "http": [80, 8080], "https": 443 }),
        );

        let path = |segments: &[&str]| -> Vec<String> {
            segments.iter().map(|s| (*s).to_string()).collect()
        };

        assert_eq!(lookup_path(&attrs, &path(&["ports", "https"])), Some(&json!(443)));
        assert_eq!(
            lookup_path(&attrs, &path(&["ports", "http", "1"])),
            Some(&json!(8080))
        );
        assert_eq!(lookup_path(&attrs, &path(&["missing"])), None);
    }
}
