//! `{...}` token resolution over a node's property tree.
//!
//! A token body is split on `.`. A first segment of `payload` addresses the
//! execution payload, anything else names a DataObject of the same feature.
//! Tokens that cannot be resolved stay in the text untouched.
use tracing::trace;

use crate::node::DataObjectHandle;
use crate::value::{NodeRef, PropertyValue};

const PAYLOAD: &str = "payload";

/// Lookup of live DataObjects by key name, scoped to one feature.
pub trait DataObjectSource {
    fn data_object(&self, key_name: &str) -> Option<DataObjectHandle>;
}

/// A source with no DataObjects at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDataObjects;

impl DataObjectSource for NoDataObjects {
    fn data_object(&self, _key_name: &str) -> Option<DataObjectHandle> {
        None
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExpressionParser;

impl ExpressionParser {
    /// Resolve tokens in place. String properties and string entries of list
    /// properties are rewritten; every other property passes through.
    pub fn resolve(properties: &mut PropertyValue, payload: &PropertyValue, source: &dyn DataObjectSource) {
        match properties {
            PropertyValue::Map(map) => {
                for value in map.values_mut() {
                    Self::resolve_property(value, payload, source);
                }
            }
            other => Self::resolve_property(other, payload, source),
        }
    }

    fn resolve_property(value: &mut PropertyValue, payload: &PropertyValue, source: &dyn DataObjectSource) {
        match value {
            PropertyValue::String(text) => {
                if let Some(resolved) = Self::resolve_text(text, payload, source) {
                    *value = resolved;
                }
            }
            PropertyValue::List(entries) => {
                for entry in entries.iter_mut() {
                    if let PropertyValue::String(text) = entry {
                        if let Some(resolved) = Self::resolve_text(text, payload, source) {
                            *entry = resolved;
                        }
                    }
                }
            }
            _ => {}
        }
    }

    /// Resolve one string. `None` means nothing changed.
    ///
    /// A string that is exactly one token may resolve to a non-string value
    /// (the whole payload, a typed payload field, a DataObject reference).
    pub fn resolve_text(
        text: &str,
        payload: &PropertyValue,
        source: &dyn DataObjectSource,
    ) -> Option<PropertyValue> {
        if !text.contains('{') {
            return None;
        }

        if let Some(body) = whole_token(text) {
            if let Some(value) = Self::resolve_whole(body, payload, source) {
                return Some(value);
            }
        }

        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        let mut changed = false;
        while let Some(open) = rest.find('{') {
            let Some(close) = rest[open..].find('}').map(|i| open + i) else {
                break;
            };
            out.push_str(&rest[..open]);
            let body = &rest[open + 1..close];
            match Self::resolve_field(body, payload, source) {
                Some(replacement) => {
                    trace!(token = body, "token resolved");
                    out.push_str(&replacement);
                    changed = true;
                }
                None => out.push_str(&rest[open..=close]),
            }
            rest = &rest[close + 1..];
        }
        out.push_str(rest);

        changed.then_some(PropertyValue::String(out))
    }

    fn resolve_whole(body: &str, payload: &PropertyValue, source: &dyn DataObjectSource) -> Option<PropertyValue> {
        let segments: Vec<&str> = body.split('.').collect();
        match segments.as_slice() {
            [PAYLOAD] => Some(payload.clone()),
            [key] if !key.is_empty() => source
                .data_object(key)
                .map(|handle| PropertyValue::Node(NodeRef::new(*key, handle))),
            [PAYLOAD, field] => payload.get(field).cloned(),
            _ => None,
        }
    }

    /// Display text for a two-segment token.
    fn resolve_field(body: &str, payload: &PropertyValue, source: &dyn DataObjectSource) -> Option<String> {
        let (head, field) = body.split_once('.')?;
        if head.is_empty() || field.is_empty() || field.contains('.') {
            return None;
        }
        if head == PAYLOAD {
            return payload.get(field).map(PropertyValue::display_string);
        }
        let handle = source.data_object(head)?;
        let data = handle.read();
        data.try_replace_string(field)
    }
}

/// Body of `text` when the whole string is a single `{...}` token.
fn whole_token(text: &str) -> Option<&str> {
    let body = text.strip_prefix('{')?.strip_suffix('}')?;
    (!body.contains('{') && !body.contains('}')).then_some(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::DataObject;
    use serde_json::{Value, json};
    use std::collections::HashMap;

    #[derive(Debug)]
    struct Profile(Value);

    impl DataObject for Profile {
        fn key_name(&self) -> &str {
            "profile"
        }
        fn update_value(&mut self, value: Value) {
            self.0 = value;
        }
        fn try_replace_string(&self, field: &str) -> Option<String> {
            self.0.get(field).and_then(|v| v.as_str()).map(str::to_string)
        }
        fn value(&self) -> PropertyValue {
            PropertyValue::from(self.0.clone())
        }
    }

    struct Source(HashMap<String, DataObjectHandle>);

    impl DataObjectSource for Source {
        fn data_object(&self, key_name: &str) -> Option<DataObjectHandle> {
            self.0.get(key_name).cloned()
        }
    }

    fn profile_source() -> Source {
        let handle = DataObjectHandle::new(Box::new(Profile(json!({"tier": "gold"}))));
        Source(HashMap::from([("profile".to_string(), handle)]))
    }

    fn text(payload: Value, input: &str) -> PropertyValue {
        let mut props = PropertyValue::from(json!({ "text": input }));
        ExpressionParser::resolve(&mut props, &PropertyValue::from(payload), &profile_source());
        props.get("text").cloned().unwrap_or_default()
    }

    #[test]
    fn test_payload_field_inside_text() {
        assert_eq!(text(json!({"name": "Ann"}), "Hello {payload.name}!"), PropertyValue::from("Hello Ann!"));
    }

    #[test]
    fn test_text_without_braces_is_unchanged() {
        assert_eq!(text(json!({"name": "Ann"}), "Hello there"), PropertyValue::from("Hello there"));
    }

    #[test]
    fn test_unresolvable_token_stays_literal() {
        assert_eq!(
            text(json!({"name": "Ann"}), "Hi {payload.missing} and {nobody.x}"),
            PropertyValue::from("Hi {payload.missing} and {nobody.x}")
        );
        assert_eq!(text(json!({}), "open { only"), PropertyValue::from("open { only"));
        assert_eq!(text(json!({}), "{a.b.c}"), PropertyValue::from("{a.b.c}"));
    }

    #[test]
    fn test_multiple_tokens_resolve_independently() {
        assert_eq!(
            text(json!({"name": "Ann", "n": 3}), "{payload.name} is {profile.tier} x{payload.n}"),
            PropertyValue::from("Ann is gold x3")
        );
    }

    #[test]
    fn test_whole_token_keeps_payload_type() {
        assert_eq!(text(json!({"n": 3}), "{payload.n}"), PropertyValue::from(json!(3)));
        assert_eq!(text(json!({"n": 3}), "{payload}"), PropertyValue::from(json!({"n": 3})));
    }

    #[test]
    fn test_whole_token_data_object_reference() {
        let resolved = text(json!({}), "{profile}");
        let node = resolved.as_node().expect("node reference");
        assert_eq!(node.key_name(), "profile");
        assert_eq!(resolved.to_json(), json!("{profile}"));
    }

    #[test]
    fn test_list_entries_and_nested_maps() {
        let mut props = PropertyValue::from(json!({
            "items": ["{payload.a}", 5, "{payload.zz}"],
            "nested": {"x": "{payload.a}"},
            "flag": true
        }));
        ExpressionParser::resolve(&mut props, &PropertyValue::from(json!({"a": "A"})), &NoDataObjects);
        assert_eq!(
            props.to_json(),
            json!({
                "items": ["A", 5, "{payload.zz}"],
                "nested": {"x": "{payload.a}"},
                "flag": true
            })
        );
    }
}
