//! Object validation against the server-published OpenAPI schema, plus duplicate-key rejection.

use std::cell::Cell;
use std::fmt;
use std::sync::{Arc, Mutex};

use jsonschema::{Draft, JSONSchema};
use rampart_core::Gvk;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::de::{self, DeserializeSeed, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Definitions whose declared `type` is narrower than what the API server accepts.
const LOOSE_DEFINITIONS: &[&str] = &[
    "io.k8s.apimachinery.pkg.util.intstr.IntOrString",
    "io.k8s.apimachinery.pkg.api.resource.Quantity",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub path: String,
    pub error: String,
    pub hint: Option<String>,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.is_empty() { "/" } else { &self.path };
        write!(f, "{}: {}", path, self.error)?;
        if let Some(hint) = &self.hint {
            write!(f, " ({})", hint)?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("malformed document: {0}")]
    Malformed(String),
    #[error("duplicate key: {0}")]
    DuplicateKey(String),
    #[error("unknown object type {0}")]
    UnknownKind(Gvk),
    #[error("invalid schema for {gvk}: {reason}")]
    Schema { gvk: Gvk, reason: String },
    #[error("{} schema violation(s): {}", .0.len(), join_issues(.0))]
    Violations(Vec<ValidationIssue>),
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

/// Validates serialized objects. Both the duplicate-key pass and the schema pass must succeed.
pub struct SchemaValidator {
    document: Arc<Json>,
    definitions_by_gvk: FxHashMap<Gvk, String>,
    compiled: Mutex<FxHashMap<Gvk, Arc<JSONSchema>>>,
}

impl fmt::Debug for SchemaValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaValidator").field("kinds", &self.definitions_by_gvk.len()).finish()
    }
}

impl SchemaValidator {
    /// Build from an OpenAPI v2 document. The document is patched before use.
    pub fn from_openapi(mut document: Json) -> Result<Self, ValidationError> {
        patch_openapi_schema(&mut document);
        let definitions = document
            .get("definitions")
            .and_then(Json::as_object)
            .ok_or_else(|| ValidationError::Malformed("OpenAPI document has no definitions".to_string()))?;

        let mut definitions_by_gvk = FxHashMap::default();
        for (name, def) in definitions {
            let Some(gvks) = def.get("x-kubernetes-group-version-kind").and_then(Json::as_array) else { continue };
            for gvk in gvks {
                let field = |f: &str| gvk.get(f).and_then(Json::as_str).unwrap_or("").to_string();
                let key = Gvk::new(&field("group"), &field("version"), &field("kind"));
                definitions_by_gvk.insert(key, name.clone());
            }
        }

        Ok(Self {
            document: Arc::new(document),
            definitions_by_gvk,
            compiled: Mutex::new(FxHashMap::default()),
        })
    }

    /// Run the duplicate-key pass over the raw document, then schema validation.
    pub fn validate(&self, raw: &[u8]) -> Result<(), ValidationError> {
        reject_duplicate_keys(raw)?;
        let value: Json = serde_yaml::from_slice(raw).map_err(|e| ValidationError::Malformed(e.to_string()))?;
        self.validate_value(&value)
    }

    /// Schema validation of an already parsed object.
    pub fn validate_value(&self, value: &Json) -> Result<(), ValidationError> {
        let api_version = value.get("apiVersion").and_then(Json::as_str);
        let kind = value.get("kind").and_then(Json::as_str);
        let (Some(api_version), Some(kind)) = (api_version, kind) else {
            return Err(ValidationError::Malformed("object is missing apiVersion or kind".to_string()));
        };
        let gvk = Gvk::from_api_version(api_version, kind);
        let schema = self.compiled_for(&gvk)?;

        if let Err(errors) = schema.validate(value) {
            let issues = errors
                .map(|err| {
                    let error = err.to_string();
                    ValidationIssue { path: err.instance_path.to_string(), hint: hint_for(&error), error }
                })
                .collect();
            return Err(ValidationError::Violations(issues));
        }
        Ok(())
    }

    fn compiled_for(&self, gvk: &Gvk) -> Result<Arc<JSONSchema>, ValidationError> {
        let mut compiled = self.compiled.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(schema) = compiled.get(gvk) {
            return Ok(Arc::clone(schema));
        }
        let name = self.definitions_by_gvk.get(gvk).ok_or_else(|| ValidationError::UnknownKind(gvk.clone()))?;
        let root = serde_json::json!({
            "$ref": format!("#/definitions/{}", name),
            "definitions": self.document["definitions"].clone(),
        });
        let schema = JSONSchema::options()
            .with_draft(Draft::Draft4)
            .compile(&root)
            .map_err(|e| ValidationError::Schema { gvk: gvk.clone(), reason: e.to_string() })?;
        let schema = Arc::new(schema);
        compiled.insert(gvk.clone(), Arc::clone(&schema));
        Ok(schema)
    }
}

// Keep hints minimal to avoid depending on specific jsonschema internals
fn hint_for(error: &str) -> Option<String> {
    if error.contains("required property") {
        Some("missing required field".into())
    } else if error.contains("is not of type") || error.contains("expected type") {
        Some("mismatched type".into())
    } else if error.contains("is not one of") {
        Some("value not in allowed set".into())
    } else {
        None
    }
}

/// Relax definitions a strict JSON-schema engine would reject valid objects against.
///
/// Int-or-string and quantity values are accepted as either strings or numbers by the API
/// server, but the published schema declares them as strings. Preserve-unknown-fields nodes
/// may hold any value.
pub fn patch_openapi_schema(document: &mut Json) {
    fn relax(node: &mut Json) {
        match node {
            Json::Object(map) => {
                let int_or_string = map.get("format").and_then(Json::as_str) == Some("int-or-string")
                    || map.get("x-kubernetes-int-or-string").and_then(Json::as_bool) == Some(true);
                let preserve_unknown = map.get("x-kubernetes-preserve-unknown-fields").and_then(Json::as_bool) == Some(true);
                if int_or_string || preserve_unknown {
                    map.remove("type");
                    map.remove("format");
                }
                map.values_mut().for_each(relax);
            }
            Json::Array(items) => items.iter_mut().for_each(relax),
            _ => {}
        }
    }

    if let Some(defs) = document.get_mut("definitions").and_then(Json::as_object_mut) {
        for name in LOOSE_DEFINITIONS {
            if let Some(def) = defs.get_mut(*name).and_then(Json::as_object_mut) {
                def.remove("type");
                def.remove("format");
            }
        }
    }
    relax(document);
}

/// Reject documents in which any mapping repeats a key. Accepts YAML or JSON.
pub fn reject_duplicate_keys(raw: &[u8]) -> Result<(), ValidationError> {
    let duplicate = Cell::new(None);
    let de = serde_yaml::Deserializer::from_slice(raw);
    NoDuplicates { path: "", duplicate: &duplicate }.deserialize(de).map_err(|e| match duplicate.take() {
        Some(path) => ValidationError::DuplicateKey(path),
        None => ValidationError::Malformed(e.to_string()),
    })
}

struct NoDuplicates<'p> {
    path: &'p str,
    /// Path of the first repeated key, set before the walk is aborted.
    duplicate: &'p Cell<Option<String>>,
}

impl<'p> NoDuplicates<'p> {
    fn child<'c>(&self, path: &'c str) -> NoDuplicates<'c>
    where
        'p: 'c,
    {
        NoDuplicates { path, duplicate: self.duplicate }
    }
}

impl<'de, 'p> DeserializeSeed<'de> for NoDuplicates<'p> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_any(self)
    }
}

impl<'de, 'p> Visitor<'de> for NoDuplicates<'p> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("any structured value")
    }

    fn visit_bool<E: de::Error>(self, _: bool) -> Result<(), E> {
        Ok(())
    }
    fn visit_i64<E: de::Error>(self, _: i64) -> Result<(), E> {
        Ok(())
    }
    fn visit_u64<E: de::Error>(self, _: u64) -> Result<(), E> {
        Ok(())
    }
    fn visit_f64<E: de::Error>(self, _: f64) -> Result<(), E> {
        Ok(())
    }
    fn visit_str<E: de::Error>(self, _: &str) -> Result<(), E> {
        Ok(())
    }
    fn visit_unit<E: de::Error>(self) -> Result<(), E> {
        Ok(())
    }
    fn visit_none<E: de::Error>(self) -> Result<(), E> {
        Ok(())
    }
    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        self.child(self.path).deserialize(deserializer)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        let mut i = 0usize;
        loop {
            let child = format!("{}[{}]", self.path, i);
            if seq.next_element_seed(self.child(&child))?.is_none() {
                return Ok(());
            }
            i += 1;
        }
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        let mut seen = FxHashSet::default();
        while let Some(ScalarKey(key)) = map.next_key()? {
            let child = format!("{}.{}", self.path, key);
            if !seen.insert(key) {
                let err = de::Error::custom(format!("duplicate key {}", child));
                self.duplicate.set(Some(child));
                return Err(err);
            }
            map.next_value_seed(self.child(&child))?;
        }
        Ok(())
    }
}

/// A mapping key rendered as a string, whatever its scalar type.
struct ScalarKey(String);

impl<'de> Deserialize<'de> for ScalarKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct KeyVisitor;

        impl<'de> Visitor<'de> for KeyVisitor {
            type Value = ScalarKey;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a scalar mapping key")
            }
            fn visit_str<E: de::Error>(self, v: &str) -> Result<ScalarKey, E> {
                Ok(ScalarKey(v.to_string()))
            }
            fn visit_bool<E: de::Error>(self, v: bool) -> Result<ScalarKey, E> {
                Ok(ScalarKey(v.to_string()))
            }
            fn visit_i64<E: de::Error>(self, v: i64) -> Result<ScalarKey, E> {
                Ok(ScalarKey(v.to_string()))
            }
            fn visit_u64<E: de::Error>(self, v: u64) -> Result<ScalarKey, E> {
                Ok(ScalarKey(v.to_string()))
            }
            fn visit_f64<E: de::Error>(self, v: f64) -> Result<ScalarKey, E> {
                Ok(ScalarKey(v.to_string()))
            }
            fn visit_unit<E: de::Error>(self) -> Result<ScalarKey, E> {
                Ok(ScalarKey("null".to_string()))
            }
        }

        deserializer.deserialize_any(KeyVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn openapi() -> Json {
        serde_json::json!({
            "swagger": "2.0",
            "definitions": {
                "io.k8s.api.core.v1.ConfigMap": {
                    "type": "object",
                    "required": ["metadata"],
                    "properties": {
                        "apiVersion": { "type": "string" },
                        "kind": { "type": "string" },
                        "metadata": { "$ref": "#/definitions/io.k8s.apimachinery.pkg.apis.meta.v1.ObjectMeta" },
                        "data": { "type": "object", "additionalProperties": { "type": "string" } }
                    },
                    "x-kubernetes-group-version-kind": [{ "group": "", "kind": "ConfigMap", "version": "v1" }]
                },
                "io.k8s.api.core.v1.ServicePort": {
                    "type": "object",
                    "properties": {
                        "port": { "type": "integer" },
                        "targetPort": { "$ref": "#/definitions/io.k8s.apimachinery.pkg.util.intstr.IntOrString" }
                    }
                },
                "io.k8s.api.core.v1.Service": {
                    "type": "object",
                    "properties": {
                        "apiVersion": { "type": "string" },
                        "kind": { "type": "string" },
                        "metadata": { "$ref": "#/definitions/io.k8s.apimachinery.pkg.apis.meta.v1.ObjectMeta" },
                        "spec": {
                            "type": "object",
                            "properties": {
                                "ports": { "type": "array", "items": { "$ref": "#/definitions/io.k8s.api.core.v1.ServicePort" } }
                            }
                        }
                    },
                    "x-kubernetes-group-version-kind": [{ "group": "", "kind": "Service", "version": "v1" }]
                },
                "io.k8s.apimachinery.pkg.apis.meta.v1.ObjectMeta": {
                    "type": "object",
                    "properties": {
                        "name": { "type": "string" },
                        "labels": { "type": "object", "additionalProperties": { "type": "string" } }
                    }
                },
                "io.k8s.apimachinery.pkg.util.intstr.IntOrString": { "type": "string", "format": "int-or-string" }
            }
        })
    }

    #[test]
    fn valid_object_passes() {
        let v = SchemaValidator::from_openapi(openapi()).unwrap();
        v.validate(b"apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: c\ndata:\n  a: b\n").unwrap();
    }

    #[test]
    fn type_violation_is_reported_with_path() {
        let v = SchemaValidator::from_openapi(openapi()).unwrap();
        let err = v.validate(b"apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: c\ndata:\n  a: 3\n").unwrap_err();
        match err {
            ValidationError::Violations(issues) => {
                assert_eq!(issues.len(), 1);
                assert_eq!(issues[0].path, "/data/a");
                assert_eq!(issues[0].hint.as_deref(), Some("mismatched type"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn missing_required_field_is_reported() {
        let v = SchemaValidator::from_openapi(openapi()).unwrap();
        let err = v.validate_value(&serde_json::json!({ "apiVersion": "v1", "kind": "ConfigMap" })).unwrap_err();
        assert!(matches!(err, ValidationError::Violations(_)), "{:?}", err);
    }

    #[test]
    fn int_or_string_accepts_both_after_patch() {
        let v = SchemaValidator::from_openapi(openapi()).unwrap();
        v.validate(b"apiVersion: v1\nkind: Service\nmetadata:\n  name: s\nspec:\n  ports:\n  - port: 443\n    targetPort: 8443\n  - port: 80\n    targetPort: http\n")
            .unwrap();
    }

    #[test]
    fn preserve_unknown_fields_drops_type_constraint() {
        let mut doc = serde_json::json!({
            "definitions": {
                "x.Raw": { "type": "object", "x-kubernetes-preserve-unknown-fields": true },
                "x.Strict": { "type": "object" }
            }
        });
        patch_openapi_schema(&mut doc);
        assert!(doc["definitions"]["x.Raw"].get("type").is_none());
        assert_eq!(doc["definitions"]["x.Strict"]["type"], "object");
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let v = SchemaValidator::from_openapi(openapi()).unwrap();
        let err = v.validate(b"apiVersion: example.com/v1\nkind: Widget\nmetadata:\n  name: w\n").unwrap_err();
        assert!(matches!(err, ValidationError::UnknownKind(g) if g.kind == "Widget"));
    }

    #[test]
    fn duplicate_keys_are_rejected_in_yaml_and_json() {
        let yaml = b"apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n  name: b\n";
        match reject_duplicate_keys(yaml) {
            Err(ValidationError::DuplicateKey(path)) => assert_eq!(path, ".metadata.name"),
            other => panic!("unexpected: {:?}", other),
        }
        let json = br#"{"apiVersion":"v1","kind":"ConfigMap","data":{"x":"1","x":"2"}}"#;
        assert!(matches!(reject_duplicate_keys(json), Err(ValidationError::DuplicateKey(_))));
        let nested = b"items:\n- a: 1\n  a: 2\n";
        match reject_duplicate_keys(nested) {
            Err(ValidationError::DuplicateKey(path)) => assert_eq!(path, ".items[0].a"),
            other => panic!("unexpected: {:?}", other),
        }
        reject_duplicate_keys(b"a: 1\nb: {a: 1}\n").unwrap();
    }

    #[test]
    fn duplicate_keys_fail_validation_even_if_schema_passes() {
        let v = SchemaValidator::from_openapi(openapi()).unwrap();
        let err = v.validate(b"apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: c\ndata:\n  a: b\n  a: c\n").unwrap_err();
        assert!(matches!(err, ValidationError::DuplicateKey(_)));
    }
}
