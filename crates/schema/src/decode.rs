//! Two-strategy object decoding.
//!
//! Strategy 1 decodes into the typed scheme. Strategy 2 decodes into a [`DynamicObject`]. The
//! dynamic strategy is tried only when the typed one fails; if both fail, the typed failure is
//! reported as the primary cause.

use kube::core::DynamicObject;
use rampart_core::{Gvk, KubeObject, TypedObject};
use serde_json::Value as Json;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed document: {0}")]
    Malformed(String),
    #[error("{typed} (generic decoding also failed: {fallback})")]
    Undecodable { typed: TypedDecodeError, fallback: String },
}

#[derive(Debug, thiserror::Error)]
pub enum TypedDecodeError {
    #[error("object is missing {0}")]
    MissingTypeMeta(&'static str),
    #[error("kind {0} is not registered in the typed scheme")]
    NotInScheme(Gvk),
    #[error("decoding {gvk}: {source}")]
    Invalid { gvk: Gvk, source: serde_json::Error },
    #[error("typed {gvk} would drop field {path}")]
    Lossy { gvk: Gvk, path: String },
}

/// Decode a serialized object (YAML or JSON).
pub fn decode(raw: &[u8]) -> Result<KubeObject, DecodeError> {
    let value: Json = serde_yaml::from_slice(raw).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    decode_value(value)
}

/// Decode an already parsed object.
pub fn decode_value(value: Json) -> Result<KubeObject, DecodeError> {
    let typed_err = match decode_typed(&value) {
        Ok(obj) => return Ok(KubeObject::Typed(obj)),
        Err(e) => e,
    };
    debug!(reason = %typed_err, "typed decoding failed; using generic decoding");
    match decode_dynamic(value) {
        Ok(obj) => Ok(KubeObject::Dynamic(obj)),
        Err(fallback) => Err(DecodeError::Undecodable { typed: typed_err, fallback }),
    }
}

/// Convert a listed dynamic object into the uniform object form, typed where possible.
pub fn unpack(obj: DynamicObject) -> Result<KubeObject, DecodeError> {
    if obj.types.is_none() {
        return Ok(KubeObject::Dynamic(obj));
    }
    let value = serde_json::to_value(&obj).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    match decode_typed(&value) {
        Ok(typed) => Ok(KubeObject::Typed(typed)),
        Err(_) => Ok(KubeObject::Dynamic(obj)),
    }
}

fn type_meta(value: &Json) -> Result<Gvk, TypedDecodeError> {
    let api_version = value
        .get("apiVersion")
        .and_then(Json::as_str)
        .ok_or(TypedDecodeError::MissingTypeMeta("apiVersion"))?;
    let kind = value.get("kind").and_then(Json::as_str).ok_or(TypedDecodeError::MissingTypeMeta("kind"))?;
    Ok(Gvk::from_api_version(api_version, kind))
}

fn decode_typed(value: &Json) -> Result<TypedObject, TypedDecodeError> {
    let gvk = type_meta(value)?;
    let obj = match TypedObject::decode(&gvk, value.clone()) {
        None => return Err(TypedDecodeError::NotInScheme(gvk)),
        Some(Err(source)) => return Err(TypedDecodeError::Invalid { gvk, source }),
        Some(Ok(obj)) => obj,
    };
    let back = obj.to_value().map_err(|source| TypedDecodeError::Invalid { gvk: gvk.clone(), source })?;
    if let Some(path) = dropped_field(value, &back, "") {
        return Err(TypedDecodeError::Lossy { gvk, path });
    }
    Ok(obj)
}

fn decode_dynamic(value: Json) -> Result<DynamicObject, String> {
    if value.get("apiVersion").is_none() || value.get("kind").is_none() {
        return Err("object is missing apiVersion or kind".to_string());
    }
    serde_json::from_value(value).map_err(|e| e.to_string())
}

/// First path present (and non-null) in `input` but missing from `output`.
fn dropped_field(input: &Json, output: &Json, path: &str) -> Option<String> {
    match (input, output) {
        (Json::Object(inp), Json::Object(out)) => {
            for (k, v) in inp {
                if v.is_null() {
                    continue;
                }
                let child = format!("{}.{}", path, k);
                match out.get(k) {
                    None => return Some(child),
                    Some(ov) => {
                        if let Some(p) = dropped_field(v, ov, &child) {
                            return Some(p);
                        }
                    }
                }
            }
            None
        }
        (Json::Array(inp), Json::Array(out)) => {
            if inp.len() != out.len() {
                return Some(path.to_string());
            }
            inp.iter()
                .zip(out)
                .enumerate()
                .find_map(|(i, (a, b))| dropped_field(a, b, &format!("{}[{}]", path, i)))
        }
        // Scalars may be normalized by the typed representation (quantities, int-or-string).
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_kind_decodes_typed() {
        let yaml = b"apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: sensor\n  namespace: stackrox\nspec:\n  selector:\n    matchLabels:\n      app: sensor\n  template:\n    metadata:\n      labels:\n        app: sensor\n    spec:\n      containers:\n      - name: sensor\n        image: stackrox/main:1.0\n";
        let obj = decode(yaml).unwrap();
        assert!(obj.is_typed());
        assert_eq!(obj.gvk(), Some(Gvk::new("apps", "v1", "Deployment")));
        assert_eq!(obj.namespace(), Some("stackrox"));
    }

    #[test]
    fn unknown_kind_falls_back_to_dynamic() {
        let json = br#"{"apiVersion":"policy/v1beta1","kind":"PodSecurityPolicy","metadata":{"name":"psp"},"spec":{"privileged":false}}"#;
        let obj = decode(json).unwrap();
        match obj {
            KubeObject::Dynamic(d) => assert_eq!(d.data["spec"]["privileged"], false),
            other => panic!("expected dynamic object, got {:?}", other),
        }
    }

    #[test]
    fn unknown_fields_are_not_dropped() {
        let yaml = b"apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: c\ndata:\n  a: b\nfutureField: 3\n";
        let obj = decode(yaml).unwrap();
        assert!(!obj.is_typed());
        assert_eq!(obj.to_value().unwrap()["futureField"], 3);
    }

    #[test]
    fn both_failures_report_typed_cause_first() {
        let err = decode(b"metadata:\n  name: x\n").unwrap_err();
        match &err {
            DecodeError::Undecodable { typed: TypedDecodeError::MissingTypeMeta("apiVersion"), .. } => {}
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(err.to_string().starts_with("object is missing apiVersion"));
    }

    #[test]
    fn malformed_yaml_is_rejected() {
        assert!(matches!(decode(b"kind: [unterminated"), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn unpack_prefers_typed() {
        let d: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1", "kind": "Secret", "metadata": { "name": "s" }, "type": "Opaque"
        }))
        .unwrap();
        assert!(unpack(d).unwrap().is_typed());

        let scc: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "security.openshift.io/v1", "kind": "SecurityContextConstraints", "metadata": { "name": "s" }
        }))
        .unwrap();
        assert!(!unpack(scc).unwrap().is_typed());
    }

    #[test]
    fn dropped_field_reports_path() {
        let a = serde_json::json!({ "spec": { "x": [ { "y": 1, "z": 2 } ] } });
        let b = serde_json::json!({ "spec": { "x": [ { "y": 1 } ] } });
        assert_eq!(dropped_field(&a, &b, ""), Some(".spec.x[0].z".to_string()));
        assert_eq!(dropped_field(&b, &a, ""), None);
    }
}
