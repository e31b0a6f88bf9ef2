//! Rampart schema: decode raw manifests into objects and validate them against the server's
//! published OpenAPI schema.
//!
//! Decoding and validation are independent. An apply path must require both.

#![forbid(unsafe_code)]

pub mod decode;
pub mod validate;

pub use decode::{decode, decode_value, unpack, DecodeError, TypedDecodeError};
pub use validate::{patch_openapi_schema, reject_duplicate_keys, SchemaValidator, ValidationError, ValidationIssue};
