//! Signature blobs (ECMA-335 II.23.2).
//!
//! Signatures are decoded into a name-based model ([`TypeSig`], [`MethodSignature`]) so that
//! members of different modules can be compared directly, and encoded back with type tokens of
//! the module that receives the blob.

mod encoders;
mod parser;
mod types;

pub use encoders::{encode_field_signature, encode_method_signature, encode_type, TypeTokenProvider};
pub use parser::{SignatureParser, TypeNameResolver};
pub use types::*;
