//! ECMA-335 metadata: the CLI header, the metadata root, heaps, tables, signatures and method
//! bodies.
//!
//! Everything in here is a faithful decoder and encoder of the on-disk structures. The
//! higher-level symbol model built from it lives in [`crate::module`].

pub mod attributes;
pub mod constant;
pub mod cor20header;
pub mod method;
pub mod root;
pub mod signatures;
pub mod streams;
pub mod tables;
pub mod token;
