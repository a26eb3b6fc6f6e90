//! Core types and traits for graphcache
//!
//! This crate defines the foundational types used throughout the system:
//! - RecordId / StorageKey / Reference: the normalized graph's keys and edges
//! - StoreValue / Record: the flattened record model
//! - Document / SelectionSet / Field: immutable query-document values
//! - Error: error type hierarchy
//! - Traits: collaborator capabilities (FragmentMatcher, identity function)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod document;
pub mod error;
pub mod traits;
pub mod types;
pub mod value;

pub use document::{
    canonical_json, field, fragment, inline_fragment, variables_fingerprint, ArgValue, Document,
    DocumentCache, Field, FragmentDefinition, InlineFragment, OperationKind, Selection,
    SelectionSet, Variables,
};
pub use error::{Error, GraphQlError, GraphQlErrors, Result, UNSPECIFIED_ERROR_MESSAGE};
pub use traits::{typename_and_id, FragmentMatch, FragmentMatcher, IdentityFn, TypenameMatcher};
pub use types::{FieldPath, RecordId, Reference, StorageKey, ROOT_MUTATION, ROOT_QUERY};
pub use value::{Record, StoreValue};
