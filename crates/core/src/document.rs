//! Query-document value types
//!
//! The textual query language and its parser are external collaborators.
//! This module defines the immutable, structurally-comparable document value
//! the core consumes: operations, selection sets, fields with arguments, and
//! fragments. A builder API constructs documents programmatically; the
//! [`DocumentCache`] memoizes parses by source string so two parses of
//! identical text are interchangeable.
//!
//! Selection sets share their selection list behind an `Arc`. This gives
//! every nested selection set a stable address, which the reader uses as
//! part of its memoization key.

use crate::error::{Error, Result};
use crate::types::StorageKey;
use dashmap::DashMap;
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

/// Variable bindings supplied alongside a document
pub type Variables = serde_json::Map<String, Json>;

/// Kind of operation a document executes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Read-only query against `ROOT_QUERY`
    Query,
    /// Mutation; field results resolve into existing records
    Mutation,
}

/// One parsed, immutable query document
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Operation kind
    pub kind: OperationKind,
    /// Operation name, when the source named one
    pub name: Option<String>,
    /// Top-level selection set
    pub selection_set: SelectionSet,
    /// Named fragments defined in the document
    pub fragments: BTreeMap<String, FragmentDefinition>,
}

impl Document {
    /// Build a query document from top-level selections
    pub fn query(selections: impl IntoIterator<Item = Selection>) -> Self {
        Document {
            kind: OperationKind::Query,
            name: None,
            selection_set: SelectionSet::new(selections),
            fragments: BTreeMap::new(),
        }
    }

    /// Build a mutation document from top-level selections
    pub fn mutation(selections: impl IntoIterator<Item = Selection>) -> Self {
        Document {
            kind: OperationKind::Mutation,
            ..Document::query(selections)
        }
    }

    /// Set the operation name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Attach a named fragment definition
    pub fn with_fragment(mut self, fragment: FragmentDefinition) -> Self {
        self.fragments.insert(fragment.name.clone(), fragment);
        self
    }

    /// Look up a fragment by name
    pub fn fragment(&self, name: &str) -> Result<&FragmentDefinition> {
        self.fragments
            .get(name)
            .ok_or_else(|| Error::UnknownFragment(name.to_string()))
    }
}

/// Named fragment definition
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentDefinition {
    /// Fragment name
    pub name: String,
    /// Type condition the enclosing record must satisfy
    pub type_condition: String,
    /// Fields selected by the fragment
    pub selection_set: SelectionSet,
}

/// An `Arc`-shared list of selections.
///
/// Cheap to clone; pointer identity of the inner list is stable for the
/// lifetime of the document.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionSet {
    selections: Arc<Vec<Selection>>,
}

impl SelectionSet {
    /// Selection set from an iterator of selections
    pub fn new(selections: impl IntoIterator<Item = Selection>) -> Self {
        SelectionSet {
            selections: Arc::new(selections.into_iter().collect()),
        }
    }

    /// The selections, in document order
    pub fn selections(&self) -> &[Selection] {
        &self.selections
    }

    /// Address of the shared selection list, used as a memo key. Only
    /// meaningful while the list is alive: once every clone is dropped the
    /// allocation can be recycled by an unrelated document. Pair with
    /// [`SelectionSet::downgrade`] to detect that.
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.selections) as usize
    }

    /// Weak handle to the shared selection list. Lets a memo entry detect
    /// that the list it was keyed on has been dropped without keeping the
    /// document alive.
    pub fn downgrade(&self) -> Weak<Vec<Selection>> {
        Arc::downgrade(&self.selections)
    }
}

/// One entry in a selection set
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// A field, possibly aliased, with optional arguments and sub-selections
    Field(Field),
    /// An inline fragment with an optional type condition
    InlineFragment(InlineFragment),
    /// A spread of a named fragment defined on the document
    FragmentSpread(String),
}

/// Field selection
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    /// Field name as stored
    pub name: String,
    /// Response alias, when the caller renamed the field
    pub alias: Option<String>,
    /// Arguments in canonical (sorted) order
    pub arguments: BTreeMap<String, ArgValue>,
    /// Sub-selections for object-valued fields
    pub selection_set: Option<SelectionSet>,
}

impl Field {
    /// Key under which this field appears in the response tree
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// Set the response alias
    pub fn aliased(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Add a literal argument
    pub fn arg(mut self, name: impl Into<String>, value: Json) -> Self {
        self.arguments.insert(name.into(), ArgValue::Literal(value));
        self
    }

    /// Add a variable-valued argument
    pub fn arg_var(mut self, name: impl Into<String>, variable: impl Into<String>) -> Self {
        self.arguments
            .insert(name.into(), ArgValue::Variable(variable.into()));
        self
    }

    /// Add sub-selections
    pub fn select(mut self, selections: impl IntoIterator<Item = Selection>) -> Self {
        self.selection_set = Some(SelectionSet::new(selections));
        self
    }

    /// Compute the storage key for this field under `variables`.
    ///
    /// A field with no arguments is keyed by its bare name. Otherwise the
    /// resolved arguments are serialized canonically (object keys sorted
    /// recursively), so equivalent argument sets always yield the same key.
    pub fn storage_key(&self, variables: &Variables) -> Result<StorageKey> {
        if self.arguments.is_empty() {
            return Ok(StorageKey::bare(&self.name));
        }
        let mut resolved = serde_json::Map::new();
        for (name, value) in &self.arguments {
            resolved.insert(name.clone(), value.resolve(variables)?.clone());
        }
        let canonical = canonical_json(&Json::Object(resolved));
        Ok(StorageKey::with_args(&self.name, &canonical))
    }
}

/// Build a field selection with the given name
pub fn field(name: impl Into<String>) -> Field {
    Field {
        name: name.into(),
        alias: None,
        arguments: BTreeMap::new(),
        selection_set: None,
    }
}

/// Build an inline fragment with a type condition
pub fn inline_fragment(
    type_condition: impl Into<String>,
    selections: impl IntoIterator<Item = Selection>,
) -> InlineFragment {
    InlineFragment {
        type_condition: Some(type_condition.into()),
        selection_set: SelectionSet::new(selections),
    }
}

/// Build a named fragment definition
pub fn fragment(
    name: impl Into<String>,
    type_condition: impl Into<String>,
    selections: impl IntoIterator<Item = Selection>,
) -> FragmentDefinition {
    FragmentDefinition {
        name: name.into(),
        type_condition: type_condition.into(),
        selection_set: SelectionSet::new(selections),
    }
}

impl From<Field> for Selection {
    fn from(f: Field) -> Self {
        Selection::Field(f)
    }
}

impl From<InlineFragment> for Selection {
    fn from(f: InlineFragment) -> Self {
        Selection::InlineFragment(f)
    }
}

/// Inline fragment selection
#[derive(Debug, Clone, PartialEq)]
pub struct InlineFragment {
    /// Type condition; `None` applies unconditionally
    pub type_condition: Option<String>,
    /// Fields selected when the condition matches
    pub selection_set: SelectionSet,
}

/// Argument value: a literal or a variable lookup
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    /// Literal JSON value
    Literal(Json),
    /// Reference to a variable by name
    Variable(String),
}

impl ArgValue {
    /// Resolve against the variable bindings
    pub fn resolve<'a>(&'a self, variables: &'a Variables) -> Result<&'a Json> {
        match self {
            ArgValue::Literal(v) => Ok(v),
            ArgValue::Variable(name) => variables
                .get(name)
                .ok_or_else(|| Error::MissingVariable(name.clone())),
        }
    }
}

/// Serialize a JSON value with object keys sorted recursively.
///
/// Equivalent inputs always produce byte-identical output, which is what
/// makes storage keys order-independent.
pub fn canonical_json(value: &Json) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Json, out: &mut String) {
    match value {
        Json::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Json::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Json::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        // Scalars already have a single serialization
        _ => out.push_str(&value.to_string()),
    }
}

/// Fingerprint of a variable set, used in reader memo keys
pub fn variables_fingerprint(variables: &Variables) -> u64 {
    use std::hash::{Hash, Hasher};
    let canonical = canonical_json(&Json::Object(variables.clone()));
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    canonical.hash(&mut hasher);
    hasher.finish()
}

/// Cache of parsed documents keyed by source text.
///
/// The core treats two parses of identical text as interchangeable; callers
/// hand this cache their parse function and get back a shared document.
#[derive(Debug, Default)]
pub struct DocumentCache {
    parsed: DashMap<String, Arc<Document>>,
}

impl DocumentCache {
    /// Empty cache
    pub fn new() -> Self {
        DocumentCache::default()
    }

    /// Return the cached document for `source`, parsing it on first use
    pub fn get_or_parse(
        &self,
        source: &str,
        parse: impl FnOnce(&str) -> Document,
    ) -> Arc<Document> {
        if let Some(found) = self.parsed.get(source) {
            return Arc::clone(found.value());
        }
        let document = Arc::new(parse(source));
        self.parsed.insert(source.to_string(), Arc::clone(&document));
        document
    }

    /// Number of cached documents
    pub fn len(&self) -> usize {
        self.parsed.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.parsed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(value: Json) -> Variables {
        match value {
            Json::Object(map) => map,
            _ => panic!("variables must be an object"),
        }
    }

    #[test]
    fn bare_field_keys_by_name() {
        let f = field("name");
        assert_eq!(f.storage_key(&Variables::new()).unwrap().as_str(), "name");
    }

    #[test]
    fn argument_order_does_not_change_key() {
        let a = field("user").arg("b", json!(2)).arg("a", json!(1));
        let b = field("user").arg("a", json!(1)).arg("b", json!(2));
        let empty = Variables::new();
        assert_eq!(a.storage_key(&empty).unwrap(), b.storage_key(&empty).unwrap());
    }

    #[test]
    fn nested_argument_objects_are_canonicalized() {
        let a = field("search").arg("filter", json!({"z": 1, "a": {"y": 2, "x": 3}}));
        let b = field("search").arg("filter", json!({"a": {"x": 3, "y": 2}, "z": 1}));
        let empty = Variables::new();
        assert_eq!(a.storage_key(&empty).unwrap(), b.storage_key(&empty).unwrap());
    }

    #[test]
    fn variables_substitute_into_keys() {
        let f = field("user").arg_var("id", "userId");
        let key = f.storage_key(&vars(json!({"userId": 7}))).unwrap();
        assert_eq!(key.as_str(), r#"user({"id":7})"#);
    }

    #[test]
    fn missing_variable_is_an_error() {
        let f = field("user").arg_var("id", "userId");
        let err = f.storage_key(&Variables::new()).unwrap_err();
        assert!(matches!(err, Error::MissingVariable(name) if name == "userId"));
    }

    #[test]
    fn literal_and_variable_args_produce_same_key() {
        let lit = field("q").arg("literal", json!(true)).arg("value", json!(42));
        let var = field("q").arg("literal", json!(true)).arg_var("value", "v");
        assert_eq!(
            lit.storage_key(&Variables::new()).unwrap(),
            var.storage_key(&vars(json!({"v": 42}))).unwrap()
        );
    }

    #[test]
    fn selection_set_identity_is_stable_across_clones() {
        let set = SelectionSet::new([field("a").into()]);
        let clone = set.clone();
        assert_eq!(set.identity(), clone.identity());
        let other = SelectionSet::new([field("a").into()]);
        assert_ne!(set.identity(), other.identity());
    }

    #[test]
    fn document_cache_returns_same_parse() {
        let cache = DocumentCache::new();
        let a = cache.get_or_parse("{ x }", |_| Document::query([field("x").into()]));
        let b = cache.get_or_parse("{ x }", |_| panic!("must not re-parse"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn unknown_fragment_lookup_errors() {
        let doc = Document::query([field("x").into()]);
        assert!(matches!(doc.fragment("F"), Err(Error::UnknownFragment(_))));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn arb_json() -> impl Strategy<Value = Json> {
            let leaf = prop_oneof![
                Just(json!(null)),
                any::<bool>().prop_map(Json::from),
                any::<i64>().prop_map(Json::from),
                "[a-z]{0,8}".prop_map(Json::from),
            ];
            leaf.prop_recursive(3, 24, 4, |inner| {
                prop_oneof![
                    proptest::collection::vec(inner.clone(), 0..4).prop_map(Json::from),
                    proptest::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                        .prop_map(|m| Json::Object(m.into_iter().collect())),
                ]
            })
        }

        proptest! {
            // Canonical serialization must not depend on object key order.
            #[test]
            fn canonical_json_is_insertion_order_independent(value in arb_json()) {
                fn reversed(value: &Json) -> Json {
                    match value {
                        Json::Object(map) => Json::Object(
                            map.iter().rev().map(|(k, v)| (k.clone(), reversed(v))).collect(),
                        ),
                        Json::Array(items) => Json::Array(items.iter().map(reversed).collect()),
                        other => other.clone(),
                    }
                }
                prop_assert_eq!(canonical_json(&value), canonical_json(&reversed(&value)));
            }

            // Canonical output stays valid JSON, deep-equal to the input.
            #[test]
            fn canonical_json_round_trips(value in arb_json()) {
                let parsed: Json = serde_json::from_str(&canonical_json(&value)).unwrap();
                prop_assert_eq!(parsed, value);
            }
        }
    }
}
