//! Writer: flattens a result tree into staged store mutations
//!
//! Walks the selection set in lockstep with the result. Children are
//! normalized before their parent links to them. Nothing touches the store
//! until the whole walk succeeds: the writer stages into a [`WriteSet`] and
//! the caller applies it atomically, so a rejected write (identity conflict)
//! leaves the store exactly as it was.
//!
//! Id rules:
//! - generated -> real: promotion. Fields stored under the generated id are
//!   copied forward to the real record (existing real fields win) and the
//!   generated record is dropped.
//! - real -> different real, or real -> generated: integrity error naming
//!   both ids and the field path.

use crate::store::{RecordSource, WriteSet};
use graphcache_core::{
    Document, Error, Field, FieldPath, IdentityFn, Record, RecordId, Reference, Result, Selection,
    SelectionSet, StorageKey, StoreValue, Variables,
};
use serde_json::Value as Json;
use tracing::{debug, warn};

/// One write request: a result tree plus the document/variables that
/// produced it and the record id to write under.
#[derive(Debug)]
pub struct WriteRequest<'a> {
    /// Query document whose selection set shaped `result`
    pub document: &'a Document,
    /// Variable bindings used for the request
    pub variables: &'a Variables,
    /// Record id the top-level fields are stored under
    pub root_id: RecordId,
    /// The result tree returned by the server
    pub result: &'a Json,
}

/// Flatten `request.result` into a staged [`WriteSet`].
///
/// `source` supplies the current visible state (base store, or an effective
/// store when deriving an optimistic patch) for conflict detection and
/// promotion. The returned write set has not been applied.
pub fn write_result(
    source: &dyn RecordSource,
    request: &WriteRequest<'_>,
    identity: Option<&IdentityFn>,
) -> Result<WriteSet> {
    let root_object = request.result.as_object().ok_or(Error::InvalidShape {
        path: FieldPath::root(),
        expected: "object",
        found: json_type_name(request.result),
    })?;
    let mut writer = Writer {
        source,
        document: request.document,
        variables: request.variables,
        identity,
        writes: WriteSet::new(),
    };
    writer.write_selection_set(
        &request.root_id,
        &request.document.selection_set,
        root_object,
        &FieldPath::root(),
        false,
    )?;
    Ok(writer.writes)
}

struct Writer<'a> {
    source: &'a dyn RecordSource,
    document: &'a Document,
    variables: &'a Variables,
    identity: Option<&'a IdentityFn>,
    writes: WriteSet,
}

impl Writer<'_> {
    /// Visible value at (id, key): staged writes shadow the source.
    fn lookup(&self, id: &RecordId, key: &StorageKey) -> Option<StoreValue> {
        if let Some(staged) = self.writes.staged_field(id, key) {
            return Some(staged.clone());
        }
        if self.writes.is_deleted(id) {
            return None;
        }
        self.source.record(id).and_then(|r| r.get(key).cloned())
    }

    /// Full visible record for `id` (source state merged with staged fields)
    fn visible_record(&self, id: &RecordId) -> Record {
        let mut record = if self.writes.is_deleted(id) {
            Record::new()
        } else {
            self.source
                .record(id)
                .map(|r| Record::clone(&r))
                .unwrap_or_default()
        };
        if let Some(staged) = self.writes.staged_record(id) {
            record.merge_from(staged);
        }
        record
    }

    fn write_selection_set(
        &mut self,
        record_id: &RecordId,
        selection_set: &SelectionSet,
        result: &serde_json::Map<String, Json>,
        path: &FieldPath,
        in_fragment: bool,
    ) -> Result<()> {
        for selection in selection_set.selections() {
            match selection {
                Selection::Field(field) => {
                    self.write_field(record_id, field, result, path, in_fragment)?;
                }
                Selection::InlineFragment(fragment) => {
                    // Fragment fields are written unconditionally; a
                    // non-matching fragment legitimately has no data in the
                    // result, so missing fields inside it stay quiet.
                    let set = fragment.selection_set.clone();
                    self.write_selection_set(record_id, &set, result, path, true)?;
                }
                Selection::FragmentSpread(name) => {
                    let set = self.document.fragment(name)?.selection_set.clone();
                    self.write_selection_set(record_id, &set, result, path, true)?;
                }
            }
        }
        Ok(())
    }

    fn write_field(
        &mut self,
        record_id: &RecordId,
        field: &Field,
        result: &serde_json::Map<String, Json>,
        path: &FieldPath,
        in_fragment: bool,
    ) -> Result<()> {
        let response_key = field.response_key();
        let Some(value) = result.get(response_key) else {
            if in_fragment {
                debug!(field = response_key, "field absent from fragment result");
            } else {
                warn!(field = response_key, %record_id, "result is missing a selected field");
            }
            return Ok(());
        };
        let key = field.storage_key(self.variables)?;
        let field_path = path.child(response_key);
        let generated_id = RecordId::generated_child(record_id, &key);
        let stored = self.normalize_value(
            value,
            field.selection_set.as_ref(),
            generated_id,
            &field_path,
        )?;
        self.link(record_id, key, stored, &field_path)
    }

    /// Normalize one result value into a storable value, writing any child
    /// records along the way. `generated_id` is the id the value's record
    /// gets if it is an object without a stronger identity.
    fn normalize_value(
        &mut self,
        value: &Json,
        selection: Option<&SelectionSet>,
        generated_id: RecordId,
        path: &FieldPath,
    ) -> Result<StoreValue> {
        match value {
            Json::Array(items) => {
                let mut stored = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    let entry_id = RecordId::generated_list_entry(&generated_id, index);
                    let entry_path = path.child(&index.to_string());
                    stored.push(self.normalize_value(item, selection, entry_id, &entry_path)?);
                }
                Ok(StoreValue::List(stored))
            }
            Json::Object(object) => {
                let Some(selection) = selection else {
                    return Err(Error::InvalidShape {
                        path: path.clone(),
                        expected: "scalar",
                        found: "object",
                    });
                };
                let real_id = self.identity.and_then(|identity| (**identity)(object));
                let reference = match real_id {
                    Some(real_id) => Reference::real(real_id),
                    None => Reference::generated(generated_id),
                };
                // Children are fully normalized before the parent links to
                // them.
                let selection = selection.clone();
                self.write_selection_set(&reference.id, &selection, object, path, false)?;
                Ok(StoreValue::Ref(reference))
            }
            scalar => {
                if selection.is_some() && !scalar.is_null() {
                    return Err(Error::InvalidShape {
                        path: path.clone(),
                        expected: "object",
                        found: json_type_name(scalar),
                    });
                }
                StoreValue::from_scalar_json(scalar).ok_or(Error::InvalidShape {
                    path: path.clone(),
                    expected: "scalar",
                    found: json_type_name(scalar),
                })
            }
        }
    }

    /// Stage the link `(parent_id, key) -> value`, applying the promotion
    /// and conflict rules when both the previous and new values are
    /// references.
    fn link(
        &mut self,
        parent_id: &RecordId,
        key: StorageKey,
        value: StoreValue,
        path: &FieldPath,
    ) -> Result<()> {
        if let (Some(StoreValue::Ref(previous)), StoreValue::Ref(next)) =
            (self.lookup(parent_id, &key), &value)
        {
            if previous.id != next.id {
                if previous.generated && !next.generated {
                    self.promote(&previous.id, &next.id);
                } else if !previous.generated {
                    return Err(Error::StoreIntegrity {
                        path: path.clone(),
                        previous: previous.id,
                        attempted: next.id.clone(),
                    });
                }
                // generated -> different generated only happens when the
                // link moved paths; the old record is simply orphaned.
            }
        }
        self.writes.insert_field(parent_id, key, value);
        Ok(())
    }

    /// Promotion: copy fields stored under the generated id forward to the
    /// real record (fields already visible on the real record win), then
    /// drop the generated record.
    fn promote(&mut self, generated_id: &RecordId, real_id: &RecordId) {
        debug!(%generated_id, %real_id, "promoting generated record to real id");
        let abandoned = self.visible_record(generated_id);
        for (key, value) in abandoned.iter() {
            if self.lookup(real_id, key).is_none() {
                self.writes.insert_field(real_id, key.clone(), value.clone());
            }
        }
        self.writes.delete(generated_id.clone());
    }
}

fn json_type_name(value: &Json) -> &'static str {
    match value {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}
