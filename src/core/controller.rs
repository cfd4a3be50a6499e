//! Generic, schema-enforcing CRUD over one entity type.
//!
//! The database knows nothing about attributes; a [`Controller`] layers the
//! schema on top of it. Every mutation runs under the store's interprocess
//! lock and inside a database transaction, so a validation or hook failure
//! leaves no partial record behind.

use crate::core::error::TauError;
use crate::core::record::{Fields, Keys, Record, RecordId};
use crate::core::schema::{Attribute, Changes, EntityKind, Referential, Relation, Schema};
use crate::core::store::Store;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, error};

/// A persisted record bound to its entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    kind: EntityKind,
    id: RecordId,
    fields: Fields,
}

impl Model {
    pub fn from_parts(kind: EntityKind, id: RecordId, fields: Fields) -> Self {
        Self { kind, id, fields }
    }

    fn from_record(kind: EntityKind, record: Record) -> Result<Self, TauError> {
        let id = record.id().ok_or_else(|| {
            TauError::InternalError(format!("{} record without an id: {}", kind, record))
        })?;
        Ok(Self::from_parts(kind, id, record.into_fields()))
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn schema(&self) -> &'static Schema {
        self.kind.schema()
    }

    pub fn get(&self, attr: &str) -> Option<&Value> {
        self.fields.get(attr).filter(|v| !v.is_null())
    }

    /// Stored value, or the schema default when unset.
    pub fn get_or_default(&self, attr: &str) -> Option<Value> {
        self.get(attr).cloned().or_else(|| {
            self.schema()
                .attribute(attr)
                .and_then(Attribute::default_json)
        })
    }

    pub fn get_str(&self, attr: &str) -> Option<&str> {
        self.get(attr).and_then(Value::as_str)
    }

    /// Boolean value with the schema default applied; false when unset.
    pub fn get_bool(&self, attr: &str) -> bool {
        self.get_or_default(attr)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn get_i64(&self, attr: &str) -> Option<i64> {
        self.get(attr).and_then(Value::as_i64)
    }

    pub fn get_id(&self, attr: &str) -> Option<RecordId> {
        self.get(attr).and_then(Value::as_u64)
    }

    pub fn get_ids(&self, attr: &str) -> Vec<RecordId> {
        ids_of(self.get(attr))
    }

    /// Primary key value rendered as text.
    pub fn name(&self) -> String {
        self.schema()
            .primary_key()
            .and_then(|pk| self.get(pk.name))
            .map(|v| match v {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| self.id.to_string())
    }

    /// SHA-256 hex digest over the canonical JSON of the hashed attributes.
    pub fn hash_digest(&self) -> Result<String, TauError> {
        let hashed: BTreeMap<&str, &Value> = self
            .schema()
            .hashed()
            .filter_map(|attr| self.get(attr.name).map(|v| (attr.name, v)))
            .collect();
        let mut hasher = Sha256::new();
        hasher.update(self.kind.name().as_bytes());
        hasher.update(b"\0");
        hasher.update(serde_json::to_vec(&hashed)?);
        Ok(format!("{:x}", hasher.finalize()))
    }

    pub fn to_record(&self) -> Record {
        Record::with_id(self.id, self.fields.clone())
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.kind, self.name())
    }
}

fn ids_of(value: Option<&Value>) -> Vec<RecordId> {
    value
        .and_then(Value::as_array)
        .map(|ids| ids.iter().filter_map(Value::as_u64).collect())
        .unwrap_or_default()
}

/// A resolved relationship.
#[derive(Debug, Clone, PartialEq)]
pub enum Related {
    One(Model),
    Many(Vec<Model>),
    Unset,
}

/// A model with some or all of its relationships materialized.
#[derive(Debug, Clone)]
pub struct Populated {
    pub model: Model,
    /// Stored fields, plus every default when populated with defaults.
    pub fields: Fields,
    pub related: BTreeMap<&'static str, Related>,
}

impl Populated {
    pub fn get(&self, attr: &str) -> Option<&Value> {
        self.fields.get(attr)
    }

    pub fn one(&self, attr: &str) -> Option<&Model> {
        match self.related.get(attr) {
            Some(Related::One(model)) => Some(model),
            _ => None,
        }
    }

    pub fn many(&self, attr: &str) -> &[Model] {
        match self.related.get(attr) {
            Some(Related::Many(models)) => models,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone)]
pub struct Controller<'s> {
    kind: EntityKind,
    store: &'s Store,
    scope: Option<(&'static str, Value)>,
}

impl<'s> Controller<'s> {
    pub fn new(kind: EntityKind, store: &'s Store) -> Self {
        Self {
            kind,
            store,
            scope: None,
        }
    }

    /// Restrict every operation to records whose `attr` equals `value`.
    /// Records created through this controller get `attr` filled in.
    pub fn scoped(mut self, attr: &'static str, value: Value) -> Self {
        self.scope = Some((attr, value));
        self
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn store(&self) -> &'s Store {
        self.store
    }

    pub fn schema(&self) -> &'static Schema {
        self.kind.schema()
    }

    /// Unscoped controller for another entity type over the same store.
    pub fn other(&self, kind: EntityKind) -> Controller<'s> {
        Controller::new(kind, self.store)
    }

    fn table(&self) -> &'static str {
        self.kind.table()
    }

    fn in_scope(&self, record: &Record) -> bool {
        match &self.scope {
            Some((attr, value)) => record.get(attr) == Some(value),
            None => true,
        }
    }

    fn attribute(&self, name: &str) -> Result<&'static Attribute, TauError> {
        self.schema().attribute(name).ok_or_else(|| {
            TauError::ModelError(format!("{} has no attribute named '{}'", self.kind, name))
        })
    }

    // ===== Reads =====

    pub fn search(&self, keys: impl Into<Keys>, match_any: bool) -> Result<Vec<Model>, TauError> {
        let keys = keys.into();
        self.store
            .database()
            .search(self.table(), &keys, match_any)?
            .into_iter()
            .filter(|record| self.in_scope(record))
            .map(|record| Model::from_record(self.kind, record))
            .collect()
    }

    pub fn one(&self, keys: impl Into<Keys>) -> Result<Option<Model>, TauError> {
        Ok(self.search(keys, false)?.into_iter().next())
    }

    pub fn all(&self) -> Result<Vec<Model>, TauError> {
        self.search(Keys::All, false)
    }

    pub fn exists(&self, keys: impl Into<Keys>) -> Result<bool, TauError> {
        Ok(!self.search(keys, false)?.is_empty())
    }

    pub fn count(&self) -> Result<usize, TauError> {
        if self.scope.is_some() {
            return Ok(self.all()?.len());
        }
        self.store.database().count(self.table())
    }

    /// Look up a record by primary key, failing with `NotFound`.
    pub fn by_name(&self, name: &str) -> Result<Model, TauError> {
        let pk = self.schema().primary_key().map_or("name", |attr| attr.name);
        self.one(Keys::by_field(pk, name))?
            .ok_or_else(|| TauError::NotFound(format!("No {} named '{}'", self.kind, name)))
    }

    pub fn reload(&self, id: RecordId) -> Result<Model, TauError> {
        self.one(Keys::ById(id))?
            .ok_or_else(|| TauError::NotFound(format!("No {} with id {}", self.kind, id)))
    }

    // ===== Validation =====

    fn validate_fields(&self, data: &Fields) -> Result<(), TauError> {
        for (name, value) in data {
            self.attribute(name)?.validate(self.kind, value)?;
        }
        Ok(())
    }

    fn apply_defaults(&self, data: &mut Fields) {
        for attr in &self.schema().attributes {
            if data.get(attr.name).is_some_and(|v| !v.is_null()) {
                continue;
            }
            if let Some(default) = attr.default_json() {
                data.insert(attr.name.to_string(), default);
            }
        }
    }

    fn check_required(&self, data: &Fields) -> Result<(), TauError> {
        for attr in self.schema().attributes.iter().filter(|a| a.required) {
            if data.get(attr.name).is_none_or(Value::is_null) {
                return Err(TauError::ModelError(format!(
                    "{} attribute '{}' is required",
                    self.kind, attr.name
                )));
            }
        }
        Ok(())
    }

    fn check_references(&self, data: &Fields) -> Result<(), TauError> {
        let db = self.store.database();
        for (name, value) in data {
            let Some(relation) = self.attribute(name)?.relation else {
                continue;
            };
            let ids = match relation {
                Relation::Model { .. } => value.as_u64().into_iter().collect(),
                Relation::Collection { .. } => ids_of(Some(value)),
                Relation::Inverse { .. } => Vec::new(),
            };
            for id in ids {
                if !db.contains(relation.model().table(), &Keys::ById(id), false)? {
                    return Err(TauError::NotFound(format!(
                        "{} attribute '{}' refers to missing {} with id {}",
                        self.kind,
                        name,
                        relation.model(),
                        id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Fail with `RecordConflict` if another record already holds any of the
    /// unique values in `data` (within the schema's uniqueness scope).
    fn check_unique(&self, data: &Fields, exclude: Option<RecordId>) -> Result<(), TauError> {
        let schema = self.schema();
        let db = self.store.database();
        for attr in schema.attributes.iter().filter(|a| a.unique) {
            let Some(value) = data.get(attr.name).filter(|v| !v.is_null()) else {
                continue;
            };
            let mut keys = Fields::new();
            keys.insert(attr.name.to_string(), value.clone());
            if let Some(scope) = schema.unique_scope.filter(|s| *s != attr.name) {
                if let Some(scope_value) = data.get(scope) {
                    keys.insert(scope.to_string(), scope_value.clone());
                }
            }
            let clash = db
                .search(self.table(), &Keys::ByFields(keys), false)?
                .into_iter()
                .any(|record| record.id() != exclude);
            if clash {
                return Err(TauError::RecordConflict {
                    entity: self.kind.name().to_string(),
                    attribute: attr.name.to_string(),
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Keep the other side of a mirrored many-to-many collection in sync.
    fn sync_mirror(
        &self,
        id: RecordId,
        attr: &Attribute,
        before: &[RecordId],
        after: &[RecordId],
    ) -> Result<(), TauError> {
        let Some(Relation::Collection {
            model,
            mirror: Some(mirror),
        }) = attr.relation
        else {
            return Ok(());
        };
        let db = self.store.database();
        let added = after.iter().filter(|other| !before.contains(other));
        let removed = before.iter().filter(|other| !after.contains(other));
        for (other, link) in added.map(|o| (*o, true)).chain(removed.map(|o| (*o, false))) {
            let Some(record) = db.get(model.table(), &Keys::ById(other), false)? else {
                continue;
            };
            let mut ids = ids_of(record.get(mirror));
            let present = ids.contains(&id);
            if link && !present {
                ids.push(id);
            } else if !link && present {
                ids.retain(|x| *x != id);
            } else {
                continue;
            }
            let mut change = Fields::new();
            change.insert(mirror.to_string(), Value::from(ids));
            db.update(model.table(), &change, &Keys::ById(other), false)?;
        }
        Ok(())
    }

    fn fire_change_hooks(&self, model: &Model, changes: &Changes) -> Result<(), TauError> {
        self.schema().hooks.on_update(self, model, changes)?;
        for (name, (before, after)) in changes {
            if let Some(hook) = self.attribute(name)?.on_change {
                hook(self, model, name, before, after)?;
            }
        }
        Ok(())
    }

    // ===== Mutations =====

    /// Validate, insert, link and run `on_create`. Any failure rolls back.
    pub fn create(&self, mut data: Fields) -> Result<Model, TauError> {
        if let Some((attr, value)) = &self.scope {
            data.entry(attr.to_string()).or_insert_with(|| value.clone());
        }
        self.validate_fields(&data)?;
        self.apply_defaults(&mut data);
        self.check_required(&data)?;

        let _lock = self.store.lock()?;
        let db = self.store.database();
        db.transaction(|| {
            self.check_references(&data)?;
            self.check_unique(&data, None)?;
            let record = db.insert(self.table(), data.clone())?;
            let model = Model::from_record(self.kind, record)?;
            for attr in &self.schema().attributes {
                self.sync_mirror(model.id(), attr, &[], &model.get_ids(attr.name))?;
            }
            self.schema().hooks.on_create(self, &model)?;
            debug!("Created {}", model);
            self.reload(model.id())
        })
    }

    /// Apply `data` to every selected record. Returns the updated models.
    pub fn update(&self, data: Fields, keys: impl Into<Keys>, match_any: bool) -> Result<Vec<Model>, TauError> {
        self.validate_fields(&data)?;
        let keys = keys.into();
        let _lock = self.store.lock()?;
        let db = self.store.database();
        db.transaction(|| {
            self.check_references(&data)?;
            let mut updated = Vec::new();
            for old in self.search(keys.clone(), match_any)? {
                let mut merged = old.fields().clone();
                let mut changes = Changes::new();
                for (name, value) in &data {
                    let before = old.fields().get(name).cloned().unwrap_or(Value::Null);
                    if &before != value {
                        changes.insert(name.clone(), (before, value.clone()));
                    }
                    merged.insert(name.clone(), value.clone());
                }
                if changes.is_empty() {
                    updated.push(old);
                    continue;
                }
                self.check_unique(&merged, Some(old.id()))?;
                db.update(self.table(), &data, &Keys::ById(old.id()), false)?;
                for (name, (before, after)) in &changes {
                    let attr = self.attribute(name)?;
                    self.sync_mirror(old.id(), attr, &ids_of(Some(before)), &ids_of(Some(after)))?;
                }
                let model = self.reload(old.id())?;
                self.fire_change_hooks(&model, &changes)?;
                debug!("Updated {}: {:?}", model, changes.keys().collect::<Vec<_>>());
                updated.push(model);
            }
            Ok(updated)
        })
    }

    /// Remove optional attributes from every selected record.
    pub fn unset(&self, names: &[&str], keys: impl Into<Keys>) -> Result<Vec<Model>, TauError> {
        for name in names {
            let attr = self.attribute(name)?;
            if attr.required {
                return Err(TauError::ModelError(format!(
                    "{} attribute '{}' is required and cannot be unset",
                    self.kind, name
                )));
            }
            if attr.relation.is_some_and(|rel| !rel.is_stored()) {
                return Err(TauError::ModelError(format!(
                    "{} attribute '{}' is derived and cannot be unset",
                    self.kind, name
                )));
            }
        }
        let owned: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        let keys = keys.into();
        let _lock = self.store.lock()?;
        let db = self.store.database();
        db.transaction(|| {
            let mut updated = Vec::new();
            for old in self.search(keys.clone(), false)? {
                let changes: Changes = owned
                    .iter()
                    .filter_map(|name| {
                        old.get(name)
                            .map(|before| (name.clone(), (before.clone(), Value::Null)))
                    })
                    .collect();
                if changes.is_empty() {
                    updated.push(old);
                    continue;
                }
                db.unset(self.table(), &owned, &Keys::ById(old.id()), false)?;
                for (name, (before, _)) in &changes {
                    self.sync_mirror(old.id(), self.attribute(name)?, &ids_of(Some(before)), &[])?;
                }
                let model = self.reload(old.id())?;
                self.fire_change_hooks(&model, &changes)?;
                updated.push(model);
            }
            Ok(updated)
        })
    }

    /// Delete every selected record, applying each referencing attribute's
    /// referential policy. Returns the number of records deleted.
    pub fn delete(&self, keys: impl Into<Keys>, match_any: bool) -> Result<usize, TauError> {
        let keys = keys.into();
        let _lock = self.store.lock()?;
        self.store.database().transaction(|| {
            let doomed = self.search(keys, match_any)?;
            for model in &doomed {
                self.delete_one(model)?;
            }
            Ok(doomed.len())
        })
    }

    fn delete_one(&self, model: &Model) -> Result<(), TauError> {
        let db = self.store.database();
        let referencing = || {
            EntityKind::ALL.into_iter().flat_map(|kind| {
                kind.schema()
                    .references_to(self.kind)
                    .map(move |attr| (kind, attr))
            })
        };

        for (kind, attr) in referencing() {
            if let Some(Relation::Model {
                on_delete: Referential::Restrict,
                ..
            }) = attr.relation
            {
                let users = self.other(kind).search(Keys::by_field(attr.name, model.id()), false)?;
                if !users.is_empty() {
                    let names: Vec<String> = users.iter().map(Model::name).collect();
                    return Err(TauError::ImmutableRecordError(format!(
                        "{} cannot be deleted because {} {} uses it",
                        model,
                        kind,
                        names.join(", ")
                    )));
                }
            }
        }

        for (kind, attr) in referencing() {
            let by_ref = Keys::by_field(attr.name, model.id());
            match attr.relation {
                Some(Relation::Model {
                    on_delete: Referential::Cascade,
                    ..
                }) => {
                    self.other(kind).delete(by_ref, false)?;
                }
                Some(Relation::Model {
                    on_delete: Referential::Nullify,
                    ..
                }) => {
                    db.unset(kind.table(), &[attr.name.to_string()], &by_ref, false)?;
                }
                Some(Relation::Collection { .. }) => {
                    let holders = db.match_field(kind.table(), attr.name, |v| {
                        ids_of(Some(v)).contains(&model.id())
                    })?;
                    for holder in holders {
                        let remaining: Vec<RecordId> = ids_of(holder.get(attr.name))
                            .into_iter()
                            .filter(|id| *id != model.id())
                            .collect();
                        let mut change = Fields::new();
                        change.insert(attr.name.to_string(), Value::from(remaining));
                        if let Some(holder_id) = holder.id() {
                            db.update(kind.table(), &change, &Keys::ById(holder_id), false)?;
                        }
                    }
                }
                _ => {}
            }
        }

        if let Err(err) = self.schema().hooks.on_delete(self, model) {
            error!("Cleanup after deleting {} failed: {}", model, err);
        }
        db.remove(self.table(), &Keys::ById(model.id()), false)?;
        debug!("Deleted {}", model);
        Ok(())
    }

    // ===== Relationships =====

    /// Resolve a single-reference attribute.
    pub fn populate_one(&self, model: &Model, attr: &str) -> Result<Option<Model>, TauError> {
        match self.attribute(attr)?.relation {
            Some(Relation::Model { model: kind, .. }) => match model.get_id(attr) {
                Some(id) => self.other(kind).reload(id).map(Some),
                None => Ok(None),
            },
            _ => Err(TauError::ModelError(format!(
                "{} attribute '{}' is not a single reference",
                self.kind, attr
            ))),
        }
    }

    /// Resolve a collection attribute, stored or derived.
    pub fn populate_many(&self, model: &Model, attr: &str) -> Result<Vec<Model>, TauError> {
        match self.attribute(attr)?.relation {
            Some(Relation::Collection { model: kind, .. }) => {
                self.other(kind).search(Keys::ByIds(model.get_ids(attr)), false)
            }
            Some(Relation::Inverse { model: kind, via }) => {
                self.other(kind).search(Keys::by_field(via, model.id()), false)
            }
            _ => Err(TauError::ModelError(format!(
                "{} attribute '{}' is not a collection",
                self.kind, attr
            ))),
        }
    }

    /// Materialize one (`Some(attr)`) or every relationship of `model`.
    /// With `defaults`, every attribute that has a default is present in the
    /// returned fields.
    pub fn populate(&self, model: &Model, attribute: Option<&str>, defaults: bool) -> Result<Populated, TauError> {
        let attrs: Vec<&'static Attribute> = match attribute {
            Some(name) => vec![self.attribute(name)?],
            None => self
                .schema()
                .attributes
                .iter()
                .filter(|a| a.relation.is_some())
                .collect(),
        };
        let mut related = BTreeMap::new();
        for attr in attrs {
            let resolved = match attr.relation {
                Some(Relation::Model { .. }) => self
                    .populate_one(model, attr.name)?
                    .map_or(Related::Unset, Related::One),
                Some(_) => Related::Many(self.populate_many(model, attr.name)?),
                None => {
                    return Err(TauError::ModelError(format!(
                        "{} attribute '{}' is not a relationship",
                        self.kind, attr.name
                    )));
                }
            };
            related.insert(attr.name, resolved);
        }
        let mut fields = model.fields().clone();
        if defaults {
            self.apply_defaults(&mut fields);
        }
        Ok(Populated {
            model: model.clone(),
            fields,
            related,
        })
    }

    // ===== Topics =====

    pub fn push_to_topic(&self, topic: &str, payload: Value) {
        self.store.push_to_topic(topic, payload);
    }

    pub fn pop_topic(&self, topic: &str) -> Vec<Value> {
        self.store.pop_topic(topic)
    }
}

/// Serialize `value` into a single-attribute field map.
pub fn field<V: Into<Value>>(name: &str, value: V) -> Fields {
    let mut out = Fields::new();
    out.insert(name.to_string(), value.into());
    out
}
