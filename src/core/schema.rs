//! Declarative attribute registry.
//!
//! Every entity type has one [`Schema`]: an ordered list of [`Attribute`]
//! descriptors plus the entity's lifecycle hooks. Relationships name the other
//! side by [`EntityKind`] and are resolved through the registry on use, so
//! entities can refer to each other in cycles (Application and Measurement
//! carry compatibility rules about each other) without any definition-order
//! coupling.

use crate::core::controller::{Controller, Model};
use crate::core::error::TauError;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum EntityKind {
    Project,
    Target,
    Application,
    Measurement,
    Experiment,
    Trial,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Project,
        EntityKind::Target,
        EntityKind::Application,
        EntityKind::Measurement,
        EntityKind::Experiment,
        EntityKind::Trial,
    ];

    pub fn name(self) -> &'static str {
        match self {
            EntityKind::Project => "Project",
            EntityKind::Target => "Target",
            EntityKind::Application => "Application",
            EntityKind::Measurement => "Measurement",
            EntityKind::Experiment => "Experiment",
            EntityKind::Trial => "Trial",
        }
    }

    /// Storage table holding records of this kind.
    pub fn table(self) -> &'static str {
        self.name()
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(name))
    }

    pub fn schema(self) -> &'static Schema {
        crate::model::schema(self)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttrType {
    String,
    Boolean,
    Integer,
    Float,
    Datetime,
    Array,
}

impl AttrType {
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            AttrType::String => value.is_string(),
            AttrType::Boolean => value.is_boolean(),
            AttrType::Integer => value.is_i64() || value.is_u64(),
            AttrType::Float => value.is_number(),
            AttrType::Datetime => value
                .as_str()
                .is_some_and(crate::core::time::is_datetime),
            AttrType::Array => value.is_array(),
        }
    }
}

/// What happens to a referencing record when the record it points at is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Referential {
    /// Delete the referencing record too.
    Cascade,
    /// Refuse to delete while referenced.
    Restrict,
    /// Remove the reference.
    Nullify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// Single foreign id.
    Model {
        model: EntityKind,
        on_delete: Referential,
    },
    /// Stored list of foreign ids. When `mirror` names a collection on the
    /// other side, both lists are kept in sync.
    Collection {
        model: EntityKind,
        mirror: Option<&'static str>,
    },
    /// Derived list: records of `model` whose `via` attribute refers here.
    /// Never stored.
    Inverse {
        model: EntityKind,
        via: &'static str,
    },
}

impl Relation {
    pub fn model(&self) -> EntityKind {
        match *self {
            Relation::Model { model, .. }
            | Relation::Collection { model, .. }
            | Relation::Inverse { model, .. } => model,
        }
    }

    pub fn is_stored(&self) -> bool {
        !matches!(self, Relation::Inverse { .. })
    }
}

/// Predicate over a single attribute value (`None` when unset).
#[derive(Debug, Clone, PartialEq)]
pub enum Test {
    /// Set to something other than null, `false` or the empty string.
    Set,
    Equals(Value),
    NotEquals(Value),
}

impl Test {
    pub fn eval(&self, value: Option<&Value>) -> bool {
        match self {
            Test::Set => match value {
                None | Some(Value::Null) | Some(Value::Bool(false)) => false,
                Some(Value::String(text)) => !text.is_empty(),
                Some(_) => true,
            },
            Test::Equals(expected) => value.unwrap_or(&Value::Null) == expected,
            Test::NotEquals(expected) => value.is_some_and(|v| !v.is_null() && v != expected),
        }
    }

    pub fn describe(&self, attribute: &str) -> String {
        match self {
            Test::Set => format!("'{}' set", attribute),
            Test::Equals(v) => format!("'{}' = {}", attribute, v),
            Test::NotEquals(v) => format!("'{}' != {}", attribute, v),
        }
    }
}

/// An attribute test on a counterpart entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub model: EntityKind,
    pub attribute: &'static str,
    pub test: Test,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Requisite {
    Required(Condition),
    Recommended(Condition),
    Encouraged(Condition),
    Violation(Condition),
}

impl Requisite {
    pub fn condition(&self) -> &Condition {
        match self {
            Requisite::Required(c)
            | Requisite::Recommended(c)
            | Requisite::Encouraged(c)
            | Requisite::Violation(c) => c,
        }
    }

    pub fn severity(&self) -> &'static str {
        match self {
            Requisite::Required(_) => "required",
            Requisite::Recommended(_) => "recommended",
            Requisite::Encouraged(_) => "encouraged",
            Requisite::Violation(_) => "violation",
        }
    }
}

/// When this attribute's value satisfies `when`, the `requisite` applies to the
/// counterpart entity named in its condition.
#[derive(Debug, Clone, PartialEq)]
pub struct CompatRule {
    pub when: Test,
    pub requisite: Requisite,
}

impl CompatRule {
    fn new(when: Test, requisite: Requisite) -> Self {
        Self { when, requisite }
    }

    pub fn required(when: Test, model: EntityKind, attribute: &'static str, test: Test) -> Self {
        Self::new(when, Requisite::Required(Condition { model, attribute, test }))
    }

    pub fn recommended(when: Test, model: EntityKind, attribute: &'static str, test: Test) -> Self {
        Self::new(when, Requisite::Recommended(Condition { model, attribute, test }))
    }

    pub fn encouraged(when: Test, model: EntityKind, attribute: &'static str, test: Test) -> Self {
        Self::new(when, Requisite::Encouraged(Condition { model, attribute, test }))
    }

    pub fn violation(when: Test, model: EntityKind, attribute: &'static str, test: Test) -> Self {
        Self::new(when, Requisite::Violation(Condition { model, attribute, test }))
    }
}

pub type DefaultFn = fn() -> Value;

/// Called with `(controller, updated model, attribute, old, new)`; unset values are null.
pub type ChangeHook = fn(&Controller<'_>, &Model, &str, &Value, &Value) -> Result<(), TauError>;

/// Attribute name to `(old, new)` for every attribute an update changed.
pub type Changes = BTreeMap<String, (Value, Value)>;

#[derive(Debug, Clone)]
pub struct Attribute {
    pub name: &'static str,
    pub ty: AttrType,
    pub description: &'static str,
    pub required: bool,
    pub unique: bool,
    pub primary_key: bool,
    pub hashed: bool,
    pub relation: Option<Relation>,
    pub default: Option<DefaultFn>,
    pub choices: &'static [&'static str],
    pub on_change: Option<ChangeHook>,
    pub compat: Vec<CompatRule>,
}

impl Attribute {
    pub fn new(name: &'static str, ty: AttrType) -> Self {
        Self {
            name,
            ty,
            description: "",
            required: false,
            unique: false,
            primary_key: false,
            hashed: false,
            relation: None,
            default: None,
            choices: &[],
            on_change: None,
            compat: Vec::new(),
        }
    }

    pub fn string(name: &'static str) -> Self {
        Self::new(name, AttrType::String)
    }

    pub fn boolean(name: &'static str) -> Self {
        Self::new(name, AttrType::Boolean)
    }

    pub fn integer(name: &'static str) -> Self {
        Self::new(name, AttrType::Integer)
    }

    pub fn float(name: &'static str) -> Self {
        Self::new(name, AttrType::Float)
    }

    pub fn datetime(name: &'static str) -> Self {
        Self::new(name, AttrType::Datetime)
    }

    /// Single foreign id.
    pub fn model(name: &'static str, model: EntityKind, on_delete: Referential) -> Self {
        Self {
            relation: Some(Relation::Model { model, on_delete }),
            ..Self::new(name, AttrType::Integer)
        }
    }

    /// Stored list of foreign ids, mirrored by `mirror` on the other side if given.
    pub fn collection(name: &'static str, model: EntityKind, mirror: Option<&'static str>) -> Self {
        Self {
            relation: Some(Relation::Collection { model, mirror }),
            ..Self::new(name, AttrType::Array)
        }
    }

    /// Derived list of `model` records whose `via` attribute refers here.
    pub fn inverse(name: &'static str, model: EntityKind, via: &'static str) -> Self {
        Self {
            relation: Some(Relation::Inverse { model, via }),
            ..Self::new(name, AttrType::Array)
        }
    }

    pub fn describe(mut self, text: &'static str) -> Self {
        self.description = text;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.unique = true;
        self.required = true;
        self
    }

    pub fn hashed(mut self) -> Self {
        self.hashed = true;
        self
    }

    pub fn default_value(mut self, default: DefaultFn) -> Self {
        self.default = Some(default);
        self
    }

    pub fn choices(mut self, choices: &'static [&'static str]) -> Self {
        self.choices = choices;
        self
    }

    pub fn on_change(mut self, hook: ChangeHook) -> Self {
        self.on_change = Some(hook);
        self
    }

    pub fn compat(mut self, rule: CompatRule) -> Self {
        self.compat.push(rule);
        self
    }

    pub fn default_json(&self) -> Option<Value> {
        self.default.map(|f| f())
    }

    /// Check a supplied value against type, relation shape and choices.
    pub fn validate(&self, entity: EntityKind, value: &Value) -> Result<(), TauError> {
        if value.is_null() {
            if self.required {
                return Err(TauError::ModelError(format!(
                    "{} attribute '{}' is required",
                    entity, self.name
                )));
            }
            return Ok(());
        }
        let shape_ok = match self.relation {
            Some(Relation::Model { .. }) => value.is_u64(),
            Some(Relation::Collection { .. }) => value
                .as_array()
                .is_some_and(|ids| ids.iter().all(Value::is_u64)),
            Some(Relation::Inverse { .. }) => {
                return Err(TauError::ModelError(format!(
                    "{} attribute '{}' is derived and cannot be set",
                    entity, self.name
                )));
            }
            None => self.ty.accepts(value),
        };
        if !shape_ok {
            return Err(TauError::ModelError(format!(
                "{} attribute '{}' expects {}, got {}",
                entity,
                self.name,
                self.expected(),
                value
            )));
        }
        if !self.choices.is_empty() {
            let allowed = value.as_str().is_some_and(|v| self.choices.contains(&v));
            if !allowed {
                return Err(TauError::ModelError(format!(
                    "{} attribute '{}' must be one of {:?}, got {}",
                    entity, self.name, self.choices, value
                )));
            }
        }
        Ok(())
    }

    fn expected(&self) -> &'static str {
        match self.relation {
            Some(Relation::Model { .. }) => "a record id",
            Some(Relation::Collection { .. }) | Some(Relation::Inverse { .. }) => "a list of record ids",
            None => match self.ty {
                AttrType::String => "a string",
                AttrType::Boolean => "a boolean",
                AttrType::Integer => "an integer",
                AttrType::Float => "a number",
                AttrType::Datetime => "an RFC 3339 datetime",
                AttrType::Array => "an array",
            },
        }
    }

    pub fn to_json(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("type".into(), json!(self.ty));
        map.insert("description".into(), json!(self.description));
        if self.required {
            map.insert("required".into(), Value::Bool(true));
        }
        if self.unique {
            map.insert("unique".into(), Value::Bool(true));
        }
        if self.primary_key {
            map.insert("primary_key".into(), Value::Bool(true));
        }
        if self.hashed {
            map.insert("hashed".into(), Value::Bool(true));
        }
        if let Some(default) = self.default_json() {
            map.insert("default".into(), default);
        }
        if !self.choices.is_empty() {
            map.insert("choices".into(), json!(self.choices));
        }
        match self.relation {
            Some(Relation::Model { model, on_delete }) => {
                map.insert("model".into(), json!(model));
                map.insert("on_delete".into(), json!(on_delete));
            }
            Some(Relation::Collection { model, .. }) => {
                map.insert("collection".into(), json!(model));
            }
            Some(Relation::Inverse { model, via }) => {
                map.insert("collection".into(), json!(model));
                map.insert("via".into(), json!(via));
            }
            None => {}
        }
        if !self.compat.is_empty() {
            let rules: Vec<Value> = self
                .compat
                .iter()
                .map(|rule| {
                    let cond = rule.requisite.condition();
                    let mut entry = serde_json::Map::new();
                    entry.insert("when".into(), json!(rule.when.describe(self.name)));
                    entry.insert(
                        rule.requisite.severity().into(),
                        json!(format!("{}.{}", cond.model, cond.test.describe(cond.attribute))),
                    );
                    Value::Object(entry)
                })
                .collect();
            map.insert("compat".into(), Value::Array(rules));
        }
        Value::Object(map)
    }
}

/// Per-entity lifecycle hooks. Every hook defaults to a no-op.
///
/// `on_create` and `on_update` run inside the controller's transaction, so an
/// error rolls the whole operation back. `on_delete` is best-effort.
pub trait EntityHooks: Sync {
    fn on_create(&self, _ctrl: &Controller<'_>, _model: &Model) -> Result<(), TauError> {
        Ok(())
    }

    fn on_update(&self, _ctrl: &Controller<'_>, _model: &Model, _changes: &Changes) -> Result<(), TauError> {
        Ok(())
    }

    fn on_delete(&self, _ctrl: &Controller<'_>, _model: &Model) -> Result<(), TauError> {
        Ok(())
    }
}

pub struct NoHooks;

impl EntityHooks for NoHooks {}

pub struct Schema {
    pub kind: EntityKind,
    pub attributes: Vec<Attribute>,
    /// Attribute that scopes uniqueness (e.g. experiment names are unique per project).
    pub unique_scope: Option<&'static str>,
    pub hooks: &'static dyn EntityHooks,
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("kind", &self.kind)
            .field("attributes", &self.attributes)
            .field("unique_scope", &self.unique_scope)
            .finish_non_exhaustive()
    }
}

impl Schema {
    pub fn new(kind: EntityKind, attributes: Vec<Attribute>) -> Self {
        Self {
            kind,
            attributes,
            unique_scope: None,
            hooks: &NoHooks,
        }
    }

    pub fn unique_within(mut self, attribute: &'static str) -> Self {
        self.unique_scope = Some(attribute);
        self
    }

    pub fn with_hooks(mut self, hooks: &'static dyn EntityHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|attr| attr.name == name)
    }

    pub fn primary_key(&self) -> Option<&Attribute> {
        self.attributes.iter().find(|attr| attr.primary_key)
    }

    pub fn hashed(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter().filter(|attr| attr.hashed)
    }

    /// Attributes of this schema that point at records of `kind`.
    pub fn references_to(&self, kind: EntityKind) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter().filter(move |attr| {
            attr.relation
                .is_some_and(|rel| rel.is_stored() && rel.model() == kind)
        })
    }

    pub fn to_json(&self) -> Value {
        let attributes: serde_json::Map<String, Value> = self
            .attributes
            .iter()
            .map(|attr| (attr.name.to_string(), attr.to_json()))
            .collect();
        json!({
            "name": self.kind.name(),
            "unique_scope": self.unique_scope,
            "attributes": attributes,
        })
    }
}

/// JSON description of an entity type's schema.
pub fn schema_json(kind: EntityKind) -> Value {
    kind.schema().to_json()
}
