//! Record schema: declared fields, their kinds and merge policies.

use std::fmt;

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;

use crate::error::SchemaError;
use crate::record::{PartialUpdate, Record};

/// Value kind of a record field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    /// Any JSON number.
    Number,
    /// A JSON number with no fractional part.
    Integer,
    Boolean,
    List,
    /// A nested JSON object.
    Map,
    /// Anything, including null.
    Any,
}

impl FieldKind {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::List => value.is_array(),
            Self::Map => value.is_object(),
            Self::Any => true,
        }
    }

    /// Value an optional field takes when neither the caller nor a default sets it.
    pub fn empty_value(&self) -> Value {
        match self {
            Self::String => Value::String(String::new()),
            Self::Number => Value::from(0.0),
            Self::Integer => Value::from(0),
            Self::Boolean => Value::Bool(false),
            Self::List => Value::Array(Vec::new()),
            Self::Map => Value::Object(serde_json::Map::new()),
            Self::Any => Value::Null,
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::List => "list",
            Self::Map => "map",
            Self::Any => "any",
        };
        f.write_str(name)
    }
}

/// How a partial update combines with the current value of a field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// The update replaces the value.
    #[default]
    Overwrite,
    /// The update's list items are concatenated onto the current list.
    Append,
}

/// Declaration of one record field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub kind: FieldKind,
    pub policy: MergePolicy,
    pub required: bool,
    pub default: Option<Value>,
}

impl FieldSpec {
    /// An optional, overwriting field of the given kind.
    pub fn new(kind: FieldKind) -> Self {
        Self {
            kind,
            policy: MergePolicy::Overwrite,
            required: false,
            default: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn append(mut self) -> Self {
        self.policy = MergePolicy::Append;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// The declared field set of a record, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    fields: IndexMap<String, FieldSpec>,
    duplicates: Vec<String>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        let name = name.into();
        if self.fields.contains_key(&name) {
            self.duplicates.push(name.clone());
        }
        self.fields.insert(name, spec);
        self
    }

    /// Add a field the caller must supply.
    pub fn required(self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.field(name, FieldSpec::new(kind).required())
    }

    /// Add a field that starts at its kind's empty value.
    pub fn optional(self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.field(name, FieldSpec::new(kind))
    }

    /// Add a list field that accumulates contributions.
    pub fn appending(self, name: impl Into<String>) -> Self {
        self.field(name, FieldSpec::new(FieldKind::List).append())
    }

    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Check the declaration itself: no duplicates, append fields are lists,
    /// defaults match their kind.
    pub fn check(&self) -> Result<(), SchemaError> {
        if let Some(name) = self.duplicates.first() {
            return Err(SchemaError::DuplicateField(name.clone()));
        }
        for (name, spec) in &self.fields {
            if spec.policy == MergePolicy::Append && spec.kind != FieldKind::List {
                return Err(SchemaError::AppendNotList(name.clone()));
            }
            if let Some(default) = &spec.default {
                if !spec.kind.matches(default) {
                    return Err(SchemaError::BadDefault {
                        field: name.clone(),
                        expected: spec.kind,
                    });
                }
            }
        }
        Ok(())
    }

    /// Build the initial record from caller-supplied values.
    ///
    /// Unknown fields and missing required fields are rejected. Optional
    /// fields the caller leaves out take their default, or the kind's
    /// empty value.
    pub fn initial_record(&self, values: Value) -> Result<Record, SchemaError> {
        let Value::Object(mut given) = values else {
            return Err(SchemaError::NotAnObject);
        };

        if let Some(unknown) = given.keys().find(|k| !self.fields.contains_key(*k)) {
            return Err(SchemaError::UnknownField(unknown.clone()));
        }

        let mut fields = IndexMap::with_capacity(self.fields.len());
        for (name, spec) in &self.fields {
            let value = match given.remove(name) {
                Some(v) => {
                    check_kind(name, spec.kind, &v)?;
                    v
                }
                None if spec.required => return Err(SchemaError::MissingField(name.clone())),
                None => spec
                    .default
                    .clone()
                    .unwrap_or_else(|| spec.kind.empty_value()),
            };
            fields.insert(name.clone(), value);
        }
        Ok(Record::from_fields(fields))
    }

    /// Validate every field of `update` before touching `record`, then merge.
    ///
    /// A rejected update leaves the record unchanged.
    pub fn apply(&self, record: &mut Record, update: PartialUpdate) -> Result<(), SchemaError> {
        for (name, value) in update.iter() {
            let spec = self
                .fields
                .get(name)
                .ok_or_else(|| SchemaError::UnknownField(name.clone()))?;
            check_kind(name, spec.kind, value)?;
        }

        let fields = record.fields_mut();
        for (name, value) in update.into_fields() {
            let policy = self
                .fields
                .get(&name)
                .map(|s| s.policy)
                .unwrap_or_default();
            match (policy, value) {
                (MergePolicy::Append, Value::Array(items)) => {
                    match fields.get_mut(&name) {
                        Some(Value::Array(current)) => current.extend(items),
                        _ => {
                            fields.insert(name, Value::Array(items));
                        }
                    }
                }
                (_, value) => {
                    fields.insert(name, value);
                }
            }
        }
        Ok(())
    }
}

fn check_kind(field: &str, kind: FieldKind, value: &Value) -> Result<(), SchemaError> {
    if kind.matches(value) {
        Ok(())
    } else {
        Err(SchemaError::KindMismatch {
            field: field.to_string(),
            expected: kind,
            found: json_type_name(value),
        })
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}
