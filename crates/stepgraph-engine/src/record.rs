use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;

/// The typed state threaded through one run.
///
/// Fields appear in schema declaration order. A record is only ever built
/// by the engine from validated input; step bodies read it through a
/// shared snapshot and describe changes as a [`PartialUpdate`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Record {
    fields: IndexMap<String, Value>,
}

impl Record {
    pub(crate) fn from_fields(fields: IndexMap<String, Value>) -> Self {
        Self { fields }
    }

    pub(crate) fn fields_mut(&mut self) -> &mut IndexMap<String, Value> {
        &mut self.fields
    }

    /// Get a value by field name.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Get a value as a string, if it's a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(|v| v.as_str())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.fields.get(key).and_then(|v| v.as_i64())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.fields.get(key).and_then(|v| v.as_f64())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.fields.get(key).and_then(|v| v.as_bool())
    }

    pub fn get_list(&self, key: &str) -> Option<&Vec<Value>> {
        self.fields.get(key).and_then(|v| v.as_array())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    /// The record as a JSON object.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

/// The subset of fields a transform changes.
///
/// Fields not mentioned are left untouched when the update is merged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialUpdate {
    fields: IndexMap<String, Value>,
}

impl PartialUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    pub(crate) fn into_fields(self) -> IndexMap<String, Value> {
        self.fields
    }
}

impl From<serde_json::Map<String, Value>> for PartialUpdate {
    fn from(map: serde_json::Map<String, Value>) -> Self {
        Self {
            fields: map.into_iter().collect(),
        }
    }
}

impl FromIterator<(String, Value)> for PartialUpdate {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}
