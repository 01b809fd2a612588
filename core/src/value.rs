use crate::hash::{Hash, IdHash};
use std::collections::BTreeMap;

/// A field value of a typed object.
///
/// Values are dynamically typed; the recipe decides which variants are
/// admissible for a field and the codec enforces it.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    String(String),
    Integer(i64),
    Number(f64),
    Boolean(bool),
    /// Reference to the id-hash of a versioned object.
    IdRef(IdHash),
    /// Reference to the content hash of an object.
    ObjRef(Hash),
    ClobRef(Hash),
    BlobRef(Hash),
    Array(Vec<Value>),
    Bag(Vec<Value>),
    Set(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// Nested object governed by nested rules.
    Object(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_obj_ref(&self) -> Option<Hash> {
        match self {
            Value::ObjRef(h) => Some(*h),
            _ => None,
        }
    }

    pub fn as_id_ref(&self) -> Option<IdHash> {
        match self {
            Value::IdRef(h) => Some(*h),
            _ => None,
        }
    }
}

/// A reference found while walking a value tree.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RefTarget {
    Obj(Hash),
    Id(IdHash),
    Clob(Hash),
    Blob(Hash),
}

impl Value {
    fn walk_refs(&self, out: &mut Vec<RefTarget>) {
        match self {
            Value::IdRef(h) => out.push(RefTarget::Id(*h)),
            Value::ObjRef(h) => out.push(RefTarget::Obj(*h)),
            Value::ClobRef(h) => out.push(RefTarget::Clob(*h)),
            Value::BlobRef(h) => out.push(RefTarget::Blob(*h)),
            Value::Array(items) | Value::Bag(items) | Value::Set(items) => {
                for item in items {
                    item.walk_refs(out);
                }
            }
            Value::Map(entries) | Value::Object(entries) => {
                for value in entries.values() {
                    value.walk_refs(out);
                }
            }
            _ => {}
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

/// A typed object: a recipe name plus its fields.
///
/// Objects are immutable once stored; mutation happens by writing a new
/// version under the same id-hash.
#[derive(Clone, Debug, PartialEq)]
pub struct Obj {
    type_name: String,
    fields: BTreeMap<String, Value>,
}

impl Obj {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field assignment.
    pub fn with(mut self, itemprop: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(itemprop.into(), value.into());
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn get(&self, itemprop: &str) -> Option<&Value> {
        self.fields.get(itemprop)
    }

    pub fn set(&mut self, itemprop: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(itemprop.into(), value.into());
    }

    pub fn remove(&mut self, itemprop: &str) -> Option<Value> {
        self.fields.remove(itemprop)
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// All references held anywhere in the object's fields.
    pub fn references(&self) -> Vec<RefTarget> {
        let mut out = Vec::new();
        for value in self.fields.values() {
            value.walk_refs(&mut out);
        }
        out
    }

    /// References held by one field only, for reverse-map maintenance.
    pub fn field_references(&self, itemprop: &str) -> Vec<RefTarget> {
        let mut out = Vec::new();
        if let Some(value) = self.fields.get(itemprop) {
            value.walk_refs(&mut out);
        }
        out
    }
}
