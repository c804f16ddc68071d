use crate::schema::BindingId;

/// A generic value carrier: an element whose identity (page/token/name) must
/// be preserved along with its payload, for schema slots that accept "any
/// element" (SPEC GLOSSARY: WbxmlValue).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WbxmlValue {
    pub page: u8,
    pub token: u8,
    pub name: Option<String>,
    pub text: Option<String>,
    pub bytes: Option<Vec<u8>>,
}

impl WbxmlValue {
    pub fn new(page: u8, token: u8, name: Option<String>) -> Self {
        Self {
            page,
            token,
            name,
            text: None,
            bytes: None,
        }
    }
}

/// An interior node of the object graph: a bound object and its ordered
/// member values, tagged with the `BindingId` of its schema binding.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundObject {
    pub type_id: BindingId,
    pub fields: Vec<(String, Value)>,
}

impl BoundObject {
    pub fn new(type_id: BindingId) -> Self {
        Self {
            type_id,
            fields: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn set(&mut self, name: &str, value: Value) {
        if let Some(slot) = self.fields.iter_mut().find(|(n, _)| n == name) {
            slot.1 = value;
        } else {
            self.fields.push((name.to_string(), value));
        }
    }

    /// Appends `item` to the collection stored at `name`, creating an empty
    /// collection first if the field is absent (SPEC §4.4: "obtain (or
    /// lazily create and assign) the collection on the parent").
    pub fn push_to_collection(&mut self, name: &str, item: Value) {
        if let Some((_, Value::Collection(items))) =
            self.fields.iter_mut().find(|(n, _)| n == name)
        {
            items.push(item);
        } else {
            self.fields.push((name.to_string(), Value::Collection(vec![item])));
        }
    }
}

/// The runtime object graph (SPEC §3): a tree of typed values with no
/// back-references, so cycles are structurally impossible to construct.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
    Object(BoundObject),
    Collection(Vec<Value>),
    Raw(WbxmlValue),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_object(&self) -> Option<&BoundObject> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut BoundObject> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_collection(&self) -> Option<&[Value]> {
        match self {
            Value::Collection(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }
}
