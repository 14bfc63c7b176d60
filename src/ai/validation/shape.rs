//! Expected Output Shape
//!
//! Describes what a structured response must look like: the root kind and
//! the fields that must be present. Missing required fields are filled with
//! the `UNKNOWN` sentinel so downstream consumers never see a hole.

use serde_json::{Map, Value};

use crate::constants::repair::UNKNOWN_SENTINEL;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootKind {
    Object,
    Array,
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct NestedList {
    field: String,
    required: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedShape {
    root: RootKind,
    required: Vec<String>,
    nested: Vec<NestedList>,
}

impl Default for ExpectedShape {
    fn default() -> Self {
        Self::any()
    }
}

impl ExpectedShape {
    pub fn any() -> Self {
        Self {
            root: RootKind::Any,
            required: Vec::new(),
            nested: Vec::new(),
        }
    }

    /// Object root with the given required top-level fields
    pub fn object(required: &[&str]) -> Self {
        Self {
            root: RootKind::Object,
            required: required.iter().map(|s| s.to_string()).collect(),
            nested: Vec::new(),
        }
    }

    /// Array root whose object elements carry the given required fields
    pub fn array_of(required: &[&str]) -> Self {
        Self {
            root: RootKind::Array,
            required: required.iter().map(|s| s.to_string()).collect(),
            nested: Vec::new(),
        }
    }

    /// Object field holding a list of objects with their own required fields
    pub fn with_list(mut self, field: &str, required: &[&str]) -> Self {
        self.nested.push(NestedList {
            field: field.to_string(),
            required: required.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    pub fn root(&self) -> RootKind {
        self.root
    }

    pub fn matches_root(&self, value: &Value) -> bool {
        match self.root {
            RootKind::Any => value.is_object() || value.is_array(),
            RootKind::Object => value.is_object(),
            RootKind::Array => value.is_array(),
        }
    }

    /// Fill missing or null required fields. Returns the paths filled.
    pub fn fill(&self, value: &mut Value) -> Vec<String> {
        let mut filled = Vec::new();
        match value {
            Value::Object(map) => {
                fill_object(map, &self.required, "", &mut filled);
                for list in &self.nested {
                    match map.get_mut(&list.field) {
                        Some(Value::Array(items)) => {
                            for (i, item) in items.iter_mut().enumerate() {
                                if let Value::Object(obj) = item {
                                    let prefix = format!("{}[{}].", list.field, i);
                                    fill_object(obj, &list.required, &prefix, &mut filled);
                                }
                            }
                        }
                        Some(Value::Null) | None => {
                            map.insert(list.field.clone(), Value::Array(Vec::new()));
                            filled.push(list.field.clone());
                        }
                        Some(_) => {}
                    }
                }
            }
            Value::Array(items) if self.root == RootKind::Array => {
                for (i, item) in items.iter_mut().enumerate() {
                    if let Value::Object(obj) = item {
                        let prefix = format!("[{}].", i);
                        fill_object(obj, &self.required, &prefix, &mut filled);
                    }
                }
            }
            _ => {}
        }
        filled
    }
}

fn fill_object(
    map: &mut Map<String, Value>,
    required: &[String],
    prefix: &str,
    filled: &mut Vec<String>,
) {
    for field in required {
        let missing = matches!(map.get(field), None | Some(Value::Null));
        if missing {
            map.insert(field.clone(), Value::String(UNKNOWN_SENTINEL.to_string()));
            filled.push(format!("{}{}", prefix, field));
        }
    }
}
