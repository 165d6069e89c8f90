//! Loosely-typed object graph of a loaded checkpoint.
//!
//! Loaders turn files into a [`Value`]; the analyzers only ever borrow it.

use crate::tensor::{ShapeError, TensorLike, TensorMeta};
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::collections::HashMap;

/// String-keyed map that keeps insertion order.
#[derive(Clone, Debug)]
pub struct OrderedMap<V> {
    entries: Vec<(String, V)>,
    index: HashMap<String, usize>,
}

impl<V> Default for OrderedMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> OrderedMap<V> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Insert a value. An existing key keeps its position and the old value is returned.
    pub fn insert(&mut self, key: impl Into<String>, value: V) -> Option<V> {
        let key = key.into();
        match self.index.get(&key) {
            Some(&i) => Some(std::mem::replace(&mut self.entries[i].1, value)),
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.index.get(key).map(|&i| &self.entries[i].1)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut V> {
        match self.index.get(key) {
            Some(&i) => Some(&mut self.entries[i].1),
            None => None,
        }
    }

    /// Value under `key`, inserting `default()` at the end when absent.
    pub fn get_or_insert_with(&mut self, key: &str, default: impl FnOnce() -> V) -> &mut V {
        let i = match self.index.get(key) {
            Some(&i) => i,
            None => {
                self.insert(key, default());
                self.entries.len() - 1
            }
        };
        &mut self.entries[i].1
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.iter().map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V: PartialEq> PartialEq for OrderedMap<V> {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl<K: Into<String>, V> FromIterator<(K, V)> for OrderedMap<V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl<V: Serialize> Serialize for OrderedMap<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// Mapping from string key to arbitrary value.
pub type Mapping = OrderedMap<Value>;

/// Scalar leaf values.
#[derive(Clone, Debug, PartialEq)]
pub enum Scalar {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl Scalar {
    pub fn kind(&self) -> &'static str {
        match self {
            Scalar::Int(_) => "int",
            Scalar::Float(_) => "float",
            Scalar::Bool(_) => "bool",
            Scalar::Str(_) => "str",
        }
    }
}

impl Serialize for Scalar {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Scalar::Int(i) => serializer.serialize_i64(*i),
            Scalar::Float(f) => serializer.serialize_f64(*f),
            Scalar::Bool(b) => serializer.serialize_bool(*b),
            Scalar::Str(s) => serializer.serialize_str(s),
        }
    }
}

/// A node of a pickled model's module tree.
#[derive(Clone, Debug, PartialEq)]
pub struct ModuleNode {
    /// Class name, e.g. `Linear` or `Sequential`
    pub kind: String,
    /// Directly owned parameters, in declaration order
    pub parameters: OrderedMap<Value>,
    /// Direct submodules, in declaration order
    pub children: OrderedMap<ModuleNode>,
}

impl ModuleNode {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            parameters: OrderedMap::new(),
            children: OrderedMap::new(),
        }
    }

    /// Add a parameter (builder style).
    pub fn with_parameter(mut self, name: impl Into<String>, tensor: TensorMeta) -> Self {
        self.parameters.insert(name, Value::Tensor(tensor));
        self
    }

    /// Add a submodule (builder style).
    pub fn with_child(mut self, name: impl Into<String>, child: ModuleNode) -> Self {
        self.children.insert(name, child);
        self
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// A deserialized checkpoint object.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Tensor(TensorMeta),
    Mapping(Mapping),
    Module(ModuleNode),
    Scalar(Scalar),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    None,
    /// Any other object, tagged with its class name
    Opaque(String),
}

impl Value {
    /// Python-style type name of the value, as reported for unrecognized keys.
    pub fn kind(&self) -> &str {
        match self {
            Value::Tensor(_) => "Tensor",
            Value::Mapping(_) => "dict",
            Value::Module(m) => &m.kind,
            Value::Scalar(s) => s.kind(),
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::None => "NoneType",
            Value::Opaque(kind) => kind,
        }
    }

    pub fn as_mapping(&self) -> Option<&Mapping> {
        match self {
            Value::Mapping(m) => Some(m),
            _ => None,
        }
    }

    pub fn is_tensor(&self) -> bool {
        matches!(self, Value::Tensor(_))
    }
}

impl TensorLike for Value {
    fn shape(&self) -> Result<Vec<usize>, ShapeError> {
        match self {
            Value::Tensor(t) => t.shape(),
            other => Err(ShapeError::NotTensor {
                kind: other.kind().to_string(),
            }),
        }
    }
}

impl From<TensorMeta> for Value {
    fn from(t: TensorMeta) -> Self {
        Value::Tensor(t)
    }
}

impl From<Mapping> for Value {
    fn from(m: Mapping) -> Self {
        Value::Mapping(m)
    }
}

impl From<ModuleNode> for Value {
    fn from(m: ModuleNode) -> Self {
        Value::Module(m)
    }
}

impl From<Scalar> for Value {
    fn from(s: Scalar) -> Self {
        Value::Scalar(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordered_map_keeps_insertion_order() {
        let mut map = OrderedMap::new();
        map.insert("z", 1);
        map.insert("a", 2);
        map.insert("m", 3);
        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["z", "a", "m"]);
        assert_eq!(map.get("a"), Some(&2));
        assert!(!map.contains_key("b"));
    }

    #[test]
    fn test_ordered_map_replace_keeps_position() {
        let mut map: OrderedMap<i32> = [("a", 1), ("b", 2)].into_iter().collect();
        assert_eq!(map.insert("a", 10), Some(1));
        assert_eq!(map.len(), 2);
        assert_eq!(map.iter().collect::<Vec<_>>(), vec![("a", &10), ("b", &2)]);
    }

    #[test]
    fn test_get_or_insert_with() {
        let mut map: OrderedMap<Vec<i32>> = OrderedMap::new();
        map.get_or_insert_with("a", Vec::new).push(1);
        map.get_or_insert_with("a", Vec::new).push(2);
        map.get_or_insert_with("b", || vec![9]);
        assert_eq!(map.get("a"), Some(&vec![1, 2]));
        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        if let Some(b) = map.get_mut("b") {
            b.clear();
        }
        assert_eq!(map.get("b"), Some(&vec![]));
    }

    #[test]
    fn test_ordered_map_serializes_in_order() {
        let map: OrderedMap<i32> = [("beta", 1), ("alpha", 2)].into_iter().collect();
        assert_eq!(serde_json::to_string(&map).unwrap(), r#"{"beta":1,"alpha":2}"#);
    }

    #[test]
    fn test_value_kinds() {
        assert_eq!(Value::Tensor(TensorMeta::new("f32", vec![1])).kind(), "Tensor");
        assert_eq!(Value::Mapping(Mapping::new()).kind(), "dict");
        assert_eq!(Value::Module(ModuleNode::new("Conv2d")).kind(), "Conv2d");
        assert_eq!(Value::Scalar(Scalar::Float(0.5)).kind(), "float");
        assert_eq!(Value::List(vec![]).kind(), "list");
        assert_eq!(Value::None.kind(), "NoneType");
        assert_eq!(Value::Opaque("Namespace".into()).kind(), "Namespace");
    }

    #[test]
    fn test_non_tensor_value_is_shape_error() {
        let v = Value::Scalar(Scalar::Str("adam".into()));
        assert_eq!(
            v.shape(),
            Err(ShapeError::NotTensor { kind: "str".into() })
        );
        let t = Value::from(TensorMeta::new("f32", vec![3, 4]));
        assert_eq!(t.numel().unwrap(), 12);
    }

    #[test]
    fn test_scalar_serialization() {
        assert_eq!(serde_json::to_string(&Scalar::Int(42)).unwrap(), "42");
        assert_eq!(serde_json::to_string(&Scalar::Float(0.25)).unwrap(), "0.25");
        assert_eq!(serde_json::to_string(&Scalar::Bool(true)).unwrap(), "true");
        assert_eq!(
            serde_json::to_string(&Scalar::Str("resnet".into())).unwrap(),
            r#""resnet""#
        );
    }
}
