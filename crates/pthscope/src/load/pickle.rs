//! Pickle reader for `torch.save` archives and raw pickle streams.
//!
//! The stream is executed by [`unpickle`](super::unpickle) and the resulting
//! objects are mapped onto [`Value`]. Tensor payloads are never touched, only
//! the rebuild arguments that carry dtype and shape.

use super::unpickle::{unpickle, Object};
use super::LoadConfig;
use crate::tensor::TensorMeta;
use crate::utils::join_path;
use crate::value::{Mapping, ModuleNode, Scalar, Value};
use crate::{Result, ScopeError};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

const DATA_PKL: &str = "data.pkl";
const CONSTANTS_PKL: &str = "constants.pkl";

/// Storage class, torch dtype name and short dtype name of each element type.
const DTYPES: &[(&str, &str, &str)] = &[
    ("FloatStorage", "float32", "f32"),
    ("DoubleStorage", "float64", "f64"),
    ("HalfStorage", "float16", "f16"),
    ("BFloat16Storage", "bfloat16", "bf16"),
    ("LongStorage", "int64", "i64"),
    ("IntStorage", "int32", "i32"),
    ("ShortStorage", "int16", "i16"),
    ("CharStorage", "int8", "i8"),
    ("ByteStorage", "uint8", "u8"),
    ("BoolStorage", "bool", "bool"),
    ("ComplexFloatStorage", "complex64", "c64"),
    ("ComplexDoubleStorage", "complex128", "c128"),
];

/// Read the root object of a `torch.save` zip archive.
pub fn read_pickle_archive(path: &Path, config: &LoadConfig) -> Result<Value> {
    let file = File::open(path)?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file))?;

    let entry = archive
        .file_names()
        .find(|name| is_entry(name, DATA_PKL))
        .map(str::to_string)
        .ok_or_else(|| ScopeError::Load(format!("archive has no {} entry", DATA_PKL)))?;
    tracing::debug!(entry = %entry, "Reading pickle from archive");

    let reader = archive.by_name(&entry)?;
    parse_pickle(BufReader::new(reader), config)
}

/// Parse one pickle stream and convert its root object.
pub fn parse_pickle<R: BufRead>(mut reader: R, config: &LoadConfig) -> Result<Value> {
    let root = unpickle(&mut reader)?;
    let converter = Converter {
        max_depth: config.max_depth,
    };
    Ok(converter.convert(root, "", 0))
}

/// Whether a zip archive was written by `torch.jit.save`.
pub(super) fn is_torchscript_archive(path: &Path) -> Result<bool> {
    let archive = zip::ZipArchive::new(BufReader::new(File::open(path)?))?;
    let found = archive.file_names().any(|name| is_entry(name, CONSTANTS_PKL));
    Ok(found)
}

fn is_entry(name: &str, file: &str) -> bool {
    name == file || name.strip_suffix(file).is_some_and(|dir| dir.ends_with('/'))
}

struct Converter {
    max_depth: usize,
}

impl Converter {
    /// `path` is the dotted location of `obj`, used in logs.
    fn convert(&self, obj: Object, path: &str, depth: usize) -> Value {
        if depth > self.max_depth {
            tracing::warn!(path, depth, "Nesting too deep, value left unexpanded");
            return Value::Opaque(object_kind(&obj).to_string());
        }

        match obj {
            Object::Dict(pairs) => Value::Mapping(self.mapping(pairs, path, depth)),
            Object::List(items) => Value::List(self.items(items, path, depth)),
            Object::Tuple(items) => Value::Tuple(self.items(items, path, depth)),
            Object::Unicode(s) => Value::Scalar(Scalar::Str(s)),
            Object::Int(i) => Value::Scalar(Scalar::Int(i)),
            Object::Float(f) => Value::Scalar(Scalar::Float(f)),
            Object::Bool(b) => Value::Scalar(Scalar::Bool(b)),
            Object::None => Value::None,
            Object::Reduce { callable, args } => self.reduce(*callable, *args, path),
            Object::Build { callable, args } => self.build(*callable, *args, path, depth),
            other => Value::Opaque(object_kind(&other).to_string()),
        }
    }

    fn mapping(&self, pairs: Vec<(Object, Object)>, path: &str, depth: usize) -> Mapping {
        let mut mapping = Mapping::new();
        for (key, value) in pairs {
            let key = key_string(key);
            let value = self.convert(value, &join_path(path, &key), depth + 1);
            if mapping.insert(key.clone(), value).is_some() {
                tracing::warn!(path, key = %key, "Duplicate key after conversion, keeping the last value");
            }
        }
        mapping
    }

    fn items(&self, items: Vec<Object>, path: &str, depth: usize) -> Vec<Value> {
        items
            .into_iter()
            .enumerate()
            .map(|(i, item)| self.convert(item, &join_path(path, &i.to_string()), depth + 1))
            .collect()
    }

    fn reduce(&self, callable: Object, args: Object, path: &str) -> Value {
        match class_of(&callable) {
            Some((module, class)) if is_tensor_rebuild(module, class) => {
                let meta = decode_tensor(&callable, &args).unwrap_or_else(|reason| {
                    tracing::warn!(path, reason = %reason, "Unreadable tensor metadata");
                    TensorMeta::unreadable(reason)
                });
                Value::Tensor(meta)
            }
            Some((_, class)) => Value::Opaque(class.to_string()),
            None => Value::Opaque(object_kind(&callable).to_string()),
        }
    }

    /// Objects restored through `__setstate__`. Those whose state holds
    /// `_modules` are `torch.nn.Module` instances.
    fn build(&self, target: Object, state: Object, path: &str, depth: usize) -> Value {
        let kind = object_kind(&target).to_string();
        match state {
            Object::Dict(pairs) if has_key(&pairs, "_modules") => {
                Value::Module(self.module(kind, pairs, path, depth))
            }
            _ => Value::Opaque(kind),
        }
    }

    fn module(&self, kind: String, state: Vec<(Object, Object)>, path: &str, depth: usize) -> ModuleNode {
        let mut node = ModuleNode::new(kind);
        for (key, value) in state {
            let key = key_string(key);
            match (key.as_str(), value) {
                ("_parameters", Object::Dict(params)) => {
                    for (name, param) in params {
                        if matches!(param, Object::None) {
                            continue;
                        }
                        let name = key_string(name);
                        let param = self.convert(param, &join_path(path, &name), depth + 1);
                        node.parameters.insert(name, param);
                    }
                }
                ("_modules", Object::Dict(children)) => {
                    for (name, child) in children {
                        let name = key_string(name);
                        let child_path = join_path(path, &name);
                        match self.convert(child, &child_path, depth + 1) {
                            Value::Module(module) => {
                                node.children.insert(name, module);
                            }
                            Value::None => {}
                            other => {
                                tracing::warn!(path = %child_path, kind = other.kind(), "Submodule is not a module object");
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        node
    }
}

/// Dtype and shape from the arguments of a torch tensor rebuild call.
fn decode_tensor(callable: &Object, args: &Object) -> std::result::Result<TensorMeta, String> {
    let name = class_of(callable).map(|(_, class)| class).unwrap_or("?");
    let args = match args {
        Object::Tuple(args) => args.as_slice(),
        other => return Err(format!("{} arguments are a {}", name, other.type_name())),
    };
    let arg = |i: usize| {
        args.get(i)
            .ok_or_else(|| format!("{} is missing argument {}", name, i))
    };

    match name {
        "_rebuild_tensor" | "_rebuild_tensor_v2" => {
            let dtype = storage_dtype(arg(0)?)?;
            Ok(TensorMeta::new(dtype, int_tuple(arg(2)?, name)?))
        }
        "_rebuild_parameter" | "_rebuild_parameter_with_state" => match arg(0)? {
            Object::Reduce { callable, args } => decode_tensor(callable, args),
            other => Err(format!("{} wraps a {}", name, other.type_name())),
        },
        "_rebuild_from_type_v2" => decode_tensor(arg(0)?, arg(2)?),
        "_rebuild_meta_tensor_no_storage" => {
            let dtype = match class_of(arg(0)?) {
                Some(("torch", dtype)) => DTYPES
                    .iter()
                    .find(|(_, torch_name, _)| *torch_name == dtype)
                    .map(|(_, _, short)| *short)
                    .ok_or_else(|| format!("unsupported dtype {}", dtype))?,
                _ => return Err(format!("{} has no dtype", name)),
            };
            Ok(TensorMeta::new(dtype, int_tuple(arg(1)?, name)?))
        }
        other => Err(format!("unsupported tensor rebuild function {}", other)),
    }
}

/// The persistent id of a storage is `('storage', <class>, key, location, numel)`.
fn storage_dtype(storage: &Object) -> std::result::Result<&'static str, String> {
    let class = match storage {
        Object::PersistentLoad(pid) => match pid.as_ref() {
            Object::Tuple(items) => items.get(1).and_then(class_of),
            _ => None,
        },
        _ => None,
    };
    let (_, class) = class.ok_or_else(|| format!("expected a storage, found {}", storage.type_name()))?;
    DTYPES
        .iter()
        .find(|(storage_class, _, _)| *storage_class == class)
        .map(|(_, _, short)| *short)
        .ok_or_else(|| format!("unsupported storage type {}", class))
}

fn int_tuple(obj: &Object, name: &str) -> std::result::Result<Vec<i64>, String> {
    let items = match obj {
        Object::Tuple(items) | Object::List(items) => items,
        other => return Err(format!("{} size is a {}", name, other.type_name())),
    };
    items
        .iter()
        .map(|item| match item {
            Object::Int(i) => Ok(*i),
            other => Err(format!("{} size holds a {}", name, other.type_name())),
        })
        .collect()
}

/// `(module, class)` of a global, or of the object a NEWOBJ/REDUCE created.
fn class_of(obj: &Object) -> Option<(&str, &str)> {
    match obj {
        Object::Class {
            module_name,
            class_name,
        } => Some((module_name.as_str(), class_name.as_str())),
        Object::Reduce { callable, .. } | Object::Build { callable, .. } => class_of(callable),
        _ => None,
    }
}

fn is_tensor_rebuild(module: &str, class: &str) -> bool {
    (module == "torch._utils" && class.starts_with("_rebuild_"))
        || (module == "torch._tensor" && class == "_rebuild_from_type_v2")
}

fn has_key(pairs: &[(Object, Object)], wanted: &str) -> bool {
    pairs
        .iter()
        .any(|(k, _)| matches!(k, Object::Unicode(s) if s == wanted))
}

/// Mapping keys are strings in the object graph; other hashable keys are rendered.
fn key_string(key: Object) -> String {
    match key {
        Object::Unicode(s) => s,
        Object::Int(i) => i.to_string(),
        Object::Float(f) => f.to_string(),
        Object::Bool(true) => "True".to_string(),
        Object::Bool(false) => "False".to_string(),
        Object::None => "None".to_string(),
        Object::Tuple(items) => {
            let parts: Vec<_> = items.into_iter().map(key_string).collect();
            format!("({})", parts.join(", "))
        }
        other => format!("<{}>", object_kind(&other)),
    }
}

fn object_kind(obj: &Object) -> &str {
    match obj {
        Object::Reduce { .. } | Object::Build { .. } => {
            class_of(obj).map(|(_, class)| class).unwrap_or("object")
        }
        other => other.type_name(),
    }
}
