//! Safetensors header reader.
//!
//! Only the JSON header is parsed; tensor data is never read.

use super::LoadConfig;
use crate::tensor::TensorMeta;
use crate::value::{Mapping, Value};
use crate::{Result, ScopeError};
use memmap2::Mmap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

const METADATA_KEY: &str = "__metadata__";
/// Headers above this size are rejected before allocating
const MAX_HEADER_SIZE: u64 = 100_000_000;

/// Read a safetensors file as a flat mapping of tensor metadata.
pub fn read_safetensors(path: &Path, config: &LoadConfig) -> Result<Value> {
    let file = File::open(path)?;

    if config.mmap {
        // Safety: the mapping is read-only and dropped before returning
        let mmap = unsafe { Mmap::map(&file)? };
        parse_header(&mmap)
    } else {
        let mut bytes = Vec::new();
        (&file).read_to_end(&mut bytes)?;
        parse_header(&bytes)
    }
}

/// Parse the length-prefixed JSON header of a safetensors buffer.
pub(super) fn parse_header(bytes: &[u8]) -> Result<Value> {
    let header_size = header_size(bytes)
        .ok_or_else(|| ScopeError::Load(format!("safetensors file too small: {} bytes", bytes.len())))?;

    if header_size > MAX_HEADER_SIZE || header_size as usize > bytes.len() - 8 {
        return Err(ScopeError::Load(format!(
            "invalid safetensors header size: {} (file size: {})",
            header_size,
            bytes.len()
        )));
    }

    let header: serde_json::Value = serde_json::from_slice(&bytes[8..8 + header_size as usize])?;
    let entries = header
        .as_object()
        .ok_or_else(|| ScopeError::Load("safetensors header is not a JSON object".into()))?;

    let mut mapping = Mapping::new();
    for (name, info) in entries {
        if name == METADATA_KEY {
            tracing::debug!("Skipping safetensors metadata block");
            continue;
        }
        mapping.insert(name.as_str(), Value::Tensor(tensor_meta(name, info)));
    }
    Ok(Value::Mapping(mapping))
}

fn tensor_meta(name: &str, info: &serde_json::Value) -> TensorMeta {
    let dtype = info.get("dtype").and_then(|d| d.as_str());
    let shape = info.get("shape").and_then(|s| s.as_array());

    let (Some(dtype), Some(shape)) = (dtype, shape) else {
        tracing::warn!(tensor = name, "Tensor entry lacks dtype or shape");
        return TensorMeta::unreadable("tensor entry lacks dtype or shape");
    };

    let dims: Option<Vec<i64>> = shape.iter().map(|d| d.as_i64()).collect();
    match dims {
        Some(dims) => TensorMeta::new(dtype.to_ascii_lowercase(), dims),
        None => {
            tracing::warn!(tensor = name, "Non-integer dimension in tensor shape");
            TensorMeta::unreadable(format!("non-integer dimension in shape {}", serde_json::Value::Array(shape.clone())))
        }
    }
}

fn header_size(bytes: &[u8]) -> Option<u64> {
    let prefix: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
    Some(u64::from_le_bytes(prefix))
}

/// Cheap sniff for files without the `.safetensors` extension.
pub(super) fn looks_like_safetensors(head: &[u8]) -> bool {
    matches!(header_size(head), Some(n) if n > 1 && n <= MAX_HEADER_SIZE) && head.get(8) == Some(&b'{')
}
