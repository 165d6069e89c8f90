//! Checkpoint loaders.
//!
//! Provides:
//! - `LoadConfig` for choosing the container format and conversion limits
//! - `load_checkpoint` to turn a file into a [`Value`]
//! - Pickle (PyTorch zip archives and raw pickle streams), safetensors and,
//!   with the `torch` feature, TorchScript readers

mod pickle;
mod safetensors;
mod unpickle;
#[cfg(feature = "torch")]
mod torchscript;

use crate::value::Value;
use crate::{Result, ScopeError};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

pub use pickle::{parse_pickle, read_pickle_archive};
pub use safetensors::read_safetensors;
pub use unpickle::PickleError;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const PICKLE_PROTO: u8 = 0x80;
/// Protocol-2 header followed by the LONG1 magic number of the pre-1.6 torch format
const LEGACY_TORCH_MAGIC: &[u8] = &[
    0x80, 0x02, 0x8a, 0x0a, 0x6c, 0xfc, 0x9c, 0x46, 0xf9, 0x20, 0x6a, 0xa8, 0x50, 0x19,
];

/// Container format of a checkpoint file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CheckpointFormat {
    /// Decide from the extension and the leading bytes
    #[default]
    Auto,
    /// `torch.save` zip archive or a raw pickle stream
    Pickle,
    Safetensors,
    /// `torch.jit.save` archive (requires the `torch` feature)
    TorchScript,
}

impl fmt::Display for CheckpointFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CheckpointFormat::Auto => "auto",
            CheckpointFormat::Pickle => "pickle",
            CheckpointFormat::Safetensors => "safetensors",
            CheckpointFormat::TorchScript => "torchscript",
        };
        f.write_str(name)
    }
}

impl FromStr for CheckpointFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(CheckpointFormat::Auto),
            "pickle" | "pth" | "pt" => Ok(CheckpointFormat::Pickle),
            "safetensors" => Ok(CheckpointFormat::Safetensors),
            "torchscript" | "jit" => Ok(CheckpointFormat::TorchScript),
            other => Err(format!(
                "unknown format '{}' (expected auto, pickle, safetensors or torchscript)",
                other
            )),
        }
    }
}

/// Configuration for loading checkpoints.
#[derive(Clone, Debug)]
pub struct LoadConfig {
    /// Container format
    pub format: CheckpointFormat,
    /// Deepest nesting converted from a pickle; deeper values become opaque
    pub max_depth: usize,
    /// Memory-map safetensors files instead of reading them into memory
    pub mmap: bool,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            format: CheckpointFormat::Auto,
            max_depth: 128,
            mmap: true,
        }
    }
}

impl LoadConfig {
    /// Create a config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the container format.
    pub fn format(mut self, format: CheckpointFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the maximum pickle nesting depth.
    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// Enable/disable memory mapping.
    pub fn mmap(mut self, enabled: bool) -> Self {
        self.mmap = enabled;
        self
    }
}

/// Load a checkpoint file into an object graph.
pub fn load_checkpoint(path: impl AsRef<Path>, config: &LoadConfig) -> Result<Value> {
    let path = path.as_ref();
    let format = match config.format {
        CheckpointFormat::Auto => detect_format(path)?,
        explicit => explicit,
    };
    tracing::debug!(path = %path.display(), %format, "Loading checkpoint");

    match format {
        CheckpointFormat::Safetensors => read_safetensors(path, config),
        CheckpointFormat::TorchScript => load_torchscript(path),
        CheckpointFormat::Pickle | CheckpointFormat::Auto => load_pickle(path, config),
    }
}

fn load_pickle(path: &Path, config: &LoadConfig) -> Result<Value> {
    let head = read_head(path)?;
    if head.starts_with(ZIP_MAGIC) {
        read_pickle_archive(path, config)
    } else if head.starts_with(LEGACY_TORCH_MAGIC) {
        Err(ScopeError::Load(
            "legacy (pre-1.6) torch serialization is not supported; re-save the checkpoint with a recent torch".into(),
        ))
    } else if head.first() == Some(&PICKLE_PROTO) {
        let file = File::open(path)?;
        parse_pickle(std::io::BufReader::new(file), config)
    } else {
        Err(ScopeError::Load(
            "not a zip archive or pickle stream".into(),
        ))
    }
}

#[cfg(feature = "torch")]
fn load_torchscript(path: &Path) -> Result<Value> {
    torchscript::read_torchscript(path)
}

#[cfg(not(feature = "torch"))]
fn load_torchscript(_path: &Path) -> Result<Value> {
    Err(ScopeError::Load(
        "TorchScript archives require the 'torch' feature".into(),
    ))
}

/// Pick a format from the extension and the first bytes of the file.
fn detect_format(path: &Path) -> Result<CheckpointFormat> {
    let is_safetensors = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("safetensors"))
        .unwrap_or(false);
    if is_safetensors {
        return Ok(CheckpointFormat::Safetensors);
    }

    let head = read_head(path)?;
    if head.starts_with(ZIP_MAGIC) && cfg!(feature = "torch") && pickle::is_torchscript_archive(path)? {
        return Ok(CheckpointFormat::TorchScript);
    }
    if head.starts_with(ZIP_MAGIC) || head.first() == Some(&PICKLE_PROTO) {
        return Ok(CheckpointFormat::Pickle);
    }
    if safetensors::looks_like_safetensors(&head) {
        return Ok(CheckpointFormat::Safetensors);
    }
    Err(ScopeError::Load(
        "unrecognized checkpoint format (expected a torch.save archive, a pickle or a safetensors file)".into(),
    ))
}

fn read_head(path: &Path) -> Result<Vec<u8>> {
    let mut head = Vec::with_capacity(LEGACY_TORCH_MAGIC.len());
    File::open(path)?
        .take(LEGACY_TORCH_MAGIC.len() as u64)
        .read_to_end(&mut head)?;
    Ok(head)
}
