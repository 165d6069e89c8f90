//! # pthscope
//!
//! Structural introspection of machine-learning checkpoints.
//!
//! ## Overview
//!
//! pthscope provides:
//! - A loosely-typed object graph (`Value`) for whatever a checkpoint file holds
//! - Loaders for PyTorch pickle archives, raw pickles and safetensors files
//! - A classifier that turns the object graph into an `AnalysisResult`: key
//!   layout, parameter counts, tensor shapes and, for pickled model objects,
//!   the module hierarchy
//!
//! ## Features
//!
//! - `default` - Pickle and safetensors support (pure Rust)
//! - `torch` - TorchScript archives through libtorch
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pthscope::prelude::*;
//!
//! let config = LoadConfig::default();
//! let document = describe_file("model.pth", &config);
//! println!("{}", document.to_json(ReportStyle::Pretty)?);
//! ```

pub mod classify;
pub mod load;
pub mod model;
pub mod report;
pub mod state;
pub mod tensor;
pub mod utils;
pub mod value;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::classify::{analyze_checkpoint, AnalysisResult, CheckpointShape, Detail, Summary};
    pub use crate::load::{load_checkpoint, CheckpointFormat, LoadConfig};
    pub use crate::model::{describe_model, ModelDescription, ModelObject};
    pub use crate::report::{describe_file, Document, ReportStyle};
    pub use crate::state::{analyze_state_mapping, analyze_tensors, StateMappingAnalysis};
    pub use crate::tensor::{describe_tensor, ShapeError, TensorDescription, TensorLike, TensorMeta};
    pub use crate::value::{Mapping, ModuleNode, OrderedMap, Scalar, Value};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use state::FormatError;
pub use tensor::ShapeError;

/// Error types for the library
#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    #[error("{0}")]
    Load(String),

    #[error("Shape error: {0}")]
    Shape(#[from] ShapeError),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("Failed to write {}: {source}", path.display())]
    Write {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Pickle error: {0}")]
    Pickle(#[from] crate::load::PickleError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "torch")]
    #[error("Tensor error: {0}")]
    Tensor(#[from] tch::TchError),
}

pub type Result<T> = std::result::Result<T, ScopeError>;
