//! Output document: the analysis wrapped with the file it came from.

use crate::classify::{analyze_checkpoint, AnalysisResult};
use crate::load::{load_checkpoint, LoadConfig};
use crate::{Result, ScopeError};
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::fs;
use std::path::Path;

/// Prefix of the whole-document error when the checkpoint cannot be loaded.
pub const LOAD_ERROR_PREFIX: &str = "Failed to load .pth file: ";

/// JSON layout of the rendered document.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReportStyle {
    /// Four-space indentation
    #[default]
    Pretty,
    Compact,
}

/// The document handed to the output layer.
#[derive(Clone, Debug, PartialEq)]
pub enum Document {
    Analysis {
        file_path: String,
        result: AnalysisResult,
    },
    /// Loading failed; nothing else was computed
    Failed { error: String },
}

impl Serialize for Document {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Document::Analysis { file_path, result } => {
                let mut map = serializer.serialize_map(Some(4))?;
                map.serialize_entry("file_path", file_path)?;
                map.serialize_entry("keys", &result.keys)?;
                map.serialize_entry("details", &result.details)?;
                map.serialize_entry("summary", &result.summary)?;
                map.end()
            }
            Document::Failed { error } => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("error", error)?;
                map.end()
            }
        }
    }
}

impl Document {
    pub fn new(file_path: impl Into<String>, result: AnalysisResult) -> Self {
        Document::Analysis {
            file_path: file_path.into(),
            result,
        }
    }

    /// Document for a checkpoint the loader could not read.
    pub fn load_failed(error: &ScopeError) -> Self {
        Document::Failed {
            error: format!("{}{}", LOAD_ERROR_PREFIX, error),
        }
    }

    pub fn result(&self) -> Option<&AnalysisResult> {
        match self {
            Document::Analysis { result, .. } => Some(result),
            Document::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Document::Analysis { .. } => None,
            Document::Failed { error } => Some(error),
        }
    }

    /// Render as JSON.
    pub fn to_json(&self, style: ReportStyle) -> Result<String> {
        let json = match style {
            ReportStyle::Compact => serde_json::to_string(self)?,
            ReportStyle::Pretty => {
                let mut buf = Vec::new();
                let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
                let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
                self.serialize(&mut ser)?;
                String::from_utf8_lossy(&buf).into_owned()
            }
        };
        Ok(json)
    }

    /// Render and write to `path`, replacing any existing file.
    pub fn write_to(&self, path: impl AsRef<Path>, style: ReportStyle) -> Result<()> {
        let path = path.as_ref();
        let json = self.to_json(style)?;
        fs::write(path, json).map_err(|source| ScopeError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "Wrote report");
        Ok(())
    }
}

/// Load a checkpoint and describe it.
///
/// Never fails: a load error becomes a single-field error document.
pub fn describe_file(path: impl AsRef<Path>, config: &LoadConfig) -> Document {
    let path = path.as_ref();
    match load_checkpoint(path, config) {
        Ok(checkpoint) => Document::new(path.display().to_string(), analyze_checkpoint(&checkpoint)),
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Failed to load checkpoint");
            Document::load_failed(&e)
        }
    }
}
