//! State-mapping analyzer: parameter totals and per-key shapes of a flat
//! name -> tensor mapping.

use crate::tensor::{describe_tensor, TensorLike};
use crate::value::{OrderedMap, Value};
use serde::Serialize;

/// Message reported when a value expected to be mapping-shaped is not.
pub const INVALID_FORMAT: &str = "Invalid format. Expected a dictionary-like object.";

/// A value expected to be mapping-shaped was something else.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid format. Expected a dictionary-like object.")]
pub struct FormatError {
    /// Type name of the offending value
    pub found: String,
}

impl FormatError {
    pub fn new(found: impl Into<String>) -> Self {
        Self {
            found: found.into(),
        }
    }
}

/// Shape of one entry, or the reason it could not be computed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ShapeEntry {
    Shape(Vec<usize>),
    Error { error: String },
}

impl ShapeEntry {
    pub fn shape(&self) -> Option<&[usize]> {
        match self {
            ShapeEntry::Shape(s) => Some(s),
            ShapeEntry::Error { .. } => None,
        }
    }
}

/// Aggregate description of a state mapping.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StateMappingAnalysis {
    pub num_parameters: u64,
    pub parameter_shapes: OrderedMap<ShapeEntry>,
    /// Set when some entries could not be counted; `num_parameters` is then partial
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Analyze any sequence of named tensor-like values.
///
/// The total is a raw sum: a tensor reachable under two keys is counted twice.
pub fn analyze_tensors<'a, T, I>(entries: I) -> StateMappingAnalysis
where
    T: TensorLike + ?Sized + 'a,
    I: IntoIterator<Item = (&'a str, &'a T)>,
{
    let mut analysis = StateMappingAnalysis::default();
    let mut failures = Failures::default();

    for (key, value) in entries {
        let entry = match describe_tensor(value) {
            Ok(desc) => {
                match analysis.num_parameters.checked_add(desc.num_elements) {
                    Some(total) => analysis.num_parameters = total,
                    None => {
                        tracing::warn!(key, "Parameter total overflows, entry left out");
                        failures.record(format!("Failed to count '{}': total parameter count overflows", key));
                    }
                }
                ShapeEntry::Shape(desc.shape)
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "Skipping entry in parameter count");
                failures.record(format!("Failed to describe '{}': {}", key, e));
                ShapeEntry::Error {
                    error: e.to_string(),
                }
            }
        };
        analysis.parameter_shapes.insert(key, entry);
    }

    analysis.error = failures.message();
    analysis
}

/// First failure message and how many entries failed in total.
#[derive(Default)]
struct Failures {
    first: Option<String>,
    count: usize,
}

impl Failures {
    fn record(&mut self, message: String) {
        self.first.get_or_insert(message);
        self.count += 1;
    }

    fn message(self) -> Option<String> {
        let first = self.first?;
        Some(match self.count {
            0 | 1 => first,
            n => format!("{} (and {} more)", first, n - 1),
        })
    }
}

/// Analyze a value expected to be a state mapping.
pub fn analyze_state_mapping(value: &Value) -> Result<StateMappingAnalysis, FormatError> {
    let mapping = value
        .as_mapping()
        .ok_or_else(|| FormatError::new(value.kind()))?;
    Ok(analyze_tensors(mapping.iter()))
}
