//! Checkpoint classifier: top-level dispatch and summary assembly.
//!
//! The shape of the loaded object is decided once, by [`CheckpointShape::of`].
//! Everything below that point works on a known variant.

use crate::model::{describe_model, ModelDescription};
use crate::state::{analyze_state_mapping, StateMappingAnalysis, INVALID_FORMAT};
use crate::value::{Mapping, ModuleNode, OrderedMap, Scalar, Value};
use serde::ser::{Serialize, SerializeMap, Serializer};

pub const STATE_DICT_KEY: &str = "state_dict";
pub const OPTIMIZER_KEY: &str = "optimizer";
pub const PARAMS_KEY: &str = "params";
pub const PARAMS_EMA_KEY: &str = "params_ema";
pub const MODEL_KEY: &str = "model";

/// Keys with dedicated analysis in a composite container.
pub const RECOGNIZED_KEYS: [&str; 4] = [STATE_DICT_KEY, OPTIMIZER_KEY, PARAMS_KEY, PARAMS_EMA_KEY];

const NOT_FOUND: &str = "Not found";

/// How the top-level object is treated.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CheckpointShape<'a> {
    /// Raw state mapping, or anything that is neither a container nor a model
    Flat(&'a Value),
    /// Pickled model object
    Model(&'a ModuleNode),
    /// Mapping with auxiliary keys or non-tensor values
    Composite(&'a Mapping),
}

impl<'a> CheckpointShape<'a> {
    pub fn of(value: &'a Value) -> Self {
        match value {
            Value::Module(module) => CheckpointShape::Model(module),
            Value::Mapping(mapping) if is_flat(mapping) => CheckpointShape::Flat(value),
            Value::Mapping(mapping) => CheckpointShape::Composite(mapping),
            other => CheckpointShape::Flat(other),
        }
    }
}

/// A flat mapping holds only tensors and none of the recognized keys.
fn is_flat(mapping: &Mapping) -> bool {
    !mapping.is_empty()
        && mapping.values().all(Value::is_tensor)
        && !RECOGNIZED_KEYS.iter().any(|k| mapping.contains_key(k))
}

/// Analysis of one entry of `details`.
#[derive(Clone, Debug, PartialEq)]
pub enum Detail {
    StateMapping(StateMappingAnalysis),
    Model(ModelDescription),
    Optimizer { keys: Vec<String> },
    NotFound,
    Scalar(Scalar),
    MappingSize(usize),
    TypeTag(String),
    Error(String),
}

impl Serialize for Detail {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Detail::StateMapping(analysis) => analysis.serialize(serializer),
            Detail::Model(desc) => desc.serialize(serializer),
            Detail::Optimizer { keys } => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("keys", keys)?;
                map.end()
            }
            Detail::NotFound => serializer.serialize_str(NOT_FOUND),
            Detail::Scalar(scalar) => scalar.serialize(serializer),
            Detail::MappingSize(n) => {
                serializer.serialize_str(&format!("Dictionary with {} keys", n))
            }
            Detail::TypeTag(kind) => serializer.serialize_str(&format!("Type: {}", kind)),
            Detail::Error(message) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("error", message)?;
                map.end()
            }
        }
    }
}

impl From<Result<StateMappingAnalysis, crate::FormatError>> for Detail {
    fn from(outcome: Result<StateMappingAnalysis, crate::FormatError>) -> Self {
        match outcome {
            Ok(analysis) => Detail::StateMapping(analysis),
            Err(e) => {
                tracing::warn!(found = %e.found, "Expected a state mapping");
                Detail::Error(e.to_string())
            }
        }
    }
}

/// Flags derived from the key list.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct Summary {
    pub num_keys: usize,
    pub has_params_ema: bool,
    pub has_params: bool,
    pub has_optimizer: bool,
}

impl Summary {
    fn from_keys(keys: &[String]) -> Self {
        let has = |name: &str| keys.iter().any(|k| k == name);
        Self {
            num_keys: keys.len(),
            has_params_ema: has(PARAMS_EMA_KEY),
            has_params: has(PARAMS_KEY),
            has_optimizer: has(OPTIMIZER_KEY),
        }
    }
}

/// Structural summary of a checkpoint.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct AnalysisResult {
    pub keys: Vec<String>,
    pub details: OrderedMap<Detail>,
    pub summary: Summary,
}

impl AnalysisResult {
    /// Parameter count of the primary weights: the first analyzed state
    /// mapping or model in `details`.
    pub fn num_parameters(&self) -> Option<u64> {
        self.details.values().find_map(|detail| match detail {
            Detail::StateMapping(analysis) => Some(analysis.num_parameters),
            Detail::Model(model) => Some(model.num_parameters),
            _ => None,
        })
    }
}

/// Classify a loaded checkpoint and analyze each of its sections.
///
/// Never fails: problems are recorded as `error` entries scoped to the
/// section they affect.
pub fn analyze_checkpoint(checkpoint: &Value) -> AnalysisResult {
    let shape = CheckpointShape::of(checkpoint);
    tracing::debug!(shape = shape.label(), "Classified checkpoint");

    let (keys, details) = match shape {
        CheckpointShape::Flat(value) => {
            let mut details = OrderedMap::new();
            details.insert(STATE_DICT_KEY, Detail::from(analyze_state_mapping(value)));
            (vec![STATE_DICT_KEY.to_string()], details)
        }
        CheckpointShape::Model(module) => {
            let mut details = OrderedMap::new();
            details.insert(MODEL_KEY, Detail::Model(describe_model(module)));
            (vec![STATE_DICT_KEY.to_string()], details)
        }
        CheckpointShape::Composite(mapping) => (
            mapping.keys().map(str::to_string).collect(),
            composite_details(mapping),
        ),
    };

    let summary = Summary::from_keys(&keys);
    AnalysisResult {
        keys,
        details,
        summary,
    }
}

impl CheckpointShape<'_> {
    fn label(&self) -> &'static str {
        match self {
            CheckpointShape::Flat(_) => "flat",
            CheckpointShape::Model(_) => "model",
            CheckpointShape::Composite(_) => "composite",
        }
    }
}

fn composite_details(mapping: &Mapping) -> OrderedMap<Detail> {
    let mut details = OrderedMap::new();

    let state_dict = match mapping.get(STATE_DICT_KEY) {
        Some(value) => Detail::from(analyze_state_mapping(value)),
        None => Detail::NotFound,
    };
    details.insert(STATE_DICT_KEY, state_dict);

    let optimizer = match mapping.get(OPTIMIZER_KEY) {
        Some(Value::Mapping(state)) => Detail::Optimizer {
            keys: state.keys().map(str::to_string).collect(),
        },
        Some(_) => Detail::Error(INVALID_FORMAT.to_string()),
        None => Detail::NotFound,
    };
    details.insert(OPTIMIZER_KEY, optimizer);

    // EMA weights win over raw params; only one of the two is analyzed
    if let Some(ema) = mapping.get(PARAMS_EMA_KEY) {
        details.insert(PARAMS_EMA_KEY, Detail::from(analyze_state_mapping(ema)));
    } else if let Some(params) = mapping.get(PARAMS_KEY) {
        details.insert(PARAMS_KEY, Detail::from(analyze_state_mapping(params)));
    }

    for (key, value) in mapping.iter() {
        if RECOGNIZED_KEYS.iter().any(|k| *k == key) {
            continue;
        }
        details.insert(key, classify_other(value));
    }

    details
}

/// Coarse description of a value under an unrecognized key.
fn classify_other(value: &Value) -> Detail {
    match value {
        Value::Scalar(scalar) => Detail::Scalar(scalar.clone()),
        Value::Mapping(mapping) => Detail::MappingSize(mapping.len()),
        other => Detail::TypeTag(other.kind().to_string()),
    }
}
