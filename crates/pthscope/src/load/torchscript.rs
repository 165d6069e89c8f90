//! TorchScript archives through libtorch.

use crate::tensor::TensorMeta;
use crate::value::{ModuleNode, Value};
use crate::Result;
use std::path::Path;
use tch::CModule;

/// Class name given to every node; scripted modules do not expose their Python class
const SCRIPT_MODULE: &str = "RecursiveScriptModule";

/// Load a scripted module and rebuild its module tree from parameter paths.
///
/// Submodules without parameters are not visible through libtorch's
/// parameter listing and are therefore missing from the tree.
pub fn read_torchscript(path: &Path) -> Result<Value> {
    let module = CModule::load(path)?;
    let params = module.named_parameters()?;
    tracing::debug!(count = params.len(), "Loaded TorchScript parameters");

    let mut root = ModuleNode::new(SCRIPT_MODULE);
    for (name, tensor) in &params {
        let meta = TensorMeta::of(tensor, format!("{:?}", tensor.kind()).to_lowercase());
        insert_parameter(&mut root, name, meta);
    }
    Ok(Value::Module(root))
}

fn insert_parameter(root: &mut ModuleNode, path: &str, meta: TensorMeta) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let Some(leaf) = segments.pop() else {
        return;
    };

    let mut node = root;
    for segment in segments {
        node = node
            .children
            .get_or_insert_with(segment, || ModuleNode::new(SCRIPT_MODULE));
    }
    node.parameters.insert(leaf, Value::Tensor(meta));
}
