//! Model-object descriptor: parameter count, module hierarchy and leaf
//! layers of a full model object.

use crate::tensor::TensorLike;
use crate::utils::join_path;
use crate::value::{ModuleNode, Value};
use serde::Serialize;

/// One node yielded by [`ModelObject::named_modules`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamedModule<'a> {
    /// Dotted path from the root; the root itself is `""`
    pub name: String,
    pub kind: &'a str,
    pub num_children: usize,
    pub num_parameters: usize,
}

/// A model exposing its parameters and its submodule tree.
pub trait ModelObject {
    type Param: TensorLike;

    /// Every parameter reachable from the root, root included.
    fn parameters(&self) -> Vec<&Self::Param>;

    /// All modules in depth-first declaration order, root first.
    fn named_modules(&self) -> Vec<NamedModule<'_>>;
}

impl ModelObject for ModuleNode {
    type Param = Value;

    fn parameters(&self) -> Vec<&Value> {
        let mut params = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            params.extend(node.parameters.values());
            // reversed so children are visited in declaration order
            let children: Vec<_> = node.children.values().collect();
            stack.extend(children.into_iter().rev());
        }
        params
    }

    fn named_modules(&self) -> Vec<NamedModule<'_>> {
        let mut out = Vec::new();
        let mut stack = vec![(String::new(), self)];
        while let Some((name, node)) = stack.pop() {
            let children: Vec<_> = node
                .children
                .iter()
                .map(|(child, module)| (join_path(&name, child), module))
                .collect();
            out.push(NamedModule {
                name,
                kind: &node.kind,
                num_children: node.children.len(),
                num_parameters: node.parameters.len(),
            });
            stack.extend(children.into_iter().rev());
        }
        out
    }
}

/// `{name, type}` row of the module hierarchy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ModuleSummary {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Structural description of a model object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ModelDescription {
    pub num_parameters: u64,
    pub layer_names: Vec<String>,
    pub num_layers: usize,
    pub module_hierarchy: Vec<ModuleSummary>,
    /// Set when some parameters could not be counted; `num_parameters` is then partial
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Describe a model object.
///
/// A node without children is a leaf layer. The root goes through the same
/// test, except that a root owning neither children nor parameters (an empty
/// model) is not counted as a layer.
pub fn describe_model<M: ModelObject + ?Sized>(model: &M) -> ModelDescription {
    let mut desc = ModelDescription::default();

    for param in model.parameters() {
        match param.numel() {
            Ok(n) => match desc.num_parameters.checked_add(n) {
                Some(total) => desc.num_parameters = total,
                None => {
                    tracing::warn!("Parameter total overflows, parameter left out");
                    desc.error
                        .get_or_insert_with(|| "Failed to count parameter: total parameter count overflows".to_string());
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "Skipping parameter in model count");
                if desc.error.is_none() {
                    desc.error = Some(format!("Failed to count parameter: {}", e));
                }
            }
        }
    }

    for (i, module) in model.named_modules().into_iter().enumerate() {
        let is_root = i == 0;
        let is_leaf = module.num_children == 0;
        if is_leaf && !(is_root && module.num_parameters == 0) {
            desc.layer_names.push(module.name.clone());
            desc.num_layers += 1;
        }
        desc.module_hierarchy.push(ModuleSummary {
            name: module.name,
            kind: module.kind.to_string(),
        });
    }

    desc
}
