//! Grafo de operaciones del plan.
//!
//! Cada nodo es un `OperationDef` inmutable más sus entradas. Los valores
//! (`ValueNode`) apuntan a una salida concreta de un nodo. Para derivar una
//! variante de una operación se usa `with_label` / `with_dataset_key`, nunca
//! se muta en sitio: el `Traverser` memoiza por identidad de nodo.

use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

use crate::cache::CacheEntryKey;
use crate::error::{PlanError, Result};
use crate::graph::TensorRef;
use crate::hashing::{PathHash, PathHasher};

/// Codificador de acumuladores para el cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CacheCoder {
    pub name: String,
}

impl CacheCoder {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Todas las clases de operación que conoce el planificador.
///
/// Las primeras son de nivel usuario (lo que declaran los analizadores);
/// desde `CreateTensorBinding` son de nivel ejecución.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationDef {
    TensorSource {
        tensors: Vec<TensorRef>,
        label: String,
    },
    CombineAccumulate {
        combiner: String,
        cache_coder: Option<CacheCoder>,
        label: String,
    },
    CombineMerge {
        combiner: String,
        label: String,
    },
    ExtractCombineMergeOutputs {
        num_outputs: usize,
        label: String,
    },
    VocabularyAccumulate {
        top_k: Option<usize>,
        cache_coder: Option<CacheCoder>,
        label: String,
    },
    VocabularyMerge {
        label: String,
    },
    VocabularyOrderAndWrite {
        vocab_filename: String,
        label: String,
    },
    /// Paso de analizador definido por el usuario, con contrato explícito.
    Custom {
        name: String,
        num_outputs: usize,
        is_partitionable: bool,
        cache_coder: Option<CacheCoder>,
        label: String,
    },
    CreateTensorBinding {
        tensor: TensorRef,
        is_asset_filepath: bool,
        label: String,
    },
    CreateSavedModel {
        table_initializers: Vec<String>,
        output_signature: BTreeMap<String, TensorRef>,
        label: String,
    },
    ApplySavedModel {
        dataset_key: Option<String>,
        phase: usize,
        label: String,
    },
    ExtractFromDict {
        keys: Vec<String>,
        label: String,
    },
    Flatten {
        label: String,
    },
    EncodeCache {
        coder: CacheCoder,
        label: String,
    },
    DecodeCache {
        dataset_key: String,
        cache_key: CacheEntryKey,
        coder: CacheCoder,
        label: String,
    },
}

impl OperationDef {
    pub fn kind_name(&self) -> &'static str {
        match self {
            OperationDef::TensorSource { .. } => "TensorSource",
            OperationDef::CombineAccumulate { .. } => "CombineAccumulate",
            OperationDef::CombineMerge { .. } => "CombineMerge",
            OperationDef::ExtractCombineMergeOutputs { .. } => "ExtractCombineMergeOutputs",
            OperationDef::VocabularyAccumulate { .. } => "VocabularyAccumulate",
            OperationDef::VocabularyMerge { .. } => "VocabularyMerge",
            OperationDef::VocabularyOrderAndWrite { .. } => "VocabularyOrderAndWrite",
            OperationDef::Custom { .. } => "Custom",
            OperationDef::CreateTensorBinding { .. } => "CreateTensorBinding",
            OperationDef::CreateSavedModel { .. } => "CreateSavedModel",
            OperationDef::ApplySavedModel { .. } => "ApplySavedModel",
            OperationDef::ExtractFromDict { .. } => "ExtractFromDict",
            OperationDef::Flatten { .. } => "Flatten",
            OperationDef::EncodeCache { .. } => "EncodeCache",
            OperationDef::DecodeCache { .. } => "DecodeCache",
        }
    }

    pub fn label(&self) -> &str {
        match self {
            OperationDef::TensorSource { label, .. }
            | OperationDef::CombineAccumulate { label, .. }
            | OperationDef::CombineMerge { label, .. }
            | OperationDef::ExtractCombineMergeOutputs { label, .. }
            | OperationDef::VocabularyAccumulate { label, .. }
            | OperationDef::VocabularyMerge { label }
            | OperationDef::VocabularyOrderAndWrite { label, .. }
            | OperationDef::Custom { label, .. }
            | OperationDef::CreateTensorBinding { label, .. }
            | OperationDef::CreateSavedModel { label, .. }
            | OperationDef::ApplySavedModel { label, .. }
            | OperationDef::ExtractFromDict { label, .. }
            | OperationDef::Flatten { label }
            | OperationDef::EncodeCache { label, .. }
            | OperationDef::DecodeCache { label, .. } => label,
        }
    }

    fn label_mut(&mut self) -> &mut String {
        match self {
            OperationDef::TensorSource { label, .. }
            | OperationDef::CombineAccumulate { label, .. }
            | OperationDef::CombineMerge { label, .. }
            | OperationDef::ExtractCombineMergeOutputs { label, .. }
            | OperationDef::VocabularyAccumulate { label, .. }
            | OperationDef::VocabularyMerge { label }
            | OperationDef::VocabularyOrderAndWrite { label, .. }
            | OperationDef::Custom { label, .. }
            | OperationDef::CreateTensorBinding { label, .. }
            | OperationDef::CreateSavedModel { label, .. }
            | OperationDef::ApplySavedModel { label, .. }
            | OperationDef::ExtractFromDict { label, .. }
            | OperationDef::Flatten { label }
            | OperationDef::EncodeCache { label, .. }
            | OperationDef::DecodeCache { label, .. } => label,
        }
    }

    pub fn num_outputs(&self) -> usize {
        match self {
            OperationDef::ExtractCombineMergeOutputs { num_outputs, .. }
            | OperationDef::Custom { num_outputs, .. } => *num_outputs,
            _ => 1,
        }
    }

    /// Si la operación puede correr de forma independiente por partición.
    pub fn is_partitionable(&self) -> bool {
        match self {
            OperationDef::CombineAccumulate { .. }
            | OperationDef::VocabularyAccumulate { .. }
            | OperationDef::ExtractFromDict { .. } => true,
            OperationDef::Custom {
                is_partitionable, ..
            } => *is_partitionable,
            _ => false,
        }
    }

    /// `Some` sólo si el resultado se puede guardar en cache.
    pub fn cache_coder(&self) -> Option<&CacheCoder> {
        match self {
            OperationDef::CombineAccumulate { cache_coder, .. }
            | OperationDef::VocabularyAccumulate { cache_coder, .. }
            | OperationDef::Custom { cache_coder, .. } => cache_coder.as_ref(),
            _ => None,
        }
    }

    /// Copia con otra etiqueta.
    pub fn with_label(&self, label: impl Into<String>) -> Self {
        let mut copy = self.clone();
        *copy.label_mut() = label.into();
        copy
    }

    /// Copia con la partición fijada. Sólo afecta a `ApplySavedModel`.
    pub fn with_dataset_key(&self, key: impl Into<String>) -> Self {
        let mut copy = self.clone();
        if let OperationDef::ApplySavedModel { dataset_key, .. } = &mut copy {
            *dataset_key = Some(key.into());
        }
        copy
    }

    /// Campos de la operación serializados de forma determinista.
    pub fn field_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| PlanError::InvalidValue {
            label: self.label().to_string(),
            reason: e.to_string(),
        })
    }
}

impl fmt::Display for OperationDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind_name(), self.label())
    }
}

#[derive(Debug)]
pub struct OperationNode {
    operation_def: OperationDef,
    inputs: Vec<ValueNode>,
}

impl OperationNode {
    pub fn new(operation_def: OperationDef, inputs: Vec<ValueNode>) -> Arc<Self> {
        Arc::new(Self {
            operation_def,
            inputs,
        })
    }

    pub fn operation_def(&self) -> &OperationDef {
        &self.operation_def
    }

    pub fn inputs(&self) -> &[ValueNode] {
        &self.inputs
    }

    pub fn outputs(self: &Arc<Self>) -> Vec<ValueNode> {
        (0..self.operation_def.num_outputs())
            .map(|value_index| ValueNode {
                parent_operation: Arc::clone(self),
                value_index,
            })
            .collect()
    }
}

/// Una salida concreta de un `OperationNode`.
#[derive(Clone)]
pub struct ValueNode {
    parent_operation: Arc<OperationNode>,
    value_index: usize,
}

impl ValueNode {
    pub fn parent_operation(&self) -> &Arc<OperationNode> {
        &self.parent_operation
    }

    pub fn operation_def(&self) -> &OperationDef {
        &self.parent_operation.operation_def
    }

    pub fn value_index(&self) -> usize {
        self.value_index
    }
}

impl PartialEq for ValueNode {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.parent_operation, &other.parent_operation)
            && self.value_index == other.value_index
    }
}

impl Eq for ValueNode {}

impl fmt::Debug for ValueNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}]",
            self.parent_operation.operation_def.label(),
            self.value_index
        )
    }
}

/// Aplica una operación de una sola salida.
pub fn apply_operation(operation_def: OperationDef, inputs: Vec<ValueNode>) -> Result<ValueNode> {
    if operation_def.num_outputs() != 1 {
        return Err(PlanError::InvalidOutputArity {
            label: operation_def.label().to_string(),
            expected: 1,
            actual: operation_def.num_outputs(),
        });
    }
    let mut outputs = OperationNode::new(operation_def, inputs).outputs();
    Ok(outputs.remove(0))
}

pub fn apply_multi_output_operation(
    operation_def: OperationDef,
    inputs: Vec<ValueNode>,
) -> Vec<ValueNode> {
    OperationNode::new(operation_def, inputs).outputs()
}

fn node_key(node: &Arc<OperationNode>) -> usize {
    Arc::as_ptr(node) as usize
}

/// Visitante de `Traverser`: recibe la operación y los valores ya calculados
/// de sus entradas, y devuelve un valor por salida.
pub trait Visitor {
    type Value: Clone;

    fn visit(
        &mut self,
        operation_def: &OperationDef,
        input_values: Vec<Self::Value>,
    ) -> Result<Vec<Self::Value>>;

    fn validate_value(&self, _value: &Self::Value) -> Result<()> {
        Ok(())
    }
}

/// Recorre el grafo de abajo hacia arriba y calcula un resultado por nodo,
/// una sola vez por nodo aunque tenga varios consumidores.
pub struct Traverser<V: Visitor> {
    visitor: V,
    // se guarda el Arc para que la dirección usada como clave siga viva
    cached: HashMap<usize, (Arc<OperationNode>, Vec<V::Value>)>,
}

impl<V: Visitor> Traverser<V> {
    pub fn new(visitor: V) -> Self {
        Self {
            visitor,
            cached: HashMap::new(),
        }
    }

    pub fn visitor(&self) -> &V {
        &self.visitor
    }

    pub fn visitor_mut(&mut self) -> &mut V {
        &mut self.visitor
    }

    pub fn into_visitor(self) -> V {
        self.visitor
    }

    /// Si la operación que produce `value` ya fue visitada.
    pub fn is_visited(&self, value: &ValueNode) -> bool {
        self.cached.contains_key(&node_key(&value.parent_operation))
    }

    pub fn visit_value_node(&mut self, value: &ValueNode) -> Result<V::Value> {
        let outputs = self.visit_operation(&value.parent_operation)?;
        outputs
            .get(value.value_index)
            .cloned()
            .ok_or_else(|| PlanError::InvalidOutputArity {
                label: value.operation_def().label().to_string(),
                expected: value.value_index + 1,
                actual: outputs.len(),
            })
    }

    fn visit_operation(&mut self, node: &Arc<OperationNode>) -> Result<Vec<V::Value>> {
        let key = node_key(node);
        if let Some((_, values)) = self.cached.get(&key) {
            return Ok(values.clone());
        }

        let mut input_values = Vec::with_capacity(node.inputs.len());
        for input in &node.inputs {
            input_values.push(self.visit_value_node(input)?);
        }

        let values = self.visitor.visit(&node.operation_def, input_values)?;
        if values.len() != node.operation_def.num_outputs() {
            return Err(PlanError::InvalidOutputArity {
                label: node.operation_def.label().to_string(),
                expected: node.operation_def.num_outputs(),
                actual: values.len(),
            });
        }
        for value in &values {
            self.visitor.validate_value(value)?;
        }

        self.cached
            .insert(key, (Arc::clone(node), values.clone()));
        Ok(values)
    }
}

/* =========================
   Render determinista del plan
   ========================= */

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanInput {
    pub node: usize,
    pub value_index: usize,
}

/// Un nodo del plan, numerado en post-orden desde la raíz.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanNode {
    pub id: usize,
    pub kind: &'static str,
    pub label: String,
    pub operation: serde_json::Value,
    pub inputs: Vec<PlanInput>,
}

/// Lista los nodos alcanzables desde `root` en post-orden (entradas primero).
/// Dos grafos con la misma forma producen exactamente la misma lista.
pub fn render_plan(root: &ValueNode) -> Result<Vec<PlanNode>> {
    let mut ids: HashMap<usize, usize> = HashMap::new();
    let mut out: Vec<PlanNode> = Vec::new();
    // pila explícita: (nodo, entradas ya apiladas)
    let mut stack: Vec<(Arc<OperationNode>, bool)> = vec![(Arc::clone(&root.parent_operation), false)];

    while let Some((node, expanded)) = stack.pop() {
        let key = node_key(&node);
        if ids.contains_key(&key) {
            continue;
        }
        if !expanded {
            stack.push((Arc::clone(&node), true));
            for input in node.inputs.iter().rev() {
                if !ids.contains_key(&node_key(&input.parent_operation)) {
                    stack.push((Arc::clone(&input.parent_operation), false));
                }
            }
            continue;
        }

        let mut inputs = Vec::with_capacity(node.inputs.len());
        for input in &node.inputs {
            let id = ids
                .get(&node_key(&input.parent_operation))
                .copied()
                .ok_or_else(|| PlanError::InvalidGraph(format!(
                    "entrada sin visitar en {}",
                    node.operation_def.label()
                )))?;
            inputs.push(PlanInput {
                node: id,
                value_index: input.value_index,
            });
        }

        let operation = serde_json::to_value(&node.operation_def).map_err(|e| {
            PlanError::InvalidValue {
                label: node.operation_def.label().to_string(),
                reason: e.to_string(),
            }
        })?;

        let id = out.len();
        ids.insert(key, id);
        out.push(PlanNode {
            id,
            kind: node.operation_def.kind_name(),
            label: node.operation_def.label().to_string(),
            operation,
            inputs,
        });
    }

    Ok(out)
}

/// Huella del plan completo: hash de su render serializado.
pub fn plan_fingerprint(root: &ValueNode) -> Result<PathHash> {
    let nodes = render_plan(root)?;
    let bytes = serde_json::to_vec(&nodes).map_err(|e| PlanError::InvalidValue {
        label: root.operation_def().label().to_string(),
        reason: e.to_string(),
    })?;
    let mut hasher = PathHasher::new();
    hasher.update(bytes);
    Ok(hasher.finish())
}
