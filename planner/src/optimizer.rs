//! Optimización del grafo de ejecución para reutilizar acumuladores en cache.
//!
//! Las operaciones particionables se aplican por partición (vista fina) y,
//! si son cacheables, se leen del cache de entrada o se agrega un nodo que
//! codifica su salida. Cuando un consumidor no admite particiones, las vistas
//! finas se aplanan con un `Flatten` explícito.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::cache::{
    cache_contains, make_cache_entry_key, make_next_hashed_path, CacheDict, CacheEntryKey,
    CacheOutputs, TensorKeysToPaths,
};
use crate::error::{PlanError, Result};
use crate::hashing::PathHash;
use crate::nodes::{apply_operation, OperationDef, OperationNode, Traverser, ValueNode, Visitor};

/// Salida de una operación durante la optimización.
#[derive(Debug, Clone)]
pub struct OptimizationView {
    prefer_fine_grained_view: bool,
    flattened_view: ValueNode,
    fine_grained_view: Option<BTreeMap<String, ValueNode>>,
    hashed_path: Option<PathHash>,
}

impl OptimizationView {
    pub fn new(
        prefer_fine_grained_view: bool,
        flattened_view: ValueNode,
        fine_grained_view: Option<BTreeMap<String, ValueNode>>,
        hashed_path: Option<PathHash>,
    ) -> Result<Self> {
        if prefer_fine_grained_view && fine_grained_view.is_none() {
            return Err(PlanError::MissingFineGrainedView(
                flattened_view.operation_def().label().to_string(),
            ));
        }
        Ok(Self {
            prefer_fine_grained_view,
            flattened_view,
            fine_grained_view,
            hashed_path,
        })
    }

    /// Pista para los consumidores: usar la vista fina porque aguas arriba
    /// hay operaciones cacheables sin aplanar.
    pub fn prefer_fine_grained_view(&self) -> bool {
        self.prefer_fine_grained_view
    }

    pub fn flattened_view(&self) -> &ValueNode {
        &self.flattened_view
    }

    pub fn fine_grained_view(&self) -> Option<&BTreeMap<String, ValueNode>> {
        self.fine_grained_view.as_ref()
    }

    pub fn hashed_path(&self) -> Option<PathHash> {
        self.hashed_path
    }
}

pub struct OptimizeVisitor<'a> {
    dataset_keys: BTreeSet<String>,
    cache_dict: Option<&'a CacheDict>,
    tensor_keys_to_paths: &'a TensorKeysToPaths,
    cache_output_nodes: CacheOutputs,
}

impl<'a> OptimizeVisitor<'a> {
    pub fn new(
        dataset_keys: &BTreeSet<String>,
        cache_dict: Option<&'a CacheDict>,
        tensor_keys_to_paths: &'a TensorKeysToPaths,
    ) -> Self {
        Self {
            dataset_keys: dataset_keys.clone(),
            cache_dict,
            tensor_keys_to_paths,
            cache_output_nodes: CacheOutputs::new(),
        }
    }

    pub fn cache_output_nodes(&self) -> &CacheOutputs {
        &self.cache_output_nodes
    }

    fn validate_operation_def(&self, operation_def: &OperationDef) -> Result<()> {
        let cacheable = operation_def.cache_coder().is_some();
        if cacheable && !operation_def.is_partitionable() {
            return Err(PlanError::UncacheableNonPartitionable(
                operation_def.label().to_string(),
            ));
        }
        if (operation_def.is_partitionable() || cacheable) && operation_def.num_outputs() != 1 {
            return Err(PlanError::InvalidOutputArity {
                label: operation_def.label().to_string(),
                expected: 1,
                actual: operation_def.num_outputs(),
            });
        }
        Ok(())
    }

    fn visit_apply_saved_model(
        &mut self,
        operation_def: &OperationDef,
        upstream_views: Vec<OptimizationView>,
    ) -> Result<Vec<OptimizationView>> {
        let upstream_view = single_input(operation_def, upstream_views)?;
        if upstream_view.fine_grained_view.is_some() {
            return Err(PlanError::UnexpectedFineGrainedInput(
                operation_def.label().to_string(),
            ));
        }

        let fine_grained_view = if self.dataset_keys.is_empty() {
            None
        } else {
            let mut view = BTreeMap::new();
            for key in &self.dataset_keys {
                let def = operation_def
                    .with_dataset_key(key.clone())
                    .with_label(format!("{}[{}]", operation_def.label(), key));
                view.insert(
                    key.clone(),
                    apply_operation(def, vec![upstream_view.flattened_view.clone()])?,
                );
            }
            Some(view)
        };

        let flattened_view =
            apply_operation(operation_def.clone(), vec![upstream_view.flattened_view])?;

        Ok(vec![OptimizationView::new(
            false,
            flattened_view,
            fine_grained_view,
            Some(PathHash::apply_saved_model_root()),
        )?])
    }

    fn visit_partitionable_operation(
        &mut self,
        operation_def: &OperationDef,
        cache_dict: &CacheDict,
        upstream_views: Vec<OptimizationView>,
    ) -> Result<Vec<OptimizationView>> {
        if upstream_views.len() != 1 {
            return Err(PlanError::MultiInputPartitionable {
                label: operation_def.label().to_string(),
                inputs: upstream_views.len(),
            });
        }
        let upstream_view = single_input(operation_def, upstream_views)?;

        let prefer_fine_grained_view = upstream_view.prefer_fine_grained_view
            || (upstream_view.fine_grained_view.is_some()
                && operation_def.cache_coder().is_some());

        let next_hashed_path = make_next_hashed_path(
            &[upstream_view.hashed_path],
            operation_def,
            self.tensor_keys_to_paths,
        )?;

        let fine_grained_view = match &upstream_view.fine_grained_view {
            Some(view) => Some(self.apply_operation_on_fine_grained_view(
                operation_def,
                cache_dict,
                view,
                next_hashed_path,
            )?),
            None => None,
        };

        let flattened_view =
            apply_operation(operation_def.clone(), vec![upstream_view.flattened_view])?;

        Ok(vec![OptimizationView::new(
            prefer_fine_grained_view,
            flattened_view,
            fine_grained_view,
            next_hashed_path,
        )?])
    }

    /// Aplica la operación en cada partición: lee del cache si hay entrada,
    /// si no la calcula y, si es cacheable, agrega el nodo que la codifica.
    fn apply_operation_on_fine_grained_view(
        &mut self,
        operation_def: &OperationDef,
        cache_dict: &CacheDict,
        fine_grained_view: &BTreeMap<String, ValueNode>,
        next_hashed_path: Option<PathHash>,
    ) -> Result<BTreeMap<String, ValueNode>> {
        let label = operation_def.label();
        let cache_entry_key: Option<CacheEntryKey> = match operation_def.cache_coder() {
            Some(_) => {
                let path = next_hashed_path
                    .ok_or_else(|| PlanError::UnhashablePath(label.to_string()))?;
                Some(make_cache_entry_key(label, &path))
            }
            None => None,
        };

        let mut result = BTreeMap::new();
        for dataset_key in &self.dataset_keys {
            let op_output = match (operation_def.cache_coder(), &cache_entry_key) {
                (Some(coder), Some(key)) if cache_contains(cache_dict, dataset_key, key) => {
                    debug!("cache hit: {} en {} ({})", label, dataset_key, key);
                    apply_operation(
                        OperationDef::DecodeCache {
                            dataset_key: dataset_key.clone(),
                            cache_key: key.clone(),
                            coder: coder.clone(),
                            label: format!("DecodeCache[{}][{}]", label, dataset_key),
                        },
                        vec![],
                    )?
                }
                _ => {
                    let value_node = fine_grained_view
                        .get(dataset_key)
                        .ok_or_else(|| PlanError::MissingFineGrainedView(label.to_string()))?;
                    let output = apply_operation(
                        operation_def.with_label(format!("{}[{}]", label, dataset_key)),
                        vec![value_node.clone()],
                    )?;

                    if let (Some(coder), Some(key)) = (operation_def.cache_coder(), &cache_entry_key) {
                        debug!("cache miss: {} en {} ({})", label, dataset_key, key);
                        let encoded = apply_operation(
                            OperationDef::EncodeCache {
                                coder: coder.clone(),
                                label: format!("EncodeCache[{}][{}]", label, dataset_key),
                            },
                            vec![output.clone()],
                        )?;
                        self.cache_output_nodes
                            .insert((dataset_key.clone(), key.clone()), encoded);
                    }
                    output
                }
            };
            result.insert(dataset_key.clone(), op_output);
        }

        Ok(result)
    }

    /// Une las vistas finas de todas las entradas en un único `Flatten`.
    fn flatten_cache(
        &self,
        operation_def: &OperationDef,
        input_values: &[OptimizationView],
    ) -> Result<ValueNode> {
        let mut disaggregated = Vec::new();
        let mut cardinalities = BTreeSet::new();
        for view in input_values {
            let fine = view
                .fine_grained_view
                .as_ref()
                .ok_or_else(|| PlanError::MissingFineGrainedView(operation_def.label().to_string()))?;
            cardinalities.insert(fine.len());
            disaggregated.extend(fine.values().cloned());
        }
        if cardinalities.len() != 1 {
            return Err(PlanError::InconsistentPartitionCardinality(
                operation_def.label().to_string(),
            ));
        }

        apply_operation(
            OperationDef::Flatten {
                label: format!("FlattenCache[{}]", operation_def.label()),
            },
            disaggregated,
        )
    }
}

fn single_input(
    operation_def: &OperationDef,
    mut views: Vec<OptimizationView>,
) -> Result<OptimizationView> {
    if views.len() != 1 {
        return Err(PlanError::InvalidGraph(format!(
            "{} espera exactamente una entrada, recibió {}",
            operation_def.label(),
            views.len()
        )));
    }
    Ok(views.remove(0))
}

impl<'a> Visitor for OptimizeVisitor<'a> {
    type Value = OptimizationView;

    fn visit(
        &mut self,
        operation_def: &OperationDef,
        input_values: Vec<OptimizationView>,
    ) -> Result<Vec<OptimizationView>> {
        self.validate_operation_def(operation_def)?;

        if let OperationDef::ApplySavedModel { phase: 0, .. } = operation_def {
            return self.visit_apply_saved_model(operation_def, input_values);
        }

        // sin cache no hace falta ninguna vista fina
        if let Some(cache_dict) = self.cache_dict {
            if operation_def.is_partitionable() {
                return self.visit_partitionable_operation(operation_def, cache_dict, input_values);
            }
        }

        let next_inputs = if input_values
            .iter()
            .any(|v| v.fine_grained_view.is_some() && v.prefer_fine_grained_view)
        {
            vec![self.flatten_cache(operation_def, &input_values)?]
        } else {
            input_values
                .into_iter()
                .map(|v| v.flattened_view)
                .collect()
        };

        OperationNode::new(operation_def.clone(), next_inputs)
            .outputs()
            .into_iter()
            .map(|flat| OptimizationView::new(false, flat, None, None))
            .collect()
    }

    fn validate_value(&self, value: &OptimizationView) -> Result<()> {
        if let Some(fine) = &value.fine_grained_view {
            let actual: BTreeSet<String> = fine.keys().cloned().collect();
            if actual != self.dataset_keys {
                return Err(PlanError::PartitionKeyMismatch {
                    expected: self.dataset_keys.clone(),
                    actual,
                });
            }
        }
        Ok(())
    }
}

/// Optimiza el grafo con raíz `root`.
///
/// Devuelve la vista aplanada de la raíz y los nodos de cache de salida, o
/// `None` cuando no se pidió cache (`cache_dict` es `None`).
pub fn perform_cache_optimization(
    root: &ValueNode,
    dataset_keys: &BTreeSet<String>,
    tensor_keys_to_paths: &TensorKeysToPaths,
    cache_dict: Option<&CacheDict>,
) -> Result<(ValueNode, Option<CacheOutputs>)> {
    let visitor = OptimizeVisitor::new(dataset_keys, cache_dict, tensor_keys_to_paths);
    let mut traverser = Traverser::new(visitor);
    let optimized = traverser.visit_value_node(root)?.flattened_view;
    let cache_output_nodes = traverser.into_visitor().cache_output_nodes;

    if cache_dict.is_none() {
        if !cache_output_nodes.is_empty() {
            return Err(PlanError::InvalidValue {
                label: root.operation_def().label().to_string(),
                reason: "se generaron salidas de cache sin cache habilitado".to_string(),
            });
        }
        return Ok((optimized, None));
    }
    Ok((optimized, Some(cache_output_nodes)))
}
