//! Planificación en fases de los analizadores de un `Graph`.
//!
//! Cada fase materializa un modelo con los valores ya ligados, lo aplica a
//! los datos y extrae de él las entradas de los analizadores que quedaron
//! listos. Las salidas de esos analizadores se ligan de vuelta al grafo y
//! habilitan la fase siguiente.

use serde::Serialize;
use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    sync::Arc,
};
use tracing::{debug, info};

use crate::cache::{CacheDict, CacheOutputs, TensorKeysToPaths};
use crate::error::{PlanError, Result};
use crate::graph::{tensor_name, Graph, TensorRef, TensorSink};
use crate::graph_tools::{DependencyOracle, GraphAnalyzer};
use crate::nodes::{apply_operation, OperationDef, OperationNode, Traverser, ValueNode, Visitor};
use crate::optimizer::perform_cache_optimization;

/// Un nodo está listo si todas sus fuentes se pueden calcular sin correr
/// más analizadores.
pub struct ReadyVisitor<'a> {
    oracle: &'a dyn DependencyOracle,
}

impl<'a> ReadyVisitor<'a> {
    pub fn new(oracle: &'a dyn DependencyOracle) -> Self {
        Self { oracle }
    }
}

impl<'a> Visitor for ReadyVisitor<'a> {
    type Value = bool;

    fn visit(&mut self, operation_def: &OperationDef, input_values: Vec<bool>) -> Result<Vec<bool>> {
        let is_ready = match operation_def {
            OperationDef::TensorSource { tensors, .. } => {
                let mut ready = true;
                for tensor in tensors {
                    ready &= self.oracle.ready_to_run(tensor)?;
                }
                ready
            }
            _ => input_values.iter().all(|&ready| ready),
        };
        Ok(vec![is_ready; operation_def.num_outputs()])
    }
}

/// Reescribe el grafo de analizadores en uno de ejecución: cada
/// `TensorSource` pasa a ser un `ExtractFromDict` sobre el modelo aplicado
/// en la fase actual.
#[derive(Default)]
pub struct TranslateVisitor {
    extracted_values_dict: Option<ValueNode>,
}

impl Visitor for TranslateVisitor {
    type Value = ValueNode;

    fn visit(
        &mut self,
        operation_def: &OperationDef,
        input_values: Vec<ValueNode>,
    ) -> Result<Vec<ValueNode>> {
        match operation_def {
            OperationDef::TensorSource { tensors, label } => {
                let dict = self.extracted_values_dict.clone().ok_or_else(|| {
                    PlanError::InvalidGraph(format!("{label} se tradujo fuera de una fase"))
                })?;
                let output = apply_operation(
                    OperationDef::ExtractFromDict {
                        keys: tensors.iter().map(tensor_name).collect(),
                        label: label.clone(),
                    },
                    vec![dict],
                )?;
                Ok(vec![output])
            }
            _ => Ok(OperationNode::new(operation_def.clone(), input_values).outputs()),
        }
    }
}

/// Tensores de los `TensorSource` de `root` que el traductor todavía no vio.
/// Son los que tiene que exponer el modelo de la fase actual.
fn collect_pending_sources(
    root: &ValueNode,
    translator: &Traverser<TranslateVisitor>,
    signature: &mut BTreeMap<String, TensorRef>,
) {
    let mut seen: HashSet<*const OperationNode> = HashSet::new();
    let mut stack = vec![root.clone()];
    while let Some(value) = stack.pop() {
        if translator.is_visited(&value) || !seen.insert(Arc::as_ptr(value.parent_operation())) {
            continue;
        }
        if let OperationDef::TensorSource { tensors, .. } = value.operation_def() {
            for tensor in tensors {
                signature.insert(tensor_name(tensor), tensor.clone());
            }
        }
        stack.extend(value.parent_operation().inputs().iter().cloned());
    }
}

/// Resumen de una fase del plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Phase {
    pub index: usize,
    /// Tensores (por nombre estable) que se ligan al terminar la fase.
    pub tensor_bindings: Vec<String>,
    /// Inicializadores de tablas listos para correr en la fase.
    pub table_initializers: Vec<String>,
}

#[derive(Debug)]
pub struct Plan {
    /// Raíz optimizada: produce el modelo final con todos los valores ligados.
    pub saved_model_future: ValueNode,
    /// `None` si no se pidió cache.
    pub cache_outputs: Option<CacheOutputs>,
    pub phases: Vec<Phase>,
}

/// Arma el plan de análisis de `graph`.
///
/// Consume los sinks pendientes del grafo. Cada analizador queda en la
/// primera fase en la que sus entradas se pueden calcular.
pub fn build(
    graph: &mut Graph,
    input_signature: &BTreeMap<String, TensorRef>,
    output_signature: &BTreeMap<String, TensorRef>,
    dataset_keys: Option<&[String]>,
    cache_dict: Option<&CacheDict>,
) -> Result<Plan> {
    for tensor in output_signature.values() {
        if !graph.contains_tensor(tensor) {
            return Err(PlanError::UnknownTensor(tensor.name()));
        }
    }

    let tensor_sinks: Vec<TensorSink> = graph.take_tensor_sinks();
    let mut sink_tensors_ready: BTreeMap<TensorRef, bool> = tensor_sinks
        .iter()
        .map(|sink| (sink.tensor.clone(), false))
        .collect();

    let mut translator = Traverser::new(TranslateVisitor::default());
    let mut tensor_bindings: Vec<ValueNode> = Vec::new();
    let mut analyzers_input_signature: BTreeMap<String, TensorRef> = BTreeMap::new();
    let mut phases: Vec<Phase> = Vec::new();
    let mut graph_analyzer: Option<GraphAnalyzer> = None;
    let mut phase = 0;

    while sink_tensors_ready.values().any(|ready| !ready) {
        let analyzer = GraphAnalyzer::new(graph, input_signature, &sink_tensors_ready)?;

        let mut ready_sinks: Vec<&TensorSink> = Vec::new();
        {
            let mut ready_traverser = Traverser::new(ReadyVisitor::new(&analyzer));
            for sink in &tensor_sinks {
                if sink_tensors_ready.get(&sink.tensor).copied().unwrap_or(false) {
                    continue;
                }
                if ready_traverser.visit_value_node(&sink.value_node)? {
                    ready_sinks.push(sink);
                }
            }
        }

        if ready_sinks.is_empty() {
            let pending = sink_tensors_ready
                .iter()
                .filter(|(_, ready)| !**ready)
                .map(|(tensor, _)| tensor_name(tensor))
                .collect();
            return Err(PlanError::DependencyCycle { pending });
        }

        let mut intermediate_output_signature = BTreeMap::new();
        for sink in &ready_sinks {
            collect_pending_sources(&sink.value_node, &translator, &mut intermediate_output_signature);
        }

        let table_initializers = analyzer.ready_table_initializers();
        let saved_model_future = apply_operation(
            OperationDef::CreateSavedModel {
                table_initializers: table_initializers.clone(),
                output_signature: intermediate_output_signature.clone(),
                label: format!("CreateSavedModelForAnalyzerInputs[{phase}]"),
            },
            tensor_bindings.clone(),
        )?;
        let extracted_values_dict = apply_operation(
            OperationDef::ApplySavedModel {
                dataset_key: None,
                phase,
                label: format!("ApplySavedModel[{phase}]"),
            },
            vec![saved_model_future],
        )?;
        translator.visitor_mut().extracted_values_dict = Some(extracted_values_dict);

        let mut resolved = Vec::with_capacity(ready_sinks.len());
        for sink in ready_sinks {
            let translated = translator.visit_value_node(&sink.value_node)?;
            let name = tensor_name(&sink.tensor);
            tensor_bindings.push(apply_operation(
                OperationDef::CreateTensorBinding {
                    tensor: sink.tensor.clone(),
                    is_asset_filepath: sink.is_asset_filepath,
                    label: format!("CreateTensorBinding[{name}]"),
                },
                vec![translated],
            )?);
            sink_tensors_ready.insert(sink.tensor.clone(), true);
            debug!("sink {} resuelto en fase {}", name, phase);
            resolved.push(name);
        }

        info!(
            "fase {}: {} analizadores, {} entradas, {} tablas",
            phase,
            resolved.len(),
            intermediate_output_signature.len(),
            table_initializers.len()
        );

        analyzers_input_signature.extend(intermediate_output_signature);
        phases.push(Phase {
            index: phase,
            tensor_bindings: resolved,
            table_initializers,
        });
        graph_analyzer = Some(analyzer);
        phase += 1;
    }

    // BTreeMap: la firma final ya queda ordenada por nombre
    let saved_model_future = apply_operation(
        OperationDef::CreateSavedModel {
            table_initializers: graph.table_initializers().to_vec(),
            output_signature: output_signature.clone(),
            label: "CreateSavedModel".to_string(),
        },
        tensor_bindings,
    )?;

    let mut tensor_keys_to_paths = TensorKeysToPaths::new();
    if let Some(analyzer) = &graph_analyzer {
        for (key, tensor) in &analyzers_input_signature {
            tensor_keys_to_paths.insert(key.clone(), analyzer.unique_path(tensor)?);
        }
    }

    let dataset_keys: BTreeSet<String> = dataset_keys
        .map(|keys| keys.iter().cloned().collect())
        .unwrap_or_default();
    let (optimized, cache_outputs) = perform_cache_optimization(
        &saved_model_future,
        &dataset_keys,
        &tensor_keys_to_paths,
        cache_dict,
    )?;

    info!(
        "plan listo: {} fases, {} salidas de cache",
        phases.len(),
        cache_outputs.as_ref().map(|c| c.len()).unwrap_or(0)
    );

    Ok(Plan {
        saved_model_future: optimized,
        cache_outputs,
        phases,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzers;
    use crate::graph::AttrValue;
    use crate::nodes::{plan_fingerprint, render_plan, PlanNode};

    fn sub(g: &mut Graph, a: &TensorRef, b: &TensorRef) -> TensorRef {
        let name = g.unique_name("sub");
        g.add_op(&name, "Sub", vec![a.clone(), b.clone()], BTreeMap::new(), 1)
            .unwrap()
            .remove(0)
    }

    fn signature(pairs: &[(&str, &TensorRef)]) -> BTreeMap<String, TensorRef> {
        pairs
            .iter()
            .map(|(k, t)| (k.to_string(), (*t).clone()))
            .collect()
    }

    /// x, min(x), max(x - min(x)).
    fn min_max_graph() -> (Graph, BTreeMap<String, TensorRef>, BTreeMap<String, TensorRef>) {
        let mut g = Graph::new();
        let x = g.placeholder("x").unwrap();
        let m = analyzers::min(&mut g, &x).unwrap();
        let centered = sub(&mut g, &x, &m);
        let mx = analyzers::max(&mut g, &centered).unwrap();
        let scaled = sub(&mut g, &centered, &mx);
        let inputs = signature(&[("x", &x)]);
        let outputs = signature(&[("y", &scaled), ("centered", &centered)]);
        (g, inputs, outputs)
    }

    fn by_label<'a>(plan: &'a [PlanNode], label: &str) -> &'a PlanNode {
        plan.iter()
            .find(|n| n.label == label)
            .unwrap_or_else(|| panic!("sin nodo {label}"))
    }

    #[test]
    fn min_y_max_dependiente_quedan_en_dos_fases() {
        let (mut g, inputs, outputs) = min_max_graph();
        let keys = vec!["data".to_string()];
        let plan = build(&mut g, &inputs, &outputs, Some(keys.as_slice()), None).unwrap();

        assert!(plan.cache_outputs.is_none());
        assert!(g.tensor_sinks().is_empty());
        assert_eq!(plan.phases.len(), 2);
        assert_eq!(plan.phases[0].tensor_bindings, vec!["min/output".to_string()]);
        assert_eq!(plan.phases[1].tensor_bindings, vec!["max/output".to_string()]);

        let rendered = render_plan(&plan.saved_model_future).unwrap();
        let root = rendered.last().unwrap();
        assert_eq!(root.label, "CreateSavedModel");
        let bindings: Vec<&str> = root
            .inputs
            .iter()
            .map(|i| rendered[i.node].label.as_str())
            .collect();
        assert_eq!(
            bindings,
            vec!["CreateTensorBinding[min/output]", "CreateTensorBinding[max/output]"]
        );

        // la fase 1 lee `sub` del modelo que ya tiene ligado el min
        let extract = by_label(&rendered, "max/TensorSource");
        assert_eq!(extract.kind, "ExtractFromDict");
        assert_eq!(extract.operation["extract_from_dict"]["keys"], serde_json::json!(["sub"]));
        let apply = &rendered[extract.inputs[0].node];
        assert_eq!(apply.label, "ApplySavedModel[1]");
        let model = &rendered[apply.inputs[0].node];
        assert_eq!(model.label, "CreateSavedModelForAnalyzerInputs[1]");
        assert_eq!(model.inputs.len(), 1);
        assert_eq!(
            model.operation["create_saved_model"]["output_signature"],
            serde_json::json!({ "sub": { "op": "sub", "value_index": 0 } })
        );
        assert_eq!(
            rendered[model.inputs[0].node].label,
            "CreateTensorBinding[min/output]"
        );
    }

    #[test]
    fn cada_sink_queda_en_la_primera_fase_posible() {
        let mut g = Graph::new();
        let x = g.placeholder("x").unwrap();
        let a = analyzers::min(&mut g, &x).unwrap();
        let b = analyzers::max(&mut g, &x).unwrap();
        let xa = sub(&mut g, &x, &a);
        let c = analyzers::sum(&mut g, &xa).unwrap();
        let xc = sub(&mut g, &x, &c);
        let xcb = sub(&mut g, &xc, &b);
        let d = analyzers::mean(&mut g, &xcb).unwrap();

        let inputs = signature(&[("x", &x)]);
        let outputs = signature(&[("d", &d)]);
        let plan = build(&mut g, &inputs, &outputs, None, None).unwrap();

        let phase_of = |name: &str| {
            plan.phases
                .iter()
                .find(|p| p.tensor_bindings.iter().any(|b| b == name))
                .map(|p| p.index)
                .unwrap()
        };
        assert_eq!(phase_of("min/output"), 0);
        assert_eq!(phase_of("max/output"), 0);
        assert_eq!(phase_of("sum/output"), 1);
        assert_eq!(phase_of("mean/output"), 2);
        assert_eq!(plan.phases.len(), 3);
    }

    #[test]
    fn el_plan_es_determinista() {
        let keys = vec!["train".to_string(), "eval".to_string()];
        let run = || {
            let (mut g, inputs, outputs) = min_max_graph();
            let plan = build(&mut g, &inputs, &outputs, Some(keys.as_slice()), Some(&CacheDict::new())).unwrap();
            let cache_keys: Vec<(String, String)> = plan
                .cache_outputs
                .as_ref()
                .unwrap()
                .keys()
                .map(|(d, k)| (d.clone(), k.to_string()))
                .collect();
            (plan_fingerprint(&plan.saved_model_future).unwrap(), cache_keys)
        };

        let (f1, k1) = run();
        let (f2, k2) = run();
        assert_eq!(f1, f2);
        assert_eq!(k1, k2);
        // sólo el min (fase 0) se puede cachear por partición
        assert_eq!(k1.len(), 2);
    }

    #[test]
    fn el_orden_de_las_particiones_no_cambia_el_plan() {
        let run = |keys: Vec<String>| {
            let (mut g, inputs, outputs) = min_max_graph();
            let plan = build(&mut g, &inputs, &outputs, Some(keys.as_slice()), Some(&CacheDict::new())).unwrap();
            plan_fingerprint(&plan.saved_model_future).unwrap()
        };
        assert_eq!(
            run(vec!["a".into(), "b".into()]),
            run(vec!["b".into(), "a".into()])
        );
    }

    #[test]
    fn cache_completo_evita_recalcular_acumuladores() {
        let keys = vec!["train".to_string(), "eval".to_string()];
        let (mut g, inputs, outputs) = min_max_graph();
        let first = build(&mut g, &inputs, &outputs, Some(keys.as_slice()), Some(&CacheDict::new())).unwrap();

        let mut cache = CacheDict::new();
        for (dataset, key) in first.cache_outputs.unwrap().keys() {
            cache
                .entry(dataset.clone())
                .or_default()
                .insert(key.clone(), b"acc".to_vec());
        }

        let (mut g, inputs, outputs) = min_max_graph();
        let second = build(&mut g, &inputs, &outputs, Some(keys.as_slice()), Some(&cache)).unwrap();
        assert!(second.cache_outputs.unwrap().is_empty());

        let rendered = render_plan(&second.saved_model_future).unwrap();
        assert_eq!(rendered.iter().filter(|n| n.kind == "DecodeCache").count(), 2);
        assert!(rendered
            .iter()
            .all(|n| !n.label.starts_with("min/CombineAccumulate[")));
    }

    #[test]
    fn vocabulario_habilita_la_tabla_en_la_fase_siguiente() {
        let mut g = Graph::new();
        let x = g.placeholder("x").unwrap();
        let vocab = analyzers::vocabulary(&mut g, &x, None, "vocab").unwrap();
        let ids = analyzers::apply_vocabulary(&mut g, &x, &vocab, "apply").unwrap();
        let total = analyzers::sum(&mut g, &ids).unwrap();

        let inputs = signature(&[("x", &x)]);
        let outputs = signature(&[("ids", &ids), ("total", &total)]);
        let plan = build(&mut g, &inputs, &outputs, None, None).unwrap();

        assert_eq!(plan.phases.len(), 2);
        assert_eq!(plan.phases[0].tensor_bindings, vec!["vocab/output".to_string()]);
        assert!(plan.phases[0].table_initializers.is_empty());
        assert_eq!(plan.phases[1].tensor_bindings, vec!["sum/output".to_string()]);
        assert_eq!(plan.phases[1].table_initializers, vec!["apply/init".to_string()]);

        let rendered = render_plan(&plan.saved_model_future).unwrap();
        let binding = by_label(&rendered, "CreateTensorBinding[vocab/output]");
        assert_eq!(
            binding.operation["create_tensor_binding"]["is_asset_filepath"],
            serde_json::json!(true)
        );
        let root = rendered.last().unwrap();
        assert_eq!(
            root.operation["create_saved_model"]["table_initializers"],
            serde_json::json!(["apply/init"])
        );
    }

    #[test]
    fn sin_analizadores_el_plan_es_solo_el_modelo_final() {
        let mut g = Graph::new();
        let x = g.placeholder("x").unwrap();
        let inputs = signature(&[("x", &x)]);
        let plan = build(&mut g, &inputs, &inputs, None, None).unwrap();

        assert!(plan.phases.is_empty());
        let rendered = render_plan(&plan.saved_model_future).unwrap();
        assert_eq!(rendered.len(), 1);
        assert_eq!(rendered[0].label, "CreateSavedModel");
    }

    #[test]
    fn dependencia_circular_es_error() {
        let mut g = Graph::new();
        g.placeholder("x").unwrap();
        let out = g
            .add_op("loop/output", analyzers::ANALYZER_OUTPUT_OP, vec![], BTreeMap::new(), 1)
            .unwrap()
            .remove(0);
        // el analizador consume su propia salida
        let source = apply_operation(
            OperationDef::TensorSource {
                tensors: vec![out.clone()],
                label: "loop/TensorSource".into(),
            },
            vec![],
        )
        .unwrap();
        g.add_tensor_sink(TensorSink {
            tensor: out,
            value_node: source,
            is_asset_filepath: false,
        })
        .unwrap();

        let inputs = signature(&[("x", &TensorRef::new("x", 0))]);
        let err = build(&mut g, &inputs, &BTreeMap::new(), None, None).unwrap_err();
        assert_eq!(
            err,
            PlanError::DependencyCycle {
                pending: vec!["loop/output".into()]
            }
        );
    }

    #[test]
    fn atributo_con_funcion_en_una_entrada_de_analizador_falla() {
        let mut g = Graph::new();
        let x = g.placeholder("x").unwrap();
        let mut attrs = BTreeMap::new();
        attrs.insert("body".to_string(), AttrValue::Func("body_fn".into()));
        let looped = g
            .add_op("while", "While", vec![x.clone()], attrs, 1)
            .unwrap()
            .remove(0);
        analyzers::min(&mut g, &looped).unwrap();

        let inputs = signature(&[("x", &x)]);
        let err = build(&mut g, &inputs, &BTreeMap::new(), None, None).unwrap_err();
        assert!(matches!(err, PlanError::UnsupportedAttribute { .. }));
    }

    #[test]
    fn placeholder_sin_uso_fuera_de_la_firma_no_impide_planificar() {
        let mut g = Graph::new();
        let x = g.placeholder("x").unwrap();
        g.placeholder("unused").unwrap();
        let m = analyzers::min(&mut g, &x).unwrap();

        let inputs = signature(&[("x", &x)]);
        let outputs = signature(&[("m", &m)]);
        let plan = build(&mut g, &inputs, &outputs, None, None).unwrap();
        assert_eq!(plan.phases.len(), 1);
        assert_eq!(plan.phases[0].tensor_bindings, vec!["min/output".to_string()]);
    }

    #[test]
    fn analizador_sobre_placeholder_no_declarado_es_error() {
        let mut g = Graph::new();
        let x = g.placeholder("x").unwrap();
        let extra = g.placeholder("extra").unwrap();
        analyzers::min(&mut g, &extra).unwrap();

        let inputs = signature(&[("x", &x)]);
        let err = build(&mut g, &inputs, &BTreeMap::new(), None, None).unwrap_err();
        assert!(matches!(err, PlanError::InvalidGraph(msg) if msg.contains("extra")));
    }

    #[test]
    fn salida_desconocida_es_error() {
        let (mut g, inputs, _) = min_max_graph();
        let outputs = signature(&[("nope", &TensorRef::new("nope", 0))]);
        let err = build(&mut g, &inputs, &outputs, None, None).unwrap_err();
        assert_eq!(err, PlanError::UnknownTensor("nope:0".into()));
    }

    #[test]
    fn ready_visitor_usa_el_oraculo_para_las_fuentes() {
        let (g, inputs, _) = min_max_graph();
        let mut replaced = BTreeMap::new();
        for sink in g.tensor_sinks() {
            replaced.insert(sink.tensor.clone(), false);
        }
        let analyzer = GraphAnalyzer::new(&g, &inputs, &replaced).unwrap();
        let mut traverser = Traverser::new(ReadyVisitor::new(&analyzer));

        let sinks = g.tensor_sinks();
        assert!(traverser.visit_value_node(&sinks[0].value_node).unwrap());
        assert!(!traverser.visit_value_node(&sinks[1].value_node).unwrap());
    }
}
