//! Analizadores de pasada completa (min, max, vocabulario, ...).
//!
//! Cada analizador agrega al grafo una operación `AnalyzerOutput` cuyas
//! salidas quedan pendientes, y registra un `TensorSink` con la expresión
//! (en nodos del plan) que las calcula.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::graph::{AttrValue, Graph, TensorRef, TensorSink};
use crate::nodes::{apply_multi_output_operation, apply_operation, CacheCoder, OperationDef, ValueNode};

pub const ANALYZER_OUTPUT_OP: &str = "AnalyzerOutput";

/// Primer `name`, `name_1`, ... cuyo `<scope>/output` no existe todavía.
fn unique_scope(graph: &Graph, name: &str) -> String {
    let mut scope = name.to_string();
    let mut i = 1;
    while graph.operation(&format!("{scope}/output")).is_some() {
        scope = format!("{name}_{i}");
        i += 1;
    }
    scope
}

fn tensor_source(scope: &str, inputs: &[TensorRef]) -> Result<ValueNode> {
    apply_operation(
        OperationDef::TensorSource {
            tensors: inputs.to_vec(),
            label: format!("{scope}/TensorSource"),
        },
        vec![],
    )
}

/// Agrega las salidas pendientes al grafo y registra un sink por cada una.
fn bind_outputs(
    graph: &mut Graph,
    scope: &str,
    kind: &str,
    value_nodes: Vec<ValueNode>,
    is_asset_filepath: bool,
) -> Result<Vec<TensorRef>> {
    let mut attrs = BTreeMap::new();
    attrs.insert("analyzer".to_string(), AttrValue::Str(kind.to_string()));
    let tensors = graph.add_op(
        &format!("{scope}/output"),
        ANALYZER_OUTPUT_OP,
        vec![],
        attrs,
        value_nodes.len(),
    )?;

    for (tensor, value_node) in tensors.iter().zip(value_nodes) {
        graph.add_tensor_sink(TensorSink {
            tensor: tensor.clone(),
            value_node,
            is_asset_filepath,
        })?;
    }
    Ok(tensors)
}

/// Analizador genérico accumulate -> merge -> extract sobre `inputs`.
pub fn combine_analyzer(
    graph: &mut Graph,
    inputs: &[TensorRef],
    combiner: &str,
    num_outputs: usize,
    name: &str,
) -> Result<Vec<TensorRef>> {
    let scope = unique_scope(graph, name);

    let source = tensor_source(&scope, inputs)?;
    let accumulate = apply_operation(
        OperationDef::CombineAccumulate {
            combiner: combiner.to_string(),
            cache_coder: Some(CacheCoder::new(format!("{combiner}_accumulator"))),
            label: format!("{scope}/CombineAccumulate"),
        },
        vec![source],
    )?;
    let merge = apply_operation(
        OperationDef::CombineMerge {
            combiner: combiner.to_string(),
            label: format!("{scope}/CombineMerge"),
        },
        vec![accumulate],
    )?;
    let outputs = apply_multi_output_operation(
        OperationDef::ExtractCombineMergeOutputs {
            num_outputs,
            label: format!("{scope}/ExtractCombineMergeOutputs"),
        },
        vec![merge],
    );

    bind_outputs(graph, &scope, combiner, outputs, false)
}

fn single(graph: &mut Graph, x: &TensorRef, combiner: &str, name: &str) -> Result<TensorRef> {
    let mut outs = combine_analyzer(graph, std::slice::from_ref(x), combiner, 1, name)?;
    Ok(outs.remove(0))
}

pub fn min(graph: &mut Graph, x: &TensorRef) -> Result<TensorRef> {
    single(graph, x, "min", "min")
}

pub fn max(graph: &mut Graph, x: &TensorRef) -> Result<TensorRef> {
    single(graph, x, "max", "max")
}

pub fn sum(graph: &mut Graph, x: &TensorRef) -> Result<TensorRef> {
    single(graph, x, "sum", "sum")
}

pub fn mean(graph: &mut Graph, x: &TensorRef) -> Result<TensorRef> {
    single(graph, x, "mean", "mean")
}

/// Vocabulario de `x`. La salida es la ruta del archivo de vocabulario.
pub fn vocabulary(
    graph: &mut Graph,
    x: &TensorRef,
    top_k: Option<usize>,
    name: &str,
) -> Result<TensorRef> {
    let scope = unique_scope(graph, name);

    let source = tensor_source(&scope, std::slice::from_ref(x))?;
    let accumulate = apply_operation(
        OperationDef::VocabularyAccumulate {
            top_k,
            cache_coder: Some(CacheCoder::new("vocabulary_accumulator")),
            label: format!("{scope}/VocabularyAccumulate"),
        },
        vec![source],
    )?;
    let merge = apply_operation(
        OperationDef::VocabularyMerge {
            label: format!("{scope}/VocabularyMerge"),
        },
        vec![accumulate],
    )?;
    let write = apply_operation(
        OperationDef::VocabularyOrderAndWrite {
            vocab_filename: format!("vocab_{}", scope.replace('/', "_")),
            label: format!("{scope}/VocabularyOrderAndWrite"),
        },
        vec![merge],
    )?;

    let mut outs = bind_outputs(graph, &scope, "vocabulary", vec![write], true)?;
    Ok(outs.remove(0))
}

/// Traduce `x` a índices usando una tabla inicializada desde `vocab_path`.
/// Registra el inicializador de la tabla en el grafo.
pub fn apply_vocabulary(
    graph: &mut Graph,
    x: &TensorRef,
    vocab_path: &TensorRef,
    name: &str,
) -> Result<TensorRef> {
    let table_name = graph.unique_name(&format!("{name}/table"));
    let table = graph
        .add_op(&table_name, "HashTable", vec![], BTreeMap::new(), 1)?
        .remove(0);

    let init_name = graph.unique_name(&format!("{name}/init"));
    graph.add_op(
        &init_name,
        "InitializeTableFromTextFile",
        vec![table.clone(), vocab_path.clone()],
        BTreeMap::new(),
        0,
    )?;
    graph.add_table_initializer(&init_name)?;

    let lookup_name = graph.unique_name(&format!("{name}/lookup"));
    let mut outs = graph.add_op(
        &lookup_name,
        "LookupTableFind",
        vec![table, x.clone()],
        BTreeMap::new(),
        1,
    )?;
    Ok(outs.remove(0))
}
