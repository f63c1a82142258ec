use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::analyzers;
use crate::error::{PlanError, Result};
use crate::graph::{AttrValue, Graph, TensorRef};

/// Descripción en JSON de un preprocesamiento: entradas, operaciones,
/// analizadores y salidas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Nombres de los tensores de entrada (placeholders).
    pub inputs: Vec<String>,

    #[serde(default)]
    pub nodes: Vec<PipelineNode>,

    #[serde(default)]
    pub analyzers: Vec<AnalyzerSpec>,

    /// nombre de salida -> referencia a tensor
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,

    #[serde(default)]
    pub table_initializers: Vec<TableInitializerSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineNode {
    pub id: String,
    pub op: String, // "Sub", "Mul", "HashTable", ...

    /// Referencias a tensores: "id" o "id:N".
    #[serde(default)]
    pub inputs: Vec<String>,

    #[serde(default)]
    pub attrs: BTreeMap<String, AttrValue>,

    #[serde(default = "default_num_outputs")]
    pub num_outputs: usize,
}

fn default_num_outputs() -> usize {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyzerKind {
    Min,
    Max,
    Sum,
    Mean,
    Vocabulary,
}

impl AnalyzerKind {
    fn combiner(self) -> &'static str {
        match self {
            AnalyzerKind::Min => "min",
            AnalyzerKind::Max => "max",
            AnalyzerKind::Sum => "sum",
            AnalyzerKind::Mean => "mean",
            AnalyzerKind::Vocabulary => "vocabulary",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerSpec {
    /// Otros nodos pueden usar este id para leer el resultado.
    pub id: String,
    pub kind: AnalyzerKind,
    pub input: String,
    /// Sólo para vocabulary.
    pub top_k: Option<usize>,
}

/// Inicializa `table` con pares (keys, values).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableInitializerSpec {
    pub id: String,
    pub table: String,
    pub keys: String,
    pub values: String,
}

/// Grafo armado a partir de un `PipelineSpec`, con sus firmas.
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    pub graph: Graph,
    pub input_signature: BTreeMap<String, TensorRef>,
    pub output_signature: BTreeMap<String, TensorRef>,
}

enum Step<'a> {
    Node(&'a PipelineNode),
    Analyzer(&'a AnalyzerSpec),
    TableInitializer(&'a TableInitializerSpec),
}

impl Step<'_> {
    fn id(&self) -> &str {
        match self {
            Step::Node(n) => &n.id,
            Step::Analyzer(a) => &a.id,
            Step::TableInitializer(t) => &t.id,
        }
    }

    fn references(&self) -> Vec<&str> {
        match self {
            Step::Node(n) => n.inputs.iter().map(String::as_str).collect(),
            Step::Analyzer(a) => vec![a.input.as_str()],
            Step::TableInitializer(t) => vec![t.table.as_str(), t.keys.as_str(), t.values.as_str()],
        }
    }
}

struct Resolver {
    /// id de analizador -> tensor de su salida
    aliases: HashMap<String, TensorRef>,
}

impl Resolver {
    fn resolve(&self, reference: &str) -> Result<TensorRef> {
        match self.aliases.get(reference) {
            Some(tensor) => Ok(tensor.clone()),
            None => TensorRef::parse(reference),
        }
    }

    fn is_available(&self, graph: &Graph, reference: &str) -> bool {
        self.resolve(reference)
            .map(|t| graph.contains_tensor(&t))
            .unwrap_or(false)
    }
}

impl PipelineSpec {
    /// Arma el grafo. Los pasos se agregan en cuanto todas sus referencias
    /// existen, así el orden dentro del JSON no importa.
    pub fn to_graph(&self) -> Result<PipelineGraph> {
        let mut graph = Graph::new();
        let mut input_signature = BTreeMap::new();
        for name in &self.inputs {
            input_signature.insert(name.clone(), graph.placeholder(name)?);
        }

        let node_ids: HashSet<&str> = self.nodes.iter().map(|n| n.id.as_str()).collect();
        if let Some(dup) = self.analyzers.iter().find(|a| node_ids.contains(a.id.as_str())) {
            return Err(PlanError::InvalidGraph(format!(
                "id duplicado entre nodo y analizador: {}",
                dup.id
            )));
        }

        let mut resolver = Resolver {
            aliases: HashMap::new(),
        };
        let mut pending: Vec<Step> = self
            .nodes
            .iter()
            .map(Step::Node)
            .chain(self.analyzers.iter().map(Step::Analyzer))
            .chain(self.table_initializers.iter().map(Step::TableInitializer))
            .collect();

        while !pending.is_empty() {
            let (ready, blocked): (Vec<Step>, Vec<Step>) = pending.into_iter().partition(|step| {
                step.references()
                    .iter()
                    .all(|r| resolver.is_available(&graph, r))
            });
            if ready.is_empty() {
                let ids: Vec<&str> = blocked.iter().map(Step::id).collect();
                return Err(PlanError::InvalidGraph(format!(
                    "referencias desconocidas o circulares en: {}",
                    ids.join(", ")
                )));
            }
            for step in ready {
                add_step(&mut graph, &mut resolver, step)?;
            }
            pending = blocked;
        }

        let mut output_signature = BTreeMap::new();
        for (name, reference) in &self.outputs {
            let tensor = resolver.resolve(reference)?;
            if !graph.contains_tensor(&tensor) {
                return Err(PlanError::UnknownTensor(tensor.name()));
            }
            output_signature.insert(name.clone(), tensor);
        }

        Ok(PipelineGraph {
            graph,
            input_signature,
            output_signature,
        })
    }
}

fn add_step(graph: &mut Graph, resolver: &mut Resolver, step: Step) -> Result<()> {
    match step {
        Step::Node(node) => {
            let inputs = node
                .inputs
                .iter()
                .map(|r| resolver.resolve(r))
                .collect::<Result<Vec<_>>>()?;
            graph.add_op(&node.id, &node.op, inputs, node.attrs.clone(), node.num_outputs)?;
        }
        Step::Analyzer(spec) => {
            if resolver.aliases.contains_key(&spec.id) {
                return Err(PlanError::InvalidGraph(format!(
                    "analizador duplicado: {}",
                    spec.id
                )));
            }
            let input = resolver.resolve(&spec.input)?;
            let output = match spec.kind {
                AnalyzerKind::Vocabulary => {
                    analyzers::vocabulary(graph, &input, spec.top_k, &spec.id)?
                }
                kind => analyzers::combine_analyzer(graph, &[input], kind.combiner(), 1, &spec.id)?
                    .remove(0),
            };
            resolver.aliases.insert(spec.id.clone(), output);
        }
        Step::TableInitializer(spec) => {
            let inputs = [&spec.table, &spec.keys, &spec.values]
                .iter()
                .map(|r| resolver.resolve(r))
                .collect::<Result<Vec<_>>>()?;
            graph.add_op(&spec.id, "InitializeTable", inputs, BTreeMap::new(), 0)?;
            graph.add_table_initializer(&spec.id)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build;
    use serde_json::json;

    fn spec(value: serde_json::Value) -> PipelineSpec {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn pipeline_min_max_arma_grafo_y_sinks() {
        let p = spec(json!({
            "inputs": ["x"],
            "nodes": [
                { "id": "centered", "op": "Sub", "inputs": ["x", "x_min"] },
                { "id": "scaled", "op": "Mul", "inputs": ["centered", "x_max"],
                  "attrs": { "factor": { "float": 0.5 } } }
            ],
            "analyzers": [
                { "id": "x_min", "kind": "min", "input": "x" },
                { "id": "x_max", "kind": "max", "input": "centered" }
            ],
            "outputs": { "scaled": "scaled" }
        }));

        let mut pg = p.to_graph().unwrap();
        assert_eq!(pg.input_signature["x"], TensorRef::new("x", 0));
        assert_eq!(pg.output_signature["scaled"], TensorRef::new("scaled", 0));
        assert_eq!(pg.graph.tensor_sinks().len(), 2);
        assert!(pg.graph.operation("x_min/output").is_some());

        let plan = build(
            &mut pg.graph,
            &pg.input_signature,
            &pg.output_signature,
            None,
            None,
        )
        .unwrap();
        assert_eq!(plan.phases.len(), 2);
        assert_eq!(plan.phases[1].tensor_bindings, vec!["x_max/output".to_string()]);
    }

    #[test]
    fn pipeline_con_vocabulario_y_tabla() {
        let p = spec(json!({
            "inputs": ["tokens"],
            "nodes": [
                { "id": "table", "op": "HashTable" },
                { "id": "ids", "op": "LookupTableFind", "inputs": ["table", "tokens"] },
                { "id": "vocab_values", "op": "Range", "inputs": ["vocab"] }
            ],
            "analyzers": [
                { "id": "vocab", "kind": "vocabulary", "input": "tokens", "top_k": 100 }
            ],
            "table_initializers": [
                { "id": "init", "table": "table", "keys": "vocab", "values": "vocab_values" }
            ],
            "outputs": { "ids": "ids" }
        }));

        let pg = p.to_graph().unwrap();
        assert_eq!(pg.graph.table_initializers(), &["init".to_string()]);
        assert!(pg.graph.tensor_sinks()[0].is_asset_filepath);
    }

    #[test]
    fn referencia_desconocida_es_error() {
        let p = spec(json!({
            "inputs": ["x"],
            "nodes": [ { "id": "y", "op": "Neg", "inputs": ["nope"] } ]
        }));
        let err = p.to_graph().unwrap_err();
        assert!(matches!(err, PlanError::InvalidGraph(msg) if msg.contains('y')));

        let p = spec(json!({
            "inputs": ["x"],
            "outputs": { "out": "missing:1" }
        }));
        assert_eq!(
            p.to_graph().unwrap_err(),
            PlanError::UnknownTensor("missing:1".into())
        );
    }

    #[test]
    fn id_repetido_entre_nodo_y_analizador_es_error() {
        let p = spec(json!({
            "inputs": ["x"],
            "nodes": [ { "id": "m", "op": "Neg", "inputs": ["x"] } ],
            "analyzers": [ { "id": "m", "kind": "min", "input": "x" } ]
        }));
        let err = p.to_graph().unwrap_err();
        assert_eq!(
            err,
            PlanError::InvalidGraph("id duplicado entre nodo y analizador: m".into())
        );
    }

    #[test]
    fn salida_de_varias_posiciones() {
        let p = spec(json!({
            "inputs": ["x"],
            "nodes": [ { "id": "split", "op": "Split", "inputs": ["x"], "num_outputs": 2 } ],
            "outputs": { "second": "split:1" }
        }));
        let pg = p.to_graph().unwrap();
        assert_eq!(pg.output_signature["second"], TensorRef::new("split", 1));
    }
}
