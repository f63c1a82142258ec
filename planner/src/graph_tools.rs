use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::{PlanError, Result};
use crate::graph::{Graph, Operation, TensorRef, PLACEHOLDER_OP};
use crate::hashing::{describe_path, PathHash, PathNode};

/// Oráculo de dependencias sobre el grafo de cómputo.
pub trait DependencyOracle {
    /// Si el tensor se puede calcular sin correr más analizadores.
    fn ready_to_run(&self, tensor: &TensorRef) -> Result<bool>;

    /// Hash de la ruta del tensor hasta sus fuentes. `None` si depende de la
    /// salida de un analizador.
    fn unique_path(&self, tensor: &TensorRef) -> Result<Option<PathHash>>;

    /// Inicializadores de tablas cuyas entradas ya están listas.
    fn ready_table_initializers(&self) -> Vec<String>;
}

/// Análisis de un `Graph` dado qué salidas de analizadores ya están resueltas.
///
/// - entradas de la firma: listas, ruta = hash de su clave
/// - salidas de analizadores: listas si están resueltas, ruta desconocida
/// - handle de tabla: listo cuando lo están las demás entradas de su inicializador
/// - el resto: listo si todas sus entradas lo están
pub struct GraphAnalyzer {
    ready: HashMap<TensorRef, Result<bool>>,
    paths: HashMap<TensorRef, Result<Option<PathHash>>>,
    ready_table_initializers: Vec<String>,
}

struct Analysis<'g> {
    graph: &'g Graph,
    input_keys: HashMap<TensorRef, String>,
    replaced: &'g BTreeMap<TensorRef, bool>,
    initializer_by_handle: HashMap<TensorRef, &'g Operation>,
    ready: HashMap<TensorRef, Result<bool>>,
    paths: HashMap<TensorRef, Result<Option<PathHash>>>,
    in_progress: HashSet<TensorRef>,
}

impl<'g> Analysis<'g> {
    /// Memoiza también los errores: un placeholder fuera de la firma sólo
    /// falla para los tensores que dependen de él.
    fn compute_ready(&mut self, tensor: &TensorRef) -> Result<bool> {
        if let Some(ready) = self.ready.get(tensor) {
            return ready.clone();
        }
        if !self.in_progress.insert(tensor.clone()) {
            return Err(PlanError::InvalidGraph(format!(
                "ciclo en el grafo alrededor de {tensor}"
            )));
        }

        let ready = self.compute_ready_uncached(tensor);

        self.in_progress.remove(tensor);
        self.ready.insert(tensor.clone(), ready.clone());
        ready
    }

    fn compute_ready_uncached(&mut self, tensor: &TensorRef) -> Result<bool> {
        if self.input_keys.contains_key(tensor) {
            return Ok(true);
        }
        if let Some(&resolved) = self.replaced.get(tensor) {
            return Ok(resolved);
        }

        let graph = self.graph;
        let op = graph.producer(tensor)?;
        check_declared(op)?;
        let mut deps: Vec<TensorRef> = op.inputs.clone();
        if let Some(init) = self.initializer_by_handle.get(tensor) {
            deps.extend(init.inputs.iter().skip(1).cloned());
        }
        let mut all_ready = true;
        for dep in &deps {
            all_ready &= self.compute_ready(dep)?;
        }
        Ok(all_ready)
    }

    // Sólo se llama después de `compute_ready`: todo tensor dentro de un
    // ciclo ya tiene guardado su error.
    fn compute_path(&mut self, tensor: &TensorRef) -> Result<Option<PathHash>> {
        if let Some(path) = self.paths.get(tensor) {
            return path.clone();
        }
        if let Some(Err(e)) = self.ready.get(tensor) {
            return Err(e.clone());
        }

        let path = if let Some(key) = self.input_keys.get(tensor) {
            describe_path(Some(PathNode::Bytes(key.as_bytes())), &[])
        } else if self.replaced.contains_key(tensor) {
            Ok(None)
        } else {
            self.compute_op_output_path(tensor)
        };

        self.paths.insert(tensor.clone(), path.clone());
        path
    }

    fn compute_op_output_path(&mut self, tensor: &TensorRef) -> Result<Option<PathHash>> {
        let graph = self.graph;
        let op = graph.producer(tensor)?;
        check_declared(op)?;
        let mut deps: Vec<TensorRef> = op.inputs.clone();
        if let Some(init) = self.initializer_by_handle.get(tensor) {
            deps.extend(init.inputs.iter().skip(1).cloned());
        }

        let mut parents = Vec::with_capacity(deps.len());
        for dep in &deps {
            parents.push(self.compute_path(dep)?);
        }
        let op_path = describe_path(Some(PathNode::Operation(op)), &parents)?;
        describe_path(Some(PathNode::Tensor(tensor)), &[op_path])
    }
}

/// Los placeholders sólo son válidos si están en la firma de entrada, y
/// esos ya se resolvieron antes de llegar acá.
fn check_declared(op: &Operation) -> Result<()> {
    if op.op_type == PLACEHOLDER_OP {
        return Err(PlanError::InvalidGraph(format!(
            "placeholder {} no está en la firma de entrada",
            op.name
        )));
    }
    Ok(())
}

impl GraphAnalyzer {
    pub fn new(
        graph: &Graph,
        input_signature: &BTreeMap<String, TensorRef>,
        replaced_tensors_ready: &BTreeMap<TensorRef, bool>,
    ) -> Result<Self> {
        let mut input_keys = HashMap::new();
        for (key, tensor) in input_signature {
            if !graph.contains_tensor(tensor) {
                return Err(PlanError::UnknownTensor(tensor.name()));
            }
            input_keys.insert(tensor.clone(), key.clone());
        }

        let mut initializers: Vec<&Operation> = Vec::new();
        let mut initializer_by_handle = HashMap::new();
        for name in graph.table_initializers() {
            let init = graph
                .operation(name)
                .ok_or_else(|| PlanError::InvalidGraph(format!("inicializador desconocido: {name}")))?;
            if let Some(handle) = init.inputs.first() {
                initializer_by_handle.insert(handle.clone(), init);
            }
            initializers.push(init);
        }

        let mut analysis = Analysis {
            graph,
            input_keys,
            replaced: replaced_tensors_ready,
            initializer_by_handle,
            ready: HashMap::new(),
            paths: HashMap::new(),
            in_progress: HashSet::new(),
        };

        // como las rutas: los errores quedan guardados por tensor
        for op in graph.operations() {
            for tensor in op.outputs() {
                let _ = analysis.compute_ready(&tensor);
            }
        }

        let mut ready_table_initializers = Vec::new();
        for init in &initializers {
            let mut ready = true;
            for input in &init.inputs {
                ready &= analysis.compute_ready(input)?;
            }
            if ready {
                ready_table_initializers.push(init.name.clone());
            }
        }

        // los errores de ruta quedan guardados por tensor y salen sólo si se piden
        for op in graph.operations() {
            for tensor in op.outputs() {
                let _ = analysis.compute_path(&tensor);
            }
        }

        Ok(Self {
            ready: analysis.ready,
            paths: analysis.paths,
            ready_table_initializers,
        })
    }
}

impl DependencyOracle for GraphAnalyzer {
    fn ready_to_run(&self, tensor: &TensorRef) -> Result<bool> {
        self.ready
            .get(tensor)
            .cloned()
            .ok_or_else(|| PlanError::UnknownTensor(tensor.name()))?
    }

    fn unique_path(&self, tensor: &TensorRef) -> Result<Option<PathHash>> {
        self.paths
            .get(tensor)
            .cloned()
            .ok_or_else(|| PlanError::UnknownTensor(tensor.name()))?
    }

    fn ready_table_initializers(&self) -> Vec<String> {
        self.ready_table_initializers.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::AttrValue;

    fn attrs(pairs: Vec<(&str, AttrValue)>) -> BTreeMap<String, AttrValue> {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    /// x -> sub(x, m) donde m es la salida (pendiente) de un analizador.
    fn graph_con_sink() -> (Graph, BTreeMap<String, TensorRef>, TensorRef, TensorRef) {
        let mut g = Graph::new();
        let x = g.placeholder("x").unwrap();
        let m = g
            .add_op("min/output", "AnalyzerOutput", vec![], BTreeMap::new(), 1)
            .unwrap()
            .remove(0);
        let sub = g
            .add_op("sub", "Sub", vec![x.clone(), m.clone()], BTreeMap::new(), 1)
            .unwrap()
            .remove(0);
        let mut inputs = BTreeMap::new();
        inputs.insert("x".to_string(), x);
        (g, inputs, m, sub)
    }

    #[test]
    fn ready_depende_de_los_sinks_resueltos() {
        let (g, inputs, m, sub) = graph_con_sink();

        let mut replaced = BTreeMap::new();
        replaced.insert(m.clone(), false);
        let analyzer = GraphAnalyzer::new(&g, &inputs, &replaced).unwrap();
        assert!(analyzer.ready_to_run(&inputs["x"]).unwrap());
        assert!(!analyzer.ready_to_run(&m).unwrap());
        assert!(!analyzer.ready_to_run(&sub).unwrap());

        replaced.insert(m.clone(), true);
        let analyzer = GraphAnalyzer::new(&g, &inputs, &replaced).unwrap();
        assert!(analyzer.ready_to_run(&sub).unwrap());
    }

    #[test]
    fn unique_path_es_none_si_depende_de_un_analizador() {
        let (g, inputs, m, sub) = graph_con_sink();
        let mut replaced = BTreeMap::new();
        replaced.insert(m, true);
        let analyzer = GraphAnalyzer::new(&g, &inputs, &replaced).unwrap();

        assert!(analyzer.unique_path(&inputs["x"]).unwrap().is_some());
        assert_eq!(analyzer.unique_path(&sub).unwrap(), None);
        assert!(analyzer
            .unique_path(&TensorRef::new("nope", 0))
            .is_err());
    }

    #[test]
    fn unique_path_no_depende_de_nombres_de_operaciones() {
        let build = |prefix: &str| {
            let mut g = Graph::new();
            let x = g.placeholder(&format!("{prefix}x")).unwrap();
            let y = g
                .add_op(
                    &format!("{prefix}scale"),
                    "Mul",
                    vec![x.clone()],
                    attrs(vec![("factor", AttrValue::Float(2.0))]),
                    1,
                )
                .unwrap()
                .remove(0);
            let mut inputs = BTreeMap::new();
            inputs.insert("x".to_string(), x);
            let analyzer = GraphAnalyzer::new(&g, &inputs, &BTreeMap::new()).unwrap();
            analyzer.unique_path(&y).unwrap()
        };

        assert!(build("a/").is_some());
        assert_eq!(build("a/"), build("otro/"));
    }

    #[test]
    fn atributo_func_falla_solo_al_pedir_la_ruta() {
        let mut g = Graph::new();
        let x = g.placeholder("x").unwrap();
        let ok = g
            .add_op("neg", "Neg", vec![x.clone()], BTreeMap::new(), 1)
            .unwrap()
            .remove(0);
        let bad = g
            .add_op(
                "while",
                "While",
                vec![x.clone()],
                attrs(vec![("body", AttrValue::Func("body_fn".into()))]),
                1,
            )
            .unwrap()
            .remove(0);
        let mut inputs = BTreeMap::new();
        inputs.insert("x".to_string(), x);

        let analyzer = GraphAnalyzer::new(&g, &inputs, &BTreeMap::new()).unwrap();
        assert!(analyzer.ready_to_run(&bad).unwrap());
        assert!(analyzer.unique_path(&ok).unwrap().is_some());
        assert_eq!(
            analyzer.unique_path(&bad).unwrap_err(),
            PlanError::UnsupportedAttribute {
                op: "while".into(),
                attr: "body".into()
            }
        );
    }

    #[test]
    fn tabla_lista_cuando_su_vocabulario_esta_resuelto() {
        let mut g = Graph::new();
        let x = g.placeholder("x").unwrap();
        let vocab = g
            .add_op("vocab/output", "AnalyzerOutput", vec![], BTreeMap::new(), 1)
            .unwrap()
            .remove(0);
        let table = g
            .add_op("table", "HashTable", vec![], BTreeMap::new(), 1)
            .unwrap()
            .remove(0);
        let lookup = g
            .add_op("lookup", "LookupTableFind", vec![table.clone(), x.clone()], BTreeMap::new(), 1)
            .unwrap()
            .remove(0);
        g.add_op("init", "InitializeTableFromFile", vec![table.clone(), vocab.clone()], BTreeMap::new(), 0)
            .unwrap();
        g.add_table_initializer("init").unwrap();

        let mut inputs = BTreeMap::new();
        inputs.insert("x".to_string(), x);

        let mut replaced = BTreeMap::new();
        replaced.insert(vocab.clone(), false);
        let analyzer = GraphAnalyzer::new(&g, &inputs, &replaced).unwrap();
        assert!(!analyzer.ready_to_run(&table).unwrap());
        assert!(!analyzer.ready_to_run(&lookup).unwrap());
        assert!(analyzer.ready_table_initializers().is_empty());

        replaced.insert(vocab, true);
        let analyzer = GraphAnalyzer::new(&g, &inputs, &replaced).unwrap();
        assert!(analyzer.ready_to_run(&lookup).unwrap());
        assert_eq!(analyzer.ready_table_initializers(), vec!["init".to_string()]);
    }

    #[test]
    fn placeholder_fuera_de_la_firma_falla_solo_para_sus_dependientes() {
        let mut g = Graph::new();
        let x = g.placeholder("x").unwrap();
        let extra = g.placeholder("extra").unwrap();
        let neg = g
            .add_op("neg", "Neg", vec![x.clone()], BTreeMap::new(), 1)
            .unwrap()
            .remove(0);
        let uses_extra = g
            .add_op("add", "Add", vec![x.clone(), extra.clone()], BTreeMap::new(), 1)
            .unwrap()
            .remove(0);
        let mut inputs = BTreeMap::new();
        inputs.insert("x".to_string(), x);

        let analyzer = GraphAnalyzer::new(&g, &inputs, &BTreeMap::new()).unwrap();
        assert!(analyzer.ready_to_run(&neg).unwrap());
        assert!(analyzer.unique_path(&neg).unwrap().is_some());

        for tensor in [&extra, &uses_extra] {
            assert!(matches!(
                analyzer.ready_to_run(tensor).unwrap_err(),
                PlanError::InvalidGraph(msg) if msg.contains("extra")
            ));
            assert!(matches!(
                analyzer.unique_path(tensor).unwrap_err(),
                PlanError::InvalidGraph(_)
            ));
        }
    }
}
