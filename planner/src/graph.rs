use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
};

use crate::error::{PlanError, Result};
use crate::nodes::ValueNode;

/// Tipo de operación de los placeholders de entrada.
pub const PLACEHOLDER_OP: &str = "Placeholder";

/// Valor de un atributo de operación.
///
/// `Func` representa un sub-cómputo embebido: no se puede serializar de forma
/// determinista, así que el hasher de rutas lo rechaza.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Dtype(String),
    Shape(Vec<i64>),
    List(Vec<AttrValue>),
    Func(String),
}

impl AttrValue {
    pub fn contains_func(&self) -> bool {
        match self {
            AttrValue::Func(_) => true,
            AttrValue::List(items) => items.iter().any(AttrValue::contains_func),
            _ => false,
        }
    }
}

/// Referencia a una salida concreta de una operación del grafo.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TensorRef {
    pub op: String,
    pub value_index: usize,
}

impl TensorRef {
    pub fn new(op: impl Into<String>, value_index: usize) -> Self {
        Self {
            op: op.into(),
            value_index,
        }
    }

    /// Parsea "op" o "op:N".
    pub fn parse(s: &str) -> Result<Self> {
        match s.rsplit_once(':') {
            Some((op, idx)) if !op.is_empty() => {
                let value_index = idx
                    .parse::<usize>()
                    .map_err(|_| PlanError::InvalidGraph(format!("nombre de tensor inválido: {s}")))?;
                Ok(Self::new(op, value_index))
            }
            Some(_) => Err(PlanError::InvalidGraph(format!(
                "nombre de tensor inválido: {s}"
            ))),
            None => Ok(Self::new(s, 0)),
        }
    }

    pub fn name(&self) -> String {
        format!("{}:{}", self.op, self.value_index)
    }
}

impl fmt::Display for TensorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.op, self.value_index)
    }
}

/// Nombre estable de un tensor: sin el sufijo ":0" cuando es la salida por defecto.
pub fn tensor_name(tensor: &TensorRef) -> String {
    if tensor.value_index == 0 {
        tensor.op.clone()
    } else {
        tensor.name()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub name: String,
    pub op_type: String,
    /// Ordenados por nombre (BTreeMap), así la serialización es determinista.
    pub attrs: BTreeMap<String, AttrValue>,
    pub inputs: Vec<TensorRef>,
    pub num_outputs: usize,
}

impl Operation {
    pub fn output(&self, value_index: usize) -> TensorRef {
        TensorRef::new(self.name.clone(), value_index)
    }

    pub fn outputs(&self) -> Vec<TensorRef> {
        (0..self.num_outputs).map(|i| self.output(i)).collect()
    }
}

/// Salida de un analizador que todavía hay que ligar de vuelta al grafo.
#[derive(Debug, Clone)]
pub struct TensorSink {
    pub tensor: TensorRef,
    pub value_node: ValueNode,
    pub is_asset_filepath: bool,
}

/// Grafo de cómputo acíclico.
///
/// Las operaciones sólo pueden referenciar tensores ya existentes, así que el
/// orden de inserción es siempre un orden topológico.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    ops: Vec<Operation>,
    index: HashMap<String, usize>,
    tensor_replacements: Vec<TensorSink>,
    table_initializers: Vec<String>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn placeholder(&mut self, name: &str) -> Result<TensorRef> {
        let mut outs = self.add_op(name, PLACEHOLDER_OP, Vec::new(), BTreeMap::new(), 1)?;
        Ok(outs.remove(0))
    }

    pub fn add_op(
        &mut self,
        name: &str,
        op_type: &str,
        inputs: Vec<TensorRef>,
        attrs: BTreeMap<String, AttrValue>,
        num_outputs: usize,
    ) -> Result<Vec<TensorRef>> {
        if name.is_empty() || name.contains(':') {
            return Err(PlanError::InvalidGraph(format!(
                "nombre de operación inválido: {name:?}"
            )));
        }
        if self.index.contains_key(name) {
            return Err(PlanError::InvalidGraph(format!(
                "operación duplicada: {name}"
            )));
        }
        for input in &inputs {
            if !self.contains_tensor(input) {
                return Err(PlanError::UnknownTensor(input.name()));
            }
        }

        let op = Operation {
            name: name.to_string(),
            op_type: op_type.to_string(),
            attrs,
            inputs,
            num_outputs,
        };
        let outputs = op.outputs();
        self.index.insert(op.name.clone(), self.ops.len());
        self.ops.push(op);
        Ok(outputs)
    }

    pub fn operation(&self, name: &str) -> Option<&Operation> {
        self.index.get(name).map(|&i| &self.ops[i])
    }

    pub fn producer(&self, tensor: &TensorRef) -> Result<&Operation> {
        self.operation(&tensor.op)
            .filter(|op| tensor.value_index < op.num_outputs)
            .ok_or_else(|| PlanError::UnknownTensor(tensor.name()))
    }

    pub fn contains_tensor(&self, tensor: &TensorRef) -> bool {
        self.producer(tensor).is_ok()
    }

    /// Operaciones en orden topológico (el de inserción).
    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.ops.iter()
    }

    /// Devuelve `base` si está libre, si no `base_1`, `base_2`, ...
    pub fn unique_name(&self, base: &str) -> String {
        if !self.index.contains_key(base) {
            return base.to_string();
        }
        let mut i = 1;
        loop {
            let candidate = format!("{base}_{i}");
            if !self.index.contains_key(&candidate) {
                return candidate;
            }
            i += 1;
        }
    }

    pub fn add_tensor_sink(&mut self, sink: TensorSink) -> Result<()> {
        if !self.contains_tensor(&sink.tensor) {
            return Err(PlanError::UnknownTensor(sink.tensor.name()));
        }
        self.tensor_replacements.push(sink);
        Ok(())
    }

    pub fn tensor_sinks(&self) -> &[TensorSink] {
        &self.tensor_replacements
    }

    /// Saca todos los sinks pendientes y deja la colección vacía.
    pub fn take_tensor_sinks(&mut self) -> Vec<TensorSink> {
        std::mem::take(&mut self.tensor_replacements)
    }

    /// Registra una operación de inicialización de tabla.
    /// Su primera entrada es el handle de la tabla.
    pub fn add_table_initializer(&mut self, init_op: &str) -> Result<()> {
        let op = self
            .operation(init_op)
            .ok_or_else(|| PlanError::InvalidGraph(format!("inicializador desconocido: {init_op}")))?;
        if op.inputs.is_empty() {
            return Err(PlanError::InvalidGraph(format!(
                "el inicializador {init_op} no recibe handle de tabla"
            )));
        }
        if !self.table_initializers.iter().any(|n| n == init_op) {
            self.table_initializers.push(init_op.to_string());
        }
        Ok(())
    }

    pub fn table_initializers(&self) -> &[String] {
        &self.table_initializers
    }
}
