use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{PlanError, Result};
use crate::graph::{Operation, TensorRef};

/// Hash de contenido de una ruta del grafo (nodo + ancestros).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathHash([u8; 32]);

impl PathHash {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Marca de la raíz de particionado (la primera aplicación del artefacto).
    pub fn apply_saved_model_root() -> Self {
        let mut hasher = PathHasher::new();
        hasher.update(b"APPLY_SAVEDMODEL");
        hasher.finish()
    }
}

impl fmt::Debug for PathHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PathHash({})", self.to_hex())
    }
}

impl fmt::Display for PathHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Acumulador incremental sobre SHA-256.
pub struct PathHasher {
    inner: Sha256,
}

impl PathHasher {
    pub fn new() -> Self {
        Self {
            inner: Sha256::new(),
        }
    }

    pub fn update(&mut self, bytes: impl AsRef<[u8]>) {
        self.inner.update(bytes.as_ref());
    }

    pub fn finish(self) -> PathHash {
        PathHash(self.inner.finalize().into())
    }
}

impl Default for PathHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Nodo del grafo cuya identidad local se hashea.
#[derive(Debug, Clone, Copy)]
pub enum PathNode<'a> {
    Operation(&'a Operation),
    /// Sólo aporta su índice de salida: la operación productora ya tiene que
    /// venir entre los padres.
    Tensor(&'a TensorRef),
    Bytes(&'a [u8]),
}

/// Serializa los atributos de una operación, ordenados por clave.
/// Falla si alguno contiene una función embebida.
pub fn serialize_op_attrs(op: &Operation) -> Result<Vec<Vec<u8>>> {
    let mut out = Vec::with_capacity(op.attrs.len() * 2);
    for (key, value) in &op.attrs {
        if value.contains_func() {
            return Err(PlanError::UnsupportedAttribute {
                op: op.name.clone(),
                attr: key.clone(),
            });
        }
        let encoded = serde_json::to_vec(value).map_err(|e| PlanError::InvalidValue {
            label: op.name.clone(),
            reason: format!("atributo {key}: {e}"),
        })?;
        out.push(key.as_bytes().to_vec());
        out.push(encoded);
    }
    Ok(out)
}

/// Hash de la ruta desde `node` hasta sus fuentes.
///
/// La identidad local de una operación es su tipo más sus atributos; el
/// nombre no participa.
///
/// Devuelve `None` si el nodo es `None` o si algún padre es `None`: la
/// identidad de ese valor todavía no se conoce (p. ej. la salida de un
/// analizador sin resolver). Los padres se hashean en el orden recibido.
pub fn describe_path(
    node: Option<PathNode<'_>>,
    parents: &[Option<PathHash>],
) -> Result<Option<PathHash>> {
    let Some(node) = node else {
        return Ok(None);
    };
    if parents.iter().any(Option::is_none) {
        return Ok(None);
    }

    let values: Vec<Vec<u8>> = match node {
        PathNode::Operation(op) => {
            let mut values = vec![op.op_type.as_bytes().to_vec()];
            values.extend(serialize_op_attrs(op)?);
            values
        }
        PathNode::Tensor(tensor) => vec![tensor.value_index.to_string().into_bytes()],
        PathNode::Bytes(bytes) => vec![bytes.to_vec()],
    };

    let mut hasher = PathHasher::new();
    for value in &values {
        hasher.update(value);
    }
    for parent in parents.iter().flatten() {
        hasher.update(parent.as_bytes());
    }
    Ok(Some(hasher.finish()))
}
