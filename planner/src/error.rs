use std::collections::BTreeSet;

/// Errores del planificador.
///
/// Ninguno es transitorio: todos indican un grafo mal formado o un contrato
/// roto por quien construyó el grafo, así que se propagan tal cual al caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("no se pueden serializar los atributos de `{op}`: `{attr}` contiene una función")]
    UnsupportedAttribute { op: String, attr: String },

    #[error("la operación `{0}` no es particionable y no puede ser cacheable")]
    UncacheableNonPartitionable(String),

    #[error("la operación `{label}` declara {actual} salidas, se esperaba {expected}")]
    InvalidOutputArity {
        label: String,
        expected: usize,
        actual: usize,
    },

    #[error("la operación particionable `{label}` recibe {inputs} entradas (sólo se soporta 1)")]
    MultiInputPartitionable { label: String, inputs: usize },

    #[error("se pidió la vista fina de `{0}` pero no existe")]
    MissingFineGrainedView(String),

    #[error("`{0}` no esperaba una entrada con vista fina")]
    UnexpectedFineGrainedInput(String),

    #[error("particiones {actual:?} no coinciden con las declaradas {expected:?}")]
    PartitionKeyMismatch {
        expected: BTreeSet<String>,
        actual: BTreeSet<String>,
    },

    #[error("las entradas de `{0}` tienen distinta cantidad de particiones")]
    InconsistentPartitionCardinality(String),

    #[error("tensor desconocido: {0}")]
    UnknownTensor(String),

    #[error("clave de tensor sin ruta registrada: {0}")]
    UnknownTensorKey(String),

    #[error("no se pudo derivar la ruta de `{0}` (depende de un valor sin identidad)")]
    UnhashablePath(String),

    #[error("grafo inválido: {0}")]
    InvalidGraph(String),

    #[error("dependencia circular: ningún sink quedó listo, pendientes {pending:?}")]
    DependencyCycle { pending: Vec<String> },

    #[error("valor inválido en `{label}`: {reason}")]
    InvalidValue { label: String, reason: String },
}

pub type Result<T> = std::result::Result<T, PlanError>;
