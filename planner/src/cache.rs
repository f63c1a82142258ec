use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

use crate::error::{PlanError, Result};
use crate::hashing::{PathHash, PathHasher};
use crate::nodes::{OperationDef, ValueNode};

/// Clave de una entrada de cache, derivada del contenido (no del nombre).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheEntryKey(String);

impl CacheEntryKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheEntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cache de entrada: partición -> clave -> acumulador ya codificado.
pub type CacheDict = BTreeMap<String, BTreeMap<CacheEntryKey, Vec<u8>>>;

/// Cache de salida: (partición, clave) -> nodo que produce el acumulador codificado.
pub type CacheOutputs = BTreeMap<(String, CacheEntryKey), ValueNode>;

/// Ruta única (hash) de cada tensor expuesto por los artefactos intermedios.
pub type TensorKeysToPaths = BTreeMap<String, Option<PathHash>>;

/// `<label saneado>-<hash en hex>`; sólo caracteres seguros para rutas.
pub fn make_cache_entry_key(label: &str, hashed_path: &PathHash) -> CacheEntryKey {
    let safe_label: String = label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    CacheEntryKey(format!("{}-{}", safe_label, hashed_path.to_hex()))
}

pub fn cache_contains(cache_dict: &CacheDict, dataset_key: &str, key: &CacheEntryKey) -> bool {
    cache_dict
        .get(dataset_key)
        .map(|entries| entries.contains_key(key))
        .unwrap_or(false)
}

/// Hash de la ruta hasta `operation_def`: padres, clase de la operación y sus
/// parámetros. `ExtractFromDict` no aporta sus campos sino la ruta única de
/// cada tensor que extrae.
///
/// Devuelve `None` si algún componente es desconocido.
pub fn make_next_hashed_path(
    parent_hashed_paths: &[Option<PathHash>],
    operation_def: &OperationDef,
    tensor_keys_to_paths: &TensorKeysToPaths,
) -> Result<Option<PathHash>> {
    let mut paths_to_hash: Vec<Option<Vec<u8>>> = parent_hashed_paths
        .iter()
        .map(|p| p.map(|h| h.as_bytes().to_vec()))
        .collect();
    paths_to_hash.push(Some(operation_def.kind_name().as_bytes().to_vec()));

    match operation_def {
        OperationDef::ExtractFromDict { keys, .. } => {
            for key in keys {
                let path = tensor_keys_to_paths
                    .get(key)
                    .ok_or_else(|| PlanError::UnknownTensorKey(key.clone()))?;
                paths_to_hash.push(path.map(|h| h.as_bytes().to_vec()));
            }
        }
        _ => paths_to_hash.push(Some(operation_def.field_bytes()?)),
    }

    let mut hasher = PathHasher::new();
    for path in paths_to_hash {
        let Some(bytes) = path else {
            return Ok(None);
        };
        hasher.update(bytes);
    }
    Ok(Some(hasher.finish()))
}
