//! Planificador de fases para grafos de preprocesamiento con analizadores
//! de pasada completa, con cache de acumuladores por partición.

pub mod analyzers;
pub mod builder;
pub mod cache;
pub mod error;
pub mod graph;
pub mod graph_tools;
pub mod hashing;
pub mod nodes;
pub mod optimizer;
pub mod pipeline;

pub use builder::{build, Phase, Plan};
pub use cache::{CacheDict, CacheEntryKey, CacheOutputs};
pub use error::{PlanError, Result};
pub use graph::{Graph, TensorRef};
pub use nodes::{plan_fingerprint, render_plan, PlanNode, ValueNode};
pub use pipeline::{PipelineGraph, PipelineSpec};
