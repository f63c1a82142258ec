use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;

use planner::{render_plan, CacheDict, CacheEntryKey, Phase, Plan, PlanNode};

/// `{ "<partición>": { "<clave>": "<base64>" } }`
pub fn parse_cache(raw: &str) -> Result<CacheDict> {
    let encoded: BTreeMap<String, BTreeMap<String, String>> = serde_json::from_str(raw)?;
    let mut cache = CacheDict::new();
    for (dataset_key, entries) in encoded {
        let decoded = cache.entry(dataset_key.clone()).or_default();
        for (key, value) in entries {
            let bytes = STANDARD
                .decode(value.as_bytes())
                .with_context(|| format!("base64 inválido en {dataset_key}/{key}"))?;
            decoded.insert(CacheEntryKey::new(key), bytes);
        }
    }
    Ok(cache)
}

#[derive(Serialize)]
struct CacheOutputEntry {
    dataset_key: String,
    cache_key: String,
    /// Etiqueta del nodo que codifica el acumulador.
    label: String,
}

#[derive(Serialize)]
struct PlanReport<'a> {
    phases: &'a [Phase],
    nodes: Vec<PlanNode>,
    cache_outputs: Option<Vec<CacheOutputEntry>>,
}

fn cache_entries(plan: &Plan) -> Option<Vec<CacheOutputEntry>> {
    plan.cache_outputs.as_ref().map(|outputs| {
        outputs
            .iter()
            .map(|((dataset_key, cache_key), node)| CacheOutputEntry {
                dataset_key: dataset_key.clone(),
                cache_key: cache_key.to_string(),
                label: node.operation_def().label().to_string(),
            })
            .collect()
    })
}

pub fn render_json(plan: &Plan) -> Result<String> {
    let report = PlanReport {
        phases: &plan.phases,
        nodes: render_plan(&plan.saved_model_future)?,
        cache_outputs: cache_entries(plan),
    };
    Ok(serde_json::to_string_pretty(&report)?)
}

pub fn render_phases(phases: &[Phase]) -> String {
    let mut out = String::new();
    for phase in phases {
        let _ = writeln!(out, "fase {}: {}", phase.index, phase.tensor_bindings.join(", "));
        if !phase.table_initializers.is_empty() {
            let _ = writeln!(out, "  tablas: {}", phase.table_initializers.join(", "));
        }
    }
    out
}

pub fn render_text(plan: &Plan) -> Result<String> {
    let mut out = render_phases(&plan.phases);

    out.push_str("\nnodos:\n");
    for node in render_plan(&plan.saved_model_future)? {
        let inputs: Vec<String> = node
            .inputs
            .iter()
            .map(|i| format!("{}:{}", i.node, i.value_index))
            .collect();
        let _ = writeln!(
            out,
            "  {:>3} {:<26} {} <- [{}]",
            node.id,
            node.kind,
            node.label,
            inputs.join(", ")
        );
    }

    match cache_entries(plan) {
        Some(entries) => {
            out.push_str("\nsalidas de cache:\n");
            for e in entries {
                let _ = writeln!(out, "  {} {}", e.dataset_key, e.cache_key);
            }
        }
        None => out.push_str("\ncache deshabilitado\n"),
    }
    Ok(out)
}
