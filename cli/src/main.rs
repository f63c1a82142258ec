mod report;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::{env, fs, path::PathBuf};
use tracing::info;

use planner::{build, CacheDict, PipelineSpec};

/// Filtro de logs.
/// - PLANNER_LOG=planner=debug para ver cada sink y cada hit/miss de cache
/// - si no está definida: planner=info,planner_cli=info
fn log_filter() -> String {
    env::var("PLANNER_LOG").unwrap_or_else(|_| "planner=info,planner_cli=info".to_string())
}

#[derive(Parser)]
#[command(name = "planner-cli")]
#[command(about = "Arma el plan por fases de un pipeline de preprocesamiento")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Arma el plan completo (fases, nodos y salidas de cache)
    Plan {
        #[arg(value_name = "PIPELINE_JSON")]
        pipeline: PathBuf,

        /// Partición del dataset; se puede repetir
        #[arg(long = "dataset-key", value_name = "K")]
        dataset_keys: Vec<String>,

        /// Cache de entrada: partición -> clave -> acumulador en base64
        #[arg(long, value_name = "CACHE_JSON")]
        cache: Option<PathBuf>,

        #[arg(long, value_enum, default_value = "text")]
        format: Format,
    },
    /// Muestra sólo en qué fase queda cada analizador
    Phases {
        #[arg(value_name = "PIPELINE_JSON")]
        pipeline: PathBuf,
    },
}

fn load_pipeline(path: &PathBuf) -> Result<PipelineSpec> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("no se pudo leer {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("pipeline inválido en {}", path.display()))
}

fn load_cache(path: &PathBuf) -> Result<CacheDict> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("no se pudo leer {}", path.display()))?;
    report::parse_cache(&raw).with_context(|| format!("cache inválido en {}", path.display()))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Plan {
            pipeline,
            dataset_keys,
            cache,
            format,
        } => {
            let spec = load_pipeline(&pipeline)?;
            let cache_dict = cache.as_ref().map(load_cache).transpose()?;
            let mut pg = spec.to_graph()?;

            info!(
                "armando plan de {} ({} particiones, cache {})",
                pipeline.display(),
                dataset_keys.len(),
                if cache_dict.is_some() { "sí" } else { "no" }
            );

            let keys = (!dataset_keys.is_empty()).then_some(dataset_keys.as_slice());
            let plan = build(
                &mut pg.graph,
                &pg.input_signature,
                &pg.output_signature,
                keys,
                cache_dict.as_ref(),
            )?;

            let out = match format {
                Format::Text => report::render_text(&plan)?,
                Format::Json => report::render_json(&plan)?,
            };
            println!("{out}");
        }
        Commands::Phases { pipeline } => {
            let spec = load_pipeline(&pipeline)?;
            let mut pg = spec.to_graph()?;
            let plan = build(
                &mut pg.graph,
                &pg.input_signature,
                &pg.output_signature,
                None,
                None,
            )?;
            print!("{}", report::render_phases(&plan.phases));
        }
    }

    Ok(())
}
