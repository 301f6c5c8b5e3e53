use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use fragstream_common::{CameraHandle, CameraState, ModelId};
use fragstream_convert::{ConvertOptions, Converter, JobOutcome, Progress, RuntimeLocator};
use fragstream_engine::{DecodeState, EngineConfig, FragmentModels};
use glam::Vec3;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fragstream-cli", about = "CLI tool for fragment streaming")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Engine configuration file (YAML, or JSON by extension)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert an IFC file into a fragment payload
    Convert {
        input: PathBuf,
        /// Output payload path
        #[arg(short, long)]
        output: PathBuf,
        /// Schema runtime description (JSON); the built-in runtime otherwise
        #[arg(long)]
        runtime: Option<PathBuf>,
    },
    /// Print the header and contents summary of a payload
    Inspect { file: PathBuf },
    /// Load a payload into the engine and report visibility for a camera
    Load {
        file: PathBuf,
        #[arg(long, default_value = "model")]
        model_id: String,
        /// Camera position as x,y,z
        #[arg(long, value_parser = parse_vec3, default_value = "0,10,10")]
        eye: Vec3,
        /// Camera target as x,y,z
        #[arg(long, value_parser = parse_vec3, default_value = "0,0,0")]
        target: Vec3,
        /// Seconds to wait for decode and refresh
        #[arg(long, default_value = "30")]
        timeout: u64,
    },
}

fn parse_vec3(s: &str) -> Result<Vec3, String> {
    let parts: Vec<f32> = s
        .split(',')
        .map(|p| p.trim().parse::<f32>().map_err(|e| format!("{p:?}: {e}")))
        .collect::<Result<_, _>>()?;
    match parts.as_slice() {
        [x, y, z] => Ok(Vec3::new(*x, *y, *z)),
        _ => Err(format!("expected x,y,z, got {s:?}")),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    let config = match &cli.config {
        Some(path) => EngineConfig::from_path(path)?,
        None => EngineConfig::default(),
    };
    tracing::debug!(workers = config.channel.workers, "engine config ready");

    match cli.command {
        Commands::Convert {
            input,
            output,
            runtime,
        } => {
            let bytes =
                std::fs::read(&input).with_context(|| format!("reading {}", input.display()))?;
            println!("Converting {} ({} bytes)", input.display(), bytes.len());

            let options = ConvertOptions {
                progress_callback: Some(Box::new(|p: &Progress| {
                    println!("  {:>5.1}% {}", p.value * 100.0, p.stage);
                })),
                runtime: runtime.map(RuntimeLocator::Path).unwrap_or_default(),
            };
            let mut job = Converter::convert(bytes, options);
            tracing::info!(job = %job.id(), input = %input.display(), "conversion started");
            match job.wait() {
                JobOutcome::Completed(payload) => {
                    fragstream_format::export_to(&output, payload)?;
                    tracing::info!(path = %output.display(), bytes = payload.len(), "payload exported");
                    println!("Wrote {} ({} bytes)", output.display(), payload.len());
                }
                JobOutcome::Failed(e) => bail!("conversion failed: {e}"),
                JobOutcome::Cancelled => bail!("conversion cancelled"),
            }
        }
        Commands::Inspect { file } => {
            let payload = fragstream_format::import_from(&file)?;
            let header = fragstream_format::peek_header(&payload)?;
            println!("Payload: {}", file.display());
            println!(
                "Header: version={}, body={} bytes, sha256={}",
                header.version, header.body_len, header.body_sha256
            );

            let model = fragstream_format::decode(&payload)?;
            println!("Model: name={}, schema={}", model.name, model.schema);
            println!(
                "Contents: batches={}, elements={}, triangles={}",
                model.batches.len(),
                model.element_count(),
                model.triangle_count()
            );
            println!(
                "Bounds: min={:?}, max={:?}",
                model.bounds.min, model.bounds.max
            );
            for batch in &model.batches {
                println!(
                    "  batch {}: class={}, items={}, triangles={}",
                    batch.id,
                    batch.class,
                    batch.items.len(),
                    batch.triangle_count()
                );
            }
        }
        Commands::Load {
            file,
            model_id,
            eye,
            target,
            timeout,
        } => {
            let mut engine = FragmentModels::new(&config)?;
            let camera = CameraHandle::new(CameraState::look_at(eye, target));
            engine.bind_camera(&camera);

            let id = ModelId::new(model_id);
            let epoch = engine.load_file(&file, id.clone())?;
            println!("Loading {} as {id} (epoch {epoch})", file.display());
            if !engine.wait_idle(Duration::from_secs(timeout)) {
                bail!("timed out after {timeout}s");
            }

            let model = engine
                .model(&id)
                .with_context(|| format!("model {id} vanished"))?;
            match model.state() {
                DecodeState::Ready => {}
                DecodeState::Failed => {
                    bail!("decode failed: {}", model.failure().unwrap_or("unknown"))
                }
                state => bail!("model ended in state {state:?}"),
            }
            let geometry = model
                .geometry()
                .context("ready model has no geometry")?;
            let visible: Vec<_> = geometry.visible_batches().collect();
            println!(
                "Ready: batches={}, visible={}, culled={}",
                geometry.batch_count(),
                visible.len(),
                geometry.visibility.culled
            );
            for (batch, lod) in visible {
                println!("  batch {} ({}): {lod:?}", batch.id, batch.class);
            }
            let stats = engine.scheduler_stats();
            println!(
                "Scheduler: rounds={}, applied={}, discarded={}",
                stats.rounds_completed, stats.results_applied, stats.results_discarded
            );
            engine.shutdown();
            tracing::info!(model = %id, "engine shut down after load");
        }
    }

    Ok(())
}
