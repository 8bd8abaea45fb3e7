use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cogvideo::hub::{ensure_snapshot, Fetched, SnapshotRequest};
use cogvideo::resolve::{resolve, resolve_controlnet, resolve_gguf, resolve_gguf_vae, resolve_tora};
use cogvideo::{
    ControlNetVariant, GgufVariant, HfHubFetcher, LoaderConfig, ModelVariant, ToraVariant,
};

/// Resolve a CogVideo model and optionally pre-fetch its weights.
#[derive(Parser, Debug)]
#[command(name = "cogvideo-fetch", version)]
struct Args {
    #[command(subcommand)]
    kind: Kind,

    /// Root of the model folders (defaults to COGVIDEO_MODELS_DIR or ./models)
    #[arg(long, global = true)]
    models_dir: Option<PathBuf>,

    /// Download whatever is missing instead of only printing the plan
    #[arg(long, global = true)]
    fetch: bool,

    /// Show hub download progress
    #[arg(long, global = true)]
    progress: bool,
}

#[derive(Subcommand, Debug)]
enum Kind {
    /// Diffusers-layout model, e.g. THUDM/CogVideoX-5b
    Model { id: String },
    /// Quantized single-file transformer, e.g. CogVideoX_5b_GGUF_Q4_0.safetensors
    Gguf { file: String },
    Controlnet { id: String },
    Tora { id: String },
    /// List the identifiers each loader offers
    List,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cogvideo=info")),
        )
        .init();

    let args = Args::parse();
    let mut config = LoaderConfig::from_env();
    if let Some(dir) = args.models_dir {
        config.models_dir = dir;
    }
    config.show_progress = args.progress;
    let paths = config.paths();

    // (request, marker) pairs, in fetch order
    let plan: Vec<(SnapshotRequest, PathBuf)> = match args.kind {
        Kind::List => {
            print_known("model", ModelVariant::KNOWN);
            print_known("gguf", GgufVariant::KNOWN);
            print_known("controlnet", ControlNetVariant::KNOWN);
            print_known("tora", ToraVariant::KNOWN);
            return Ok(());
        }
        Kind::Model { id } => {
            let variant = ModelVariant::parse(&id)?;
            let resolution = resolve(&variant, &paths);
            println!("model:     {}", variant);
            println!("family:    {:?} {:?} {:?}", variant.family(), variant.size(), variant.capability());
            println!("base path: {}", resolution.base_path.display());
            println!("scheduler: {}", resolution.scheduler.file_name());
            vec![(resolution.snapshot_request(), resolution.marker())]
        }
        Kind::Gguf { file } => {
            let variant = GgufVariant::parse(&file)?;
            let resolution = resolve_gguf(&variant, &paths);
            let vae = resolve_gguf_vae(&paths);
            println!("model:       {}", variant);
            println!("in_channels: {}", variant.in_channels());
            println!("model path:  {}", resolution.model_path.display());
            println!("vae path:    {}", vae.vae_path.display());
            vec![
                (resolution.snapshot_request(), resolution.model_path.clone()),
                (vae.snapshot_request(), vae.vae_path.clone()),
            ]
        }
        Kind::Controlnet { id } => {
            let variant = ControlNetVariant::parse(&id)?;
            let resolution = resolve_controlnet(&variant, &paths);
            println!("base path: {}", resolution.base_path.display());
            vec![(resolution.snapshot_request(), resolution.marker().to_path_buf())]
        }
        Kind::Tora { id } => {
            let variant = ToraVariant::parse(&id)?;
            let resolution = resolve_tora(&variant, &paths);
            [&resolution.fuser, &resolution.traj_extractor]
                .into_iter()
                .map(|c| {
                    println!("component: {}", c.path.display());
                    (resolution.snapshot_request(c), c.path.clone())
                })
                .collect()
        }
    };

    for (request, marker) in &plan {
        println!(
            "repo {} -> {} (allow {:?}, ignore {:?}){}",
            request.repo_id,
            request.local_dir.display(),
            request.allow_patterns,
            request.ignore_patterns,
            if marker.exists() { " [present]" } else { "" }
        );
    }

    if args.fetch {
        let fetcher = HfHubFetcher::new()
            .with_cache_dir(config.hf_cache_dir.clone())
            .with_token(config.hf_token.clone())
            .with_progress(config.show_progress);
        for (request, marker) in &plan {
            match ensure_snapshot(&fetcher, request, marker)? {
                Fetched::AlreadyPresent => println!("{}: already present", request.repo_id),
                Fetched::Downloaded => println!("{}: downloaded", request.repo_id),
            }
        }
    }
    Ok(())
}

fn print_known(label: &str, ids: &[&str]) {
    println!("{}:", label);
    for id in ids {
        println!("  {}", id);
    }
}
