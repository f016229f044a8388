use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use templar_pipeline::dispatcher::format_status_line;
use templar_pipeline::{ComponentDescriptor, OrchestratorBuilder, PipelineConfig};

/// Drives one end-to-end build over a directory of components.
#[derive(Parser, Debug)]
#[command(name = "templar-pipeline-cli", about = "Build every component under a directory")]
struct Args {
    /// Directory containing component source files.
    #[arg(long)]
    components: PathBuf,

    /// Source file extension to treat as a component (without the dot).
    #[arg(long, default_value = "tmpl")]
    extension: String,

    /// Number of worker threads. 0 resolves to the pipeline default.
    #[arg(long, default_value_t = 0)]
    workers: usize,

    /// Per-build deadline, in milliseconds.
    #[arg(long, default_value_t = 30_000)]
    build_timeout_ms: u64,

    /// Command the pipeline is allowed to invoke for code generation.
    #[arg(long, default_value = "templar-generate")]
    generator: String,

    /// Maximum time to wait for all submitted builds to drain, in
    /// milliseconds, before giving up and stopping anyway.
    #[arg(long, default_value_t = 30_000)]
    drain_timeout_ms: u64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let descriptors = match discover_components(&args.components, &args.extension) {
        Ok(descriptors) => descriptors,
        Err(e) => {
            eprintln!("failed to scan {}: {e}", args.components.display());
            std::process::exit(1);
        }
    };

    if descriptors.is_empty() {
        eprintln!(
            "no *.{} files found under {}",
            args.extension,
            args.components.display()
        );
        std::process::exit(1);
    }

    let config = PipelineConfig {
        worker_count: args.workers,
        build_timeout: Some(Duration::from_millis(args.build_timeout_ms)),
        allowed_commands: vec![args.generator.clone()],
        generator_args: vec!["generate".to_string()],
        ..Default::default()
    };

    let completed = Arc::new(Mutex::new(0usize));
    let completed_for_callback = Arc::clone(&completed);
    let total = descriptors.len();

    let orchestrator = OrchestratorBuilder::new(config)
        .with_callback(Box::new(move |result| {
            println!("{}", format_status_line(result));
            *completed_for_callback.lock().expect("completed lock poisoned") += 1;
        }))
        .build();

    orchestrator.start().expect("pipeline failed to start");

    for descriptor in descriptors {
        if orchestrator.submit(descriptor).is_err() {
            tracing::warn!("pipeline queue closed mid-submission");
            break;
        }
    }

    let deadline = Instant::now() + Duration::from_millis(args.drain_timeout_ms);
    while *completed.lock().expect("completed lock poisoned") < total && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }

    if let Err(e) = orchestrator.stop_with_timeout(Duration::from_secs(5)) {
        eprintln!("pipeline did not shut down cleanly: {e}");
    }

    let snapshot = orchestrator.metrics_snapshot();
    let json = serde_json::to_string_pretty(&snapshot).expect("MetricsSnapshot is always serializable");
    println!("{json}");
}

/// Scans `dir` for files matching `extension`, one [`ComponentDescriptor`]
/// per match. Component name and package are both derived from the
/// file stem; a real embedder's component registry would carry richer
/// metadata than a directory walk can infer.
fn discover_components(
    dir: &std::path::Path,
    extension: &str,
) -> std::io::Result<Vec<Arc<ComponentDescriptor>>> {
    let mut descriptors = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(extension) {
            continue;
        }
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("component")
            .to_string();
        descriptors.push(Arc::new(ComponentDescriptor {
            name: name.clone(),
            source_path: path,
            package: name,
            params: Vec::new(),
        }));
    }
    descriptors.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(descriptors)
}
