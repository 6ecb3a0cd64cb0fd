use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use soma_flow::config::EngineConfig;
use soma_flow::domain::engine::scheduler::LocalScheduler;
use soma_flow::domain::remote_object::ObjectServer;
use soma_flow::{WorkflowEngine, logger};

/// Workflow engine serving one computing resource
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// Resource section of the configuration to serve
    #[arg(short, long, default_value = "local")]
    resource: String,

    /// Port to listen on, overriding the configuration (0 picks a free port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory receiving engine.log
    #[arg(short, long, default_value = "log")]
    log_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logger::init(&args.log_dir);

    let config = EngineConfig::load(&args.config)?;
    let resource = config.resource(&args.resource)?;
    log::info!("Serving resource '{}' from staging directory '{}'", args.resource, resource.staging_dir.display());

    let scheduler = Arc::new(LocalScheduler::new(resource.max_running_jobs));
    let engine = Arc::new(WorkflowEngine::new(resource, scheduler).context("cannot create the workflow engine")?);

    let server = ObjectServer::bind(args.port.or(resource.port), resource.max_frame_length)
        .await
        .with_context(|| format!("cannot bind the object server for resource '{}'", args.resource))?;
    let handle = server.register(Arc::clone(&engine)).await;

    // Submitting hosts read the handle from stdout.
    println!("{}", handle);
    log::info!("Workflow engine registered as {}", handle);

    let _housekeeping = engine.spawn_housekeeping(resource.housekeeping_interval());
    server.serve_forever().await?;
    Ok(())
}
