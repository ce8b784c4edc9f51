mod cli;

use previewly::{
    config, server,
    streaming::{ChunkSink, CreatePreview, Dispatcher, ServeOutcome, SessionManager, WriterSink},
};

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use std::path::{Path, PathBuf};

async fn start_server(
    host: Option<String>,
    port: Option<u16>,
    config_path: Option<&Path>,
) -> Result<()> {
    let mut config = config::load_config_or_default(config_path)?;

    // Override host/port from CLI if specified
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    config::validate_config(&config)?;

    tracing::info!("Starting Previewly server");
    tracing::info!(
        "Server will listen on {}:{}",
        config.server.host,
        config.server.port
    );
    tracing::info!(
        max_window_chunks = config.buffer.max_window_chunks,
        chunk_size_bytes = config.buffer.chunk_size_bytes,
        max_sessions = config.sessions.max_concurrent,
        "Buffer policy loaded"
    );

    server::start_server(config).await
}

async fn run_preview(
    url: String,
    output: Option<PathBuf>,
    start_index: u64,
    max_chunks: Option<u64>,
    config_path: Option<&Path>,
) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;
    let sessions = SessionManager::new(&config);

    let session = sessions
        .create(CreatePreview {
            start_index,
            ..CreatePreview::new(url)
        })
        .context("Failed to start preview")?;
    let id = session.id();
    let mut dispatcher = Dispatcher::attach(session)?;

    let result = match &output {
        Some(path) => {
            let file = tokio::fs::File::create(path)
                .await
                .with_context(|| format!("Failed to create output file: {:?}", path))?;
            let mut sink = WriterSink::new(tokio::io::BufWriter::new(file));
            drain(&mut dispatcher, &mut sink, max_chunks).await
        }
        None => {
            let mut sink = WriterSink::new(tokio::io::stdout());
            drain(&mut dispatcher, &mut sink, max_chunks).await
        }
    };

    drop(dispatcher);
    sessions.destroy(&id);

    let outcome = result.context("Preview failed")?;
    tracing::info!(
        session_id = %id,
        delivered = outcome.delivered(),
        ?outcome,
        "Preview finished"
    );
    if let Some(path) = output {
        eprintln!("Wrote {} chunks to {:?}", outcome.delivered(), path);
    }

    Ok(())
}

async fn drain<S: ChunkSink>(
    dispatcher: &mut Dispatcher,
    sink: &mut S,
    max_chunks: Option<u64>,
) -> previewly_common::Result<ServeOutcome> {
    match max_chunks {
        Some(max) => dispatcher.serve_up_to(sink, max).await,
        None => dispatcher.serve(sink).await,
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "previewly=trace,previewly_common=debug,tower_http=debug".to_string()
        } else {
            "previewly=info,tower_http=info".to_string()
        }
    });

    // Logs go to stderr so `preview` can write media to stdout.
    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Start { host, port } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(start_server(host, port, cli.config.as_deref()))
        }
        Commands::Preview {
            url,
            output,
            start_index,
            max_chunks,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_preview(
                url,
                output,
                start_index,
                max_chunks,
                cli.config.as_deref(),
            ))
        }
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("previewly {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let config = config::load_config(p)?;
            println!("✓ Configuration is valid");
            config
        }
        None => {
            println!("No config file specified, using defaults");
            config::Config::default()
        }
    };

    let buffer = &config.buffer;
    println!("  Server: {}:{}", config.server.host, config.server.port);
    println!(
        "  Window: {} chunks of {} bytes (up to {} bytes per session)",
        buffer.max_window_chunks,
        buffer.chunk_size_bytes,
        buffer.memory_ceiling_bytes()
    );
    println!(
        "  Prefetch: {} (min {}, max {})",
        buffer.default_prefetch, buffer.min_prefetch, buffer.max_prefetch
    );
    match buffer.rewind_limit_secs() {
        Some(secs) => println!(
            "  Rewind limit: {} chunks ({:.0}s)",
            buffer.rewind_limit_chunks(),
            secs
        ),
        None => println!("  Rewind limit: {} chunks", buffer.rewind_limit_chunks()),
    }
    println!(
        "  Fetch: timeout {}s, {} retries",
        config.fetch.timeout_secs, config.fetch.max_retries
    );
    println!("  Max sessions: {}", config.sessions.max_concurrent);

    Ok(())
}
