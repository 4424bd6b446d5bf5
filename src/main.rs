mod cli;

use knive::{
    channel::Channel,
    config,
    context::KniveContext,
    feed::FeedClient,
    outlets::StdinSource,
    server::{self, AppContext, SettingsStore},
};
use knive_av::ToolRegistry;
use knive_core::config::RelayConfig;
use knive_pipeline::PipelineGraph;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use std::path::Path;
use tokio_util::sync::CancellationToken;

const VERBOSE_FILTER: &str =
    "knive=trace,knive_pipeline=trace,knive_core=debug,knive_av=debug,knive_media=debug,tower_http=debug";
const DEFAULT_FILTER: &str = "knive=info,knive_pipeline=info,knive_av=info,knive_media=info,tower_http=info";

async fn serve(config_path: Option<&Path>) -> Result<()> {
    let (config, loaded_from) = config::load_config_or_default(config_path)?;
    match &loaded_from {
        Some(path) => tracing::info!("Loaded config from {:?}", path),
        None => tracing::warn!("No config file found; no channels will run"),
    }

    let settings = SettingsStore::new(&config, loaded_from);
    let knive = KniveContext::new(config);
    tracing::info!("Starting Knive with {} channel(s)", knive.config.channels.len());

    let mut channels = Vec::with_capacity(knive.config.channels.len());
    for channel_config in &knive.config.channels {
        let channel = Channel::from_config(channel_config, &knive)
            .await
            .with_context(|| format!("Failed to build channel '{}'", channel_config.slug))?;
        channels.push(channel);
    }

    for channel in &channels {
        match channel.start().await {
            Ok(()) => tracing::info!(
                "Channel '{}' waiting for its feed on {}",
                channel.slug(),
                channel
                    .feed_address()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "?".into())
            ),
            Err(e) => tracing::error!("Channel '{}' failed to start: {}", channel.slug(), e),
        }
    }

    let shutdown = CancellationToken::new();
    let mut admin = if knive.config.server.enabled {
        let ctx = AppContext::new(knive.clone(), &channels, settings);
        Some(tokio::spawn(server::start_server(ctx, shutdown.clone())))
    } else {
        None
    };

    let server_result = match admin.as_mut() {
        Some(handle) => tokio::select! {
            _ = server::shutdown_signal() => None,
            result = handle => Some(result),
        },
        None => {
            server::shutdown_signal().await;
            None
        }
    };

    // Cleanup
    tracing::info!("Shutting down...");
    shutdown.cancel();
    let server_result = match (server_result, admin) {
        (Some(result), _) => result,
        (None, Some(handle)) => handle.await,
        (None, None) => Ok(Ok(())),
    };

    for channel in &channels {
        if channel.is_recording().await {
            if let Err(e) = channel.stop_episode().await {
                tracing::warn!("Channel '{}': failed to close episode: {}", channel.slug(), e);
            }
        }
        if let Err(e) = channel.stop().await {
            tracing::warn!("Channel '{}' did not stop cleanly: {}", channel.slug(), e);
        }
    }

    server_result.context("Admin API task panicked")?
}

async fn send(host: String, port: u16, secret: String) -> Result<()> {
    let graph = PipelineGraph::new();
    let source = StdinSource::new("stdin");
    let mut end_of_input = source.end_of_input();
    let src = graph.add_stage(source);
    let client = FeedClient::new(format!("send/{host}:{port}"), RelayConfig { host, port, secret })
        .wait_for_connection(true);
    let client = graph.add_stage(client);
    graph.add_consumer(src, client)?;

    graph.start(src).await.context("Failed to connect to the feed")?;
    tracing::info!("Sending stdin");

    tokio::select! {
        _ = end_of_input.wait_for(|done| *done) => tracing::info!("End of input"),
        _ = server::shutdown_signal() => {}
    }

    graph.stop_tree(src).await?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins, then the configured level, then the presets
    let env_filter = std::env::var("RUST_LOG")
        .ok()
        .or_else(|| configured_level(cli.config.as_deref()))
        .unwrap_or_else(|| {
            if cli.verbose {
                VERBOSE_FILTER.to_string()
            } else {
                DEFAULT_FILTER.to_string()
            }
        });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(serve(cli.config.as_deref()))
        }
        Commands::Send { host, port, secret } => {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            rt.block_on(send(host, port, secret))
        }
        Commands::CheckTools => check_tools(cli.config.as_deref()),
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("knive {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn configured_level(config_path: Option<&Path>) -> Option<String> {
    config::load_config_or_default(config_path)
        .ok()
        .and_then(|(config, _)| config.logging.level)
}

fn check_tools(config_path: Option<&Path>) -> Result<()> {
    println!("Checking external tools...\n");

    let (config, _) = config::load_config_or_default(config_path)?;
    let tools = ToolRegistry::discover(&config.tools).check_all();
    let mut all_ok = true;

    for tool in &tools {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);

        if let Some(ref version) = tool.version {
            print!(" ({})", version.lines().next().unwrap_or(""));
        }

        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }

        println!();
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
    } else {
        println!("Some tools are missing. Channels with HTTP live outlets will not start.");
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    match path.map(Path::to_path_buf).or_else(config::find_config) {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let config = config::load_config(&p)?;
            println!("✓ Configuration is valid");
            println!("  Admin API: {}:{} (enabled: {})", config.server.host, config.server.port, config.server.enabled);
            println!("  Data dir: {}", config.paths.data_dir.display());
            println!("  Channels: {}", config.channels.len());
            for channel in &config.channels {
                let outlets: Vec<&str> = channel.outlets.iter().map(|o| o.kind()).collect();
                println!(
                    "    {} ({}) feed {}:{} -> [{}]",
                    channel.name,
                    channel.slug,
                    channel.feed.host,
                    channel.feed.port,
                    outlets.join(", ")
                );
            }
        }
        None => {
            println!("No config file specified or found, using defaults");
            let config = knive_core::config::Config::default();
            println!("Default config:");
            println!("  Admin API: {}:{}", config.server.host, config.server.port);
        }
    }

    Ok(())
}
