use clap::Parser;
use tickloop_server::network::TcpTransport;
use tickloop_server::protocol::ChatLogHandler;
use tickloop_server::{Config, ServerLoop};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 9000)]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Number of dispatch threads (0 = number of CPUs)
    #[arg(short = 't', long, default_value_t = 0)]
    threads: usize,

    /// Tick period in milliseconds
    #[arg(long, default_value_t = 16)]
    tick_ms: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Create configuration
    let config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        let threads = if args.threads == 0 {
            num_cpus::get()
        } else {
            args.threads
        };

        Config {
            bind_addr: args.bind.clone(),
            port: args.port,
            dispatch_threads: threads,
            tick_interval_ms: args.tick_ms,
            log_level: args.log_level.clone(),
            ..Default::default()
        }
    };

    // Initialize tracing
    let log_level = if args.verbose {
        "debug"
    } else {
        &config.log_level
    };
    tracing_subscriber::fmt()
        .with_env_filter(format!("tickloop_server={}", log_level))
        .init();

    config.validate()?;
    let addr = config.socket_addr()?;

    info!(
        "Starting tickloop-server v{} on {} ({} dispatch threads, {}ms ticks)",
        env!("CARGO_PKG_VERSION"),
        addr,
        config.dispatch_threads,
        config.tick_interval_ms
    );

    let transport = TcpTransport::new(&config)?;
    let mut server = ServerLoop::new(transport, ChatLogHandler, &config);

    // Bind failure is fatal; no retry
    server.start(addr)?;

    // Setup signal handlers for graceful shutdown
    let shutdown = server.shutdown_handle();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal, shutting down gracefully...");
        shutdown.trigger();
    })?;

    // Run the server
    if let Err(e) = server.run() {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}
