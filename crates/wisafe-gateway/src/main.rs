//! `wisafe-gateway`: connect to a radio module and run the gateway engine.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use wisafe_gateway::{
    Context, ControlQueue, Engine, GatewayConfig, GatewayError, GatewayMessage, GatewayResult,
    MemoryShadow, SystemClock,
};
use wisafe_link::{FrameSink, LinkDriver, TcpTransport};

#[derive(Parser, Debug)]
#[command(author, version, about = "WiSafe gateway engine")]
struct Args {
    /// YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Radio module address (host:port), overriding the configuration.
    #[arg(long)]
    connect: Option<String>,

    /// Log filter, e.g. `debug` or `wisafe_gateway=trace`. Defaults to RUST_LOG, then `info`.
    #[arg(long)]
    log_level: Option<String>,

    /// Start in learn mode.
    #[arg(long)]
    learn: bool,

    /// Seconds before learn mode turns itself off.
    #[arg(long, default_value_t = 300)]
    learn_timeout: u32,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.log_level.as_deref());

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn run(args: Args) -> GatewayResult<()> {
    let mut config = match &args.config {
        Some(path) => GatewayConfig::load(path)?,
        None => GatewayConfig::default(),
    };
    config.apply_env()?;
    if let Some(addr) = args.connect {
        config.connect = Some(addr);
    }
    config.validate()?;
    let addr = config.connect.clone().ok_or(GatewayError::Missing(
        "no radio module address; use --connect or set `connect` in the configuration",
    ))?;

    wisafe_metrics::describe_metrics();

    info!("Connecting to radio module at {}", addr);
    let transport = TcpTransport::connect(addr.as_str(), config.link.read_poll())
        .map_err(|source| GatewayError::Connect {
            addr: addr.clone(),
            source,
        })?;

    let pool = config.link.build_pool();
    let (tx, rx) = crossbeam_channel::unbounded::<GatewayMessage>();
    let link = Arc::new(LinkDriver::start(transport, pool.clone(), tx.clone(), &config.link)?);

    let controls = ControlQueue::new(tx);
    let on_interrupt = controls.clone();
    ctrlc::set_handler(move || {
        info!("Interrupted, shutting down");
        on_interrupt.shutdown();
    })?;

    if args.learn {
        controls.learn(true, args.learn_timeout);
    }

    let sink: Arc<dyn FrameSink> = link.clone();
    let ctx = Context::new(MemoryShadow::new(), pool, sink, Arc::new(SystemClock));
    let mut engine = Engine::new(&config, ctx);

    let handle = thread::Builder::new()
        .name("wisafe-engine".to_string())
        .spawn(move || {
            engine.start();
            engine.run(rx);
        })
        .map_err(|e| GatewayError::Engine(e.to_string()))?;

    handle
        .join()
        .map_err(|_| GatewayError::Engine("engine thread panicked".to_string()))?;

    link.close()?;
    info!("Gateway stopped");
    Ok(())
}
