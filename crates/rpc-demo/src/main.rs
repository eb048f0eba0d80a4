//! Runs providers and a consumer of a hello service in one process.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use proven_rpc::{
    DrainOutcome, Registry, RpcConfig, RpcContext, RpcServer, ServiceDefinition, ServiceKey,
    Strategy,
};
use proven_rpc_registry_memory::MemoryRegistry;
use tracing::{Level, info, warn};

/// Demo error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// RPC runtime error
    #[error(transparent)]
    Rpc(#[from] proven_rpc::Error),

    /// Signal handler error
    #[error("signal handler error: {0}")]
    Signal(#[from] std::io::Error),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StrategyArg {
    RoundRobin,
    ConsistentHash,
    MinimumResponseTime,
}

impl From<StrategyArg> for Strategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::RoundRobin => Self::RoundRobin,
            StrategyArg::ConsistentHash => Self::ConsistentHash {
                virtual_nodes: proven_rpc::balancer::DEFAULT_VIRTUAL_NODES,
            },
            StrategyArg::MinimumResponseTime => Self::MinimumResponseTime,
        }
    }
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// TOML configuration file; defaults apply when omitted
    #[arg(long, env = "PROVEN_RPC_CONFIG")]
    config: Option<PathBuf>,

    /// Number of providers to start
    #[arg(long, default_value_t = 2, env = "PROVEN_RPC_PROVIDERS")]
    providers: u16,

    /// Number of calls the consumer makes
    #[arg(long, default_value_t = 10, env = "PROVEN_RPC_CALLS")]
    calls: u32,

    /// Load balancing strategy, overriding the configuration file
    #[arg(long, value_enum, env = "PROVEN_RPC_STRATEGY")]
    strategy: Option<StrategyArg>,

    /// Serializer name (json or cbor), overriding the configuration file
    #[arg(long, env = "PROVEN_RPC_SERIALIZER")]
    serializer: Option<String>,

    /// Compressor name (none or gzip), overriding the configuration file
    #[arg(long, env = "PROVEN_RPC_COMPRESSOR")]
    compressor: Option<String>,

    /// Keep serving after the calls until interrupted
    #[arg(long, env = "PROVEN_RPC_SERVE")]
    serve: bool,

    /// Log level
    #[arg(long, default_value_t = Level::INFO, env = "PROVEN_RPC_LOG_LEVEL")]
    log_level: Level,
}

fn hello() -> ServiceKey {
    ServiceKey::new("HelloService")
}

fn hello_service(provider: u16) -> ServiceDefinition {
    ServiceDefinition::new(hello()).method("sayHi", move |(msg,): (String,)| async move {
        info!("provider {} received {:?}", provider, msg);
        Ok::<_, Infallible>(format!("hi consumer: {msg}"))
    })
}

fn load_config(args: &Args) -> Result<RpcConfig, Error> {
    let mut config = match &args.config {
        Some(path) => RpcConfig::from_file(path)?,
        None => RpcConfig::default(),
    };

    if let Some(strategy) = args.strategy {
        config.strategy = strategy.into();
    }
    if let Some(serializer) = &args.serializer {
        config.serializer.clone_from(serializer);
    }
    if let Some(compressor) = &args.compressor {
        config.compressor.clone_from(compressor);
    }

    // Every provider in this process needs its own port
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;

    config.validate()?;
    Ok(config)
}

async fn start_providers(
    config: &RpcConfig,
    registry: &Arc<dyn Registry>,
    count: u16,
) -> Result<Vec<RpcServer>, Error> {
    let mut servers = Vec::with_capacity(usize::from(count));

    for provider in 0..count {
        let mut provider_config = config.clone();
        provider_config.app_name = format!("provider-{provider}");
        provider_config.id.machine_id = u64::from(provider % 32);

        let context = RpcContext::new(provider_config, Arc::clone(registry))?;
        let server = context.server().await?;
        server.publish(hello_service(provider)).await?;
        server.start()?;

        info!("provider {} serving on {}", provider, server.local_address());
        servers.push(server);
    }

    Ok(servers)
}

async fn wait_for_signal() -> Result<(), Error> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received interrupt signal");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    tracing_subscriber::fmt().with_max_level(args.log_level).init();

    let config = load_config(&args)?;
    let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new());

    let servers = start_providers(&config, &registry, args.providers.max(1)).await?;

    let mut consumer_config = config.clone();
    consumer_config.app_name = "consumer".to_string();
    consumer_config.id.machine_id = 31;
    let consumer = RpcContext::new(consumer_config, Arc::clone(&registry))?;
    consumer.start()?;

    let proxy = consumer.client().reference(hello()).await?;
    for call in 0..args.calls {
        match proxy
            .invoke::<_, String>("sayHi", (format!("hi #{call}"),))
            .await
        {
            Ok(reply) => info!("call {} answered: {}", call, reply),
            Err(e) => warn!("call {} failed: {}", call, e),
        }
    }

    if args.serve {
        info!("Serving until interrupted");
        wait_for_signal().await?;
    }

    for server in &servers {
        match server.shutdown().await {
            DrainOutcome::Drained => {}
            DrainOutcome::TimedOut { remaining } => {
                warn!("{} requests abandoned on {}", remaining, server.local_address());
            }
        }
    }
    consumer.shutdown().await;

    info!("Shut down");
    Ok(())
}
