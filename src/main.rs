use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sortie::config::Config;
use sortie::contact::{ChannelRegistry, ContactService, ForwardedChannel, TcpTransport};
use sortie::core::{AgentDefaults, Definitions, InMemoryFactStore, Paw};
use sortie::fleet::FleetRegistry;
use sortie::orchestration::{
    EngineContext, EngineSettings, OperationConfig, PlannerRegistry, Scheduler,
};
use sortie::payload::LocalPayloadStore;
use sortie::state::{JsonFileStore, MemoryStore, OperationStore};
use sortie::Result;

/// Sortie - adversary emulation operation server
#[derive(Parser, Debug)]
#[command(name = "sortie")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    SORTIE_DEBUG=1     Enable debug logging (alternative to --debug)\n    SORTIE_LOG=<filter>  Override the log filter, e.g. sortie=trace")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.sortie/sortie.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (default: ~/.sortie/sortie.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Listen for agents and drive operations until Ctrl-C
    Serve(ServeArgs),

    /// Load the definitions directory and report what it contains
    Validate {
        /// Definitions directory (default: from config)
        #[arg(long)]
        definitions: Option<PathBuf>,
    },
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct ServeArgs {
    /// Listen address, overriding `bind` from the config
    #[arg(long)]
    pub bind: Option<String>,

    /// Start an operation for this adversary
    #[arg(long)]
    pub adversary: Option<String>,

    /// Planner definition for the started operation
    #[arg(long, default_value = "atomic")]
    pub planner: String,

    /// Fact source seeding the started operation
    #[arg(long, requires = "adversary")]
    pub source: Option<String>,

    /// Restrict the started operation to one agent group
    #[arg(long, requires = "adversary")]
    pub group: Option<String>,

    /// Keep the started operation running after it runs out of work
    #[arg(long, requires = "adversary")]
    pub keep_open: bool,

    /// Trust this agent as soon as it checks in (repeatable)
    #[arg(long = "trust", value_name = "PAW")]
    pub trust: Vec<String>,

    /// Trust every agent of this group as soon as it checks in (repeatable)
    #[arg(long = "trust-group", value_name = "GROUP")]
    pub trust_group: Vec<String>,

    /// Trust agents relayed through the forwarded channel
    #[arg(long)]
    pub trust_forwarded: bool,

    /// Keep operation state in memory only
    #[arg(long)]
    pub ephemeral: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    sortie::log::init_with_debug(cli.debug);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Serve(args) => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(serve(config, args))
        }
        Command::Validate { definitions } => run_validate(&config, definitions),
    }
}

async fn serve(config: Config, args: ServeArgs) -> Result<()> {
    info!("Sortie starting");
    let definitions = Definitions::load_dir(&config.definitions_dir()?)?;
    let mut defaults = AgentDefaults::from(&config);
    defaults.trusted_paws.extend(args.trust.iter().map(Paw::new));
    defaults.trusted_groups.extend(args.trust_group.iter().cloned());
    if !defaults.trusted_paws.is_empty() || !defaults.trusted_groups.is_empty() {
        info!(
            "Trusting on check-in: paws={:?} groups={:?}",
            defaults.trusted_paws, defaults.trusted_groups
        );
    }
    let registry = Arc::new(FleetRegistry::new(defaults));
    let ctx = EngineContext {
        definitions: Arc::new(definitions),
        registry: registry.clone(),
        facts: Arc::new(InMemoryFactStore::new()),
        planners: Arc::new(PlannerRegistry::with_builtins()),
        settings: EngineSettings::from(&config),
        cancel: CancellationToken::new(),
    };

    let store: Arc<dyn OperationStore> = if args.ephemeral {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(JsonFileStore::new(config.state_dir()?.join("operations")))
    };
    let scheduler = Arc::new(Scheduler::new(ctx.clone(), store));
    if let Err(e) = scheduler.resume_stored().await {
        warn!("Could not resume stored operations: {}", e);
    }

    if let Some(adversary) = &args.adversary {
        let mut op_config = OperationConfig::new(adversary, adversary, &args.planner)
            .with_auto_close(!args.keep_open);
        if let Some(source) = &args.source {
            op_config = op_config.with_source(source);
        }
        if let Some(group) = &args.group {
            op_config = op_config.with_group(group);
        }
        let op = scheduler.create_operation(op_config).await?;
        println!("Started operation {} ({})", op.id(), op.name());
    }

    let mut channels = ChannelRegistry::with_builtins();
    if args.trust_forwarded {
        channels.register(Arc::new(ForwardedChannel::new(true)));
    }
    let payloads = Arc::new(LocalPayloadStore::new(
        config.payload_dir()?,
        config.exfil_dir()?,
    ));
    let service = Arc::new(ContactService::new(
        registry,
        scheduler.clone(),
        payloads,
        channels,
    ));

    let bind = args.bind.unwrap_or_else(|| config.bind.clone());
    let transport = TcpTransport::bind(&bind, service).await?;
    println!("Listening for agents on {}", transport.local_addr()?);

    let listener = tokio::spawn(transport.serve(ctx.cancel.clone()));
    let runner = tokio::spawn(scheduler.clone().run());

    tokio::signal::ctrl_c().await?;
    println!("Shutting down...");
    scheduler.shutdown();
    let _ = listener.await;
    let _ = runner.await;
    info!("Sortie stopped");
    Ok(())
}

fn run_validate(config: &Config, dir: Option<PathBuf>) -> Result<()> {
    let dir = match dir {
        Some(dir) => dir,
        None => config.definitions_dir()?,
    };
    let definitions = Definitions::load_dir(&dir)?;
    let (abilities, adversaries, planners, sources) = definitions.counts();
    println!("Definitions in {}:", dir.display());
    println!("  abilities:   {}", abilities);
    println!("  adversaries: {}", adversaries);
    println!("  planners:    {}", planners);
    println!("  sources:     {}", sources);
    Ok(())
}
