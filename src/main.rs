use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::Deserialize;
use structopt::StructOpt;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use virtance_agent::config::{AgentConfig, ConfigManager, LogFormat, LoggingConfig};
use virtance_agent::network::{FirewallPolicy, FloatingIpBinding, Rule};
use virtance_agent::Agent;

#[derive(Debug, StructOpt)]
#[structopt(name = "virtance-agent", about = "Compute-node agent for virtances and their network policy")]
struct Opt {
    /// Path to configuration file
    #[structopt(short, long, parse(from_os_str))]
    config: Option<PathBuf>,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Download a template image into the cache and verify its checksum
    FetchImage { url: String, checksum: String },

    /// Per-entity firewall chains
    Firewall(FirewallCommand),

    /// Floating IP aliases and DNAT redirection
    FloatingIp(FloatingIpCommand),

    /// Host-wide packet filter lock
    Lock(LockCommand),
}

#[derive(Debug, StructOpt)]
enum FirewallCommand {
    Attach {
        #[structopt(flatten)]
        target: PolicyTarget,

        /// YAML file with `inbound` and `outbound` rule lists
        #[structopt(long, parse(from_os_str))]
        rules: Option<PathBuf>,
    },
    Detach {
        #[structopt(flatten)]
        target: PolicyTarget,
    },
}

#[derive(Debug, StructOpt)]
struct PolicyTarget {
    #[structopt(long)]
    entity: String,

    #[structopt(long)]
    public: Option<Ipv4Addr>,

    #[structopt(long)]
    private: Option<Ipv4Addr>,
}

#[derive(Debug, StructOpt)]
enum FloatingIpCommand {
    Attach(BindingArgs),
    Detach(BindingArgs),
}

#[derive(Debug, StructOpt)]
struct BindingArgs {
    #[structopt(long)]
    floating: Ipv4Addr,

    #[structopt(long, default_value = "32")]
    prefix: u8,

    #[structopt(long)]
    gateway: Ipv4Addr,

    #[structopt(long)]
    fixed: Ipv4Addr,
}

impl From<BindingArgs> for FloatingIpBinding {
    fn from(args: BindingArgs) -> Self {
        FloatingIpBinding {
            floating: args.floating,
            prefix: args.prefix,
            gateway: args.gateway,
            fixed: args.fixed,
        }
    }
}

#[derive(Debug, StructOpt)]
enum LockCommand {
    /// Print `locked` or `free`
    Status,
    /// Force the lock free
    Release,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RuleSet {
    inbound: Vec<Rule>,
    outbound: Vec<Rule>,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Plain => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

fn load_rules(path: Option<PathBuf>) -> Result<RuleSet, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)?;
            Ok(serde_yaml::from_str(&raw)?)
        }
        None => Ok(RuleSet::default()),
    }
}

async fn execute(agent: &Agent, command: Command) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::FetchImage { url, checksum } => {
            let path = agent.fetch_image(&url, &checksum).await?;
            println!("{}", path.display());
        }
        Command::Firewall(FirewallCommand::Attach { target, rules }) => {
            let rules = load_rules(rules)?;
            let policy = FirewallPolicy {
                entity_id: target.entity,
                public_address: target.public,
                private_address: target.private,
                inbound: rules.inbound,
                outbound: rules.outbound,
            };
            agent.network().firewall().attach(&policy).await?;
        }
        Command::Firewall(FirewallCommand::Detach { target }) => {
            agent
                .network()
                .firewall()
                .detach(&target.entity, target.public, target.private)
                .await?;
        }
        Command::FloatingIp(FloatingIpCommand::Attach(args)) => {
            agent.network().floating_ips().attach(&args.into()).await?;
        }
        Command::FloatingIp(FloatingIpCommand::Detach(args)) => {
            agent.network().floating_ips().detach(&args.into()).await?;
        }
        Command::Lock(LockCommand::Status) => {
            println!("{}", agent.locks().state()?);
        }
        Command::Lock(LockCommand::Release) => {
            agent.locks().mark_free()?;
            info!("Lock released");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opt = Opt::from_args();

    let config = match &opt.config {
        Some(path) => ConfigManager::load_from_file(path)?.get_config().clone(),
        None => ConfigManager::from_config(AgentConfig::default())?.get_config().clone(),
    };
    init_tracing(&config.logging);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting virtance-agent");

    let agent = Agent::with_host_tools(config);
    execute(&agent, opt.command).await.map_err(|e| {
        error!("{}", e);
        e
    })
}
