use clap::{Parser, Subcommand};
use lattice_common::args::{NatsArgs, PostgresArgs};

#[derive(Parser, Debug)]
#[command(name = "lattice-controlplane")]
#[command(about = "Control-plane backend for the cluster lifecycle service")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the control-plane server
    Server(ServerArgs),

    /// Check service health
    Health(HealthArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct ServerArgs {
    /// Port for the HTTP API
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    #[clap(flatten)]
    pub postgres: PostgresArgs,

    #[clap(flatten)]
    pub nats: NatsArgs,

    #[clap(flatten)]
    pub scheduler: SchedulerArgs,

    #[clap(flatten)]
    pub pagination: PaginationArgs,

    /// Phases a non-forced delete is allowed from, comma separated
    #[arg(long, env = "DELETABLE_PHASES", default_value = "Pending,Failed", value_delimiter = ',')]
    pub deletable_phases: Vec<String>,

    /// Accept requests without X-User-Email and attribute them to this
    /// identity (dev mode only)
    #[arg(long, env = "DEV_DEFAULT_USER")]
    pub dev_default_user: Option<String>,

    /// Identifier stamped as the source of outbound lifecycle events
    #[arg(long, env = "EVENT_SOURCE", default_value = "lattice-controlplane")]
    pub event_source: String,
}

#[derive(Parser, Debug, Clone)]
pub struct SchedulerArgs {
    /// How often the periodic scheduler sweeps for due resources
    #[arg(long, env = "CHECK_INTERVAL_SECS", default_value_t = 60)]
    pub check_interval_secs: u64,

    /// Baseline reconcile interval for resources without an override
    #[arg(long, env = "DEFAULT_INTERVAL_SECS", default_value_t = 300)]
    pub default_interval_secs: u64,

    /// Most reconcile events published per sweep
    #[arg(long, env = "MAX_CONCURRENT", default_value_t = 50)]
    pub max_concurrent: usize,
}

#[derive(Parser, Debug, Clone)]
pub struct PaginationArgs {
    /// Page size applied when a list request gives no limit
    #[arg(long, env = "PAGE_LIMIT_DEFAULT", default_value_t = 50)]
    pub page_limit_default: i64,

    /// Largest accepted page size
    #[arg(long, env = "PAGE_LIMIT_MAX", default_value_t = 100)]
    pub page_limit_max: i64,
}

#[derive(Parser, Debug, Clone)]
pub struct HealthArgs {
    /// Control-plane endpoint
    #[arg(long, env = "LATTICE_ENDPOINT", default_value = "http://127.0.0.1:8080")]
    pub endpoint: String,
}
