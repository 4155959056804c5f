use anyhow::{Context, Result};
use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub struct PostgresArgs {
    #[arg(long, env = "POSTGRES_HOST", default_value = "localhost")]
    pub postgres_host: String,

    #[arg(long, env = "POSTGRES_PORT", default_value_t = 5432)]
    pub postgres_port: u16,

    #[arg(long, env = "POSTGRES_DATABASE", default_value = "postgres")]
    pub postgres_database: String,

    #[arg(long, env = "POSTGRES_USERNAME", default_value = "postgres")]
    pub postgres_username: String,

    #[arg(long, env = "POSTGRES_PASSWORD")]
    pub postgres_password: Option<String>,

    /// PEM bundle used to verify the server when connecting over TLS
    #[arg(long, env = "POSTGRES_CA_CERT")]
    pub postgres_ca_cert: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct NatsArgs {
    #[arg(long, env = "NATS_URL", required = true)]
    pub nats_url: String,

    #[arg(long, env = "NATS_USER", default_value = "app")]
    pub nats_user: String,

    #[arg(long, env = "NATS_PASSWORD", default_value = "devpass")]
    pub nats_password: String,
}

impl NatsArgs {
    pub async fn connect(&self) -> Result<async_nats::Client> {
        async_nats::ConnectOptions::with_user_and_password(
            self.nats_user.clone(),
            self.nats_password.clone(),
        )
        .connect(self.nats_url.as_str())
        .await
        .context("failed to connect to NATS")
    }
}
