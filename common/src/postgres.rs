use crate::args::PostgresArgs;
use anyhow::{Result, bail};
use deadpool_postgres::{Config as PgConfig, ManagerConfig, Pool, RecyclingMethod};
use postgres::NoTls;
use rustls::pki_types::CertificateDer;
use std::env;

pub async fn create_pool(pg_args: PostgresArgs) -> Pool {
    let mut password = pg_args.postgres_password;
    if password.is_none() {
        if let Ok(pw) = env::var("POSTGRES_PASSWORD") {
            password = Some(pw);
        }
    }
    let tls_connector = pg_args
        .postgres_ca_cert
        .as_deref()
        .map(|ca_cert| tls_from_ca_cert(ca_cert).expect("invalid Postgres CA certificate"));

    let mut pg_pool_cfg = PgConfig::new();
    pg_pool_cfg.dbname = Some(pg_args.postgres_database);
    pg_pool_cfg.host = Some(pg_args.postgres_host);
    pg_pool_cfg.port = Some(pg_args.postgres_port);
    pg_pool_cfg.user = Some(pg_args.postgres_username);
    pg_pool_cfg.password = password;
    pg_pool_cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    if let Some(tls) = tls_connector {
        pg_pool_cfg
            .create_pool(Some(deadpool_postgres::Runtime::Tokio1), tls)
            .expect("create Postgres connection pool")
    } else {
        pg_pool_cfg
            .create_pool(Some(deadpool_postgres::Runtime::Tokio1), NoTls)
            .expect("create Postgres connection pool")
    }
}

/// Build a tokio-postgres config for a dedicated (non-pooled) connection.
///
/// The change-notification listener needs its own long-lived session because
/// LISTEN subscriptions do not survive pool recycling.
pub fn direct_config(pg_args: &PostgresArgs) -> tokio_postgres::Config {
    let mut cfg = tokio_postgres::Config::new();
    cfg.host(&pg_args.postgres_host);
    cfg.port(pg_args.postgres_port);
    cfg.dbname(&pg_args.postgres_database);
    cfg.user(&pg_args.postgres_username);
    if let Some(ref pw) = pg_args.postgres_password {
        cfg.password(pw);
    } else if let Ok(pw) = env::var("POSTGRES_PASSWORD") {
        cfg.password(pw);
    }
    cfg
}

/// TLS connector verified against the provided CA material. Both the pool
/// and the dedicated notification connection build theirs here.
pub fn tls_from_ca_cert(ca_cert: &str) -> Result<tokio_postgres_rustls::MakeRustlsConnect> {
    let extra_roots = parse_ca_certs(ca_cert.as_bytes())?;
    crate::make_rustls(extra_roots)
}

/// Accepts either a PEM bundle or a single raw DER certificate.
fn parse_ca_certs(bytes: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    if !bytes.starts_with(b"-----BEGIN") {
        return Ok(vec![CertificateDer::from(bytes.to_vec())]);
    }
    let mut rd: &[u8] = bytes;
    let mut certs = Vec::new();
    for item in rustls_pemfile::read_all(&mut rd) {
        let item = item.map_err(|e| anyhow::anyhow!("unreadable PEM bundle: {e}"))?;
        if let rustls_pemfile::Item::X509Certificate(der) = item {
            certs.push(der);
        }
    }
    if certs.is_empty() {
        bail!("CA material contains no X509 certificates");
    }
    Ok(certs)
}
