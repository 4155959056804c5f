use rustls::{ClientConfig, RootCertStore, pki_types::CertificateDer};
use tokio_postgres_rustls::MakeRustlsConnect;

pub mod args;
pub mod metrics;
pub mod postgres;
pub mod shutdown;
pub mod streams;
pub mod wait;

/// Current time as Unix epoch milliseconds.
///
/// Every persisted timestamp in the system uses this timebase.
pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub fn make_rustls(extra_roots: Vec<CertificateDer<'static>>) -> anyhow::Result<MakeRustlsConnect> {
    let mut roots = RootCertStore::empty();
    for cert in extra_roots {
        roots.add(cert)?;
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(MakeRustlsConnect::new(config))
}
