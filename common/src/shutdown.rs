use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;

/// Spawn a watcher that cancels `cancel` once a termination signal arrives.
///
/// The HTTP server, scheduler, notification reader and config poller all
/// share one token, so a single signal winds every task down at its next
/// suspension point.
pub fn cancel_on_signal(cancel: CancellationToken) {
    tokio::spawn(async move {
        let signal = wait_for_signal().await;
        eprintln!("{}", format!("🛑 {signal} received, shutting down").red());
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    // K8s sends SIGTERM first
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    tokio::signal::ctrl_c().await.expect("install Ctrl+C handler");
    "Ctrl+C"
}
