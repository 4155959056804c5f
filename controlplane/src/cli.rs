use anyhow::{Context, Result, bail};

use crate::args::HealthArgs;

/// Probe a running control plane and print its health document.
pub async fn run_health(args: HealthArgs) -> Result<()> {
    let url = format!("{}/health", args.endpoint.trim_end_matches('/'));
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("failed to reach {url}"))?;

    let status = response.status();
    let body: serde_json::Value = response
        .json()
        .await
        .context("health endpoint returned a non-JSON body")?;
    println!("{}", serde_json::to_string_pretty(&body)?);

    if !status.is_success() {
        bail!("service unhealthy (HTTP {status})");
    }
    Ok(())
}
