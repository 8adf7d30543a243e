use anyhow::Result;
use buildkit_bootstrap::AppConfig;
use buildkit_runtime::ProbeReport;
use std::path::Path;

/// Print the effective configuration and whether each engine can host buildkitd.
pub async fn run(config: &AppConfig, log_dir: &Path) -> Result<()> {
    tracing::info!("Checking configuration…");
    println!("Configuration is valid");
    println!("{}", config.to_yaml()?);

    let reports = super::provider_chain(config, log_dir).probe_all().await;
    println!("{}", render_reports(&reports));

    if !reports.iter().any(ProbeReport::is_supported) {
        anyhow::bail!("no supported buildkitd providers");
    }
    Ok(())
}

fn render_reports(reports: &[ProbeReport]) -> String {
    let mut out = String::from("Providers:");
    for report in reports {
        match &report.outcome {
            Ok(()) => out.push_str(&format!("\n  {}: supported", report.kind)),
            Err(reason) => out.push_str(&format!("\n  {}: unsupported ({reason})", report.kind)),
        }
    }
    out
}
