use anyhow::{Context, Result};
use pipeline_pulse::config::Config;
use pipeline_pulse::dashboard::Dashboard;
use pipeline_pulse::filters::FilterCriteria;
use pipeline_pulse::models::LogBody;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

// Fetches, timers and the push connection all interleave on one thread.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Config::new().context("Failed to load config")?;
    info!("Using data gateway at {}", config.gateway.base_url);

    let dashboard = Dashboard::start(&config)?;

    // Headless stand-in for the rendering layer: one summary line per snapshot.
    let _render = dashboard.subscribe(|vm| {
        let rate = vm
            .overview
            .as_ref()
            .map(|o| format!("{:.1}%", o.success_rate))
            .unwrap_or_else(|| "-".to_string());
        info!(
            version = vm.version,
            connection = ?vm.connection,
            theme = ?vm.theme,
            builds = vm.builds.len(),
            chart_points = vm.chart_series.len(),
            errors = vm.errors.len(),
            "success rate {}",
            rate
        );
    });

    info!("Commands: filter <provider|-> <status|-> [query], range <days>, refresh, theme, logs <build-id>, quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line.context("Failed to read stdin")? {
                Some(line) => {
                    if !run_command(&dashboard, line.trim()).await {
                        break;
                    }
                }
                None => {
                    // stdin closed (e.g. running as a service); wait for Ctrl-C instead.
                    tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
                    break;
                }
            },
            res = tokio::signal::ctrl_c() => {
                res.context("Failed to listen for shutdown signal")?;
                break;
            }
        }
    }

    info!("Shutting down");
    dashboard.shutdown().await;
    Ok(())
}

/// Returns `false` when the user asked to quit.
async fn run_command(dashboard: &Dashboard, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some("filter") => {
            let field = |v: Option<&str>| match v {
                Some("-") | None => String::new(),
                Some(v) => v.to_string(),
            };
            let provider = field(parts.next());
            let status = field(parts.next());
            let query = parts.collect::<Vec<_>>().join(" ");
            dashboard.set_filters(FilterCriteria::from_inputs(&provider, &status, &query));
        }
        Some("range") => match parts.next().and_then(|s| s.parse::<usize>().ok()) {
            Some(days) => dashboard.set_time_range(days),
            None => warn!("usage: range <days>"),
        },
        Some("refresh") => dashboard.refresh(),
        Some("theme") => dashboard.toggle_theme(),
        Some("logs") => {
            let Some(id) = parts.next().and_then(|s| s.parse::<i64>().ok()) else {
                warn!("usage: logs <build-id>");
                return true;
            };
            let snapshot = dashboard.snapshot();
            let Some(build) = snapshot.builds.iter().find(|b| b.id == id) else {
                warn!("Build {} is not in the current view", id);
                return true;
            };
            match dashboard.logs(build).await {
                Ok(payload) => match payload.logs {
                    LogBody::Text(text) => println!("{text}"),
                    LogBody::Structured(value) => println!("{value:#}"),
                },
                Err(e) => warn!("Failed to fetch logs for build {}: {}", id, e),
            }
        }
        Some("quit") | Some("exit") => return false,
        Some(other) => warn!("Unknown command: {}", other),
        None => {}
    }
    true
}
