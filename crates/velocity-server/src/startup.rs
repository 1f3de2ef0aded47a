//! Server startup utilities.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;
use velocity_config::{AppConfig, MetricsConfig};
use velocity_core::{VelocityError, VelocityResult};

/// Prints the startup banner.
pub fn print_banner() {
    info!(r#"
 _    __     __           _ __
| |  / /__  / /___  _____(_) /___  __
| | / / _ \/ / __ \/ ___/ / __/ / / /
| |/ /  __/ / /_/ / /__/ / /_/ /_/ /
|___/\___/_/\____/\___/_/\__/\__, /
                            /____/
                   Job Worker Daemon
    "#);
}

/// Prints the effective pool configuration.
pub fn print_startup_info(config: &AppConfig) {
    let jobs = &config.jobs;
    let separator = "=".repeat(60);
    info!("{}", separator);
    info!("Store:     {} (prefix {})", redact_url(&jobs.redis.url), jobs.redis.key_prefix);
    info!(
        "Workers:   {} (poll every {}ms)",
        jobs.manager.max_workers, jobs.manager.poll_interval_ms
    );
    info!("Queues:    {} priority levels", jobs.manager.priority_levels());
    if jobs.lease.enabled {
        info!(
            "Leases:    {}ms, {} retries",
            jobs.lease.duration_ms, jobs.lease.max_retries
        );
    } else {
        info!("Leases:    disabled");
    }
    if config.metrics.enabled {
        info!("Metrics:   http://{}/metrics", config.metrics.listen_addr);
    }
    info!("{}", separator);
}

/// Installs the Prometheus recorder and its scrape endpoint.
///
/// Must run inside the Tokio runtime.
pub fn install_metrics_exporter(config: &MetricsConfig) -> VelocityResult<()> {
    let addr = config
        .socket_addr()
        .map_err(|e| VelocityError::configuration(format!("Invalid metrics address: {}", e)))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| VelocityError::internal(format!("Failed to install metrics exporter: {}", e)))?;

    info!(%addr, "Prometheus exporter listening");
    Ok(())
}

/// Hides the password in a connection URL.
pub fn redact_url(url: &str) -> String {
    let Some(scheme_end) = url.find("://").map(|i| i + 3) else {
        return url.to_string();
    };
    let rest = &url[scheme_end..];
    let Some(at) = rest.find('@') else {
        return url.to_string();
    };

    let userinfo = &rest[..at];
    let redacted = match userinfo.split_once(':') {
        Some((user, _)) => format!("{}:***", user),
        None => userinfo.to_string(),
    };
    format!("{}{}{}", &url[..scheme_end], redacted, &rest[at..])
}
