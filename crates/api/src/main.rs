use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveTime;

use hostpilot_core::RetryPolicy;
use hostpilot_infra::dispatcher::{Dispatcher, DispatcherConfig};
use hostpilot_infra::registry::HandlerRegistry;
use hostpilot_infra::watchdog::{Watchdog, WatchdogConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hostpilot_observability::init();

    let services = Arc::new(hostpilot_api::app::services::build_services().await?);

    let handlers_file = std::env::var("HOSTPILOT_HANDLERS_FILE")
        .unwrap_or_else(|_| "/etc/hostpilot/handlers.conf".to_string());
    let registry = Arc::new(HandlerRegistry::load(&handlers_file)?);
    tracing::info!(handlers = registry.len(), file = %handlers_file, "handler registry loaded");

    let retry = RetryPolicy::new(env_parse("HOSTPILOT_MAX_RETRIES", 3));

    let dispatcher = Dispatcher::new(
        services.store.clone(),
        registry,
        DispatcherConfig {
            poll_interval: Duration::from_secs(env_parse("HOSTPILOT_POLL_INTERVAL_SECS", 5)),
            max_concurrent: env_parse("HOSTPILOT_MAX_CONCURRENT", 1),
            retry,
            name: "dispatcher".to_string(),
        },
    );
    let watchdog = Watchdog::new(
        services.store.clone(),
        WatchdogConfig {
            interval: Duration::from_secs(env_parse("HOSTPILOT_WATCHDOG_INTERVAL_SECS", 60)),
            stall_threshold: Duration::from_secs(env_parse(
                "HOSTPILOT_STALL_THRESHOLD_SECS",
                30 * 60,
            )),
            retry,
            archive_retention_days: env_parse("HOSTPILOT_ARCHIVE_RETENTION_DAYS", 30),
            daily_at: env_daily_at(),
        },
    );

    let dispatcher_handle = dispatcher.spawn();
    let watchdog_handle = watchdog.spawn();

    let app = hostpilot_api::app::build_app(services);
    let bind = std::env::var("HOSTPILOT_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    dispatcher_handle.shutdown().await;
    watchdog_handle.shutdown().await;
    Ok(())
}

fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "unparseable env override, using default");
            default
        }),
        Err(_) => default,
    }
}

/// `HOSTPILOT_DAILY_AT` as `HH:MM` (UTC); defaults to midnight.
fn env_daily_at() -> NaiveTime {
    match std::env::var("HOSTPILOT_DAILY_AT") {
        Ok(raw) => NaiveTime::parse_from_str(&raw, "%H:%M").unwrap_or_else(|_| {
            tracing::warn!(value = %raw, "unparseable HOSTPILOT_DAILY_AT, using midnight");
            NaiveTime::MIN
        }),
        Err(_) => NaiveTime::MIN,
    }
}
