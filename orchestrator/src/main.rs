// File: orchestrator/src/main.rs
use anyhow::Result;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use orchestrator::config::{ConfigManager, PoolConnectionConfig};
use orchestrator::constants::cleanup;
use orchestrator::session::{Connection, HttpSession};
use orchestrator::web::{start_web_server, AppState, PoolHandle};

async fn connect_pool(name: String, config: PoolConnectionConfig) -> Option<(String, PoolHandle)> {
    let session = match HttpSession::new(&config) {
        Ok(session) => Arc::new(session),
        Err(e) => {
            error!("Failed to create session for pool {}: {}", name, e);
            return None;
        }
    };

    let permissions = match session.fetch_permissions().await {
        Ok(permissions) => permissions,
        Err(e) => {
            error!("Failed to fetch permissions for pool {}: {}", name, e);
            return None;
        }
    };

    let connection = Connection::new(name.clone(), session.clone(), Arc::new(permissions));
    info!("Connected to pool {} at {}", name, config.url);
    Some((
        name,
        PoolHandle {
            connection,
            snapshots: session,
        },
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging with reduced verbosity
    let env_filter = EnvFilter::from_default_env()
        .add_directive("orchestrator=info".parse()?)
        .add_directive("tower_http=warn".parse()?)
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=warn".parse()?);

    fmt().with_env_filter(env_filter).init();

    info!("Starting Pool Operation Orchestrator");

    // Load configuration
    let config_manager = ConfigManager::new("config".to_string()).await?;
    let config = config_manager.get_current_config();
    info!(
        "Configuration loaded: {} pools, poll interval {:?}",
        config.pools.len(),
        config.poll_settings().interval
    );

    let connected = join_all(
        config
            .pools
            .iter()
            .map(|(name, pool)| connect_pool(name.clone(), pool.clone())),
    )
    .await;
    let pools: HashMap<String, PoolHandle> = connected.into_iter().flatten().collect();

    if pools.len() < config.pools.len() {
        warn!(
            "{} of {} configured pools are unavailable",
            config.pools.len() - pools.len(),
            config.pools.len()
        );
    }

    let state = AppState::new(config.clone(), pools);

    // Start periodic history cleanup
    let history = state.history.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(
            cleanup::CLEANUP_INTERVAL_SECONDS,
        ));
        loop {
            interval.tick().await;
            let cleaned = history
                .cleanup_finished(cleanup::HISTORY_RETENTION_HOURS)
                .await;
            if cleaned > 0 {
                info!(
                    "Cleaned up {} operations older than {}h",
                    cleaned,
                    cleanup::HISTORY_RETENTION_HOURS
                );
            }
        }
    });

    info!("Starting web server on {}:{}", config.host, config.port);
    start_web_server(state).await
}
