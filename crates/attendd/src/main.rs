use anyhow::{Context, Result};
use attend_store::LocalStore;
use attend_sync::{
    ConnectivityMonitor, Credentials, HttpRemote, LinkProbe, OfflineKiosk, SyncCoordinator,
    SyncSettings, SysfsLinkProbe,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;

use config::Config;
use dbus_interface::KioskService;

const BUS_NAME: &str = "org.attend.Kiosk1";
const OBJECT_PATH: &str = "/org/attend/Kiosk1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("attendd starting");
    let config = Config::from_env();

    // Link state: seed with one probe, then poll in the background.
    let probe: Arc<dyn LinkProbe> = Arc::new(SysfsLinkProbe::new());
    let monitor = Arc::new(ConnectivityMonitor::new(probe.probe().await));
    let poller = monitor.spawn_poller(Arc::clone(&probe), config.online_check_interval());

    let credentials = Credentials::from_parts(config.kiosk_id.clone(), config.admin_code.clone());
    if credentials.is_none() {
        tracing::warn!("ATTEND_KIOSK_ID / ATTEND_ADMIN_CODE not set; syncing disabled");
    }

    let remote = Arc::new(
        HttpRemote::new(config.api_url.clone(), config.request_timeout())
            .context("failed to build HTTP client")?,
    );
    tracing::info!(api_url = %config.api_url, "remote configured");

    let mut scheduler = None;
    let service = match LocalStore::open_at(&config.db_path).await {
        Ok(store) => {
            let store = Arc::new(store);
            let coordinator = Arc::new(SyncCoordinator::new(
                Arc::clone(&store),
                remote,
                Arc::clone(&monitor),
                credentials,
                SyncSettings {
                    sync_interval: config.sync_interval(),
                    request_timeout: config.request_timeout(),
                },
            ));
            if let Err(e) = coordinator.hydrate().await {
                tracing::warn!(error = %e, "could not load sync status from store");
            }
            if config.auto_sync {
                scheduler = Some(coordinator.spawn_scheduler());
            } else {
                tracing::info!("auto sync disabled via ATTEND_AUTO_SYNC=0");
            }
            KioskService::new(OfflineKiosk::new(store, coordinator, config.match_threshold))
        }
        Err(e) => {
            tracing::error!(
                path = %config.db_path.display(),
                error = %e,
                "local store unavailable; kiosk is not offline-ready"
            );
            KioskService::degraded(Arc::clone(&monitor), e.to_string())
        }
    };

    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .with_context(|| format!("failed to acquire {BUS_NAME} on the D-Bus"))?;

    tracing::info!(bus = BUS_NAME, session = config.session_bus, "attendd ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("attendd shutting down");

    if let Some(scheduler) = scheduler {
        scheduler.shutdown().await;
    }
    poller.abort();

    Ok(())
}
