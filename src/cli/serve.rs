//! `previewd serve`: boot the host and run until Ctrl+C.

use std::sync::Arc;

use anyhow::{Context, Result};
use crossbeam::channel;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::broadcast;

use crate::admin::AdminServer;
use crate::config::HostConfig;
use crate::conflict::ConflictEvent;
use crate::core::{ProjectId, register_shutdown};
use crate::registry::ProjectRegistry;
use crate::relay::{Relay, ViewerServer};
use crate::{debug, log};

/// Services that live for the whole `serve` run.
struct Host {
    registry: ProjectRegistry,
    relay: Relay,
    viewers: Option<ViewerServer>,
    admin: Option<AdminServer>,
}

pub fn serve(config: &HostConfig) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("previewd")
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(1);
    register_shutdown(shutdown_tx);

    let host = boot(&runtime, config)?;
    runtime.block_on(register_projects(&host.registry, config));

    // Blocks until Ctrl+C.
    let _ = shutdown_rx.recv();
    shutdown(&runtime, host);
    Ok(())
}

fn boot(runtime: &Runtime, config: &HostConfig) -> Result<Host> {
    let _guard = runtime.enter();

    let registry = ProjectRegistry::from_config(config);
    registry.start_idle_cleanup();
    spawn_conflict_log(registry.resolver().subscribe());

    let relay = Relay::from_config(config.relay.clone(), registry.orchestrator().clone());
    let touched = registry.clone();
    relay.set_activity_hook(Arc::new(move |id: &ProjectId| {
        touched.touch(id);
    }));

    let viewers = if config.relay.enable {
        relay.spawn_pump();
        Some(ViewerServer::start(&config.relay, relay.clone()).context("Failed to start relay")?)
    } else {
        None
    };

    let admin = if config.admin.enable {
        Some(AdminServer::start(
            &config.admin,
            registry.clone(),
            Handle::current(),
        )?)
    } else {
        None
    };

    Ok(Host {
        registry,
        relay,
        viewers,
        admin,
    })
}

/// Register `[[project]]` entries and start the autostart ones.
///
/// A failing project is logged and skipped; the others still come up.
async fn register_projects(registry: &ProjectRegistry, config: &HostConfig) {
    for entry in &config.projects {
        if let Err(e) = registry
            .register_project(entry.id.clone(), &entry.root, entry.name.clone())
            .await
        {
            log!("error"; "cannot register {}: {}", entry.id, e);
            continue;
        }
        if !entry.autostart {
            continue;
        }
        match registry.start_project(&entry.id).await {
            Ok(record) => log!("serve"; "{} on port {}", entry.display_name(), record.port),
            Err(e) => log!("error"; "{}: {}", entry.display_name(), e),
        }
    }

    let stats = registry.get_stats();
    log!(
        "serve";
        "{} project(s) registered, {} running, {} port(s) free",
        stats.total,
        stats.running,
        stats.free_ports
    );
}

fn spawn_conflict_log(mut events: broadcast::Receiver<ConflictEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ConflictEvent::Detected { file_path }) => {
                    log!("conflict"; "{} changed on disk and in the editor", file_path);
                }
                Ok(ConflictEvent::Resolved {
                    file_path,
                    strategy,
                    collisions,
                }) => {
                    debug!(
                        "conflict";
                        "{} resolved with {} ({} collision(s))",
                        file_path,
                        strategy.as_str(),
                        collisions
                    );
                }
                Ok(ConflictEvent::Expired { file_path }) => {
                    log!("warning"; "conflict on {} expired unresolved", file_path);
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}

/// Flush pending changes, close endpoints, then stop every runtime.
fn shutdown(runtime: &Runtime, host: Host) {
    let Host {
        registry,
        relay,
        viewers,
        admin,
    } = host;

    let flushed = registry.flush_watcher();
    if flushed > 0 {
        debug!("serve"; "flushed {} pending change(s)", flushed);
    }

    if let Some(mut viewers) = viewers {
        viewers.stop();
    }
    relay.stop_pump();
    relay.close_all();
    if let Some(mut admin) = admin {
        admin.stop();
    }

    runtime.block_on(registry.shutdown());
    log!("serve"; "stopped");
}
