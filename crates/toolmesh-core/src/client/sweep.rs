//! Discovery reconciliation, pool reconnection and their background loops

use super::Inner;
use crate::Result;
use crate::registry::SweepReport;
use futures::future::join_all;
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Poll the discovery source, reconcile the registry and bring pools in
/// line with the result
pub(super) async fn sweep(inner: &Inner) -> Result<SweepReport> {
    let Some(source) = inner.discovery.as_ref() else {
        return Ok(SweepReport::default());
    };

    let discovered = source.list_servers().await?;
    let report = inner.registry.reconcile(&discovered);

    for id in &report.removed {
        inner.pool.close_pool(id).await;
        inner.breaker.remove(id);
    }

    for id in &report.readdressed {
        let Some(record) = inner.registry.get(id) else {
            continue;
        };
        info!(server_id = %id, address = %record.address.describe(), "Server moved, reconnecting");
        inner.pool.close_pool(id).await;
        inner.breaker.remove(id);
        inner.open_pool(id, record.address, inner.config.pool_for(id)).await;
    }

    for id in &report.added {
        let Some(record) = inner.registry.get(id) else {
            continue;
        };
        inner.open_pool(id, record.address, inner.config.pool_for(id)).await;
    }

    if report.is_empty() {
        debug!(servers = discovered.len(), "Discovery sweep found no changes");
    } else {
        info!(
            added = report.added.len(),
            removed = report.removed.len(),
            readdressed = report.readdressed.len(),
            "Discovery sweep applied"
        );
    }
    Ok(report)
}

/// Create pools for registered servers that have none
///
/// Only servers whose circuit admits a request are tried; a half-open
/// circuit spends its trial on the attempt. Returns the recovered ids.
pub(super) async fn reconnect(inner: &Inner) -> Vec<String> {
    let pending: Vec<_> = inner
        .registry
        .snapshot()
        .into_iter()
        .filter(|r| !inner.pool.contains(&r.id))
        .filter(|r| inner.breaker.is_request_allowed(&r.id))
        .collect();
    if pending.is_empty() {
        return Vec::new();
    }

    debug!(servers = pending.len(), "Reconnecting servers without a pool");
    let attempts = pending.into_iter().map(|record| async move {
        let opened = inner
            .open_pool(&record.id, record.address, inner.config.pool_for(&record.id))
            .await;
        (record.id, opened)
    });

    let mut recovered = Vec::new();
    for (id, opened) in join_all(attempts).await {
        if inner.registry.get(&id).is_none() {
            // Unregistered while connecting.
            inner.pool.close_pool(&id).await;
            inner.breaker.remove(&id);
            continue;
        }
        if !opened {
            continue;
        }
        inner.breaker.record_success(&id);
        info!(server_id = %id, "Server reconnected");
        recovered.push(id);
    }
    recovered
}

/// Run [`reconnect`] every `interval` until cancelled or the client is
/// dropped
pub(super) fn spawn_reconnect_loop(
    inner: Weak<Inner>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(inner) = inner.upgrade() else { break };
                    reconnect(&inner).await;
                }
            }
        }
        debug!("Reconnect loop stopped");
    })
}

/// Run [`sweep`] every `interval` until cancelled or the client is dropped
pub(super) fn spawn_discovery_loop(
    inner: Weak<Inner>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(inner) = inner.upgrade() else { break };
                    if let Err(e) = sweep(&inner).await {
                        warn!("Discovery sweep failed, registry left unchanged: {}", e);
                    }
                }
            }
        }
        debug!("Discovery loop stopped");
    })
}
