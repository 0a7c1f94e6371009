//! Wires the watch layer to the dispatcher and keeps both in sync with the
//! project registry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{error, info};

use ralph_dashboard_core::ProjectPaths;

use super::dispatcher::Dispatcher;
use super::hub::Hub;
use super::watcher::{ChangeEvent, ChangeKind, RefreshReport, WatchService, WatchTarget};
use crate::config::Settings;
use crate::registry::ProjectRegistry;

pub struct LiveMonitor {
    registry: Arc<ProjectRegistry>,
    dispatcher: Arc<Dispatcher>,
    watch: Mutex<WatchService>,
    rx: std::sync::Mutex<Option<mpsc::Receiver<ChangeEvent>>>,
    refresh_interval: Duration,
}

impl LiveMonitor {
    pub fn new(
        registry: Arc<ProjectRegistry>,
        hub: Arc<Hub>,
        settings: &Settings,
    ) -> notify::Result<Self> {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let watch = WatchService::new(tx, settings.debounce)?;
        Ok(Self {
            registry,
            dispatcher: Arc::new(Dispatcher::new(hub, settings.log_read_cap)),
            watch: Mutex::new(watch),
            rx: std::sync::Mutex::new(Some(rx)),
            refresh_interval: settings.refresh_interval,
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Spawn the change consumer and the periodic refresh. Calling this
    /// more than once has no further effect.
    pub fn start(self: &Arc<Self>) {
        let rx = self
            .rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let Some(rx) = rx else {
            return;
        };
        self.spawn_consumer(rx);
        self.spawn_refresher();
        info!("Live monitor started");
    }

    /// Reconcile watches and dispatcher state with the registry.
    ///
    /// Both locks are held together so that a removed project's watch and
    /// its dispatcher state disappear as one step.
    pub async fn refresh(&self) -> RefreshReport {
        let desired: Vec<WatchTarget> = self
            .registry
            .entries()
            .await
            .into_iter()
            .map(|e| WatchTarget {
                id: e.id,
                root: e.root,
            })
            .collect();

        let mut watch = self.watch.lock().await;
        let mut tracked = self.dispatcher.tracked().await;
        let report = watch.refresh(&desired);
        for id in &report.removed {
            tracked.forget(id);
        }
        for target in watch.targets() {
            tracked.track(&target.id, &target.root);
        }
        if !report.added.is_empty() || !report.removed.is_empty() {
            info!(
                added = report.added.len(),
                removed = report.removed.len(),
                tracked = tracked.len(),
                "Watch set refreshed"
            );
        }
        report
    }

    fn spawn_consumer(self: &Arc<Self>, mut rx: mpsc::Receiver<ChangeEvent>) {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut last_dropped = 0u64;
            while let Some(change) = rx.recv().await {
                let dropped = monitor.dropped_events().await;
                if dropped > last_dropped {
                    last_dropped = dropped;
                    info!(dropped_total = dropped, "Watcher dropped events; re-reading project files");
                    monitor.catch_up().await;
                }
                monitor.dispatcher.dispatch(change).await;
            }
            error!("Change queue closed; live updates stopped");
        });
    }

    fn spawn_refresher(self: &Arc<Self>) {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.refresh_interval);
            loop {
                interval.tick().await;
                monitor.registry.invalidate();
                monitor.refresh().await;
            }
        });
    }

    async fn dropped_events(&self) -> u64 {
        self.watch.lock().await.dropped_events()
    }

    /// Re-dispatch the state files of every watched project. Handlers only
    /// emit on real changes, so anything already delivered stays quiet.
    async fn catch_up(&self) {
        let targets = self.watch.lock().await.targets();
        for target in targets {
            let paths = ProjectPaths::new(&target.root);
            for path in [paths.plan(), paths.ledger(), paths.log(), paths.pid(), paths.pending_notification()] {
                if !path.exists() {
                    continue;
                }
                self.dispatcher
                    .dispatch(ChangeEvent {
                        project_id: target.id.clone(),
                        project_root: target.root.clone(),
                        path,
                        kind: ChangeKind::Other,
                    })
                    .await;
            }
        }
    }
}
