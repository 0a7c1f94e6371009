//! Application state for the Axum server.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Settings;
use crate::live::hub::Hub;
use crate::live::monitor::LiveMonitor;
use crate::registry::ProjectRegistry;
use crate::supervisor::ProcessSupervisor;

/// Shared application state accessible from all route handlers.
///
/// Every service is built once here and handed out by `Arc`.
pub struct AppState {
    /// Server start time for uptime tracking.
    pub start_time: Instant,
    pub settings: Arc<Settings>,
    /// Realtime connections and their subscriptions.
    pub hub: Arc<Hub>,
    /// Discovered and registered projects.
    pub registry: Arc<ProjectRegistry>,
    pub supervisor: Arc<ProcessSupervisor>,
    /// File watch layer plus change dispatcher.
    pub monitor: Arc<LiveMonitor>,
}

impl AppState {
    /// Build all services. Background tasks are not started; call
    /// [`LiveMonitor::start`] on `monitor` for live updates.
    pub fn new(settings: Settings) -> notify::Result<Arc<Self>> {
        let settings = Arc::new(settings);
        let hub = Arc::new(Hub::new());
        let registry = Arc::new(ProjectRegistry::new(
            settings.project_dirs.clone(),
            &settings.data_dir,
        ));
        let supervisor = Arc::new(ProcessSupervisor::new(
            registry.clone(),
            settings.fallback_script.clone(),
            settings.stop_grace,
        ));
        let monitor = Arc::new(LiveMonitor::new(registry.clone(), hub.clone(), &settings)?);

        Ok(Arc::new(Self {
            start_time: Instant::now(),
            settings,
            hub,
            registry,
            supervisor,
            monitor,
        }))
    }

    /// Get the server uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
