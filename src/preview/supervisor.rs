//! Per-project dev-server supervision.
//!
//! Every project gets a slot holding its status, its log ring and a control
//! lock. All mutations of a slot (start, stop, readiness outcome, exit
//! handling) happen with the control lock held, so concurrent `start` calls
//! for one project spawn at most one process and lease at most one port.
//! The lock is released while readiness is polled so `stop` stays
//! responsive; a generation counter tells a pending start whether the
//! process it was watching is still the current one. Starts and stops run
//! on spawned tasks, so a caller that gives up waiting never leaves a slot
//! half transitioned.

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::errors::PreviewError;
use crate::hub::{EventKind, StreamEvent, StreamHub};
use crate::project::ProjectId;

use super::install::{InstallOutput, InstallSpec, run_install};
use super::logs::{DEFAULT_LOG_CAPACITY, SharedLogs};
use super::ports::{DEFAULT_PORT_RANGE, DEFAULT_PROBE_TIMEOUT, PortAllocator, PortLease};
use super::probe::{HttpProbe, ReadinessProbe};
use super::process::{DevServerProcess, DevServerSpec, ExitInfo};
use super::state::{PreviewState, PreviewStatus};
use super::workspace::WorkspaceResolver;

/// Prefix of lines the supervisor itself writes into a project's log ring.
const SUPERVISOR_LOG_PREFIX: &str = "[stagehand]";

#[derive(Debug, Clone)]
pub struct PreviewSettings {
    /// Dev server executable and arguments; `{port}` in an argument is
    /// replaced with the allocated port. `PORT` is always set as well.
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub port_range: RangeInclusive<u16>,
    pub probe_timeout: Duration,
    /// Delay between readiness probes.
    pub poll_interval: Duration,
    /// How long a dev server may take to answer its first probe.
    pub startup_timeout: Duration,
    /// Time between SIGTERM and SIGKILL on stop.
    pub stop_grace: Duration,
    pub log_capacity: usize,
    /// Number of trailing log lines attached to a failed status.
    pub log_excerpt_lines: usize,
    /// Host used in the preview URL handed to browsers.
    pub public_host: String,
    pub install_command: String,
    pub install_args: Vec<String>,
    pub install_timeout: Duration,
}

impl Default for PreviewSettings {
    fn default() -> Self {
        Self {
            command: "npm".to_string(),
            args: ["run", "dev", "--", "--port", "{port}"]
                .into_iter()
                .map(String::from)
                .collect(),
            env: Vec::new(),
            port_range: DEFAULT_PORT_RANGE,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            poll_interval: Duration::from_secs(2),
            startup_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(5),
            log_capacity: DEFAULT_LOG_CAPACITY,
            log_excerpt_lines: 30,
            public_host: "localhost".to_string(),
            install_command: "npm".to_string(),
            install_args: vec!["install".to_string()],
            install_timeout: Duration::from_secs(600),
        }
    }
}

/// Owns the dev server of every project.
#[derive(Clone)]
pub struct PreviewSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    settings: PreviewSettings,
    ports: PortAllocator,
    hub: Arc<StreamHub>,
    workspaces: Arc<dyn WorkspaceResolver>,
    probe: Arc<dyn ReadinessProbe>,
    slots: Mutex<HashMap<ProjectId, Arc<Slot>>>,
}

struct Slot {
    logs: SharedLogs,
    /// Readable without waiting on the control lock.
    status: RwLock<PreviewStatus>,
    control: tokio::sync::Mutex<Control>,
}

#[derive(Default)]
struct Control {
    process: Option<DevServerProcess>,
    lease: Option<u16>,
    /// Bumped by every start and stop.
    generation: u64,
}

enum Readiness {
    Ready,
    Exited(ExitInfo),
    TimedOut,
}

impl Slot {
    fn new(project_id: ProjectId, log_capacity: usize) -> Self {
        Self {
            logs: SharedLogs::new(log_capacity),
            status: RwLock::new(PreviewStatus::stopped(project_id)),
            control: tokio::sync::Mutex::new(Control::default()),
        }
    }

    fn snapshot(&self) -> PreviewStatus {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply `change` to a scratch copy and commit it only if it succeeds.
    fn update(
        &self,
        change: impl FnOnce(&mut PreviewStatus) -> Result<(), PreviewError>,
    ) -> Result<PreviewStatus, PreviewError> {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = status.clone();
        change(&mut next)?;
        *status = next.clone();
        Ok(next)
    }
}

impl PreviewSupervisor {
    /// Supervisor probing dev servers over HTTP.
    pub fn new(
        settings: PreviewSettings,
        hub: Arc<StreamHub>,
        workspaces: Arc<dyn WorkspaceResolver>,
    ) -> Result<Self, PreviewError> {
        let probe = Arc::new(HttpProbe::new(settings.poll_interval.max(Duration::from_secs(1)))?);
        Self::with_probe(settings, hub, workspaces, probe)
    }

    pub fn with_probe(
        settings: PreviewSettings,
        hub: Arc<StreamHub>,
        workspaces: Arc<dyn WorkspaceResolver>,
        probe: Arc<dyn ReadinessProbe>,
    ) -> Result<Self, PreviewError> {
        let ports = PortAllocator::new(settings.port_range.clone(), settings.probe_timeout)?;
        Ok(Self {
            inner: Arc::new(Inner {
                settings,
                ports,
                hub,
                workspaces,
                probe,
                slots: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn settings(&self) -> &PreviewSettings {
        &self.inner.settings
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.inner.ports
    }

    /// Last known status. Never blocks on an in-flight start or stop.
    pub fn get_status(&self, project_id: &ProjectId) -> PreviewStatus {
        match self.existing_slot(project_id) {
            Some(slot) => slot.snapshot(),
            None => PreviewStatus::stopped(project_id.clone()),
        }
    }

    /// Statuses of every project that has been started at least once.
    pub fn statuses(&self) -> Vec<PreviewStatus> {
        let slots: Vec<Arc<Slot>> = self.lock_slots().values().cloned().collect();
        let mut statuses: Vec<PreviewStatus> = slots.iter().map(|s| s.snapshot()).collect();
        statuses.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        statuses
    }

    /// Last `lines` lines of the project's dev-server output.
    pub fn logs(&self, project_id: &ProjectId, lines: usize) -> Vec<String> {
        self.existing_slot(project_id)
            .map(|slot| slot.logs.tail(lines))
            .unwrap_or_default()
    }

    pub async fn leases(&self) -> Vec<PortLease> {
        self.inner.ports.leases().await
    }

    /// Start the project's dev server, or return the current status if it is
    /// already starting or running.
    pub async fn start(&self, project_id: &ProjectId) -> Result<PreviewStatus, PreviewError> {
        self.start_on(project_id, None).await
    }

    /// Like [`PreviewSupervisor::start`], trying `preferred_port` first.
    ///
    /// Resolves once the server answered its readiness probe or failed. The
    /// startup runs on its own task and completes even if the caller stops
    /// waiting.
    pub async fn start_on(
        &self,
        project_id: &ProjectId,
        preferred_port: Option<u16>,
    ) -> Result<PreviewStatus, PreviewError> {
        let supervisor = self.clone();
        let id = project_id.clone();
        tokio::spawn(async move { supervisor.run_start(id, preferred_port).await })
            .await
            .map_err(|e| {
                PreviewError::Other(anyhow::anyhow!("Start task for {} failed: {}", project_id, e))
            })?
    }

    async fn run_start(
        self,
        project_id: ProjectId,
        preferred_port: Option<u16>,
    ) -> Result<PreviewStatus, PreviewError> {
        let slot = self.slot(&project_id);
        let mut control = slot.control.lock().await;

        let current = slot.snapshot();
        if current.state.is_active() {
            tracing::debug!(project_id = %project_id, state = %current.state, "Preview already active");
            return Ok(current);
        }

        let cwd = self.inner.workspaces.resolve(&project_id)?;

        slot.logs.clear();
        let status = slot.update(|s| s.transition(PreviewState::Starting))?;
        self.publish(&status);
        control.generation += 1;
        let generation = control.generation;

        let lease = match self.inner.ports.acquire(&project_id, preferred_port).await {
            Ok(lease) => lease,
            Err(e) => return Err(self.fail(&slot, &project_id, e.into())),
        };
        let port = lease.port;

        let settings = &self.inner.settings;
        let spec = DevServerSpec {
            command: settings.command.clone(),
            args: settings.args.clone(),
            env: settings.env.clone(),
            cwd,
            port,
        };
        slot.logs.push(format!(
            "{SUPERVISOR_LOG_PREFIX} $ {} (port {port})",
            spec.display_command()
        ));
        let process = match DevServerProcess::spawn(&spec, slot.logs.clone()) {
            Ok(process) => process,
            Err(e) => {
                self.inner.ports.release(port).await;
                return Err(self.fail(&slot, &project_id, e));
            }
        };

        let pid = process.pid();
        let exit_rx = process.exit_watch();
        control.process = Some(process);
        control.lease = Some(port);
        let status = slot.update(|s| {
            s.pid = pid;
            s.port = Some(port);
            Ok(())
        })?;
        self.publish(&status);
        tracing::info!(project_id = %project_id, port, ?pid, "Dev server spawned");
        drop(control);

        self.finish_start(project_id, slot, generation, port, exit_rx)
            .await
    }

    /// Stop the project's dev server. Stopping a stopped preview is a no-op.
    ///
    /// Like a start, the stop runs on its own task: once begun it always
    /// ends with the process gone and the port released.
    pub async fn stop(&self, project_id: &ProjectId) -> Result<PreviewStatus, PreviewError> {
        let Some(slot) = self.existing_slot(project_id) else {
            return Ok(PreviewStatus::stopped(project_id.clone()));
        };
        let supervisor = self.clone();
        let id = project_id.clone();
        tokio::spawn(async move { supervisor.run_stop(id, slot).await })
            .await
            .map_err(|e| {
                PreviewError::Other(anyhow::anyhow!("Stop task for {} failed: {}", project_id, e))
            })?
    }

    async fn run_stop(self, project_id: ProjectId, slot: Arc<Slot>) -> Result<PreviewStatus, PreviewError> {
        let mut control = slot.control.lock().await;

        let current = slot.snapshot();
        if current.state == PreviewState::Stopped {
            return Ok(current);
        }

        control.generation += 1;
        if let Some(process) = control.process.take() {
            let exit = process.terminate(self.inner.settings.stop_grace).await;
            tracing::info!(project_id = %project_id, exit = %exit.description, "Dev server stopped");
        }
        if let Some(port) = control.lease.take() {
            self.inner.ports.release(port).await;
        }

        let status = slot.update(|s| s.transition(PreviewState::Stopped))?;
        self.publish(&status);
        Ok(status)
    }

    pub async fn restart(&self, project_id: &ProjectId) -> Result<PreviewStatus, PreviewError> {
        self.stop(project_id).await?;
        self.start(project_id).await
    }

    /// Run the dependency installer in the project's workspace.
    pub async fn install_dependencies(
        &self,
        project_id: &ProjectId,
    ) -> Result<InstallOutput, PreviewError> {
        let cwd = self.inner.workspaces.resolve(project_id)?;
        let settings = &self.inner.settings;
        run_install(&InstallSpec {
            command: settings.install_command.clone(),
            args: settings.install_args.clone(),
            cwd,
            timeout: settings.install_timeout,
            output_lines: settings.log_capacity,
        })
        .await
    }

    /// Stop every preview that is not already stopped.
    pub async fn shutdown(&self) {
        let ids: Vec<ProjectId> = self.lock_slots().keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                tracing::warn!(project_id = %id, "Failed to stop preview during shutdown: {}", e);
            }
        }
    }

    async fn finish_start(
        &self,
        project_id: ProjectId,
        slot: Arc<Slot>,
        generation: u64,
        port: u16,
        mut exit_rx: watch::Receiver<Option<ExitInfo>>,
    ) -> Result<PreviewStatus, PreviewError> {
        let outcome = self.await_readiness(port, &mut exit_rx).await;

        let mut control = slot.control.lock().await;
        if control.generation != generation || slot.snapshot().state != PreviewState::Starting {
            // Stopped or restarted while we were waiting.
            return Ok(slot.snapshot());
        }

        match outcome {
            Readiness::Ready => {
                let url = format!("http://{}:{}", self.inner.settings.public_host, port);
                let status = slot.update(|s| {
                    s.transition(PreviewState::Running)?;
                    s.url = Some(url);
                    Ok(())
                })?;
                self.publish(&status);
                tracing::info!(project_id = %project_id, port, "Preview running");
                self.watch_exit(project_id, Arc::clone(&slot), generation, exit_rx);
                Ok(status)
            }
            Readiness::TimedOut => {
                if let Some(process) = control.process.take() {
                    process.terminate(self.inner.settings.stop_grace).await;
                }
                if let Some(port) = control.lease.take() {
                    self.inner.ports.release(port).await;
                }
                let error = PreviewError::ReadinessTimeout {
                    port,
                    waited: self.inner.settings.startup_timeout,
                };
                Err(self.fail(&slot, &project_id, error))
            }
            Readiness::Exited(exit) => {
                control.process = None;
                if let Some(port) = control.lease.take() {
                    self.inner.ports.release(port).await;
                }
                let error = PreviewError::ExitedBeforeReady {
                    status: exit.description,
                };
                Err(self.fail(&slot, &project_id, error))
            }
        }
    }

    /// Probe every `poll_interval` until the server answers, exits, or the
    /// startup window closes.
    async fn await_readiness(
        &self,
        port: u16,
        exit_rx: &mut watch::Receiver<Option<ExitInfo>>,
    ) -> Readiness {
        let settings = &self.inner.settings;
        let deadline = Instant::now() + settings.startup_timeout;
        loop {
            if let Some(exit) = exit_rx.borrow().clone() {
                return Readiness::Exited(exit);
            }
            if self.inner.probe.probe(port).await {
                return Readiness::Ready;
            }
            let now = Instant::now();
            if now >= deadline {
                return Readiness::TimedOut;
            }
            tokio::select! {
                _ = tokio::time::sleep(settings.poll_interval.min(deadline - now)) => {}
                changed = exit_rx.changed() => {
                    if changed.is_err() && exit_rx.borrow().is_none() {
                        return Readiness::Exited(ExitInfo::unknown());
                    }
                }
            }
        }
    }

    /// Move a running preview to `error` if its process exits on its own.
    fn watch_exit(
        &self,
        project_id: ProjectId,
        slot: Arc<Slot>,
        generation: u64,
        mut exit_rx: watch::Receiver<Option<ExitInfo>>,
    ) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let exit = match exit_rx.wait_for(Option::is_some).await {
                Ok(exit) => (*exit).clone().unwrap_or_else(ExitInfo::unknown),
                Err(_) => ExitInfo::unknown(),
            };

            let mut control = slot.control.lock().await;
            if control.generation != generation || slot.snapshot().state != PreviewState::Running {
                return;
            }
            control.process = None;
            if let Some(port) = control.lease.take() {
                supervisor.inner.ports.release(port).await;
            }
            supervisor.fail(
                &slot,
                &project_id,
                PreviewError::ProcessExited {
                    status: exit.description,
                },
            );
        });
    }

    /// Record `error` on the slot, move it to `error`, publish, and hand the
    /// error back for the caller to return.
    fn fail(&self, slot: &Slot, project_id: &ProjectId, error: PreviewError) -> PreviewError {
        let message = error.to_string();
        slot.logs.push(format!("{SUPERVISOR_LOG_PREFIX} {message}"));
        let excerpt = slot.logs.tail(self.inner.settings.log_excerpt_lines);

        match slot.update(|s| {
            s.transition(PreviewState::Error)?;
            s.last_error = Some(message.clone());
            s.log_excerpt = excerpt;
            Ok(())
        }) {
            Ok(status) => self.publish(&status),
            Err(e) => tracing::error!(project_id = %project_id, "Could not record preview failure: {}", e),
        }
        tracing::warn!(project_id = %project_id, "Preview failed: {}", message);
        error
    }

    fn publish(&self, status: &PreviewStatus) {
        match StreamEvent::from_serialize(EventKind::PreviewStatus, status.project_id.clone(), status) {
            Ok(event) => {
                self.inner.hub.publish(event);
            }
            Err(e) => tracing::error!(project_id = %status.project_id, "Failed to serialize preview status: {}", e),
        }
    }

    fn slot(&self, project_id: &ProjectId) -> Arc<Slot> {
        let mut slots = self.lock_slots();
        Arc::clone(slots.entry(project_id.clone()).or_insert_with(|| {
            Arc::new(Slot::new(project_id.clone(), self.inner.settings.log_capacity))
        }))
    }

    fn existing_slot(&self, project_id: &ProjectId) -> Option<Arc<Slot>> {
        self.lock_slots().get(project_id).cloned()
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<ProjectId, Arc<Slot>>> {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
