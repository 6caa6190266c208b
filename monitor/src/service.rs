//! Entry points for CLI and service collaborators

use procwatch_shared::{
    log_control, log_info, logging::LogCategory, Config, MonitorEvent, ProcessRow, SortKey,
    TerminateOutcome,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::controller::{Escalation, ProcessControl, ProcessController};
use crate::error::{MonitorError, MonitorResult};
use crate::monitor_loop::{LoopState, MonitorLoop, TickSummary, Ticker};
use crate::procfs::{HostProcesses, ProcessDetails};
use crate::ranking::{Query, RankedView, RankingEngine};
use crate::snapshot::ProcessTable;

/// Host capabilities the service needs
pub trait Host: ProcessTable + ProcessControl {
    /// Detailed information for one pid, `None` if it cannot be read
    fn details(&self, pid: u32) -> Option<ProcessDetails>;
}

impl Host for HostProcesses {
    fn details(&self, pid: u32) -> Option<ProcessDetails> {
        HostProcesses::details(self, pid).ok()
    }
}

/// A running monitor loop
#[derive(Clone)]
pub struct MonitorHandle {
    inner: Arc<MonitorLoop>,
}

impl MonitorHandle {
    pub fn state(&self) -> LoopState {
        self.inner.state()
    }

    /// Requests a stop without waiting for the in-flight tick
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Waits until the loop has stopped
    pub async fn stopped(&self) {
        self.inner.join().await;
    }
}

/// One engine, one view: at most one loop or one-shot sample publishes at a
/// time.
pub struct MonitorService {
    host: Arc<dyn Host>,
    ranking: Arc<RankingEngine>,
    controller: ProcessController,
    events: broadcast::Sender<MonitorEvent>,
    active: Mutex<Weak<MonitorLoop>>,
    sampling: AtomicBool,
}

/// Clears the one-shot sampling flag when dropped
struct SamplingGuard<'a>(&'a AtomicBool);

impl Drop for SamplingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl MonitorService {
    pub fn new(host: Arc<dyn Host>, escalation: Escalation) -> Self {
        let (events, _) = broadcast::channel(100);
        let control: Arc<dyn ProcessControl> = Arc::new(ControlAdapter(Arc::clone(&host)));
        Self {
            controller: ProcessController::new(control, escalation),
            host,
            ranking: Arc::new(RankingEngine::new()),
            events,
            active: Mutex::new(Weak::new()),
            sampling: AtomicBool::new(false),
        }
    }

    fn loop_active(active: &Weak<MonitorLoop>) -> bool {
        active
            .upgrade()
            .is_some_and(|monitor| monitor.state() != LoopState::Stopped)
    }

    /// Service over the live `/proc` host, timed from `config`
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Arc::new(HostProcesses::new()),
            Escalation {
                force_wait: config.control.force_wait(),
                poll_interval: config.control.poll_interval(),
            },
        )
    }

    pub fn ranking(&self) -> Arc<RankingEngine> {
        Arc::clone(&self.ranking)
    }

    /// Per-tick events of every loop started by this service
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    /// Starts a loop; refused while another loop or a one-shot sample runs
    pub fn start_monitoring(&self, interval: Duration) -> MonitorResult<MonitorHandle> {
        let mut active = self.active.lock().map_err(|_| MonitorError::Busy)?;
        if Self::loop_active(&active) || self.sampling.load(Ordering::SeqCst) {
            log_control!(warn, "monitoring already running on this service");
            return Err(MonitorError::Busy);
        }

        let table: Arc<dyn ProcessTable> = Arc::new(TableAdapter(Arc::clone(&self.host)));
        let monitor = Arc::new(MonitorLoop::with_events(
            table,
            self.ranking(),
            self.events.clone(),
        ));
        monitor.start(interval)?;
        *active = Arc::downgrade(&monitor);
        Ok(MonitorHandle { inner: monitor })
    }

    /// Stops the loop and waits for it; repeat calls are no-ops
    pub async fn stop_monitoring(&self, handle: &MonitorHandle) {
        handle.stop();
        handle.stopped().await;
    }

    /// Two captures `settle` apart, published as a fresh view.
    ///
    /// Refused while a loop started by this service is still running.
    pub async fn sample_once(&self, settle: Duration) -> MonitorResult<TickSummary> {
        let _guard = {
            let active = self.active.lock().map_err(|_| MonitorError::Busy)?;
            if Self::loop_active(&active)
                || self
                    .sampling
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
            {
                return Err(MonitorError::Busy);
            }
            SamplingGuard(&self.sampling)
        };

        let table: Arc<dyn ProcessTable> = Arc::new(TableAdapter(Arc::clone(&self.host)));
        let mut ticker = Ticker::new(table, self.ranking());
        ticker.tick().await?;
        tokio::time::sleep(settle).await;
        ticker.tick().await
    }

    pub fn query(&self, sort: SortKey, limit: usize, name_filter: Option<&str>) -> Vec<ProcessRow> {
        let query = Query {
            sort,
            limit: Some(limit),
            name_filter: name_filter.map(str::to_string),
            owner: None,
        };
        self.query_with(&query).rows()
    }

    pub fn query_with(&self, query: &Query) -> RankedView {
        self.ranking.query(query)
    }

    /// Terminates `pid`, escalating to SIGKILL after `grace_secs`.
    ///
    /// The pid is resolved to the identity seen by the latest tick, so a pid
    /// recycled since then is reported as `NotFound`.
    pub async fn terminate(&self, pid: u32, grace_secs: u64) -> TerminateOutcome {
        let identity = match self.ranking.lookup(pid) {
            Some(identity) => identity,
            None => match self.controller.current_identity(pid) {
                Some(identity) => {
                    log_control!(debug, "pid {pid} not in current view, using {identity}");
                    identity
                }
                None => return TerminateOutcome::NotFound,
            },
        };

        let outcome = self
            .controller
            .terminate(identity, Duration::from_secs(grace_secs))
            .await;
        log_info!(LogCategory::Control, "terminate {identity}: {outcome}");
        outcome
    }

    pub fn inspect(&self, pid: u32) -> Option<ProcessDetails> {
        self.host.details(pid)
    }
}

// Upcasting `Arc<dyn Host>` to its supertraits needs explicit adapters.
struct TableAdapter(Arc<dyn Host>);

impl ProcessTable for TableAdapter {
    fn pids(&self) -> Result<Vec<u32>, crate::error::ProbeError> {
        self.0.pids()
    }

    fn probe(&self, pid: u32) -> Result<crate::snapshot::RawProcess, crate::error::ProbeError> {
        self.0.probe(pid)
    }

    fn total_memory(&self) -> Result<u64, crate::error::ProbeError> {
        self.0.total_memory()
    }

    fn cpu_count(&self) -> usize {
        self.0.cpu_count()
    }
}

struct ControlAdapter(Arc<dyn Host>);

impl ProcessControl for ControlAdapter {
    fn occupant(
        &self,
        pid: u32,
    ) -> Result<Option<crate::controller::Occupant>, crate::error::ProbeError> {
        self.0.occupant(pid)
    }

    fn send(
        &self,
        pid: u32,
        signal: crate::controller::TermSignal,
    ) -> Result<(), crate::error::ProbeError> {
        self.0.send(pid, signal)
    }
}
