//! Fixed-interval sampling loop
//!
//! State machine: `Idle -> Running -> Stopping -> Stopped`. A tick runs
//! capture, diff and publish to completion; cancellation is only observed
//! between ticks. A stopped loop is never restarted.

use chrono::Utc;
use procwatch_shared::{log_loop, MonitorEvent, TickEvent};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::delta::{self, DeltaReport};
use crate::error::{MonitorError, MonitorResult, ProbeError};
use crate::ranking::RankingEngine;
use crate::snapshot::{self, ProcessTable, Snapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Outcome of one successful tick
#[derive(Debug, Clone)]
pub struct TickSummary {
    pub tick: u64,
    pub processes: usize,
    pub exited: Vec<u32>,
}

/// Capture, diff and publish. Owns the previous snapshot; nothing else
/// writes it.
///
/// Tick numbers continue from the engine's current view, so they never go
/// backwards across successive tickers on one engine.
pub struct Ticker {
    table: Arc<dyn ProcessTable>,
    ranking: Arc<RankingEngine>,
    previous: Option<Snapshot>,
    tick: u64,
    attempted: u64,
}

impl Ticker {
    pub fn new(table: Arc<dyn ProcessTable>, ranking: Arc<RankingEngine>) -> Self {
        let tick = ranking.current().tick;
        Self {
            table,
            ranking,
            previous: None,
            tick,
            attempted: 0,
        }
    }

    /// Number of ticks attempted by this ticker
    pub fn ticks(&self) -> u64 {
        self.attempted
    }

    /// Number of the latest attempted tick
    pub fn last_tick(&self) -> u64 {
        self.tick
    }

    pub async fn tick(&mut self) -> MonitorResult<TickSummary> {
        self.tick += 1;
        self.attempted += 1;

        let table = Arc::clone(&self.table);
        let current = tokio::task::spawn_blocking(move || snapshot::capture(table.as_ref()))
            .await
            .map_err(|e| {
                MonitorError::TableUnreadable(ProbeError::Io(std::io::Error::other(e.to_string())))
            })??;

        let report: DeltaReport = match &self.previous {
            Some(previous) => delta::diff(previous, &current),
            None => delta::baseline(&current),
        };

        let exited = report.exited_pids();
        let processes = report.processes.len();
        for gone in &report.exited {
            log_loop!(debug, "exited: {} ({})", gone.identity, gone.name);
        }

        self.ranking
            .publish(self.tick, current.wall_time(), report.processes);
        self.previous = Some(current);

        Ok(TickSummary {
            tick: self.tick,
            processes,
            exited,
        })
    }
}

pub struct MonitorLoop {
    table: Arc<dyn ProcessTable>,
    ranking: Arc<RankingEngine>,
    events: broadcast::Sender<MonitorEvent>,
    state: Arc<watch::Sender<LoopState>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorLoop {
    pub fn new(table: Arc<dyn ProcessTable>, ranking: Arc<RankingEngine>) -> Self {
        let (events, _) = broadcast::channel(100);
        Self::with_events(table, ranking, events)
    }

    /// Publishes onto an existing event channel
    pub fn with_events(
        table: Arc<dyn ProcessTable>,
        ranking: Arc<RankingEngine>,
        events: broadcast::Sender<MonitorEvent>,
    ) -> Self {
        let (state, _) = watch::channel(LoopState::Idle);
        Self {
            table,
            ranking,
            events,
            state: Arc::new(state),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    /// Idle -> Running; spawns the tick task on the current runtime.
    pub fn start(&self, interval: Duration) -> MonitorResult<()> {
        let mut refused = None;
        self.state.send_if_modified(|state| {
            if *state == LoopState::Idle {
                *state = LoopState::Running;
                true
            } else {
                refused = Some(*state);
                false
            }
        });
        if let Some(state) = refused {
            return Err(MonitorError::InvalidState(state));
        }

        log_loop!(info, "monitor loop started (interval {interval:?})");

        let ticker = Ticker::new(Arc::clone(&self.table), Arc::clone(&self.ranking));
        let handle = tokio::spawn(run(
            ticker,
            interval,
            Arc::clone(&self.state),
            self.events.clone(),
        ));

        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }
        Ok(())
    }

    /// Requests a stop. Safe to call any number of times in any state.
    pub fn stop(&self) {
        let mut never_started = false;
        self.state.send_if_modified(|state| match *state {
            LoopState::Running => {
                *state = LoopState::Stopping;
                true
            }
            LoopState::Idle => {
                *state = LoopState::Stopped;
                never_started = true;
                true
            }
            LoopState::Stopping | LoopState::Stopped => false,
        });

        if never_started {
            let _ = self.events.send(MonitorEvent::Stopped { ticks: 0 });
        }
    }

    /// Waits for the loop to reach `Stopped` (only returns after `stop`)
    pub async fn join(&self) {
        let task = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                log_loop!(error, "monitor task ended abnormally: {e}");
                self.state.send_replace(LoopState::Stopped);
            }
            return;
        }

        let mut state = self.state.subscribe();
        while !is_stopped(&mut state) {
            if state.changed().await.is_err() {
                break;
            }
        }
    }

    /// `stop` followed by `join`
    pub async fn shutdown(&self) {
        self.stop();
        self.join().await;
    }
}

impl Drop for MonitorLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn is_running(state: &mut watch::Receiver<LoopState>) -> bool {
    *state.borrow_and_update() == LoopState::Running
}

fn is_stopped(state: &mut watch::Receiver<LoopState>) -> bool {
    *state.borrow_and_update() == LoopState::Stopped
}

async fn run(
    mut ticker: Ticker,
    interval: Duration,
    state: Arc<watch::Sender<LoopState>>,
    events: broadcast::Sender<MonitorEvent>,
) {
    let mut state_rx = state.subscribe();

    while is_running(&mut state_rx) {
        let started = Instant::now();
        let result = ticker.tick().await;
        let overrun = started.elapsed() > interval;

        let event = match result {
            Ok(summary) => MonitorEvent::Tick(TickEvent {
                tick: summary.tick,
                timestamp: Utc::now(),
                overrun,
                exited: summary.exited,
            }),
            Err(e) => {
                log_loop!(warn, "tick {} failed: {e}", ticker.last_tick());
                MonitorEvent::TickFailed {
                    tick: ticker.last_tick(),
                    timestamp: Utc::now(),
                    message: e.to_string(),
                }
            }
        };
        let _ = events.send(event);

        if overrun {
            log_loop!(
                warn,
                "tick {} overran the {interval:?} interval ({:?})",
                ticker.last_tick(),
                started.elapsed()
            );
            continue;
        }

        tokio::select! {
            _ = tokio::time::sleep_until(started + interval) => {}
            _ = state_rx.changed() => {}
        }
    }

    state.send_replace(LoopState::Stopped);
    log_loop!(info, "monitor loop stopped after {} ticks", ticker.ticks());
    let _ = events.send(MonitorEvent::Stopped {
        ticks: ticker.ticks(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{Counters, ProcessIdentity, RawProcess};
    use procwatch_shared::ProcessState;

    struct OneProcess;

    impl ProcessTable for OneProcess {
        fn pids(&self) -> Result<Vec<u32>, ProbeError> {
            Ok(vec![42])
        }

        fn probe(&self, pid: u32) -> Result<RawProcess, ProbeError> {
            Ok(RawProcess {
                identity: ProcessIdentity::new(pid, 1),
                name: "answer".to_string(),
                owner: "root".to_string(),
                state: ProcessState::Running,
                parent_pid: 1,
                counters: Ok(Counters {
                    cpu_time: Duration::ZERO,
                    resident_bytes: 0,
                    threads: 1,
                }),
            })
        }

        fn total_memory(&self) -> Result<u64, ProbeError> {
            Ok(1024)
        }

        fn cpu_count(&self) -> usize {
            1
        }
    }

    fn new_loop() -> MonitorLoop {
        MonitorLoop::new(Arc::new(OneProcess), Arc::new(RankingEngine::new()))
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let monitor = new_loop();
        assert_eq!(monitor.state(), LoopState::Idle);

        monitor.start(Duration::from_millis(10)).unwrap();
        assert_eq!(monitor.state(), LoopState::Running);
        assert!(matches!(
            monitor.start(Duration::from_millis(10)),
            Err(MonitorError::InvalidState(LoopState::Running))
        ));

        monitor.shutdown().await;
        assert_eq!(monitor.state(), LoopState::Stopped);

        // no restart, and stopping again is a no-op
        assert!(monitor.start(Duration::from_millis(10)).is_err());
        monitor.stop();
        monitor.shutdown().await;
        assert_eq!(monitor.state(), LoopState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let monitor = new_loop();
        let mut events = monitor.subscribe();
        monitor.stop();
        assert_eq!(monitor.state(), LoopState::Stopped);
        assert_eq!(events.recv().await.unwrap(), MonitorEvent::Stopped { ticks: 0 });
        monitor.join().await;
    }

    #[tokio::test]
    async fn test_ticker_publishes_baseline_then_rates() {
        let ranking = Arc::new(RankingEngine::new());
        let mut ticker = Ticker::new(Arc::new(OneProcess), Arc::clone(&ranking));

        let first = ticker.tick().await.unwrap();
        assert_eq!(first.tick, 1);
        assert_eq!(first.processes, 1);
        assert_eq!(ranking.current().processes[0].cpu_percent, None);

        tokio::time::sleep(Duration::from_millis(5)).await;
        ticker.tick().await.unwrap();
        assert_eq!(ranking.current().tick, 2);
        assert_eq!(ranking.current().processes[0].cpu_percent, Some(0.0));
    }

    #[tokio::test]
    async fn test_new_ticker_continues_numbering() {
        let ranking = Arc::new(RankingEngine::new());
        let mut first = Ticker::new(Arc::new(OneProcess), Arc::clone(&ranking));
        first.tick().await.unwrap();
        first.tick().await.unwrap();

        let mut second = Ticker::new(Arc::new(OneProcess), Arc::clone(&ranking));
        let summary = second.tick().await.unwrap();
        assert_eq!(summary.tick, 3);
        assert_eq!(second.ticks(), 1);
        assert_eq!(ranking.current().tick, 3);
    }
}
