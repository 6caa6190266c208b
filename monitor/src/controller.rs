//! Safe process termination with escalation
//!
//! SIGTERM first, SIGKILL after the grace period. Every step re-checks that
//! the pid still belongs to the requested [`ProcessIdentity`], so a reused pid
//! is never signalled.

use procwatch_shared::{log_control, ProcessState, TerminateOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{MonitorError, ProbeError};
use crate::snapshot::ProcessIdentity;

/// Signals the controller may send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermSignal {
    /// SIGTERM
    Graceful,
    /// SIGKILL
    Forceful,
}

/// The process currently holding a pid
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Occupant {
    pub identity: ProcessIdentity,
    pub state: ProcessState,
}

/// Host primitives needed for termination
pub trait ProcessControl: Send + Sync {
    /// Current occupant of `pid`, `None` if the pid is free
    fn occupant(&self, pid: u32) -> Result<Option<Occupant>, ProbeError>;

    fn send(&self, pid: u32, signal: TermSignal) -> Result<(), ProbeError>;
}

/// Escalation timing
#[derive(Debug, Clone, Copy)]
pub struct Escalation {
    /// Bounded wait after SIGKILL
    pub force_wait: Duration,
    /// Exit polling cadence
    pub poll_interval: Duration,
}

impl Default for Escalation {
    fn default() -> Self {
        Self {
            force_wait: Duration::from_secs(1),
            poll_interval: Duration::from_millis(50),
        }
    }
}

enum Liveness {
    Alive,
    Exited,
}

pub struct ProcessController {
    host: Arc<dyn ProcessControl>,
    escalation: Escalation,
    own_pid: u32,
}

impl ProcessController {
    pub fn new(host: Arc<dyn ProcessControl>, escalation: Escalation) -> Self {
        Self {
            host,
            escalation,
            own_pid: std::process::id(),
        }
    }

    /// Pids that must never be signalled
    fn is_protected(&self, pid: u32) -> bool {
        pid <= 1 || pid == self.own_pid
    }

    /// Confirms `identity` still occupies its pid
    fn verify(&self, identity: ProcessIdentity) -> Result<Occupant, TerminateOutcome> {
        match self.host.occupant(identity.pid) {
            Ok(Some(occupant)) if occupant.identity == identity => Ok(occupant),
            Ok(Some(occupant)) => {
                let err = MonitorError::StaleIdentity(identity);
                log_control!(
                    info,
                    "{err} (now {}), refusing to signal",
                    occupant.identity
                );
                Err(TerminateOutcome::NotFound)
            }
            Ok(None) => Err(TerminateOutcome::NotFound),
            Err(ProbeError::PermissionDenied) => Err(TerminateOutcome::Denied),
            Err(ProbeError::Vanished) => Err(TerminateOutcome::NotFound),
            Err(e) => {
                log_control!(warn, "cannot read pid {}: {e}", identity.pid);
                Err(TerminateOutcome::NotFound)
            }
        }
    }

    fn liveness(&self, identity: ProcessIdentity) -> Liveness {
        match self.host.occupant(identity.pid) {
            Ok(Some(occupant)) if occupant.identity == identity => {
                if occupant.state.has_exited() {
                    Liveness::Exited
                } else {
                    Liveness::Alive
                }
            }
            // gone, or the pid already belongs to someone else
            Ok(_) | Err(ProbeError::Vanished) => Liveness::Exited,
            Err(_) => Liveness::Alive,
        }
    }

    /// Polls until `identity` exits or `timeout` elapses
    async fn wait_for_exit(&self, identity: ProcessIdentity, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if matches!(self.liveness(identity), Liveness::Exited) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let pause = self.escalation.poll_interval.min(deadline - now);
            tokio::time::sleep(pause).await;
        }
    }

    /// Terminates `identity`, escalating to SIGKILL after `grace`.
    pub async fn terminate(&self, identity: ProcessIdentity, grace: Duration) -> TerminateOutcome {
        if self.is_protected(identity.pid) {
            log_control!(warn, "pid {} is protected, not signalling", identity.pid);
            return TerminateOutcome::Denied;
        }

        if let Err(outcome) = self.verify(identity) {
            return outcome;
        }

        log_control!(info, "SIGTERM -> {identity}");
        match self.host.send(identity.pid, TermSignal::Graceful) {
            Ok(()) => {}
            Err(ProbeError::Vanished) => return TerminateOutcome::NotFound,
            Err(ProbeError::PermissionDenied) => return TerminateOutcome::Denied,
            Err(e) => {
                log_control!(error, "SIGTERM to {identity} failed: {e}");
                return TerminateOutcome::Denied;
            }
        }

        if self.wait_for_exit(identity, grace).await {
            log_control!(info, "{identity} exited within grace period");
            return TerminateOutcome::Terminated;
        }

        // the pid may have been recycled while we waited
        if let Err(outcome) = self.verify(identity) {
            return match outcome {
                TerminateOutcome::NotFound => TerminateOutcome::Terminated,
                other => other,
            };
        }

        log_control!(warn, "{identity} ignored SIGTERM for {grace:?}, sending SIGKILL");
        match self.host.send(identity.pid, TermSignal::Forceful) {
            Ok(()) => {}
            Err(ProbeError::Vanished) => return TerminateOutcome::Terminated,
            Err(ProbeError::PermissionDenied) => return TerminateOutcome::Denied,
            Err(e) => {
                log_control!(error, "SIGKILL to {identity} failed: {e}");
                return TerminateOutcome::Denied;
            }
        }

        if self.wait_for_exit(identity, self.escalation.force_wait).await {
            TerminateOutcome::Terminated
        } else {
            log_control!(error, "{identity} survived SIGKILL");
            TerminateOutcome::StillAlive
        }
    }

    /// Identity currently holding `pid`, if any
    pub fn current_identity(&self, pid: u32) -> Option<ProcessIdentity> {
        self.host
            .occupant(pid)
            .ok()
            .flatten()
            .map(|occupant| occupant.identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// How a fake process reacts to each signal
    #[derive(Clone, Copy)]
    enum Reaction {
        Exit,
        Zombie,
        Ignore,
    }

    struct FakeProc {
        occupant: Occupant,
        on_term: Reaction,
        on_kill: Reaction,
    }

    #[derive(Default)]
    struct FakeHost {
        procs: Mutex<HashMap<u32, FakeProc>>,
        sent: Mutex<Vec<(u32, TermSignal)>>,
        deny_signals: bool,
        /// `send` of this signal fails with ESRCH
        vanish_on: Option<TermSignal>,
        /// At this occupant query (1-based) the pid passes to a new process
        recycle_at_query: Option<usize>,
        /// From this occupant query on (1-based), reading the pid is refused
        deny_from_query: Option<usize>,
        queries: Mutex<usize>,
    }

    impl FakeHost {
        fn with(pid: u32, start: u64, on_term: Reaction, on_kill: Reaction) -> Self {
            let host = FakeHost::default();
            host.procs.lock().unwrap().insert(
                pid,
                FakeProc {
                    occupant: Occupant {
                        identity: ProcessIdentity::new(pid, start),
                        state: ProcessState::Sleeping,
                    },
                    on_term,
                    on_kill,
                },
            );
            host
        }

        fn sent(&self) -> Vec<(u32, TermSignal)> {
            self.sent.lock().unwrap().clone()
        }

        /// Hands `pid` to a different process instance
        fn recycle(&self, pid: u32) {
            if let Some(proc) = self.procs.lock().unwrap().get_mut(&pid) {
                proc.occupant.identity.start_time += 1000;
            }
        }
    }

    impl ProcessControl for FakeHost {
        fn occupant(&self, pid: u32) -> Result<Option<Occupant>, ProbeError> {
            let query = {
                let mut queries = self.queries.lock().unwrap();
                *queries += 1;
                *queries
            };
            if self.deny_from_query.is_some_and(|n| query >= n) {
                return Err(ProbeError::PermissionDenied);
            }
            if self.recycle_at_query == Some(query) {
                self.recycle(pid);
            }
            Ok(self.procs.lock().unwrap().get(&pid).map(|p| p.occupant))
        }

        fn send(&self, pid: u32, signal: TermSignal) -> Result<(), ProbeError> {
            if self.deny_signals {
                return Err(ProbeError::PermissionDenied);
            }
            self.sent.lock().unwrap().push((pid, signal));
            if self.vanish_on == Some(signal) {
                return Err(ProbeError::Vanished);
            }
            let mut procs = self.procs.lock().unwrap();
            let proc = procs.get_mut(&pid).ok_or(ProbeError::Vanished)?;
            let reaction = match signal {
                TermSignal::Graceful => proc.on_term,
                TermSignal::Forceful => proc.on_kill,
            };
            match reaction {
                Reaction::Exit => {
                    procs.remove(&pid);
                }
                Reaction::Zombie => proc.occupant.state = ProcessState::Zombie,
                Reaction::Ignore => {}
            }
            Ok(())
        }
    }

    fn controller(host: Arc<FakeHost>) -> ProcessController {
        ProcessController::new(
            host,
            Escalation {
                force_wait: Duration::from_millis(40),
                poll_interval: Duration::from_millis(5),
            },
        )
    }

    const GRACE: Duration = Duration::from_millis(40);

    #[tokio::test]
    async fn test_graceful_exit() {
        let host = Arc::new(FakeHost::with(500, 7, Reaction::Exit, Reaction::Exit));
        let outcome = controller(host.clone())
            .terminate(ProcessIdentity::new(500, 7), GRACE)
            .await;
        assert_eq!(outcome, TerminateOutcome::Terminated);
        assert_eq!(host.sent(), vec![(500, TermSignal::Graceful)]);
    }

    #[tokio::test]
    async fn test_zombie_counts_as_exited() {
        let host = Arc::new(FakeHost::with(500, 7, Reaction::Zombie, Reaction::Ignore));
        let outcome = controller(host.clone())
            .terminate(ProcessIdentity::new(500, 7), GRACE)
            .await;
        assert_eq!(outcome, TerminateOutcome::Terminated);
    }

    #[tokio::test]
    async fn test_escalates_to_sigkill() {
        let host = Arc::new(FakeHost::with(500, 7, Reaction::Ignore, Reaction::Exit));
        let outcome = controller(host.clone())
            .terminate(ProcessIdentity::new(500, 7), GRACE)
            .await;
        assert_eq!(outcome, TerminateOutcome::Terminated);
        assert_eq!(
            host.sent(),
            vec![(500, TermSignal::Graceful), (500, TermSignal::Forceful)]
        );
    }

    #[tokio::test]
    async fn test_survivor_is_still_alive() {
        let host = Arc::new(FakeHost::with(500, 7, Reaction::Ignore, Reaction::Ignore));
        let outcome = controller(host.clone())
            .terminate(ProcessIdentity::new(500, 7), GRACE)
            .await;
        assert_eq!(outcome, TerminateOutcome::StillAlive);
    }

    #[tokio::test]
    async fn test_stale_identity_sends_nothing() {
        let host = Arc::new(FakeHost::with(500, 99, Reaction::Exit, Reaction::Exit));
        let outcome = controller(host.clone())
            .terminate(ProcessIdentity::new(500, 7), GRACE)
            .await;
        assert_eq!(outcome, TerminateOutcome::NotFound);
        assert!(host.sent().is_empty());
    }

    #[tokio::test]
    async fn test_missing_pid_is_not_found() {
        let host = Arc::new(FakeHost::default());
        let outcome = controller(host.clone())
            .terminate(ProcessIdentity::new(500, 7), GRACE)
            .await;
        assert_eq!(outcome, TerminateOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_denied_does_not_escalate() {
        let mut host = FakeHost::with(500, 7, Reaction::Ignore, Reaction::Ignore);
        host.deny_signals = true;
        let host = Arc::new(host);
        let outcome = controller(host.clone())
            .terminate(ProcessIdentity::new(500, 7), GRACE)
            .await;
        assert_eq!(outcome, TerminateOutcome::Denied);
        assert!(host.sent().is_empty());
    }

    #[tokio::test]
    async fn test_protected_pids() {
        let host = Arc::new(FakeHost::with(1, 1, Reaction::Exit, Reaction::Exit));
        let controller = controller(host.clone());
        assert_eq!(
            controller.terminate(ProcessIdentity::new(1, 1), GRACE).await,
            TerminateOutcome::Denied
        );
        let me = ProcessIdentity::new(std::process::id(), 0);
        assert_eq!(controller.terminate(me, GRACE).await, TerminateOutcome::Denied);
        assert!(host.sent().is_empty());
    }

    #[tokio::test]
    async fn test_pid_recycled_during_grace_is_not_killed() {
        let host = Arc::new(FakeHost::with(500, 7, Reaction::Ignore, Reaction::Exit));
        let recycler = {
            let host = host.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                host.recycle(500);
            })
        };
        let outcome = controller(host.clone())
            .terminate(ProcessIdentity::new(500, 7), GRACE)
            .await;
        recycler.await.unwrap();

        assert_eq!(outcome, TerminateOutcome::Terminated);
        assert_eq!(host.sent(), vec![(500, TermSignal::Graceful)]);
    }

    #[tokio::test]
    async fn test_pid_recycled_before_recheck_is_not_killed() {
        // zero grace: query 1 verifies, query 2 polls once, query 3 re-checks
        let mut host = FakeHost::with(500, 7, Reaction::Ignore, Reaction::Exit);
        host.recycle_at_query = Some(3);
        let host = Arc::new(host);
        let outcome = controller(host.clone())
            .terminate(ProcessIdentity::new(500, 7), Duration::ZERO)
            .await;

        assert_eq!(outcome, TerminateOutcome::Terminated);
        assert_eq!(host.sent(), vec![(500, TermSignal::Graceful)]);
    }

    #[tokio::test]
    async fn test_esrch_on_sigterm_is_not_found() {
        let mut host = FakeHost::with(500, 7, Reaction::Exit, Reaction::Exit);
        host.vanish_on = Some(TermSignal::Graceful);
        let host = Arc::new(host);
        let outcome = controller(host.clone())
            .terminate(ProcessIdentity::new(500, 7), GRACE)
            .await;

        assert_eq!(outcome, TerminateOutcome::NotFound);
        assert_eq!(host.sent(), vec![(500, TermSignal::Graceful)]);
    }

    #[tokio::test]
    async fn test_esrch_on_sigkill_is_terminated() {
        let mut host = FakeHost::with(500, 7, Reaction::Ignore, Reaction::Ignore);
        host.vanish_on = Some(TermSignal::Forceful);
        let host = Arc::new(host);
        let outcome = controller(host.clone())
            .terminate(ProcessIdentity::new(500, 7), Duration::ZERO)
            .await;

        assert_eq!(outcome, TerminateOutcome::Terminated);
        assert_eq!(
            host.sent(),
            vec![(500, TermSignal::Graceful), (500, TermSignal::Forceful)]
        );
    }

    #[tokio::test]
    async fn test_denied_recheck_does_not_escalate() {
        let mut host = FakeHost::with(500, 7, Reaction::Ignore, Reaction::Exit);
        host.deny_from_query = Some(2);
        let host = Arc::new(host);
        let outcome = controller(host.clone())
            .terminate(ProcessIdentity::new(500, 7), Duration::ZERO)
            .await;

        assert_eq!(outcome, TerminateOutcome::Denied);
        assert_eq!(host.sent(), vec![(500, TermSignal::Graceful)]);
    }
}
