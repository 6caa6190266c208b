// Shared fixtures for the integration tests. Each test binary compiles this
// module separately and uses only part of it.

#![cfg(test)]
#![allow(dead_code)]

use procwatch_monitor::controller::{Occupant, ProcessControl, TermSignal};
use procwatch_monitor::procfs::ProcessDetails;
use procwatch_monitor::snapshot::{Counters, RawProcess};
use procwatch_monitor::{Escalation, Host, MonitorService, ProbeError, ProcessIdentity, ProcessTable};
use procwatch_shared::ProcessState;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TOTAL_MEMORY: u64 = 1024 * 1024 * 1024;

/// How a fake process answers SIGTERM
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OnTerm {
    Exit,
    Ignore,
}

#[derive(Debug, Clone)]
pub struct FakeProcess {
    pub start_time: u64,
    pub name: String,
    pub owner: String,
    pub state: ProcessState,
    pub cpu_time: Duration,
    pub resident_bytes: u64,
    pub restricted: bool,
    pub on_term: OnTerm,
}

impl FakeProcess {
    pub fn new(name: &str, owner: &str) -> Self {
        Self {
            start_time: 1,
            name: name.to_string(),
            owner: owner.to_string(),
            state: ProcessState::Sleeping,
            cpu_time: Duration::ZERO,
            resident_bytes: 4 * 1024 * 1024,
            restricted: false,
            on_term: OnTerm::Exit,
        }
    }

    pub fn started_at(mut self, start_time: u64) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn restricted(mut self) -> Self {
        self.restricted = true;
        self
    }

    pub fn ignoring_sigterm(mut self) -> Self {
        self.on_term = OnTerm::Ignore;
        self
    }
}

/// In-memory process table that also records the signals it receives
#[derive(Default)]
pub struct FakeHost {
    procs: Mutex<BTreeMap<u32, FakeProcess>>,
    signals: Mutex<Vec<(u32, TermSignal)>>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn spawn(&self, pid: u32, process: FakeProcess) {
        self.procs.lock().unwrap().insert(pid, process);
    }

    pub fn exit(&self, pid: u32) {
        self.procs.lock().unwrap().remove(&pid);
    }

    /// Adds CPU time to a running process
    pub fn burn(&self, pid: u32, cpu: Duration) {
        if let Some(p) = self.procs.lock().unwrap().get_mut(&pid) {
            p.cpu_time += cpu;
        }
    }

    pub fn signals(&self) -> Vec<(u32, TermSignal)> {
        self.signals.lock().unwrap().clone()
    }

    pub fn identity(&self, pid: u32) -> ProcessIdentity {
        let start = self.procs.lock().unwrap()[&pid].start_time;
        ProcessIdentity::new(pid, start)
    }
}

impl ProcessTable for FakeHost {
    fn pids(&self) -> Result<Vec<u32>, ProbeError> {
        Ok(self.procs.lock().unwrap().keys().copied().collect())
    }

    fn probe(&self, pid: u32) -> Result<RawProcess, ProbeError> {
        let procs = self.procs.lock().unwrap();
        let p = procs.get(&pid).ok_or(ProbeError::Vanished)?;
        let counters = if p.restricted {
            Err(ProbeError::PermissionDenied)
        } else {
            Ok(Counters {
                cpu_time: p.cpu_time,
                resident_bytes: p.resident_bytes,
                threads: 1,
            })
        };
        Ok(RawProcess {
            identity: ProcessIdentity::new(pid, p.start_time),
            name: p.name.clone(),
            owner: p.owner.clone(),
            state: p.state,
            parent_pid: 1,
            counters,
        })
    }

    fn total_memory(&self) -> Result<u64, ProbeError> {
        Ok(TOTAL_MEMORY)
    }

    fn cpu_count(&self) -> usize {
        4
    }
}

impl ProcessControl for FakeHost {
    fn occupant(&self, pid: u32) -> Result<Option<Occupant>, ProbeError> {
        Ok(self.procs.lock().unwrap().get(&pid).map(|p| Occupant {
            identity: ProcessIdentity::new(pid, p.start_time),
            state: p.state,
        }))
    }

    fn send(&self, pid: u32, signal: TermSignal) -> Result<(), ProbeError> {
        self.signals.lock().unwrap().push((pid, signal));
        let mut procs = self.procs.lock().unwrap();
        let p = procs.get(&pid).ok_or(ProbeError::Vanished)?;
        if signal == TermSignal::Forceful || p.on_term == OnTerm::Exit {
            procs.remove(&pid);
        }
        Ok(())
    }
}

impl Host for FakeHost {
    fn details(&self, pid: u32) -> Option<ProcessDetails> {
        let procs = self.procs.lock().unwrap();
        let p = procs.get(&pid)?;
        Some(ProcessDetails {
            identity: ProcessIdentity::new(pid, p.start_time),
            name: p.name.clone(),
            owner: p.owner.clone(),
            state: p.state,
            parent_pid: 1,
            threads: Some(1),
            resident_bytes: Some(p.resident_bytes),
            virtual_bytes: None,
            started_at: None,
            command_line: vec![p.name.clone()],
        })
    }
}

pub fn fast_escalation() -> Escalation {
    Escalation {
        force_wait: Duration::from_millis(50),
        poll_interval: Duration::from_millis(5),
    }
}

pub fn service_over(host: &Arc<FakeHost>) -> MonitorService {
    MonitorService::new(host.clone(), fast_escalation())
}
