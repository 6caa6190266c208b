//! Rates between two consecutive snapshots

use procwatch_shared::{log_debug, logging::LogCategory, ProcessRow, ProcessState};
use std::time::Duration;

use crate::error::MonitorError;
use crate::snapshot::{ProcessIdentity, ProcessSample, Snapshot};

/// Where an identity stands relative to the previous snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Present in both snapshots
    Continuing,
    /// Only in the newer snapshot
    New,
    /// Only in the older snapshot
    Exited,
}

/// One process with derived metrics
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotatedProcess {
    pub identity: ProcessIdentity,
    pub name: String,
    pub owner: String,
    pub state: ProcessState,
    pub resident_bytes: Option<u64>,
    /// `None` when no rate can be computed
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub lifecycle: Lifecycle,
    pub restricted: bool,
}

impl AnnotatedProcess {
    fn from_sample(
        identity: ProcessIdentity,
        sample: &ProcessSample,
        total_memory: u64,
        cpu_percent: Option<f64>,
        lifecycle: Lifecycle,
    ) -> Self {
        Self {
            identity,
            name: sample.name.clone(),
            owner: sample.owner.clone(),
            state: sample.state,
            resident_bytes: sample.resident_bytes,
            cpu_percent,
            memory_percent: memory_percent(sample.resident_bytes, total_memory),
            lifecycle,
            restricted: sample.restricted,
        }
    }

    pub fn pid(&self) -> u32 {
        self.identity.pid
    }

    pub fn to_row(&self) -> ProcessRow {
        ProcessRow {
            pid: self.identity.pid,
            owner: self.owner.clone(),
            cpu_percent: self.cpu_percent,
            memory_percent: self.memory_percent,
            state: self.state,
            command: self.name.clone(),
        }
    }
}

/// Output of [`diff`]
#[derive(Debug, Clone, Default)]
pub struct DeltaReport {
    /// Live processes of the newer snapshot, in identity order
    pub processes: Vec<AnnotatedProcess>,
    /// Processes of the older snapshot that are gone
    pub exited: Vec<AnnotatedProcess>,
}

impl DeltaReport {
    pub fn exited_pids(&self) -> Vec<u32> {
        self.exited.iter().map(AnnotatedProcess::pid).collect()
    }
}

fn memory_percent(resident: Option<u64>, total: u64) -> Option<f64> {
    match resident {
        Some(resident) if total > 0 => Some(resident as f64 / total as f64 * 100.0),
        _ => None,
    }
}

/// Wall time between two snapshots, rejecting a clock that did not advance
pub fn elapsed(previous: &Snapshot, current: &Snapshot) -> Result<Duration, MonitorError> {
    match current
        .captured_at()
        .checked_duration_since(previous.captured_at())
    {
        Some(d) if !d.is_zero() => Ok(d),
        _ => Err(MonitorError::ClockAnomaly),
    }
}

/// CPU share over `wall`, clamped to `[0, 100 * cores]`
pub fn cpu_percent(before: Duration, after: Duration, wall: Duration, cores: usize) -> Option<f64> {
    if wall.is_zero() {
        return None;
    }
    let used = after.checked_sub(before)?;
    let percent = used.as_secs_f64() / wall.as_secs_f64() * 100.0;
    Some(percent.clamp(0.0, 100.0 * cores.max(1) as f64))
}

/// Annotates a snapshot that has no predecessor; every process is `New`.
pub fn baseline(current: &Snapshot) -> DeltaReport {
    let processes = current
        .iter()
        .map(|(identity, sample)| {
            AnnotatedProcess::from_sample(
                *identity,
                sample,
                current.total_memory(),
                None,
                Lifecycle::New,
            )
        })
        .collect();

    DeltaReport {
        processes,
        exited: Vec::new(),
    }
}

/// Compares two snapshots.
///
/// Identities are matched on pid and start time together, so a recycled
/// pid shows up as one exited and one new process.
pub fn diff(previous: &Snapshot, current: &Snapshot) -> DeltaReport {
    let wall = match elapsed(previous, current) {
        Ok(wall) => Some(wall),
        Err(e) => {
            log_debug!(LogCategory::Delta, "{e}; CPU rates unknown for this tick");
            None
        }
    };
    let cores = current.cpu_count();
    let total_memory = current.total_memory();

    let processes = current
        .iter()
        .map(|(identity, sample)| match previous.get(identity) {
            Some(before) => {
                let rate = match (wall, before.cpu_time, sample.cpu_time) {
                    (Some(wall), Some(b), Some(a)) => cpu_percent(b, a, wall, cores),
                    _ => None,
                };
                AnnotatedProcess::from_sample(
                    *identity,
                    sample,
                    total_memory,
                    rate,
                    Lifecycle::Continuing,
                )
            }
            None => AnnotatedProcess::from_sample(
                *identity,
                sample,
                total_memory,
                None,
                Lifecycle::New,
            ),
        })
        .collect();

    let exited: Vec<AnnotatedProcess> = previous
        .iter()
        .filter(|(identity, _)| !current.contains(identity))
        .map(|(identity, sample)| {
            AnnotatedProcess::from_sample(
                *identity,
                sample,
                previous.total_memory(),
                None,
                Lifecycle::Exited,
            )
        })
        .collect();

    if !exited.is_empty() {
        log_debug!(LogCategory::Delta, "{} processes exited", exited.len());
    }

    DeltaReport { processes, exited }
}
