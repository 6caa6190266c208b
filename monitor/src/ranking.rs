//! Ranked, filtered views over the latest tick
//!
//! The engine publishes one immutable [`RankedView`] per tick behind an
//! `Arc`. The lock is held only to clone or swap that pointer, so a query
//! always works on a single tick's complete data.

use chrono::{DateTime, Utc};
use procwatch_shared::{log_trace, logging::LogCategory, ProcessRow, SortKey};
use std::cmp::Ordering;
use std::sync::{Arc, RwLock};

use crate::delta::AnnotatedProcess;
use crate::snapshot::ProcessIdentity;

/// Selection and ordering for a query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub sort: SortKey,
    /// Applied after filtering and sorting
    pub limit: Option<usize>,
    /// Case-insensitive substring of the command name
    pub name_filter: Option<String>,
    /// Exact owner name
    pub owner: Option<String>,
}

impl Query {
    pub fn top(sort: SortKey, limit: usize) -> Self {
        Self {
            sort,
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, filter: impl Into<String>) -> Self {
        self.name_filter = Some(filter.into());
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

/// Ordered processes from one tick
#[derive(Debug, Clone, PartialEq)]
pub struct RankedView {
    pub tick: u64,
    pub captured_at: DateTime<Utc>,
    pub processes: Vec<AnnotatedProcess>,
}

impl RankedView {
    /// The view before the first tick
    pub fn empty() -> Self {
        Self {
            tick: 0,
            captured_at: Utc::now(),
            processes: Vec::new(),
        }
    }

    pub fn rows(&self) -> Vec<ProcessRow> {
        self.processes.iter().map(AnnotatedProcess::to_row).collect()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}

/// Unknown rates sort below every known rate
fn descending(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.total_cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn compare(sort: SortKey, a: &AnnotatedProcess, b: &AnnotatedProcess) -> Ordering {
    let primary = match sort {
        SortKey::Cpu => descending(a.cpu_percent, b.cpu_percent),
        SortKey::Memory => descending(a.memory_percent, b.memory_percent),
        SortKey::Pid => Ordering::Equal,
        SortKey::Name => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
    };
    primary.then_with(|| a.identity.cmp(&b.identity))
}

fn matches(query: &Query, process: &AnnotatedProcess) -> bool {
    let name_ok = query.name_filter.as_ref().map_or(true, |filter| {
        process.name.to_lowercase().contains(&filter.to_lowercase())
    });
    let owner_ok = query
        .owner
        .as_ref()
        .map_or(true, |owner| &process.owner == owner);
    name_ok && owner_ok
}

/// Applies `query` to an already published view
pub fn rank(view: &RankedView, query: &Query) -> RankedView {
    let mut processes: Vec<AnnotatedProcess> = view
        .processes
        .iter()
        .filter(|p| matches(query, p))
        .cloned()
        .collect();

    processes.sort_by(|a, b| compare(query.sort, a, b));

    if let Some(limit) = query.limit {
        processes.truncate(limit);
    }

    RankedView {
        tick: view.tick,
        captured_at: view.captured_at,
        processes,
    }
}

/// Holds the current view; written by the monitor loop, read by everyone
pub struct RankingEngine {
    current: RwLock<Arc<RankedView>>,
}

impl Default for RankingEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RankingEngine {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(RankedView::empty())),
        }
    }

    /// Replaces the current view in one step
    pub fn publish(&self, tick: u64, captured_at: DateTime<Utc>, mut processes: Vec<AnnotatedProcess>) {
        processes.sort_by(|a, b| a.identity.cmp(&b.identity));
        let view = Arc::new(RankedView {
            tick,
            captured_at,
            processes,
        });
        log_trace!(LogCategory::Ranking, "tick {tick}: {} processes published", view.len());

        match self.current.write() {
            Ok(mut guard) => *guard = view,
            Err(poisoned) => *poisoned.into_inner() = view,
        }
    }

    /// The current view; stays valid however many ticks follow
    pub fn current(&self) -> Arc<RankedView> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn query(&self, query: &Query) -> RankedView {
        rank(&self.current(), query)
    }

    /// Identity recorded for `pid` in the current view
    pub fn lookup(&self, pid: u32) -> Option<ProcessIdentity> {
        let view = self.current();
        view.processes
            .binary_search_by(|p| p.identity.pid.cmp(&pid))
            .ok()
            .map(|index| view.processes[index].identity)
    }
}
