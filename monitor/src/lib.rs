pub mod controller;
pub mod delta;
pub mod error;
pub mod live_ui;
pub mod monitor_loop;
pub mod procfs;
pub mod ranking;
pub mod service;
pub mod snapshot;
pub mod unicode_utils;

pub use controller::{Escalation, ProcessControl, ProcessController, TermSignal};
pub use error::{MonitorError, MonitorResult, ProbeError};
pub use monitor_loop::{LoopState, MonitorLoop, TickSummary, Ticker};
pub use ranking::{Query, RankedView, RankingEngine};
pub use service::{Host, MonitorHandle, MonitorService};
pub use snapshot::{ProcessIdentity, ProcessTable, Snapshot};
