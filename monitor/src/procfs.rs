//! Linux host access through `/proc`
//!
//! Field layout follows proc(5). The command name in `/proc/<pid>/stat` may
//! contain spaces and parentheses, so parsing anchors on the last `)`.

use chrono::{DateTime, TimeZone, Utc};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{Pid, Uid, User};
use procwatch_shared::ProcessState;
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crate::controller::{Occupant, ProcessControl, TermSignal};
use crate::error::ProbeError;
use crate::snapshot::{Counters, ProcessIdentity, ProcessTable, RawProcess};

/// Fields of `/proc/<pid>/stat` the engine uses
#[derive(Debug, Clone, PartialEq)]
pub struct StatFields {
    pub pid: u32,
    pub comm: String,
    pub state: ProcessState,
    pub ppid: u32,
    pub utime: u64,
    pub stime: u64,
    pub num_threads: u32,
    pub start_time: u64,
    pub vsize: u64,
}

/// Detailed view of one process
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessDetails {
    pub identity: ProcessIdentity,
    pub name: String,
    pub owner: String,
    pub state: ProcessState,
    pub parent_pid: u32,
    pub threads: Option<u32>,
    pub resident_bytes: Option<u64>,
    pub virtual_bytes: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub command_line: Vec<String>,
}

fn malformed(file: &'static str, reason: impl Into<String>) -> ProbeError {
    ProbeError::Malformed {
        file,
        reason: reason.into(),
    }
}

fn field<T: std::str::FromStr>(fields: &[&str], index: usize, name: &str) -> Result<T, ProbeError> {
    fields
        .get(index)
        .ok_or_else(|| malformed("stat", format!("missing {name}")))?
        .parse()
        .map_err(|_| malformed("stat", format!("bad {name}")))
}

pub fn parse_stat(content: &str) -> Result<StatFields, ProbeError> {
    let open = content
        .find('(')
        .ok_or_else(|| malformed("stat", "no command name"))?;
    let close = content
        .rfind(')')
        .ok_or_else(|| malformed("stat", "unterminated command name"))?;
    if close < open {
        return Err(malformed("stat", "unterminated command name"));
    }

    let pid = content[..open]
        .trim()
        .parse()
        .map_err(|_| malformed("stat", "bad pid"))?;
    let comm = content[open + 1..close].to_string();

    // rest[0] is field 3 (state); field n lives at rest[n - 3]
    let rest: Vec<&str> = content[close + 1..].split_whitespace().collect();
    let state = rest
        .first()
        .and_then(|s| s.chars().next())
        .map(ProcessState::from_code)
        .ok_or_else(|| malformed("stat", "missing state"))?;

    Ok(StatFields {
        pid,
        comm,
        state,
        ppid: field(&rest, 1, "ppid")?,
        utime: field(&rest, 11, "utime")?,
        stime: field(&rest, 12, "stime")?,
        num_threads: field(&rest, 17, "num_threads")?,
        start_time: field(&rest, 19, "starttime")?,
        vsize: field(&rest, 20, "vsize")?,
    })
}

/// Resident pages from `/proc/<pid>/statm`
pub fn parse_statm_resident(content: &str) -> Result<u64, ProbeError> {
    content
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| malformed("statm", "missing resident"))?
        .parse()
        .map_err(|_| malformed("statm", "bad resident"))
}

/// Real uid from `/proc/<pid>/status`
pub fn parse_status_uid(content: &str) -> Option<u32> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|uid| uid.parse().ok())
}

/// `MemTotal` from `/proc/meminfo`, in bytes
pub fn parse_meminfo_total(content: &str) -> Result<u64, ProbeError> {
    let line = content
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .ok_or_else(|| malformed("meminfo", "missing MemTotal"))?;
    let kib: u64 = line
        .split_whitespace()
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| malformed("meminfo", "bad MemTotal"))?;
    Ok(kib * 1024)
}

/// Boot time (seconds since the epoch) from `/proc/stat`
pub fn parse_boot_time(content: &str) -> Option<i64> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("btime"))
        .and_then(|v| v.trim().parse().ok())
}

fn sysconf_or(name: libc::c_int, fallback: u64) -> u64 {
    // SAFETY: sysconf has no preconditions and only reads configuration.
    let value = unsafe { libc::sysconf(name) };
    if value > 0 {
        value as u64
    } else {
        fallback
    }
}

/// The live host, read through a procfs mount
pub struct HostProcesses {
    root: PathBuf,
    clock_ticks: u64,
    page_size: u64,
    user_names: Mutex<HashMap<u32, String>>,
}

impl Default for HostProcesses {
    fn default() -> Self {
        Self::new()
    }
}

impl HostProcesses {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Reads from an alternative procfs root
    pub fn with_root<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            clock_ticks: sysconf_or(libc::_SC_CLK_TCK, 100),
            page_size: sysconf_or(libc::_SC_PAGESIZE, 4096),
            user_names: Mutex::new(HashMap::new()),
        }
    }

    fn pid_dir(&self, pid: u32) -> PathBuf {
        self.root.join(pid.to_string())
    }

    fn read(&self, path: &Path) -> Result<String, ProbeError> {
        Ok(fs::read_to_string(path)?)
    }

    fn read_stat(&self, pid: u32) -> Result<StatFields, ProbeError> {
        parse_stat(&self.read(&self.pid_dir(pid).join("stat"))?)
    }

    fn ticks_to_duration(&self, ticks: u64) -> Duration {
        let secs = ticks / self.clock_ticks;
        let rem = ticks % self.clock_ticks;
        Duration::from_secs(secs) + Duration::from_nanos(rem * 1_000_000_000 / self.clock_ticks)
    }

    fn owner_uid(&self, pid: u32) -> Result<u32, ProbeError> {
        let dir = self.pid_dir(pid);
        match self.read(&dir.join("status")) {
            Ok(status) => {
                if let Some(uid) = parse_status_uid(&status) {
                    return Ok(uid);
                }
            }
            Err(ProbeError::Vanished) => return Err(ProbeError::Vanished),
            Err(_) => {}
        }
        Ok(fs::metadata(&dir)?.uid())
    }

    fn user_name(&self, uid: u32) -> String {
        if let Ok(cache) = self.user_names.lock() {
            if let Some(name) = cache.get(&uid) {
                return name.clone();
            }
        }

        let name = match User::from_uid(Uid::from_raw(uid)) {
            Ok(Some(user)) => user.name,
            _ => uid.to_string(),
        };

        if let Ok(mut cache) = self.user_names.lock() {
            cache.insert(uid, name.clone());
        }
        name
    }

    fn counters(&self, pid: u32, stat: &StatFields) -> Result<Counters, ProbeError> {
        let statm = self.read(&self.pid_dir(pid).join("statm"))?;
        let resident_pages = parse_statm_resident(&statm)?;
        Ok(Counters {
            cpu_time: self.ticks_to_duration(stat.utime + stat.stime),
            resident_bytes: resident_pages * self.page_size,
            threads: stat.num_threads,
        })
    }

    fn boot_time(&self) -> Option<i64> {
        self.read(&self.root.join("stat"))
            .ok()
            .and_then(|content| parse_boot_time(&content))
    }

    /// Everything known about `pid`, including the command line
    pub fn details(&self, pid: u32) -> Result<ProcessDetails, ProbeError> {
        let stat = self.read_stat(pid)?;
        let owner = self
            .owner_uid(pid)
            .map(|uid| self.user_name(uid))
            .unwrap_or_else(|_| "?".to_string());
        let counters = self.counters(pid, &stat).ok();

        let command_line = match fs::read(self.pid_dir(pid).join("cmdline")) {
            Ok(bytes) => bytes
                .split(|b| *b == 0)
                .filter(|arg| !arg.is_empty())
                .map(|arg| String::from_utf8_lossy(arg).into_owned())
                .collect(),
            Err(_) => Vec::new(),
        };

        let started_at = self.boot_time().and_then(|boot| {
            let offset = self.ticks_to_duration(stat.start_time);
            Utc.timestamp_opt(boot + offset.as_secs() as i64, offset.subsec_nanos())
                .single()
        });

        Ok(ProcessDetails {
            identity: ProcessIdentity::new(stat.pid, stat.start_time),
            name: stat.comm,
            owner,
            state: stat.state,
            parent_pid: stat.ppid,
            threads: counters.map(|c| c.threads),
            resident_bytes: counters.map(|c| c.resident_bytes),
            virtual_bytes: Some(stat.vsize),
            started_at,
            command_line,
        })
    }
}

impl ProcessTable for HostProcesses {
    fn pids(&self) -> Result<Vec<u32>, ProbeError> {
        let mut pids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
                pids.push(pid);
            }
        }
        pids.sort_unstable();
        Ok(pids)
    }

    fn probe(&self, pid: u32) -> Result<RawProcess, ProbeError> {
        let stat = self.read_stat(pid)?;
        let owner = self.user_name(self.owner_uid(pid)?);
        let counters = self.counters(pid, &stat);

        Ok(RawProcess {
            identity: ProcessIdentity::new(stat.pid, stat.start_time),
            name: stat.comm,
            owner,
            state: stat.state,
            parent_pid: stat.ppid,
            counters,
        })
    }

    fn total_memory(&self) -> Result<u64, ProbeError> {
        parse_meminfo_total(&self.read(&self.root.join("meminfo"))?)
    }

    fn cpu_count(&self) -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

impl ProcessControl for HostProcesses {
    fn occupant(&self, pid: u32) -> Result<Option<Occupant>, ProbeError> {
        match self.read_stat(pid) {
            Ok(stat) => Ok(Some(Occupant {
                identity: ProcessIdentity::new(stat.pid, stat.start_time),
                state: stat.state,
            })),
            Err(ProbeError::Vanished) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn send(&self, pid: u32, signal: TermSignal) -> Result<(), ProbeError> {
        let pid = i32::try_from(pid).map_err(|_| ProbeError::Vanished)?;
        let signal = match signal {
            TermSignal::Graceful => Signal::SIGTERM,
            TermSignal::Forceful => Signal::SIGKILL,
        };
        kill(Pid::from_raw(pid), signal)?;
        Ok(())
    }
}
