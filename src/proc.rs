//! Active program detection over the OS process table.

use crate::config::{Config, Program};
use crate::state::SharedState;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info};

/// Read-only view of the running processes.
pub trait ProcessTable {
    fn pids(&self) -> Vec<i32>;
    /// Full command line with arguments joined by spaces
    fn cmdline(&self, pid: i32) -> Option<String>;
    /// Resolved executable path
    fn exe(&self, pid: i32) -> Option<String>;
    fn is_alive(&self, pid: i32) -> bool;
}

/// The real process table under `/proc`.
pub struct ProcFs {
    root: PathBuf,
}

impl ProcFs {
    pub fn new() -> Self {
        Self { root: PathBuf::from("/proc") }
    }
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for ProcFs {
    fn pids(&self) -> Vec<i32> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse().ok()))
            .collect()
    }

    fn cmdline(&self, pid: i32) -> Option<String> {
        let raw = fs::read(self.root.join(pid.to_string()).join("cmdline")).ok()?;
        let args: Vec<String> = raw
            .split(|&b| b == 0)
            .filter(|arg| !arg.is_empty())
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect();
        Some(args.join(" "))
    }

    fn exe(&self, pid: i32) -> Option<String> {
        fs::read_link(self.root.join(pid.to_string()).join("exe"))
            .ok()
            .map(|p| p.to_string_lossy().into_owned())
    }

    fn is_alive(&self, pid: i32) -> bool {
        // EPERM still means the process exists
        !matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
    }
}

/// Index of the first program, in stored order, that claims the process.
pub fn match_process(programs: &[Program], cmdline: Option<&str>, exe: Option<&str>) -> Option<usize> {
    programs.iter().position(|p| p.matches(cmdline, exe))
}

/// Finds the active program and keeps `SharedState` pointed at it.
pub struct ProcessWatcher<P: ProcessTable> {
    table: P,
}

impl<P: ProcessTable> ProcessWatcher<P> {
    pub fn new(table: P) -> Self {
        Self { table }
    }

    /// Full scan of the process table. The first matching process wins.
    pub fn scan(&self, state: &mut SharedState, config: &Config) {
        if config.programs.is_empty() {
            state.set_program(None, None);
            return;
        }

        for pid in self.table.pids() {
            let cmdline = self.table.cmdline(pid);
            let exe = self.table.exe(pid);
            // Exited mid-scan
            if cmdline.is_none() && exe.is_none() {
                continue;
            }
            if let Some(index) = match_process(&config.programs, cmdline.as_deref(), exe.as_deref()) {
                if state.program() != Some(index) || state.pid() != Some(pid) {
                    info!(program = %config.programs[index].name, pid, "program active");
                }
                state.set_program(Some(index), Some(pid));
                return;
            }
        }

        if let Some(index) = state.program() {
            if let Some(prog) = config.program(index) {
                info!(program = %prog.name, "program no longer running");
            }
        }
        state.set_program(None, None);
    }

    /// Called on every loop tick. Rescans when idle, otherwise only checks the known pid.
    pub fn on_tick(&self, state: &mut SharedState, config: &Config) {
        match state.pid() {
            Some(pid) if self.table.is_alive(pid) => {}
            Some(pid) => {
                debug!(pid, "active process exited, rescanning");
                self.scan(state, config);
            }
            None => self.scan(state, config),
        }
    }

    pub fn on_config_updated(&self, state: &mut SharedState, config: &Config) {
        self.scan(state, config);
    }
}
