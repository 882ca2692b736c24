//! A simulated remote host for tests
//!
//! [`FakeHost`] implements [`Shell`] by interpreting the small set of scripts
//! the coordinator sends (PID files, process table, `/proc` probes, kill)
//! against an in-memory model. Anything else is answered from canned
//! responses registered with [`FakeHost::respond`], or succeeds with empty
//! output.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use command_executor::{Command, Error, ExitResult, Result, Shell};

/// A process on a [`FakeHost`]
#[derive(Debug, Clone)]
pub struct FakeProcess {
    /// Full command line
    pub args: String,
    /// Whether `/proc/<pid>` exists
    pub alive: bool,
    /// Ports the process listens on
    pub ports: Vec<u16>,
    hidden_for: u32,
}

/// Mutable state of a [`FakeHost`]
#[derive(Debug)]
pub struct HostState {
    /// Files by absolute path
    pub files: HashMap<String, String>,
    /// Processes by PID
    pub processes: BTreeMap<u32, FakeProcess>,
    /// Every script run, in order
    pub scripts: Vec<String>,
    /// Process table listings before a launched process shows up; `None`
    /// means it never does
    pub appear_after: Option<u32>,
    /// Ports a launched process listens on
    pub launch_ports: Vec<u16>,
    /// The launch command exits non-zero
    pub launch_fails: bool,
    /// `kill` has no effect
    pub ignore_kill: bool,
    /// Every command fails as an SSH connection failure
    pub unreachable: bool,
    responses: Vec<(String, ExitResult)>,
    next_pid: u32,
}

impl Default for HostState {
    fn default() -> Self {
        Self {
            files: HashMap::new(),
            processes: BTreeMap::new(),
            scripts: Vec::new(),
            appear_after: Some(0),
            launch_ports: Vec::new(),
            launch_fails: false,
            ignore_kill: false,
            unreachable: false,
            responses: Vec::new(),
            next_pid: 1000,
        }
    }
}

/// In-memory stand-in for a server reached over SSH
#[derive(Debug)]
pub struct FakeHost {
    name: String,
    state: Mutex<HostState>,
}

impl FakeHost {
    /// A reachable host with no processes
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(HostState::default()),
        }
    }

    /// Lock the state for inspection or setup
    pub fn state(&self) -> MutexGuard<'_, HostState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Answer scripts containing `pattern` with `result`
    ///
    /// Later registrations win over earlier ones.
    pub fn respond(&self, pattern: impl Into<String>, result: ExitResult) {
        self.state().responses.insert(0, (pattern.into(), result));
    }

    /// Add a running process and return its PID
    pub fn spawn(&self, args: &str, ports: &[u16]) -> u32 {
        let mut state = self.state();
        let pid = state.next_pid;
        state.next_pid += 1;
        state.processes.insert(
            pid,
            FakeProcess {
                args: args.to_string(),
                alive: true,
                ports: ports.to_vec(),
                hidden_for: 0,
            },
        );
        pid
    }

    /// Mark a process dead
    pub fn kill(&self, pid: u32) {
        if let Some(process) = self.state().processes.get_mut(&pid) {
            process.alive = false;
        }
    }

    /// Number of scripts run that contain `pattern`
    pub fn count(&self, pattern: &str) -> usize {
        self.state()
            .scripts
            .iter()
            .filter(|s| s.contains(pattern))
            .count()
    }

    /// Contents of a file
    pub fn file(&self, path: &str) -> Option<String> {
        self.state().files.get(path).cloned()
    }

    fn handle(&self, script: &str) -> ExitResult {
        let mut state = self.state();
        state.scripts.push(script.to_string());

        if let Some((_, result)) = state
            .responses
            .iter()
            .find(|(pattern, _)| script.contains(pattern.as_str()))
        {
            return result.clone();
        }

        if let Some(rest) = script.strip_prefix("[ -e /proc/") {
            let pid = leading_number(rest);
            let alive = state.processes.get(&pid).is_some_and(|p| p.alive);
            return exit(alive);
        }

        if script.starts_with("ps -eo pid=,args=") {
            let mut listing = String::new();
            for (pid, process) in state.processes.iter_mut() {
                if !process.alive {
                    continue;
                }
                if process.hidden_for > 0 {
                    process.hidden_for -= 1;
                    continue;
                }
                listing.push_str(&format!("{:>5} {}\n", pid, process.args));
            }
            return ExitResult::ok(listing);
        }

        if script.contains("nohup ") {
            if state.launch_fails {
                return ExitResult::failed(127, "launch failed");
            }
            let args = between(script, "nohup ", " > ").unwrap_or_default().to_string();
            let pid = state.next_pid;
            state.next_pid += 1;
            let hidden_for = state.appear_after.unwrap_or(u32::MAX);
            let ports = state.launch_ports.clone();
            state.processes.insert(
                pid,
                FakeProcess {
                    args,
                    alive: true,
                    ports,
                    hidden_for,
                },
            );
            return ExitResult::ok("");
        }

        if script.starts_with("cat /proc/net/tcp") {
            let mut table = String::from(
                "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n",
            );
            for (pid, process) in &state.processes {
                if !process.alive {
                    continue;
                }
                for (i, port) in process.ports.iter().enumerate() {
                    table.push_str(&format!(
                        "   0: 00000000:{:04X} 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 {} 1\n",
                        port,
                        inode(*pid, i)
                    ));
                }
            }
            return ExitResult::ok(table);
        }

        if let Some(rest) = script.strip_prefix("ls -l /proc/") {
            let pid = leading_number(rest);
            return match state.processes.get(&pid).filter(|p| p.alive) {
                Some(process) => {
                    let mut listing = String::from("total 0\n");
                    for (i, _) in process.ports.iter().enumerate() {
                        listing.push_str(&format!(
                            "lrwx------ 1 admin admin 64 Jan  1 00:00 {} -> socket:[{}]\n",
                            i + 3,
                            inode(pid, i)
                        ));
                    }
                    ExitResult::ok(listing)
                }
                None => ExitResult::failed(2, ""),
            };
        }

        if script.contains("kill -9 ") {
            let pid = between(script, "kill -9 ", " ").map(leading_number).unwrap_or(0);
            if !state.ignore_kill {
                if let Some(process) = state.processes.get_mut(&pid) {
                    process.alive = false;
                }
            }
            return ExitResult::ok("");
        }

        if let Some(path) = script.strip_prefix("cat ").and_then(|r| r.strip_suffix(" 2>/dev/null")) {
            return match state.files.get(path) {
                Some(content) => ExitResult::ok(content.clone()),
                None => ExitResult::failed(1, ""),
            };
        }

        if let Some(rest) = script.strip_prefix("echo ") {
            if let Some((content, path)) = rest.split_once(" > ") {
                state.files.insert(path.to_string(), format!("{}\n", content));
                return ExitResult::ok("");
            }
        }

        if let Some(path) = script.strip_prefix("rm -f ") {
            state.files.remove(path);
            return ExitResult::ok("");
        }

        ExitResult::ok("")
    }
}

#[async_trait]
impl Shell for FakeHost {
    fn host(&self) -> &str {
        &self.name
    }

    async fn run(&self, command: Command) -> Result<ExitResult> {
        if self.state().unreachable {
            return Err(Error::ssh_connection_failed(&self.name, "connection refused"));
        }
        let script = command
            .script()
            .map(str::to_string)
            .unwrap_or_else(|| command.to_shell_string());
        Ok(self.handle(&script))
    }
}

fn exit(success: bool) -> ExitResult {
    if success {
        ExitResult::ok("")
    } else {
        ExitResult::failed(1, "")
    }
}

fn inode(pid: u32, index: usize) -> u64 {
    u64::from(pid) * 100 + index as u64
}

fn leading_number(s: &str) -> u32 {
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().unwrap_or(0)
}

fn between<'a>(s: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let from = s.find(start)? + start.len();
    let to = s[from..].find(end).map_or(s.len(), |i| from + i);
    Some(&s[from..to])
}
