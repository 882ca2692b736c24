//! Reading process and socket state from a remote `/proc`
//!
//! A port counts as bound by a PID when the socket inode listening on it in
//! `/proc/net/tcp` or `/proc/net/tcp6` also appears as `socket:[inode]` in
//! `/proc/<pid>/fd`. Matching on the inode rather than on the port alone keeps
//! another process's listener from being mistaken for ours.

use std::collections::{BTreeSet, HashSet};

use command_executor::{Command, Shell};

use crate::Result;

const LISTEN_STATE: &str = "0A";

/// Listening `(port, inode)` pairs from the contents of `/proc/net/tcp*`
pub fn parse_listening_sockets(table: &str) -> Vec<(u16, u64)> {
    table
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            // sl local rem st tx:rx tr:when retrnsmt uid timeout inode
            if fields.len() < 10 || fields[3] != LISTEN_STATE {
                return None;
            }
            let (_, port_hex) = fields[1].rsplit_once(':')?;
            let port = u16::from_str_radix(port_hex, 16).ok()?;
            let inode = fields[9].parse().ok()?;
            Some((port, inode))
        })
        .collect()
}

/// Socket inodes referenced by an `ls -l /proc/<pid>/fd` listing
pub fn parse_socket_inodes(listing: &str) -> HashSet<u64> {
    listing
        .lines()
        .filter_map(|line| {
            let start = line.find("socket:[")? + "socket:[".len();
            let end = line[start..].find(']')? + start;
            line[start..end].parse().ok()
        })
        .collect()
}

/// PID of the process whose full command line equals `invocation`
///
/// `listing` is the output of `ps -eo pid=,args=`.
pub fn find_pid(listing: &str, invocation: &str) -> Option<u32> {
    let wanted = invocation.trim();
    listing.lines().find_map(|line| {
        let (pid, args) = line.trim_start().split_once(char::is_whitespace)?;
        (args.trim() == wanted).then(|| pid.parse().ok()).flatten()
    })
}

/// Declared ports that are listening on a socket owned by the PID
pub fn bound_ports(table: &str, fd_listing: &str, ports: &[u16]) -> BTreeSet<u16> {
    let owned = parse_socket_inodes(fd_listing);
    parse_listening_sockets(table)
        .into_iter()
        .filter(|(port, inode)| ports.contains(port) && owned.contains(inode))
        .map(|(port, _)| port)
        .collect()
}

/// Whether `/proc/<pid>` exists on the server
pub async fn pid_alive(shell: &dyn Shell, pid: u32) -> Result<bool> {
    Ok(shell.test(&format!("[ -e /proc/{pid} ]")).await?)
}

/// Read a PID file; `None` when it is missing or unparseable
pub async fn read_pid_file(shell: &dyn Shell, path: &str) -> Result<Option<u32>> {
    let result = shell
        .run(Command::shell(format!("cat {} 2>/dev/null", command_executor::shell_escape(path))))
        .await?;
    if !result.success() {
        return Ok(None);
    }
    Ok(result.stdout_trimmed().parse().ok())
}

/// Which of `ports` the PID currently listens on
pub async fn ports_bound_by(shell: &dyn Shell, pid: u32, ports: &[u16]) -> Result<BTreeSet<u16>> {
    if ports.is_empty() {
        return Ok(BTreeSet::new());
    }

    let table = shell
        .run(Command::shell("cat /proc/net/tcp /proc/net/tcp6 2>/dev/null"))
        .await?;
    let fds = shell
        .run(Command::shell(format!("ls -l /proc/{pid}/fd 2>/dev/null")))
        .await?;

    Ok(bound_ports(&table.stdout, &fds.stdout, ports))
}
