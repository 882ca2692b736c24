//! Aggregated results of a fan-out

use crate::Error;

/// A server whose operation failed
#[derive(Debug)]
pub struct ServerFailure {
    /// Server name
    pub server: String,
    /// What went wrong
    pub error: Error,
}

/// Outcome of running one operation across many servers
///
/// The operation succeeded only if `failed` is empty.
#[derive(Debug)]
pub struct CoordinatorReport<T> {
    /// Per-server results of servers that succeeded, in completion order
    pub succeeded: Vec<(String, T)>,
    /// Every server that failed
    pub failed: Vec<ServerFailure>,
}

impl<T> Default for CoordinatorReport<T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<T> CoordinatorReport<T> {
    /// Record one server's result
    pub fn push(&mut self, server: String, result: crate::Result<T>) {
        match result {
            Ok(value) => self.succeeded.push((server, value)),
            Err(error) => self.failed.push(ServerFailure { server, error }),
        }
    }

    /// Whether every server succeeded
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Result for one server
    pub fn get(&self, server: &str) -> Option<&T> {
        self.succeeded
            .iter()
            .find(|(name, _)| name == server)
            .map(|(_, value)| value)
    }

    /// One line per failed server
    pub fn failure_summary(&self) -> String {
        self.failed
            .iter()
            .map(|f| format!("{}: {}", f.server, f.error))
            .collect::<Vec<_>>()
            .join("; ")
    }
}
