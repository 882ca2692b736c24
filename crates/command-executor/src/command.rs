//! Command type for building executable commands

use async_process::Command as AsyncCommand;
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::PathBuf;

/// A command to be executed
///
/// Unlike `async_process::Command` this type is `Clone` and can be inspected,
/// which lets the SSH backend re-render it as a remote shell string and lets
/// tests match on what would have been run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    program: OsString,
    args: Vec<OsString>,
    env: BTreeMap<OsString, OsString>,
    current_dir: Option<PathBuf>,
}

impl Command {
    /// Create a new command for the given program
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Self {
            program: program.as_ref().to_owned(),
            args: Vec::new(),
            env: BTreeMap::new(),
            current_dir: None,
        }
    }

    /// Create a `sh -c <script>` command
    ///
    /// Remote lifecycle operations are mostly small pipelines, so they are
    /// expressed as one script rather than a program with arguments.
    pub fn shell(script: impl AsRef<str>) -> Self {
        let mut cmd = Self::new("sh");
        cmd.arg("-c").arg(script.as_ref());
        cmd
    }

    /// Add an argument to the command
    pub fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    /// Add multiple arguments to the command
    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.arg(arg);
        }
        self
    }

    /// Set an environment variable
    pub fn env<K, V>(&mut self, key: K, val: V) -> &mut Self
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.env
            .insert(key.as_ref().to_owned(), val.as_ref().to_owned());
        self
    }

    /// Set the working directory for the command
    pub fn current_dir<P: AsRef<std::path::Path>>(&mut self, dir: P) -> &mut Self {
        self.current_dir = Some(dir.as_ref().to_owned());
        self
    }

    /// Get the program name
    pub fn get_program(&self) -> &OsStr {
        &self.program
    }

    /// Get the arguments
    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    /// Get the environment variables
    pub fn get_envs(&self) -> &BTreeMap<OsString, OsString> {
        &self.env
    }

    /// Get the current directory
    pub fn get_current_dir(&self) -> Option<&std::path::Path> {
        self.current_dir.as_deref()
    }

    /// The script of a [`Command::shell`] command, if this is one
    pub fn script(&self) -> Option<&str> {
        if self.program != "sh" || self.args.len() != 2 || self.args[0] != "-c" {
            return None;
        }
        self.args[1].to_str()
    }

    /// Render the command as a single string for a remote POSIX shell
    ///
    /// Arguments are escaped; the working directory, if any, becomes a
    /// leading `cd`. Environment variables are not forwarded.
    pub fn to_shell_string(&self) -> String {
        let mut rendered = self.program.to_string_lossy().into_owned();
        for arg in &self.args {
            rendered.push(' ');
            rendered.push_str(&shell_escape(&arg.to_string_lossy()));
        }
        match &self.current_dir {
            Some(dir) => format!(
                "cd {} && {}",
                shell_escape(&dir.to_string_lossy()),
                rendered
            ),
            None => rendered,
        }
    }

    /// Prepare this command for local execution
    pub fn prepare(&self) -> AsyncCommand {
        let mut cmd = AsyncCommand::new(&self.program);
        cmd.args(&self.args);
        for (key, val) in &self.env {
            cmd.env(key, val);
        }
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_shell_string())
    }
}

/// Escape a string for safe inclusion in a POSIX shell command
pub fn shell_escape(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s.contains(|c: char| c.is_whitespace() || "\"'\\$`!*?<>|&;()[]{}#~".contains(c)) {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_with_args() {
        let mut cmd = Command::new("ls");
        cmd.arg("-la").arg("/tmp");

        assert_eq!(cmd.get_program(), "ls");
        assert_eq!(cmd.get_args().len(), 2);
        assert_eq!(cmd.get_args()[0], "-la");
        assert_eq!(cmd.to_shell_string(), "ls -la /tmp");
    }

    #[test]
    fn test_shell_command_round_trips_script() {
        let cmd = Command::shell("cat /proc/net/tcp | wc -l");
        assert_eq!(cmd.script(), Some("cat /proc/net/tcp | wc -l"));
        assert_eq!(cmd.to_shell_string(), "sh -c 'cat /proc/net/tcp | wc -l'");
        assert_eq!(Command::new("true").script(), None);
    }

    #[test]
    fn test_current_dir_renders_cd() {
        let mut cmd = Command::new("./bin/observer");
        cmd.current_dir("/home/admin/ob");
        assert_eq!(cmd.to_string(), "cd /home/admin/ob && ./bin/observer");
    }

    #[test]
    fn test_shell_escape() {
        assert_eq!(shell_escape("simple"), "simple");
        assert_eq!(shell_escape("with space"), "'with space'");
        assert_eq!(shell_escape("with'quote"), "'with'\"'\"'quote'");
        assert_eq!(shell_escape("$variable"), "'$variable'");
        assert_eq!(shell_escape("path/to/file"), "path/to/file");
        assert_eq!(shell_escape(""), "''");
    }
}
