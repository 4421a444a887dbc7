//! Local and ssh command channels

use std::sync::OnceLock;

use regex::Regex;
use tokio::process::Command;

use crate::error::{HarnessError, HarnessResult};
use crate::traits::{CommandChannel, CommandSpec};

/// Runs commands on this machine; the command's host is informational
#[derive(Debug, Default, Clone)]
pub struct LocalChannel;

impl LocalChannel {
    pub fn new() -> Self {
        Self
    }
}

impl CommandChannel for LocalChannel {
    fn command(&self, spec: &CommandSpec) -> HarnessResult<Command> {
        let (program, args) = split_argv(spec)?;

        let mut command = Command::new(program);
        command.args(args);
        for (key, value) in &spec.env {
            command.env(key, expand_env(value));
        }
        Ok(command)
    }
}

/// Runs commands on `spec.host` through the `ssh` client
///
/// The remote command line is `env K="v"... [timeout <secs>] 'argv'...`;
/// environment values are double-quoted so `${VAR}` expands on the remote
/// side, arguments are single-quoted verbatim.
///
/// A pseudo-terminal is always forced (`-tt`). Signalling the local client
/// then tears down the remote session, and the remote program receives
/// SIGHUP; without a pty sshd leaves it running on its port.
#[derive(Debug, Clone)]
pub struct SshChannel {
    ssh_program: String,
    options: Vec<String>,
}

impl Default for SshChannel {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            options: vec!["-o".to_string(), "BatchMode=yes".to_string()],
        }
    }
}

impl SshChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different ssh client binary (fluent API)
    pub fn with_program<S: Into<String>>(mut self, program: S) -> Self {
        self.ssh_program = program.into();
        self
    }

    /// Extra ssh client options, e.g. `-p 2222` (fluent API)
    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = options;
        self
    }

    pub fn remote_command_line(spec: &CommandSpec) -> HarnessResult<String> {
        split_argv(spec)?;

        let mut parts = Vec::with_capacity(spec.argv.len() + spec.env.len() + 3);
        if !spec.env.is_empty() {
            parts.push("env".to_string());
            for (key, value) in &spec.env {
                if !is_env_name(key) {
                    return Err(HarnessError::invariant(format!("invalid environment variable name {key:?}")));
                }
                parts.push(format!("{key}={}", double_quote(value)));
            }
        }
        if let Some(limit) = spec.timeout {
            parts.push("timeout".to_string());
            parts.push(limit.as_secs().max(1).to_string());
        }
        parts.extend(spec.argv.iter().map(|arg| single_quote(arg)));
        Ok(parts.join(" "))
    }
}

impl CommandChannel for SshChannel {
    fn command(&self, spec: &CommandSpec) -> HarnessResult<Command> {
        let remote = Self::remote_command_line(spec)?;

        let mut command = Command::new(&self.ssh_program);
        command
            .arg("-tt")
            .args(&self.options)
            .arg(&spec.host)
            .arg("--")
            .arg(remote);
        Ok(command)
    }
}

fn split_argv(spec: &CommandSpec) -> HarnessResult<(&String, &[String])> {
    spec.argv
        .split_first()
        .ok_or_else(|| HarnessError::invariant(format!("empty command line for host {}", spec.host)))
}

fn env_reference() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env reference pattern is valid"))
}

/// Expand `${NAME}` references from this process's environment; unset names expand to nothing
pub fn expand_env(value: &str) -> String {
    env_reference()
        .replace_all(value, |caps: &regex::Captures<'_>| std::env::var(&caps[1]).unwrap_or_default())
        .into_owned()
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

fn single_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

fn double_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '\\' | '`') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}
