//! Test doubles for the session's external seams.
//!
//! Every double replays a fixed script and records what it was asked, so
//! tests can assert on requests without a network, an interpreter or a
//! package manager.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use serde_json::json;

use crate::core::types::{ExecutionOutcome, Turn};
use crate::io::deps::PackageInstaller;
use crate::io::interrupt::Interrupt;
use crate::io::provider::{ModelClient, ProviderError};
use crate::io::supervisor::{ProjectRunner, SupervisorFault};
use crate::session::{OperatorCommand, OperatorInput, parse_operator_line};

/// Build a well-formed model response writing `files`.
pub fn project_response(files: &[(&str, &str)]) -> String {
    let out_file: Vec<_> = files
        .iter()
        .map(|(name, code)| {
            json!({
                "file_name": name,
                "operation": "write",
                "description": format!("{name} source"),
                "code": code,
            })
        })
        .collect();
    json!({ "project_type": "python", "out_file": out_file }).to_string()
}

/// Model client that replays scripted replies and records every request.
pub struct ScriptedModel {
    replies: RefCell<VecDeque<Result<String, ProviderError>>>,
    requests: RefCell<Vec<Vec<Turn>>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<Result<String, ProviderError>>) -> Self {
        Self {
            replies: RefCell::new(replies.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.borrow().len()
    }

    /// Conversation sent with each request, in order.
    pub fn requests(&self) -> Vec<Vec<Turn>> {
        self.requests.borrow().clone()
    }
}

impl ModelClient for ScriptedModel {
    fn complete(&self, history: &[Turn]) -> Result<String, ProviderError> {
        self.requests.borrow_mut().push(history.to_vec());
        self.replies
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::Transport("no scripted reply left".to_string())))
    }
}

/// Project runner that replays scripted outcomes.
///
/// Outcomes that imply a live service (`UserInterrupted`, `TimedOut`) report
/// the running phase before returning, like the real supervisor.
pub struct ScriptedRunner {
    outcomes: RefCell<VecDeque<ExecutionOutcome>>,
    runs: Cell<usize>,
}

impl ScriptedRunner {
    pub fn new(outcomes: Vec<ExecutionOutcome>) -> Self {
        Self {
            outcomes: RefCell::new(outcomes.into()),
            runs: Cell::new(0),
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.get()
    }
}

impl ProjectRunner for ScriptedRunner {
    fn run(
        &self,
        _root: &Path,
        on_running: &mut dyn FnMut(),
    ) -> Result<ExecutionOutcome, SupervisorFault> {
        self.runs.set(self.runs.get() + 1);
        let outcome = self
            .outcomes
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| SupervisorFault::Wait(io::Error::other("no scripted outcome left")))?;
        if matches!(
            outcome,
            ExecutionOutcome::UserInterrupted | ExecutionOutcome::TimedOut
        ) {
            on_running();
        }
        Ok(outcome)
    }
}

/// Package installer with a fixed set of present and uninstallable packages.
pub struct ScriptedInstaller {
    installed: Vec<String>,
    failing: Vec<String>,
    installs: RefCell<Vec<String>>,
}

impl ScriptedInstaller {
    pub fn new(installed: &[&str], failing: &[&str]) -> Self {
        Self {
            installed: installed.iter().map(|s| s.to_string()).collect(),
            failing: failing.iter().map(|s| s.to_string()).collect(),
            installs: RefCell::new(Vec::new()),
        }
    }

    /// Every install requested, including failed ones.
    pub fn installs(&self) -> Vec<String> {
        self.installs.borrow().clone()
    }
}

impl PackageInstaller for ScriptedInstaller {
    /// A pinned spec needs the exact `name==version` entry; anything else
    /// only needs the name.
    fn is_satisfied(&self, spec: &str) -> Result<bool> {
        if spec.contains("==") {
            return Ok(self.installed.iter().any(|entry| entry == spec));
        }
        let name = spec
            .split(|c: char| !(c.is_ascii_alphanumeric() || "._-".contains(c)))
            .next()
            .unwrap_or(spec);
        Ok(self
            .installed
            .iter()
            .any(|entry| entry.split("==").next() == Some(name)))
    }

    fn install(&self, spec: &str) -> Result<()> {
        self.installs.borrow_mut().push(spec.to_string());
        if self.failing.iter().any(|name| spec.starts_with(name.as_str())) {
            bail!("scripted install failure for {spec}");
        }
        Ok(())
    }
}

/// Interrupt that fires on chosen calls to `take` (1-based).
pub struct ScriptedInterrupt {
    fire_on: Vec<usize>,
    calls: Cell<usize>,
}

impl ScriptedInterrupt {
    pub fn fire_on(calls: &[usize]) -> Self {
        Self {
            fire_on: calls.to_vec(),
            calls: Cell::new(0),
        }
    }
}

impl Interrupt for ScriptedInterrupt {
    fn take(&self) -> bool {
        let call = self.calls.get() + 1;
        self.calls.set(call);
        self.fire_on.contains(&call)
    }
}

/// Interrupt that fires once, the first time it is checked after `delay`.
pub struct InterruptAfter {
    deadline: Instant,
    fired: Cell<bool>,
}

impl InterruptAfter {
    pub fn new(delay: Duration) -> Self {
        Self {
            deadline: Instant::now() + delay,
            fired: Cell::new(false),
        }
    }
}

impl Interrupt for InterruptAfter {
    fn take(&self) -> bool {
        if self.fired.get() || Instant::now() < self.deadline {
            return false;
        }
        self.fired.set(true);
        true
    }
}

/// Operator input replaying lines; running out behaves like end of input.
pub struct ScriptedInput {
    lines: VecDeque<String>,
}

impl ScriptedInput {
    pub fn new(lines: &[&str]) -> Self {
        Self {
            lines: lines.iter().map(|line| line.to_string()).collect(),
        }
    }
}

impl OperatorInput for ScriptedInput {
    fn next_command(&mut self) -> Result<OperatorCommand> {
        while let Some(line) = self.lines.pop_front() {
            if let Some(command) = parse_operator_line(&line) {
                return Ok(command);
            }
        }
        Ok(OperatorCommand::Exit)
    }
}

/// Whether `pid` no longer runs (absent, or a zombie awaiting its reaper).
#[cfg(target_os = "linux")]
pub fn process_gone(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Err(_) => true,
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| state == "Z" || state == "X"),
    }
}
