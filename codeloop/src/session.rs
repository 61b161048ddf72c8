//! Session controller: the generate, materialize, execute, repair loop.
//!
//! A [`Session`] owns the conversation history and the retry budget. Each
//! submitted requirement runs cycles until the project runs successfully or
//! the budget is spent; the caller then asks the operator what to do next.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, instrument, warn};

use crate::core::budget::RetryBudget;
use crate::core::feedback::{FailureKind, compose_feedback};
use crate::core::history::ConversationHistory;
use crate::core::response::parse_response;
use crate::core::state::{SessionState, Step, transition};
use crate::core::types::{AttemptOutcome, ExecutionOutcome, GenerationAttempt, Mode};
use crate::io::attempt_log::{AttemptMeta, AttemptWriteRequest, write_attempt};
use crate::io::config::CodeloopConfig;
use crate::io::deps::{
    DependencyInstallWarning, DependencyReport, PackageInstaller, resolve_dependencies,
};
use crate::io::interrupt::Interrupt;
use crate::io::materialize::{MaterializeError, MaterializeReport, Project, materialize};
use crate::io::prompt::PromptEngine;
use crate::io::provider::{ModelClient, ProviderError};
use crate::io::supervisor::ProjectRunner;

/// Progress notifications for the operator.
#[derive(Debug)]
pub enum SessionEvent<'a> {
    /// The state machine moved.
    State(SessionState),
    /// A generation request is about to be sent.
    Attempt { number: usize, budget_remaining: u32 },
    Materialized(&'a MaterializeReport),
    DependencyWarning(&'a DependencyInstallWarning),
    /// The project outlived its startup window and is being served.
    Running { project_type: Option<&'a str> },
    /// An attempt finished and was recorded.
    Outcome {
        number: usize,
        outcome: &'a AttemptOutcome,
    },
}

/// How one submitted requirement ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Succeeded(ExecutionOutcome),
    /// Every allowed attempt failed; carries the last failure verbatim.
    Exhausted { last_failure: String },
    /// The operator interrupted while no project was running.
    Interrupted,
}

/// What the operator wants after a success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    Requirement(String),
    Exit,
}

/// Source of operator commands (stdin in the CLI, scripted in tests).
pub trait OperatorInput {
    fn next_command(&mut self) -> Result<OperatorCommand>;
}

/// Interpret one line typed by the operator.
///
/// Blank lines yield `None`. `exit` ends the session. The two characters `\n`
/// become a line break so multi-line requirements fit on one line.
pub fn parse_operator_line(line: &str) -> Option<OperatorCommand> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.eq_ignore_ascii_case("exit") {
        return Some(OperatorCommand::Exit);
    }
    Some(OperatorCommand::Requirement(trimmed.replace("\\n", "\n")))
}

/// Why a whole session stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    Exited,
    Exhausted { last_failure: String },
    Interrupted,
}

/// What one loop iteration produced before it is recorded.
struct IterationResult {
    response_text: String,
    outcome: AttemptOutcome,
    materialized: Option<MaterializeReport>,
    dependencies: Option<DependencyReport>,
}

pub struct Session<M, R, P, I> {
    config: CodeloopConfig,
    prompts: PromptEngine,
    project: Project,
    history: ConversationHistory,
    budget: RetryBudget,
    state: SessionState,
    requirement: String,
    model: M,
    runner: R,
    installer: P,
    interrupt: I,
}

impl<M, R, P, I> Session<M, R, P, I>
where
    M: ModelClient,
    R: ProjectRunner,
    P: PackageInstaller,
    I: Interrupt,
{
    /// Create a session. Existing projects are described to the model up front.
    pub fn new(
        project: Project,
        config: CodeloopConfig,
        model: M,
        runner: R,
        installer: P,
        interrupt: I,
    ) -> Result<Self> {
        let prompts = PromptEngine::new(project.mode(), &config)?;
        let mut history = ConversationHistory::new();
        if project.mode() == Mode::Existing {
            let seed = prompts.existing(&project.directory_tree(), project.files())?;
            history.push_user(seed);
            debug!(files = project.files().len(), "seeded history with existing project");
        }
        Ok(Self {
            budget: RetryBudget::new(config.session.retry_budget),
            config,
            prompts,
            project,
            history,
            state: SessionState::Init,
            requirement: String::new(),
            model,
            runner,
            installer,
            interrupt,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn budget(&self) -> RetryBudget {
        self.budget
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    /// Run requirements from `input` until the operator exits or a cycle stops the session.
    pub fn drive(
        &mut self,
        first: Option<String>,
        input: &mut dyn OperatorInput,
        on_event: &mut dyn FnMut(&SessionEvent<'_>),
    ) -> Result<SessionEnd> {
        let mut command = match first {
            Some(requirement) => OperatorCommand::Requirement(requirement),
            None => input.next_command()?,
        };
        loop {
            match command {
                OperatorCommand::Exit => {
                    self.advance(Step::Exit, on_event)?;
                    return Ok(SessionEnd::Exited);
                }
                OperatorCommand::Requirement(requirement) => {
                    match self.submit(&requirement, on_event)? {
                        CycleOutcome::Succeeded(_) => {}
                        CycleOutcome::Exhausted { last_failure } => {
                            return Ok(SessionEnd::Exhausted { last_failure });
                        }
                        CycleOutcome::Interrupted => return Ok(SessionEnd::Interrupted),
                    }
                }
            }
            command = input.next_command()?;
            if self.check_interrupt(on_event)? {
                return Ok(SessionEnd::Interrupted);
            }
        }
    }

    /// Run one requirement to success, exhaustion or interrupt.
    #[instrument(skip_all, fields(mode = ?self.project.mode()))]
    pub fn submit(
        &mut self,
        requirement: &str,
        on_event: &mut dyn FnMut(&SessionEvent<'_>),
    ) -> Result<CycleOutcome> {
        let first = match self.state {
            SessionState::Init => true,
            SessionState::SuccessAwaitInput => false,
            other => bail!("cannot accept a requirement in state {other}"),
        };
        self.advance(
            if first { Step::Begin } else { Step::NewRequirement },
            on_event,
        )?;
        self.budget.reset();
        self.requirement = requirement.trim().to_string();
        info!(requirement = %self.requirement, budget = self.budget.initial(), "requirement accepted");

        let mut prompt = if first && self.project.mode() == Mode::Fresh {
            self.prompts.initial(&self.requirement)?
        } else {
            self.prompts.modification(&self.requirement)?
        };

        loop {
            if self.check_interrupt(on_event)? {
                return Ok(CycleOutcome::Interrupted);
            }
            let number = self.project.next_attempt_number();
            on_event(&SessionEvent::Attempt {
                number,
                budget_remaining: self.budget.remaining(),
            });

            let timestamp = chrono::Utc::now().to_rfc3339();
            let started = Instant::now();
            self.history.push_user(prompt.clone());
            let Some(result) = self.iterate(on_event)? else {
                return Ok(CycleOutcome::Interrupted);
            };

            let succeeded = result.outcome.is_success();
            let budget_left = succeeded || self.budget.consume();
            let record = GenerationAttempt {
                prompt_text: prompt,
                response_text: result.response_text,
                timestamp,
                outcome: result.outcome,
            };
            let meta = AttemptMeta {
                attempt: number,
                started_at: record.timestamp.clone(),
                duration_ms: started.elapsed().as_millis() as u64,
                budget_remaining: self.budget.remaining(),
                outcome: record.outcome.clone(),
                materialized: result.materialized,
            };
            write_attempt(&AttemptWriteRequest {
                root: self.project.root(),
                record: &record,
                meta: &meta,
                dependencies: result.dependencies.as_ref(),
            })
            .context("write attempt log")?;
            self.project.record_attempt(record.clone());
            on_event(&SessionEvent::Outcome {
                number,
                outcome: &record.outcome,
            });

            if succeeded {
                if let AttemptOutcome::Executed { outcome } = record.outcome {
                    return Ok(CycleOutcome::Succeeded(outcome));
                }
                bail!("attempt {number} succeeded without executing");
            }

            self.advance(Step::Retry { budget_left }, on_event)?;
            let (kind, failure) = match &record.outcome {
                AttemptOutcome::Executed {
                    outcome: ExecutionOutcome::Crashed { trace },
                } => (FailureKind::Crashed, trace.clone()),
                AttemptOutcome::ProviderFailed { message } => (FailureKind::Provider, message.clone()),
                AttemptOutcome::Executed { outcome } => {
                    return Err(anyhow!("attempt {number} failed with {}", outcome.label()));
                }
            };
            if !budget_left {
                warn!(attempts = self.budget.used(), "retry budget exhausted");
                return Ok(CycleOutcome::Exhausted {
                    last_failure: failure,
                });
            }

            info!(
                attempt = number,
                remaining = self.budget.remaining(),
                "attempt failed, asking for a repair"
            );
            let feedback = compose_feedback(
                kind,
                &self.requirement,
                self.project.files(),
                &failure,
                self.config.feedback.trace_limit_bytes,
            );
            prompt = self.prompts.feedback(&feedback)?;
        }
    }

    /// Generate, materialize and execute once. `None` means the operator interrupted.
    fn iterate(
        &mut self,
        on_event: &mut dyn FnMut(&SessionEvent<'_>),
    ) -> Result<Option<IterationResult>> {
        debug!(
            turns = self.history.len(),
            bytes = self.history.content_bytes(),
            "requesting generation"
        );
        let reply = self.model.complete(self.history.turns());
        if self.check_interrupt(on_event)? {
            return Ok(None);
        }

        let text = match reply {
            Ok(text) => text,
            Err(err) => {
                warn!(err = %err, "generation failed");
                self.advance(Step::ProviderFailed, on_event)?;
                return Ok(Some(IterationResult {
                    response_text: String::new(),
                    outcome: AttemptOutcome::ProviderFailed {
                        message: err.to_string(),
                    },
                    materialized: None,
                    dependencies: None,
                }));
            }
        };
        self.history.push_model(text.clone());
        self.advance(Step::ResponseReceived, on_event)?;

        let parsed = match parse_response(&text) {
            Ok(parsed) => parsed,
            Err(reason) => return self.unusable_response(text, reason, on_event).map(Some),
        };

        let root: PathBuf = self.project.root().to_path_buf();
        let mut materialization = match materialize(&mut self.project, &parsed) {
            Ok(materialization) => materialization,
            Err(err @ MaterializeError::NothingApplicable { .. }) => {
                return self
                    .unusable_response(text, err.to_string(), on_event)
                    .map(Some);
            }
            Err(MaterializeError::Io(err)) => {
                return Err(err.context(format!("materialize project in {}", root.display())));
            }
        };
        on_event(&SessionEvent::Materialized(materialization.report()));
        let dependencies = resolve_dependencies(
            &mut materialization,
            &root,
            &self.installer,
            &self.config.dependencies,
        );
        if let Some(report) = &dependencies {
            for warning in &report.warnings {
                on_event(&SessionEvent::DependencyWarning(warning));
            }
        }
        self.advance(Step::Materialized, on_event)?;

        if self.check_interrupt(on_event)? {
            return Ok(None);
        }
        let project_type = self.project.project_type().map(str::to_string);
        let outcome = self
            .runner
            .run(&root, &mut || {
                on_event(&SessionEvent::Running {
                    project_type: project_type.as_deref(),
                });
            })
            .context("supervise project run")?;
        self.advance(
            if outcome.is_success() {
                Step::Succeeded
            } else {
                Step::Crashed
            },
            on_event,
        )?;

        Ok(Some(IterationResult {
            response_text: text,
            outcome: AttemptOutcome::Executed { outcome },
            materialized: Some(materialization.report().clone()),
            dependencies,
        }))
    }

    /// Record a response that produced nothing to run as a provider failure.
    fn unusable_response(
        &mut self,
        text: String,
        reason: String,
        on_event: &mut dyn FnMut(&SessionEvent<'_>),
    ) -> Result<IterationResult> {
        let err = ProviderError::Malformed { reason };
        warn!(err = %err, "response unusable");
        self.advance(Step::ProviderFailed, on_event)?;
        Ok(IterationResult {
            response_text: text,
            outcome: AttemptOutcome::ProviderFailed {
                message: err.to_string(),
            },
            materialized: None,
            dependencies: None,
        })
    }

    fn check_interrupt(&mut self, on_event: &mut dyn FnMut(&SessionEvent<'_>)) -> Result<bool> {
        if !self.interrupt.take() {
            return Ok(false);
        }
        info!(state = %self.state, "interrupted outside a project run");
        self.advance(Step::Interrupt, on_event)?;
        Ok(true)
    }

    fn advance(&mut self, step: Step, on_event: &mut dyn FnMut(&SessionEvent<'_>)) -> Result<()> {
        let next = transition(self.state, step).map_err(|err| anyhow!(err))?;
        debug!(from = %self.state, to = %next, ?step, "session transition");
        self.state = next;
        on_event(&SessionEvent::State(next));
        Ok(())
    }
}
