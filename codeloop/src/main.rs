//! LLM-driven project generator.
//!
//! Asks a model for a whole project, runs it, and feeds failures back until
//! it works. After a success the operator can keep asking for changes.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use codeloop::core::types::{AttemptOutcome, Mode};
use codeloop::exit_codes;
use codeloop::io::config::{CodeloopConfig, DEFAULT_CONFIG_FILE, load_config};
use codeloop::io::deps::PipInstaller;
use codeloop::io::interrupt::CtrlC;
use codeloop::io::materialize::Project;
use codeloop::io::provider::OpenAiCompatibleClient;
use codeloop::io::supervisor::Supervisor;
use codeloop::io::web;
use codeloop::logging;
use codeloop::session::{
    OperatorCommand, OperatorInput, Session, SessionEnd, SessionEvent, parse_operator_line,
};

#[derive(Parser)]
#[command(
    name = "codeloop",
    version,
    about = "Generate a project with a language model, run it, and repair it until it works"
)]
struct Cli {
    /// Config file (defaults to `codeloop.toml` in the working directory, if present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a new project from a requirement.
    New {
        /// Target directory (defaults to `session.project_root`).
        #[arg(long)]
        path: Option<PathBuf>,
        /// Allow a non-empty target; files the model does not return are deleted.
        #[arg(long)]
        force: bool,
        /// First requirement. Prompted for when omitted.
        requirement: Vec<String>,
    },
    /// Modify an existing project.
    Modify {
        /// Directory of the existing project.
        #[arg(long)]
        path: PathBuf,
        /// First requirement. Prompted for when omitted.
        requirement: Vec<String>,
    },
}

/// What to generate into, resolved from the command line or the menu.
struct Plan {
    mode: Mode,
    path: PathBuf,
    force: bool,
    first: Option<OperatorCommand>,
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::FAULT
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config_path = match &cli.config {
        Some(path) if !path.exists() => bail!("config file {} not found", path.display()),
        Some(path) => path.clone(),
        None => PathBuf::from(DEFAULT_CONFIG_FILE),
    };
    let config = load_config(&config_path)?;

    let stdin = io::stdin();
    let mut operator = StdinOperator::new(stdin.lock());
    let plan = match cli.command {
        Some(command) => plan_from_command(command, &config),
        None => match operator.menu(&config)? {
            Some(plan) => plan,
            None => return Ok(exit_codes::OK),
        },
    };

    let first = match plan.first {
        Some(OperatorCommand::Exit) => return Ok(exit_codes::OK),
        Some(OperatorCommand::Requirement(requirement)) => Some(requirement),
        None => None,
    };

    let model = OpenAiCompatibleClient::from_env(&config.provider)?;
    let project = match plan.mode {
        Mode::Fresh => Project::fresh(&plan.path, plan.force)?,
        Mode::Existing => Project::load_existing(&plan.path)?,
    };
    let interrupt = CtrlC::install().context("install interrupt handler")?;
    let runner = Supervisor::new(config.supervisor.clone(), interrupt.clone());
    let installer = PipInstaller::new(&config.dependencies);
    eprintln!("==> project: {}", plan.path.display());
    let web_config = config.web.clone();
    let mut session = Session::new(project, config, model, runner, installer, interrupt)?;

    let mut on_event = |event: &SessionEvent<'_>| {
        report_event(event);
        if let SessionEvent::Running {
            project_type: Some(project_type),
        } = event
            && web::is_web_project(project_type)
        {
            web::open_when_ready(&web_config, |url| eprintln!("==> serving at {url}"));
        }
    };
    let end = session.drive(first, &mut operator, &mut on_event)?;
    Ok(match end {
        SessionEnd::Exited => exit_codes::OK,
        SessionEnd::Exhausted { last_failure } => {
            eprintln!("==> retry budget exhausted; last failure:\n{last_failure}");
            exit_codes::EXHAUSTED
        }
        SessionEnd::Interrupted => {
            eprintln!("==> interrupted");
            exit_codes::INTERRUPTED
        }
    })
}

fn plan_from_command(command: Command, config: &CodeloopConfig) -> Plan {
    match command {
        Command::New {
            path,
            force,
            requirement,
        } => Plan {
            mode: Mode::Fresh,
            path: path.unwrap_or_else(|| config.session.project_root.clone()),
            force,
            first: parse_operator_line(&requirement.join(" ")),
        },
        Command::Modify { path, requirement } => Plan {
            mode: Mode::Existing,
            path,
            force: false,
            first: parse_operator_line(&requirement.join(" ")),
        },
    }
}

fn report_event(event: &SessionEvent<'_>) {
    match event {
        SessionEvent::State(state) => eprintln!("==> [{state}]"),
        SessionEvent::Attempt {
            number,
            budget_remaining,
        } => eprintln!("==> attempt {number} ({budget_remaining} left for this requirement)"),
        SessionEvent::Materialized(report) => {
            eprintln!(
                "==> wrote {} file(s), deleted {}",
                report.written.len(),
                report.deleted.len()
            );
            for reason in &report.dropped {
                eprintln!("==> ignored: {reason}");
            }
        }
        SessionEvent::DependencyWarning(warning) => eprintln!("==> warning: {warning}"),
        SessionEvent::Running { .. } => {
            eprintln!("==> project is running; press Ctrl-C to stop it and continue");
        }
        SessionEvent::Outcome { number, outcome } => match outcome {
            AttemptOutcome::Executed { outcome } => {
                eprintln!("==> attempt {number}: {}", outcome.label());
            }
            AttemptOutcome::ProviderFailed { message } => {
                eprintln!("==> attempt {number}: unusable reply: {message}");
            }
        },
    }
}

/// Reads operator commands from a line-based reader (stdin in practice).
struct StdinOperator<R> {
    reader: R,
}

impl<R: BufRead> StdinOperator<R> {
    fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Print `prompt` and read one trimmed line. `None` at end of input.
    fn ask(&mut self, prompt: &str) -> Result<Option<String>> {
        print!("{prompt}");
        io::stdout().flush().context("flush stdout")?;
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).context("read stdin")?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    }

    fn menu(&mut self, config: &CodeloopConfig) -> Result<Option<Plan>> {
        println!("codeloop");
        println!("  1) generate a new project");
        println!("  2) modify an existing project");
        loop {
            let Some(choice) = self.ask("choose 1 or 2 (or exit): ")? else {
                return Ok(None);
            };
            let mode = match choice.as_str() {
                "1" => Mode::Fresh,
                "2" => Mode::Existing,
                "exit" => return Ok(None),
                _ => continue,
            };
            let path = match mode {
                Mode::Fresh => {
                    let default = config.session.project_root.display().to_string();
                    match self.ask(&format!("project directory [{default}]: "))? {
                        None => return Ok(None),
                        Some(path) if path.is_empty() => PathBuf::from(default),
                        Some(path) => PathBuf::from(path),
                    }
                }
                Mode::Existing => loop {
                    match self.ask("existing project directory: ")? {
                        None => return Ok(None),
                        Some(path) if path.is_empty() => continue,
                        Some(path) => break PathBuf::from(path),
                    }
                },
            };
            return Ok(Some(Plan {
                mode,
                path,
                force: false,
                first: None,
            }));
        }
    }
}

impl<R: BufRead> OperatorInput for StdinOperator<R> {
    fn next_command(&mut self) -> Result<OperatorCommand> {
        loop {
            let Some(line) = self.ask("\nrequirement (\\n for a line break, exit to quit)> ")?
            else {
                return Ok(OperatorCommand::Exit);
            };
            if let Some(command) = parse_operator_line(&line) {
                return Ok(command);
            }
        }
    }
}
