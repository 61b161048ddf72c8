//! Prompt rendering for every user turn the session sends.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::feedback::{FailureKind, FeedbackInputs, SourceFile};
use crate::core::types::Mode;
use crate::io::config::CodeloopConfig;

const CONTRACT_TEMPLATE: &str = include_str!("prompts/contract.md");
const INITIAL_TEMPLATE: &str = include_str!("prompts/initial.md");
const EXISTING_TEMPLATE: &str = include_str!("prompts/existing.md");
const MODIFY_TEMPLATE: &str = include_str!("prompts/modify.md");
const REPAIR_TEMPLATE: &str = include_str!("prompts/repair.md");
const REFORMAT_TEMPLATE: &str = include_str!("prompts/reformat.md");

/// Reply-format rules shared by every template that embeds the contract.
#[derive(Debug, Clone)]
struct Contract {
    mode: &'static str,
    run_command: String,
    manifest: String,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
    contract: Contract,
}

impl PromptEngine {
    pub fn new(mode: Mode, config: &CodeloopConfig) -> Result<Self> {
        let mut env = Environment::new();
        for (name, source) in [
            ("contract", CONTRACT_TEMPLATE),
            ("initial", INITIAL_TEMPLATE),
            ("existing", EXISTING_TEMPLATE),
            ("modify", MODIFY_TEMPLATE),
            ("repair", REPAIR_TEMPLATE),
            ("reformat", REFORMAT_TEMPLATE),
        ] {
            env.add_template(name, source)
                .with_context(|| format!("load {name} prompt template"))?;
        }

        let entry = config
            .supervisor
            .entry_candidates
            .first()
            .map(String::as_str)
            .unwrap_or("main.py");
        let contract = Contract {
            mode: match mode {
                Mode::Fresh => "fresh",
                Mode::Existing => "existing",
            },
            run_command: format!("{} {entry}", config.supervisor.command.join(" ")),
            manifest: config.dependencies.manifest.clone(),
        };
        Ok(Self { env, contract })
    }

    fn render<S: Serialize>(&self, name: &str, ctx: S) -> Result<String> {
        let template = self.env.get_template(name)?;
        template
            .render(ctx)
            .with_context(|| format!("render {name} prompt"))
    }

    /// First request of a fresh project.
    pub fn initial(&self, requirement: &str) -> Result<String> {
        self.render(
            "initial",
            context! {
                mode => self.contract.mode,
                run_command => &self.contract.run_command,
                manifest => &self.contract.manifest,
                requirement => requirement.trim(),
            },
        )
    }

    /// Description of an existing project, sent before its first requirement.
    pub fn existing(&self, tree: &str, files: &BTreeMap<PathBuf, String>) -> Result<String> {
        let files: Vec<SourceFile> = files
            .iter()
            .map(|(path, content)| SourceFile {
                path: path.to_string_lossy().replace('\\', "/"),
                content: content.clone(),
            })
            .collect();
        self.render(
            "existing",
            context! {
                mode => self.contract.mode,
                run_command => &self.contract.run_command,
                manifest => &self.contract.manifest,
                tree => tree.trim_end(),
                files => files,
            },
        )
    }

    /// A requirement against a project the model already knows.
    pub fn modification(&self, requirement: &str) -> Result<String> {
        self.render("modify", context! { requirement => requirement.trim() })
    }

    /// Follow-up after a failed attempt.
    pub fn feedback(&self, feedback: &FeedbackInputs) -> Result<String> {
        let name = match feedback.kind {
            FailureKind::Crashed => "repair",
            FailureKind::Provider => "reformat",
        };
        self.render(
            name,
            context! {
                mode => self.contract.mode,
                run_command => &self.contract.run_command,
                manifest => &self.contract.manifest,
                feedback => feedback,
            },
        )
    }
}
