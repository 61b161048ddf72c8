//! Project materializer: turn parsed file blocks into files on disk.
//!
//! Writes are staged under `.codeloop/staging/`. Whatever a write or delete
//! replaces is first moved under `.codeloop/backup/`, and every move is
//! journaled: if any step fails the journal is replayed backwards and the
//! tree is left as it was before the call.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::core::response::{ParsedResponse, STATE_DIR};
use crate::core::types::{FileBlock, FileOperation, GenerationAttempt, Mode};
use crate::io::attempt_log::last_attempt_number;

/// Directories never read into an existing project or swept from a fresh one.
const SKIPPED_DIRS: &[&str] = &[STATE_DIR, ".git", "__pycache__", "node_modules", ".venv"];
/// Files larger than this are left out when seeding from an existing project.
const MAX_SEED_FILE_BYTES: u64 = 256 * 1024;
const STAGING_DIR: &str = "staging";
const BACKUP_DIR: &str = "backup";
const MANIFEST_FILE: &str = "manifest.json";

/// The project the session generates into.
#[derive(Debug, Clone)]
pub struct Project {
    root: PathBuf,
    mode: Mode,
    project_type: Option<String>,
    files: BTreeMap<PathBuf, String>,
    descriptions: BTreeMap<PathBuf, String>,
    /// Attempts recorded under the state directory by earlier sessions.
    previous_attempts: usize,
    attempts: Vec<GenerationAttempt>,
}

impl Project {
    /// Prepare an empty project at `root`.
    ///
    /// The directory may already exist but must hold nothing besides the
    /// agent's state directory unless `force` is set.
    pub fn fresh(root: &Path, force: bool) -> Result<Self> {
        if root.exists() {
            if !root.is_dir() {
                bail!("{} exists and is not a directory", root.display());
            }
            let occupied = fs::read_dir(root)
                .with_context(|| format!("read {}", root.display()))?
                .filter_map(|entry| entry.ok())
                .any(|entry| entry.file_name() != STATE_DIR);
            if occupied && !force {
                bail!(
                    "{} is not empty; pass --force to let generation replace its contents",
                    root.display()
                );
            }
            if occupied {
                warn!(root = %root.display(), "target not empty, existing files will be replaced");
            }
        }
        fs::create_dir_all(root).with_context(|| format!("create {}", root.display()))?;
        Self::empty(root, Mode::Fresh)
    }

    /// Load the text files of an existing project.
    #[instrument(skip_all, fields(root = %root.display()))]
    pub fn load_existing(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            bail!("{} is not an existing directory", root.display());
        }
        let mut project = Self::empty(root, Mode::Existing)?;
        project.project_type = read_manifest_project_type(&project.state_dir());
        for entry in WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !is_skipped_dir(entry))
        {
            let entry = entry.with_context(|| format!("walk {}", root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(root)
                .with_context(|| format!("relativize {}", entry.path().display()))?
                .to_path_buf();
            let size = entry.metadata().map(|meta| meta.len()).unwrap_or(u64::MAX);
            if size > MAX_SEED_FILE_BYTES {
                debug!(path = %relative.display(), size, "skipping large file");
                continue;
            }
            let bytes = fs::read(entry.path())
                .with_context(|| format!("read {}", entry.path().display()))?;
            match String::from_utf8(bytes) {
                Ok(text) => {
                    project.files.insert(relative, text);
                }
                Err(_) => debug!(path = %relative.display(), "skipping non-text file"),
            }
        }
        info!(files = project.files.len(), "loaded existing project");
        Ok(project)
    }

    fn empty(root: &Path, mode: Mode) -> Result<Self> {
        Ok(Self {
            root: root.to_path_buf(),
            mode,
            project_type: None,
            files: BTreeMap::new(),
            descriptions: BTreeMap::new(),
            previous_attempts: last_attempt_number(root)?,
            attempts: Vec::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Kind of project the model last declared (`web`, `python`, ...).
    pub fn project_type(&self) -> Option<&str> {
        self.project_type.as_deref()
    }

    /// Source files as last materialized (or loaded), keyed by relative path.
    pub fn files(&self) -> &BTreeMap<PathBuf, String> {
        &self.files
    }

    /// Attempts made by this session.
    pub fn attempts(&self) -> &[GenerationAttempt] {
        &self.attempts
    }

    /// Number the next attempt will be logged under.
    ///
    /// Continues after the attempts earlier sessions left in the state
    /// directory.
    pub fn next_attempt_number(&self) -> usize {
        self.previous_attempts + self.attempts.len() + 1
    }

    /// Agent state directory inside the project.
    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    /// Append an attempt and return the number it was logged under.
    pub fn record_attempt(&mut self, attempt: GenerationAttempt) -> usize {
        let number = self.next_attempt_number();
        self.attempts.push(attempt);
        number
    }

    /// Indented listing of the project's files, directories first-seen order.
    pub fn directory_tree(&self) -> String {
        let name = self
            .root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| ".".to_string());
        let mut out = format!("{name}/\n");
        let mut open: Vec<OsString> = Vec::new();
        for path in self.files.keys() {
            let parts: Vec<OsString> = path.iter().map(OsString::from).collect();
            let Some((file, dirs)) = parts.split_last() else {
                continue;
            };
            let shared = open
                .iter()
                .zip(dirs)
                .take_while(|(a, b)| a == b)
                .count();
            for (depth, dir) in dirs.iter().enumerate().skip(shared) {
                out.push_str(&"  ".repeat(depth + 1));
                out.push_str(&dir.to_string_lossy());
                out.push_str("/\n");
            }
            out.push_str(&"  ".repeat(dirs.len() + 1));
            out.push_str(&file.to_string_lossy());
            out.push('\n');
            open = dirs.to_vec();
        }
        out
    }
}

/// What one materialization changed on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaterializeReport {
    pub written: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
    /// Response entries that were ignored, with reasons.
    pub dropped: Vec<String>,
}

/// Result of materializing one response.
///
/// Carries the once-only guard for dependency resolution.
#[derive(Debug)]
pub struct Materialization {
    report: MaterializeReport,
    deps_resolved: bool,
}

impl Materialization {
    pub fn report(&self) -> &MaterializeReport {
        &self.report
    }

    /// Claim dependency resolution for this materialization.
    ///
    /// Returns `false` if it was already claimed.
    pub fn claim_dependency_resolution(&mut self) -> bool {
        !std::mem::replace(&mut self.deps_resolved, true)
    }
}

#[derive(Debug, Error)]
pub enum MaterializeError {
    /// Every block conflicted with the tree on disk. Nothing was changed.
    #[error("no file block could be applied: {}", .dropped.join("; "))]
    NothingApplicable { dropped: Vec<String> },
    /// The filesystem failed; the tree was restored to its previous state.
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
struct Manifest<'a> {
    project_type: Option<&'a str>,
    files: Vec<ManifestEntry<'a>>,
}

#[derive(Debug, Serialize)]
struct ManifestEntry<'a> {
    file_name: String,
    description: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct StoredManifest {
    project_type: Option<String>,
}

/// Write `response` into the project directory.
///
/// Fresh projects end up holding exactly the response's files (plus the state
/// directory); files or directories standing where a write needs to go are
/// cleared. Existing projects keep every file the response does not mention,
/// except explicit deletions, and blocks that conflict with the tree are
/// dropped.
#[instrument(skip_all, fields(root = %project.root.display(), blocks = response.blocks.len()))]
pub fn materialize(
    project: &mut Project,
    response: &ParsedResponse,
) -> Result<Materialization, MaterializeError> {
    let plan = plan(project, response);
    if plan.writes.is_empty() && plan.deletes.is_empty() {
        return Err(MaterializeError::NothingApplicable {
            dropped: plan.dropped,
        });
    }

    let staging = project.state_dir().join(STAGING_DIR);
    let backup = project.state_dir().join(BACKUP_DIR);
    reset_dir(&staging)?;
    reset_dir(&backup)?;

    let mut journal = Journal::default();
    let committed = stage_writes(&staging, &plan.writes).and_then(|()| {
        commit(&project.root, project.mode, &plan, &staging, &backup, &mut journal)
    });
    let report = match committed {
        Ok(report) => report,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "materialization failed, restoring previous tree");
            if journal.rollback() {
                remove_dir_if_present(&backup)?;
            } else {
                warn!(backup = %backup.display(), "some replaced files could not be restored");
            }
            remove_dir_if_present(&staging)?;
            return Err(err.into());
        }
    };
    remove_dir_if_present(&staging)?;
    remove_dir_if_present(&backup)?;

    match project.mode {
        Mode::Fresh => {
            project.files.clear();
            project.descriptions.clear();
            if let Err(err) = prune_empty_dirs(&project.root) {
                warn!(error = %format!("{err:#}"), "could not remove empty directories");
            }
        }
        Mode::Existing => {
            for block in &plan.deletes {
                project.files.remove(&block.path);
                project.descriptions.remove(&block.path);
                if let Err(err) = prune_empty_parents(&project.root, &block.path) {
                    warn!(error = %format!("{err:#}"), "could not remove empty directories");
                }
            }
        }
    }
    for block in &plan.writes {
        project
            .files
            .insert(block.path.clone(), block.content.clone());
        match &block.description {
            Some(description) => {
                project
                    .descriptions
                    .insert(block.path.clone(), description.clone());
            }
            None => {
                project.descriptions.remove(&block.path);
            }
        }
    }
    if let Some(project_type) = &response.project_type {
        project.project_type = Some(project_type.clone());
    }

    write_manifest(project)?;
    info!(
        written = report.written.len(),
        deleted = report.deleted.len(),
        dropped = report.dropped.len(),
        "project materialized"
    );
    Ok(Materialization {
        report,
        deps_resolved: false,
    })
}

/// Blocks that survived conflict checks against the tree on disk.
struct Plan<'a> {
    writes: Vec<&'a FileBlock>,
    deletes: Vec<&'a FileBlock>,
    /// Paths cleared before any write, fresh mode only.
    clear: Vec<PathBuf>,
    dropped: Vec<String>,
}

impl Plan<'_> {
    fn reject(&mut self, reason: String) {
        warn!(%reason, "dropping file block");
        self.dropped.push(reason);
    }
}

fn plan<'a>(project: &Project, response: &'a ParsedResponse) -> Plan<'a> {
    let root = project.root.as_path();
    let mut plan = Plan {
        writes: Vec::new(),
        deletes: Vec::new(),
        clear: Vec::new(),
        dropped: response.dropped.clone(),
    };
    if project.mode == Mode::Existing {
        for block in &response.blocks {
            if block.operation != FileOperation::Delete {
                continue;
            }
            if is_dir_no_follow(&root.join(&block.path)) {
                plan.reject(format!("delete {}: is a directory", block.path.display()));
            } else {
                plan.deletes.push(block);
            }
        }
    }

    for block in response.writes() {
        let blocker = blocking_file(root, &block.path);
        let target_is_dir = is_dir_no_follow(&root.join(&block.path));
        match project.mode {
            Mode::Fresh => {
                let cleared = blocker
                    .into_iter()
                    .chain(target_is_dir.then(|| block.path.clone()));
                for path in cleared {
                    if !plan.clear.contains(&path) {
                        plan.clear.push(path);
                    }
                }
            }
            Mode::Existing => {
                if let Some(blocker) = blocker {
                    plan.reject(format!(
                        "write {}: {} is a file",
                        block.path.display(),
                        blocker.display()
                    ));
                    continue;
                }
                if target_is_dir {
                    plan.reject(format!("write {}: is a directory", block.path.display()));
                    continue;
                }
            }
        }
        plan.writes.push(block);
    }
    plan
}

/// Shallowest ancestor of `relative` that exists under `root` but is not a directory.
fn blocking_file(root: &Path, relative: &Path) -> Option<PathBuf> {
    let mut ancestors: Vec<&Path> = relative
        .ancestors()
        .skip(1)
        .filter(|dir| !dir.as_os_str().is_empty())
        .collect();
    ancestors.reverse();
    ancestors
        .into_iter()
        .find(|dir| fs::metadata(root.join(dir)).is_ok_and(|meta| !meta.is_dir()))
        .map(Path::to_path_buf)
}

fn is_dir_no_follow(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok_and(|meta| meta.is_dir())
}

fn stage_writes(staging: &Path, writes: &[&FileBlock]) -> Result<()> {
    for block in writes {
        let staged = staging.join(&block.path);
        if let Some(parent) = staged.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create staging directory {}", parent.display()))?;
        }
        fs::write(&staged, &block.content)
            .with_context(|| format!("stage {}", block.path.display()))?;
    }
    Ok(())
}

fn commit(
    root: &Path,
    mode: Mode,
    plan: &Plan<'_>,
    staging: &Path,
    backup: &Path,
    journal: &mut Journal,
) -> Result<MaterializeReport> {
    let mut report = MaterializeReport {
        dropped: plan.dropped.clone(),
        ..MaterializeReport::default()
    };
    for path in &plan.clear {
        journal.displace(root, backup, path)?;
        debug!(path = %path.display(), "cleared path in the way of a write");
        report.deleted.push(path.clone());
    }
    for block in &plan.deletes {
        if journal.displace(root, backup, &block.path)? {
            report.deleted.push(block.path.clone());
        }
    }
    for block in &plan.writes {
        let target = root.join(&block.path);
        journal.displace(root, backup, &block.path)?;
        if let Some(parent) = target.parent() {
            journal.create_parents(parent)?;
        }
        journal.place(&staging.join(&block.path), &target)?;
        report.written.push(block.path.clone());
    }
    if mode == Mode::Fresh {
        for path in unlisted_files(root, &report.written)? {
            journal.displace(root, backup, &path)?;
            debug!(path = %path.display(), "removed file absent from response");
            report.deleted.push(path);
        }
    }
    Ok(report)
}

#[derive(Debug)]
enum JournalEntry {
    Displaced { original: PathBuf, backup: PathBuf },
    CreatedDir(PathBuf),
    Placed(PathBuf),
}

/// Filesystem steps taken by one materialization, oldest first.
#[derive(Debug, Default)]
struct Journal {
    entries: Vec<JournalEntry>,
}

impl Journal {
    /// Move `relative` from `root` into `backup`. Returns `false` if it did not exist.
    fn displace(&mut self, root: &Path, backup: &Path, relative: &Path) -> Result<bool> {
        let original = root.join(relative);
        if fs::symlink_metadata(&original).is_err() {
            return Ok(false);
        }
        let saved = backup.join(relative);
        if let Some(parent) = saved.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create backup directory {}", parent.display()))?;
        }
        fs::rename(&original, &saved)
            .with_context(|| format!("move {} aside", relative.display()))?;
        self.entries.push(JournalEntry::Displaced {
            original,
            backup: saved,
        });
        Ok(true)
    }

    fn create_parents(&mut self, dir: &Path) -> Result<()> {
        let mut missing = Vec::new();
        let mut current = Some(dir);
        while let Some(path) = current.filter(|path| !path.exists()) {
            missing.push(path.to_path_buf());
            current = path.parent();
        }
        for path in missing.into_iter().rev() {
            fs::create_dir(&path)
                .with_context(|| format!("create directory {}", path.display()))?;
            self.entries.push(JournalEntry::CreatedDir(path));
        }
        Ok(())
    }

    fn place(&mut self, staged: &Path, target: &Path) -> Result<()> {
        fs::rename(staged, target)
            .with_context(|| format!("move {} into place", target.display()))?;
        self.entries.push(JournalEntry::Placed(target.to_path_buf()));
        Ok(())
    }

    /// Undo every step, newest first. Returns `false` if any step could not be undone.
    fn rollback(self) -> bool {
        let mut clean = true;
        for entry in self.entries.into_iter().rev() {
            let undone = match &entry {
                JournalEntry::Placed(path) => fs::remove_file(path),
                JournalEntry::CreatedDir(path) => fs::remove_dir(path),
                JournalEntry::Displaced { original, backup } => fs::rename(backup, original),
            };
            if let Err(err) = undone {
                warn!(?entry, %err, "rollback step failed");
                clean = false;
            }
        }
        clean
    }
}

/// Relative paths of files under `root` that are not in `keep`.
fn unlisted_files(root: &Path, keep: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut unlisted = Vec::new();
    for entry in WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || entry.file_name() != STATE_DIR)
    {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        if entry.depth() == 0 || entry.file_type().is_dir() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("relativize {}", entry.path().display()))?
            .to_path_buf();
        if !keep.contains(&relative) {
            unlisted.push(relative);
        }
    }
    Ok(unlisted)
}

/// Remove directories under `root` (outside the state directory) left empty.
fn prune_empty_dirs(root: &Path) -> Result<()> {
    let mut dirs = Vec::new();
    for entry in WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| entry.file_name() != STATE_DIR)
    {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        if entry.file_type().is_dir() {
            dirs.push(entry.into_path());
        }
    }
    // Deepest first so parents see their children gone.
    for dir in dirs.iter().rev() {
        if is_empty_dir(dir)? {
            fs::remove_dir(dir).with_context(|| format!("remove {}", dir.display()))?;
        }
    }
    Ok(())
}

fn prune_empty_parents(root: &Path, relative: &Path) -> Result<()> {
    let mut current = relative.parent();
    while let Some(dir) = current.filter(|dir| !dir.as_os_str().is_empty()) {
        let absolute = root.join(dir);
        if !absolute.is_dir() || !is_empty_dir(&absolute)? {
            break;
        }
        fs::remove_dir(&absolute).with_context(|| format!("remove {}", absolute.display()))?;
        current = dir.parent();
    }
    Ok(())
}

fn write_manifest(project: &Project) -> Result<()> {
    let manifest = Manifest {
        project_type: project.project_type(),
        files: project
            .files
            .keys()
            .map(|path| ManifestEntry {
                file_name: path.to_string_lossy().replace('\\', "/"),
                description: project.descriptions.get(path).map(String::as_str),
            })
            .collect(),
    };
    let mut buf = serde_json::to_string_pretty(&manifest).context("serialize manifest")?;
    buf.push('\n');
    let path = project.state_dir().join(MANIFEST_FILE);
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, &path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

fn read_manifest_project_type(state_dir: &Path) -> Option<String> {
    let path = state_dir.join(MANIFEST_FILE);
    let text = fs::read_to_string(&path).ok()?;
    match serde_json::from_str::<StoredManifest>(&text) {
        Ok(manifest) => manifest.project_type,
        Err(err) => {
            debug!(path = %path.display(), %err, "ignoring unreadable manifest");
            None
        }
    }
}

fn is_skipped_dir(entry: &walkdir::DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| SKIPPED_DIRS.contains(&name))
}

fn is_empty_dir(path: &Path) -> Result<bool> {
    let mut entries = fs::read_dir(path).with_context(|| format!("read {}", path.display()))?;
    Ok(entries.next().is_none())
}

fn reset_dir(path: &Path) -> Result<()> {
    remove_dir_if_present(path)?;
    fs::create_dir_all(path).with_context(|| format!("create {}", path.display()))
}

fn remove_dir_if_present(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::response::parse_response;
    use crate::test_support::project_response;

    fn parsed(files: &[(&str, &str)]) -> ParsedResponse {
        parse_response(&project_response(files)).expect("parse")
    }

    fn tree(root: &Path) -> Vec<(String, String)> {
        WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.file_name() != STATE_DIR)
            .map(|entry| entry.expect("walk"))
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| {
                let relative = entry.path().strip_prefix(root).expect("relative");
                (
                    relative.to_string_lossy().into_owned(),
                    fs::read_to_string(entry.path()).expect("read"),
                )
            })
            .collect()
    }

    #[test]
    fn fresh_refuses_non_empty_directory_without_force() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("keep.txt"), "x").expect("write");
        let err = Project::fresh(temp.path(), false).unwrap_err();
        assert!(format!("{err:#}").contains("--force"));
        Project::fresh(temp.path(), true).expect("forced");
    }

    #[test]
    fn fresh_accepts_directory_holding_only_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join(STATE_DIR)).expect("mkdir");
        Project::fresh(temp.path(), false).expect("fresh");
    }

    #[test]
    fn materializing_twice_yields_identical_tree() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut project = Project::fresh(temp.path(), false).expect("fresh");
        let response = parsed(&[("main.py", "print(1)\n"), ("pkg/util.py", "X = 1\n")]);

        materialize(&mut project, &response).expect("first");
        let first = tree(temp.path());
        materialize(&mut project, &response).expect("second");

        assert_eq!(tree(temp.path()), first);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn fresh_mode_sweeps_files_missing_from_response() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut project = Project::fresh(temp.path(), false).expect("fresh");
        materialize(
            &mut project,
            &parsed(&[("main.py", "a"), ("old/helper.py", "b")]),
        )
        .expect("first");

        let materialization =
            materialize(&mut project, &parsed(&[("main.py", "c")])).expect("second");

        assert_eq!(
            tree(temp.path()),
            vec![("main.py".to_string(), "c".to_string())]
        );
        assert!(!temp.path().join("old").exists());
        assert_eq!(
            materialization.report().deleted,
            vec![PathBuf::from("old/helper.py")]
        );
        assert_eq!(project.files().len(), 1);
    }

    #[test]
    fn existing_mode_preserves_unmentioned_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("main.py"), "old").expect("write");
        fs::write(temp.path().join("README.md"), "docs").expect("write");
        let mut project = Project::load_existing(temp.path()).expect("load");

        materialize(&mut project, &parsed(&[("main.py", "new")])).expect("materialize");

        assert_eq!(
            tree(temp.path()),
            vec![
                ("README.md".to_string(), "docs".to_string()),
                ("main.py".to_string(), "new".to_string()),
            ]
        );
        assert_eq!(project.files().len(), 2);
    }

    #[test]
    fn existing_mode_applies_explicit_deletes() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("legacy")).expect("mkdir");
        fs::write(temp.path().join("legacy/old.py"), "x").expect("write");
        fs::write(temp.path().join("main.py"), "old").expect("write");
        let mut project = Project::load_existing(temp.path()).expect("load");
        let response = parse_response(
            r#"{"out_file":[
                {"file_name":"legacy/old.py","operation":"delete"},
                {"file_name":"main.py","code":"new"}]}"#,
        )
        .expect("parse");

        let materialization = materialize(&mut project, &response).expect("materialize");

        assert!(!temp.path().join("legacy").exists());
        assert_eq!(
            materialization.report().deleted,
            vec![PathBuf::from("legacy/old.py")]
        );
        assert!(!project.files().contains_key(Path::new("legacy/old.py")));
    }

    #[test]
    fn staging_leaves_no_residue_and_state_dir_survives() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut project = Project::fresh(temp.path(), false).expect("fresh");
        fs::create_dir_all(project.state_dir().join("attempts/1")).expect("mkdir");
        fs::write(project.state_dir().join("attempts/1/prompt.md"), "p").expect("write");

        materialize(&mut project, &parsed(&[("main.py", "x")])).expect("materialize");

        assert!(!project.state_dir().join(STAGING_DIR).exists());
        assert!(project.state_dir().join("attempts/1/prompt.md").is_file());
        let manifest =
            fs::read_to_string(project.state_dir().join(MANIFEST_FILE)).expect("manifest");
        assert!(manifest.contains("\"main.py\""));
    }

    #[test]
    fn load_existing_skips_state_binary_and_cache() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir_all(root.join(STATE_DIR)).expect("mkdir");
        fs::write(root.join(STATE_DIR).join("manifest.json"), "{}").expect("write");
        fs::create_dir_all(root.join("__pycache__")).expect("mkdir");
        fs::write(root.join("__pycache__/main.cpython.pyc"), "x").expect("write");
        fs::write(root.join("logo.png"), [0xff_u8, 0xfe, 0x00]).expect("write");
        fs::write(root.join("main.py"), "print(1)").expect("write");

        let project = Project::load_existing(root).expect("load");

        let keys: Vec<&Path> = project.files().keys().map(PathBuf::as_path).collect();
        assert_eq!(keys, vec![Path::new("main.py")]);
    }

    #[test]
    fn directory_tree_nests_files_under_directories() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("shop");
        let mut project = Project::fresh(&root, false).expect("fresh");
        materialize(
            &mut project,
            &parsed(&[
                ("main.py", "x"),
                ("app/routes.py", "x"),
                ("app/templates/index.html", "x"),
            ]),
        )
        .expect("materialize");

        assert_eq!(
            project.directory_tree(),
            "shop/\n  app/\n    routes.py\n    templates/\n      index.html\n  main.py\n"
        );
    }

    #[test]
    fn dependency_resolution_is_claimed_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut project = Project::fresh(temp.path(), false).expect("fresh");
        let mut materialization =
            materialize(&mut project, &parsed(&[("main.py", "x")])).expect("materialize");
        assert!(materialization.claim_dependency_resolution());
        assert!(!materialization.claim_dependency_resolution());
    }

    #[test]
    fn fresh_mode_replaces_a_file_with_a_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut project = Project::fresh(temp.path(), false).expect("fresh");
        materialize(&mut project, &parsed(&[("config", "DEBUG = 1\n")])).expect("first");

        let materialization = materialize(
            &mut project,
            &parsed(&[("config/settings.py", "DEBUG = 0\n")]),
        )
        .expect("second");

        assert_eq!(
            tree(temp.path()),
            vec![("config/settings.py".to_string(), "DEBUG = 0\n".to_string())]
        );
        assert_eq!(
            materialization.report().deleted,
            vec![PathBuf::from("config")]
        );
        assert!(!project.state_dir().join(BACKUP_DIR).exists());
    }

    #[test]
    fn fresh_mode_replaces_a_directory_with_a_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut project = Project::fresh(temp.path(), false).expect("fresh");
        materialize(
            &mut project,
            &parsed(&[("app/main.py", "a"), ("app/util.py", "b")]),
        )
        .expect("first");

        materialize(&mut project, &parsed(&[("app", "single module")])).expect("second");

        assert_eq!(
            tree(temp.path()),
            vec![("app".to_string(), "single module".to_string())]
        );
        let keys: Vec<&Path> = project.files().keys().map(PathBuf::as_path).collect();
        assert_eq!(keys, vec![Path::new("app")]);
    }

    #[test]
    fn existing_mode_drops_writes_that_conflict_with_the_tree() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("config"), "keep me").expect("write");
        fs::create_dir_all(temp.path().join("static")).expect("mkdir");
        fs::write(temp.path().join("static/site.css"), "body {}").expect("write");
        let mut project = Project::load_existing(temp.path()).expect("load");

        let materialization = materialize(
            &mut project,
            &parsed(&[
                ("config/settings.py", "x"),
                ("static", "x"),
                ("main.py", "print(1)"),
            ]),
        )
        .expect("materialize");

        assert_eq!(
            tree(temp.path()),
            vec![
                ("config".to_string(), "keep me".to_string()),
                ("main.py".to_string(), "print(1)".to_string()),
                ("static/site.css".to_string(), "body {}".to_string()),
            ]
        );
        let report = materialization.report();
        assert_eq!(report.written, vec![PathBuf::from("main.py")]);
        assert_eq!(report.dropped.len(), 2, "dropped: {:?}", report.dropped);
        assert!(report.dropped[0].contains("config is a file"));
        assert!(report.dropped[1].contains("is a directory"));
        assert!(!project.files().contains_key(Path::new("config/settings.py")));
    }

    #[test]
    fn existing_mode_delete_naming_a_directory_is_dropped() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("data")).expect("mkdir");
        fs::write(temp.path().join("data/seed.csv"), "id\n").expect("write");
        let mut project = Project::load_existing(temp.path()).expect("load");
        let response = parse_response(
            r#"{"out_file":[
                {"file_name":"data","operation":"delete"},
                {"file_name":"main.py","code":"print(1)"}]}"#,
        )
        .expect("parse");

        let materialization = materialize(&mut project, &response).expect("materialize");

        assert!(temp.path().join("data/seed.csv").is_file());
        assert!(materialization.report().deleted.is_empty());
        assert!(
            materialization.report().dropped[0].contains("delete data: is a directory"),
            "dropped: {:?}",
            materialization.report().dropped
        );
    }

    #[test]
    fn nothing_applicable_leaves_the_tree_alone() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("data")).expect("mkdir");
        fs::write(temp.path().join("data/seed.csv"), "id\n").expect("write");
        let mut project = Project::load_existing(temp.path()).expect("load");
        let response =
            parse_response(r#"{"out_file":[{"file_name":"data","operation":"delete"}]}"#)
                .expect("parse");

        let err = materialize(&mut project, &response).unwrap_err();

        match err {
            MaterializeError::NothingApplicable { dropped } => {
                assert_eq!(dropped, vec!["delete data: is a directory".to_string()]);
            }
            other => panic!("unexpected error: {other:#}"),
        }
        assert!(temp.path().join("data/seed.csv").is_file());
        assert!(!project.state_dir().join(STAGING_DIR).exists());
        assert!(!project.state_dir().join(MANIFEST_FILE).exists());
    }

    #[test]
    fn failed_commit_restores_the_previous_tree() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("main.py"), "old").expect("write");
        std::os::unix::fs::symlink(temp.path().join("missing"), temp.path().join("link"))
            .expect("symlink");
        let mut project = Project::fresh(temp.path(), true).expect("fresh");

        let err = materialize(
            &mut project,
            &parsed(&[("main.py", "new"), ("link/a.py", "x")]),
        )
        .unwrap_err();

        assert!(matches!(err, MaterializeError::Io(_)), "error: {err:#}");
        assert_eq!(
            fs::read_to_string(temp.path().join("main.py")).expect("read"),
            "old"
        );
        assert!(fs::symlink_metadata(temp.path().join("link")).is_ok());
        assert!(!project.state_dir().join(STAGING_DIR).exists());
        assert!(!project.state_dir().join(BACKUP_DIR).exists());
        assert!(project.files().is_empty());
    }

    #[test]
    fn journal_rollback_undoes_steps_newest_first() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("project");
        let backup = temp.path().join("backup");
        let staged = temp.path().join("staged.py");
        fs::create_dir_all(&root).expect("mkdir");
        fs::write(root.join("pkg"), "was a file").expect("write");
        fs::write(&staged, "new").expect("write");

        let mut journal = Journal::default();
        assert!(journal.displace(&root, &backup, Path::new("pkg")).expect("displace"));
        assert!(!journal.displace(&root, &backup, Path::new("absent")).expect("absent"));
        journal.create_parents(&root.join("pkg/sub")).expect("mkdirs");
        journal.place(&staged, &root.join("pkg/sub/mod.py")).expect("place");
        assert!(root.join("pkg/sub/mod.py").is_file());

        assert!(journal.rollback());

        assert_eq!(
            fs::read_to_string(root.join("pkg")).expect("read"),
            "was a file"
        );
        assert_eq!(fs::read_dir(&root).expect("read_dir").count(), 1);
    }

    #[test]
    fn project_type_is_recorded_and_reloaded() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut project = Project::fresh(temp.path(), false).expect("fresh");
        let response = parse_response(
            r#"{"project_type":"web","out_file":[{"file_name":"app.py","code":"x"}]}"#,
        )
        .expect("parse");
        materialize(&mut project, &response).expect("materialize");
        assert_eq!(project.project_type(), Some("web"));

        let reloaded = Project::load_existing(temp.path()).expect("load");
        assert_eq!(reloaded.project_type(), Some("web"));
    }

    #[test]
    fn attempt_numbers_continue_after_earlier_sessions() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join(STATE_DIR).join("attempts/3")).expect("mkdir");
        fs::write(temp.path().join("main.py"), "x").expect("write");

        let project = Project::load_existing(temp.path()).expect("load");

        assert_eq!(project.next_attempt_number(), 4);
        assert!(project.attempts().is_empty());
    }
}
