//! Branch management through the `git` CLI.
//!
//! The engine only needs two things from version control: be on the plan's
//! branch before the first story, and commit after each story that passes. We
//! keep a small, explicit wrapper around `git` subprocess calls.

use std::path::PathBuf;
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

/// Version-control operations the engine drives.
pub trait BranchManager: Send + Sync {
    /// Check out `name`, creating it at the current HEAD if it does not exist.
    fn ensure_branch(&self, name: &str) -> Result<()>;

    /// Stage everything and commit. Returns `false` when there was nothing to commit.
    fn commit(&self, message: &str) -> Result<bool>;
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    /// Pathspecs (relative to `workdir`) never staged by [`Git::add_all`].
    excluded: Vec<String>,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            excluded: Vec::new(),
        }
    }

    pub fn with_excluded(mut self, patterns: impl IntoIterator<Item = String>) -> Self {
        self.excluded.extend(patterns);
        self
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (refuse to switch branches)"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Create and checkout a new branch at current HEAD.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_new_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "creating and checking out new branch");
        self.run_checked(&["checkout", "-b", branch])?;
        Ok(())
    }

    /// Checkout an existing branch.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch");
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    /// Stage all changes in the repository except the excluded paths (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        let excludes: Vec<String> = self
            .excluded
            .iter()
            .map(|pattern| format!(":(exclude){pattern}"))
            .collect();
        let mut args = vec!["add", "-A", "--", ":/"];
        args.extend(excludes.iter().map(String::as_str));
        self.run_checked(&args)?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

impl BranchManager for Git {
    #[instrument(skip(self))]
    fn ensure_branch(&self, name: &str) -> Result<()> {
        if self.current_branch()? == name {
            debug!("already on target branch");
            return Ok(());
        }
        let switched = if self.branch_exists(name)? {
            self.checkout_branch(name)
        } else {
            info!(branch = name, "creating branch");
            self.checkout_new_branch(name)
        };
        switched.with_context(|| format!("switch to branch {name}"))
    }

    fn commit(&self, message: &str) -> Result<bool> {
        self.add_all()?;
        self.commit_staged(message)
    }
}
