/*
 * Copyright (C) 2026 Mark Wells Dev
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Workspace provisioning.
//!
//! The proxy core only depends on the [`WorkspaceProvisioner`] and
//! [`HookRunner`] traits; how bytes actually land in a session's cache
//! directory is a deployment concern. The defaults here mirror a local
//! source tree and run hook programs as child processes.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use ignore::WalkBuilder;
use tokio::process::Command;
use tracing::debug;
use wildmatch::WildMatch;

/// Fills and maintains a session's workspace cache directory.
#[async_trait]
pub trait WorkspaceProvisioner: Send + Sync {
    /// Populates `cache_dir`. When `globs` is non-empty, only files whose
    /// basename matches one of the globs are materialized; an empty list
    /// means no filter.
    async fn clone_into(&self, cache_dir: &Path, globs: &[String]) -> Result<()>;

    /// Removes the named workspace folder from `cache_dir`.
    async fn remove(&self, cache_dir: &Path, workspace_name: &str) -> Result<()>;
}

/// Runs operator-supplied programs against a cache directory.
#[async_trait]
pub trait HookRunner: Send + Sync {
    /// Runs `program` with `cache_dir` as working directory and sole
    /// argument.
    async fn run(&self, program: &Path, cache_dir: &Path) -> Result<()>;
}

/// Default provisioner: mirrors a local source tree into the cache
/// directory.
///
/// Every file is copied, hidden files included; ignore files are not
/// honored, since the language server may need files a VCS would skip.
pub struct MirrorProvisioner {
    source: PathBuf,
}

impl MirrorProvisioner {
    #[must_use]
    pub const fn new(source: PathBuf) -> Self {
        Self { source }
    }
}

#[async_trait]
impl WorkspaceProvisioner for MirrorProvisioner {
    async fn clone_into(&self, cache_dir: &Path, globs: &[String]) -> Result<()> {
        let source = self.source.clone();
        let dest = cache_dir.to_path_buf();
        let globs: Vec<WildMatch> = globs.iter().map(|g| WildMatch::new(g)).collect();

        // The directory walk is synchronous; keep it off the runtime.
        tokio::task::spawn_blocking(move || mirror_tree(&source, &dest, &globs))
            .await
            .context("mirror task panicked")?
    }

    async fn remove(&self, cache_dir: &Path, workspace_name: &str) -> Result<()> {
        // The folder name comes off the wire; never let it climb out of the
        // cache directory.
        if workspace_name.is_empty()
            || workspace_name.contains('/')
            || workspace_name.contains("..")
        {
            bail!("refusing to remove workspace with unsafe name {workspace_name:?}");
        }

        let target = cache_dir.join(workspace_name);
        if !target.exists() {
            debug!("workspace {workspace_name} not present in cache, nothing to remove");
            return Ok(());
        }
        tokio::fs::remove_dir_all(&target)
            .await
            .with_context(|| format!("removing {}", target.display()))
    }
}

/// Copies `source` recursively into `dest`, filtering files by basename glob
/// when `globs` is non-empty.
fn mirror_tree(source: &Path, dest: &Path, globs: &[WildMatch]) -> Result<()> {
    if !source.is_dir() {
        bail!("workspace source {} is not a directory", source.display());
    }

    let walker = WalkBuilder::new(source)
        .hidden(false)
        .ignore(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .build();

    for entry in walker {
        let entry = entry.context("walking workspace source failed")?;
        let path = entry.path();
        if path == source {
            continue;
        }

        let rel = path
            .strip_prefix(source)
            .context("walked path escaped the source root")?;
        let target = dest.join(rel);

        if entry.file_type().is_some_and(|t| t.is_dir()) {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("creating {}", target.display()))?;
            continue;
        }

        if !globs.is_empty() {
            let matches = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| globs.iter().any(|glob| glob.matches(name)));
            if !matches {
                continue;
            }
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        std::fs::copy(path, &target)
            .with_context(|| format!("copying {} to {}", path.display(), target.display()))?;
    }

    Ok(())
}

/// Default hook runner: executes the hook as a child process.
pub struct CommandHookRunner;

#[async_trait]
impl HookRunner for CommandHookRunner {
    async fn run(&self, program: &Path, cache_dir: &Path) -> Result<()> {
        let status = Command::new(program)
            .arg(cache_dir)
            .current_dir(cache_dir)
            .status()
            .await
            .with_context(|| format!("running hook {}", program.display()))?;

        if !status.success() {
            bail!("hook {} exited with {status}", program.display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mirror_copies_everything_without_globs() -> Result<()> {
        let source = tempfile::tempdir()?;
        let dest = tempfile::tempdir()?;
        std::fs::write(source.path().join("a.py"), "print(1)\n")?;
        std::fs::create_dir(source.path().join("sub"))?;
        std::fs::write(source.path().join("sub/b.txt"), "b")?;
        std::fs::write(source.path().join(".hidden"), "h")?;

        let provisioner = MirrorProvisioner::new(source.path().to_path_buf());
        provisioner.clone_into(dest.path(), &[]).await?;

        assert!(dest.path().join("a.py").is_file());
        assert!(dest.path().join("sub/b.txt").is_file());
        assert!(dest.path().join(".hidden").is_file());
        Ok(())
    }

    #[tokio::test]
    async fn test_mirror_filters_by_basename_glob() -> Result<()> {
        let source = tempfile::tempdir()?;
        let dest = tempfile::tempdir()?;
        std::fs::write(source.path().join("a.py"), "")?;
        std::fs::write(source.path().join("b.rs"), "")?;
        std::fs::create_dir(source.path().join("sub"))?;
        std::fs::write(source.path().join("sub/c.py"), "")?;

        let provisioner = MirrorProvisioner::new(source.path().to_path_buf());
        provisioner
            .clone_into(dest.path(), &["*.py".to_string()])
            .await?;

        assert!(dest.path().join("a.py").is_file());
        assert!(dest.path().join("sub/c.py").is_file());
        assert!(!dest.path().join("b.rs").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_mirror_fails_on_missing_source() {
        let dest = tempfile::tempdir().expect("tempdir");
        let provisioner = MirrorProvisioner::new(PathBuf::from("/definitely/not/here"));
        let result = provisioner.clone_into(dest.path(), &[]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_remove_deletes_named_folder() -> Result<()> {
        let cache = tempfile::tempdir()?;
        std::fs::create_dir(cache.path().join("proj"))?;
        std::fs::write(cache.path().join("proj/x"), "")?;

        let provisioner = MirrorProvisioner::new(PathBuf::new());
        provisioner.remove(cache.path(), "proj").await?;
        assert!(!cache.path().join("proj").exists());

        // Removing something already gone is not an error.
        provisioner.remove(cache.path(), "proj").await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_rejects_escaping_names() {
        let cache = tempfile::tempdir().expect("tempdir");
        let provisioner = MirrorProvisioner::new(PathBuf::new());
        for name in ["", "..", "../x", "a/b"] {
            assert!(
                provisioner.remove(cache.path(), name).await.is_err(),
                "name {name:?} should be rejected"
            );
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hook_runner_passes_cache_dir() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let cache = tempfile::tempdir()?;
        let hooks = tempfile::tempdir()?;
        let hook = hooks.path().join("hook.sh");
        std::fs::write(&hook, "#!/bin/sh\ntouch \"$1/hook_ran\"\n")?;
        std::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755))?;

        CommandHookRunner.run(&hook, cache.path()).await?;
        assert!(cache.path().join("hook_ran").is_file());
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hook_runner_reports_nonzero_exit() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let cache = tempfile::tempdir()?;
        let hooks = tempfile::tempdir()?;
        let hook = hooks.path().join("hook.sh");
        std::fs::write(&hook, "#!/bin/sh\nexit 3\n")?;
        std::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755))?;

        assert!(CommandHookRunner.run(&hook, cache.path()).await.is_err());
        Ok(())
    }
}
