//! Repository access: reading files and applying approved patch sets
//! atomically with backup and rollback.
//!
//! Backups live under `.repo-patcher/backups/<session>/<patch-set>/` and are
//! kept until the patch is committed or rolled back. Line anchors in a
//! patch refer to the file as it was before the patch set.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::context::collect_file_tree;
use crate::domain::{Modification, ModificationKind, PatcherError, Result};
use crate::safety::ApprovedPatchSet;

/// Directory under the repository root that holds repo-patcher state.
pub const STATE_DIR_NAME: &str = ".repo-patcher";

/// Backup of one file touched by an applied patch set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBackup {
    pub path: String,
    /// False when the patch created the file.
    pub existed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_file: Option<PathBuf>,
    /// SHA-256 of the original bytes, checked before restoring.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_sha256: Option<String>,
}

/// Record of an applied, not yet committed patch set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedPatch {
    pub patch_set_id: Uuid,
    pub backup_dir: PathBuf,
    pub files: Vec<FileBackup>,
}

/// Repository operations the repair loop depends on.
pub trait Workspace: Send + Sync {
    fn root(&self) -> &Path;

    fn read_file(&self, path: &str) -> Result<String>;

    fn file_tree(&self, limit: usize) -> Result<Vec<String>>;

    /// Apply every modification or none, keeping a backup of each file.
    fn apply(&self, patch: &ApprovedPatchSet) -> Result<AppliedPatch>;

    /// Restore the files of `applied` byte-for-byte.
    fn rollback(&self, applied: &AppliedPatch) -> Result<()>;

    /// Discard backups, making `applied` permanent.
    fn commit(&self, applied: &AppliedPatch) -> Result<()>;
}

/// [`Workspace`] over a local directory.
#[derive(Debug, Clone)]
pub struct FsWorkspace {
    root: PathBuf,
    backups: PathBuf,
}

impl FsWorkspace {
    pub fn new(root: impl Into<PathBuf>, session_id: Uuid) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(PatcherError::unrecoverable(format!(
                "repository not accessible: {}",
                root.display()
            )));
        }
        let backups = root
            .join(STATE_DIR_NAME)
            .join("backups")
            .join(session_id.to_string());
        Ok(Self { root, backups })
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let rel = Path::new(path);
        let safe = !path.is_empty()
            && rel.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        let first = rel.components().find_map(|c| match c {
            Component::Normal(name) => name.to_str(),
            _ => None,
        });
        if !safe || matches!(first, Some(STATE_DIR_NAME) | Some(".git")) {
            return Err(PatcherError::PatchApplication {
                path: path.to_string(),
                reason: "path escapes the repository or targets internal state".into(),
            });
        }
        let full = self.root.join(rel);
        self.ensure_contained(path, &full)?;
        Ok(full)
    }

    /// Follow symlinks on the deepest existing ancestor of `full` and require
    /// the result to stay under the repository root.
    fn ensure_contained(&self, path: &str, full: &Path) -> Result<()> {
        let root = self.root.canonicalize()?;
        let existing = full
            .ancestors()
            .find(|p| p.symlink_metadata().is_ok())
            .unwrap_or(self.root.as_path());
        let contained = existing
            .canonicalize()
            .map(|resolved| resolved.starts_with(&root))
            .unwrap_or(false);
        if !contained {
            return Err(patch_error(path, "path resolves outside the repository through a symlink"));
        }
        Ok(())
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Write `bytes` to `path` through a temp file in the same directory.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().ok_or_else(|| {
        PatcherError::unrecoverable(format!("no parent directory for {}", path.display()))
    })?;
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn patch_error(path: &str, reason: impl Into<String>) -> PatcherError {
    PatcherError::PatchApplication {
        path: path.to_string(),
        reason: reason.into(),
    }
}

/// Apply `mods` to `original`, returning the new file contents.
pub fn apply_modifications(path: &str, original: Option<&str>, mods: &[&Modification]) -> Result<String> {
    if mods.iter().any(|m| m.kind == ModificationKind::Create) {
        if mods.len() != 1 {
            return Err(patch_error(path, "create cannot be combined with other edits"));
        }
        if original.is_some() {
            return Err(patch_error(path, "file already exists"));
        }
        return Ok(mods[0].content.clone());
    }
    let Some(original) = original else {
        return Err(patch_error(path, "file does not exist"));
    };

    let newline = if original.contains("\r\n") { "\r\n" } else { "\n" };
    let mut lines: Vec<String> = original.split_inclusive('\n').map(str::to_string).collect();
    let line_count = lines.len();

    // Descending anchors keep earlier anchors valid; ties run in reverse so
    // same-anchor inserts end up in patch order.
    let mut ordered: Vec<(usize, &Modification)> = mods.iter().copied().enumerate().collect();
    ordered.sort_by(|(ia, a), (ib, b)| {
        let la = a.line.unwrap_or(line_count + 1);
        let lb = b.line.unwrap_or(line_count + 1);
        lb.cmp(&la).then(ib.cmp(ia))
    });

    let to_lines = |content: &str| -> Vec<String> {
        content.lines().map(|l| format!("{l}{newline}")).collect()
    };

    for (_, m) in ordered {
        let anchor = m.line.unwrap_or(line_count + 1);
        match m.kind {
            ModificationKind::Insert => {
                if anchor == 0 || anchor > line_count + 1 {
                    return Err(patch_error(path, format!("insert anchor {anchor} out of range")));
                }
                if anchor == line_count + 1 {
                    if let Some(last) = lines.last_mut() {
                        if !last.ends_with('\n') {
                            last.push_str(newline);
                        }
                    }
                }
                let idx = (anchor - 1).min(lines.len());
                for (offset, line) in to_lines(&m.content).into_iter().enumerate() {
                    lines.insert(idx + offset, line);
                }
            }
            ModificationKind::Replace | ModificationKind::Delete => {
                if anchor == 0 || anchor > line_count || anchor > lines.len() {
                    return Err(patch_error(path, format!("line {anchor} out of range")));
                }
                let idx = anchor - 1;
                if let Some(expected) = &m.expected {
                    let current = lines[idx].trim_end_matches(['\r', '\n']);
                    if current.trim_end() != expected.trim_end() {
                        return Err(patch_error(
                            path,
                            format!("line {anchor} is {current:?}, expected {expected:?}"),
                        ));
                    }
                }
                let removed = lines.remove(idx);
                if m.kind == ModificationKind::Replace {
                    let had_newline = removed.ends_with('\n');
                    let mut replacement = to_lines(&m.content);
                    if !had_newline {
                        if let Some(last) = replacement.last_mut() {
                            let trimmed = last.trim_end_matches(['\r', '\n']).len();
                            last.truncate(trimmed);
                        }
                    }
                    for (offset, line) in replacement.into_iter().enumerate() {
                        lines.insert(idx + offset, line);
                    }
                }
            }
            ModificationKind::Create => {
                return Err(patch_error(path, "create cannot be combined with other edits"));
            }
        }
    }
    Ok(lines.concat())
}

impl Workspace for FsWorkspace {
    fn root(&self) -> &Path {
        &self.root
    }

    fn read_file(&self, path: &str) -> Result<String> {
        let full = self.resolve(path)?;
        Ok(fs::read_to_string(full)?)
    }

    fn file_tree(&self, limit: usize) -> Result<Vec<String>> {
        collect_file_tree(&self.root, limit)
    }

    fn apply(&self, approved: &ApprovedPatchSet) -> Result<AppliedPatch> {
        let patch_set = approved.patch_set();

        // Group modifications per file, preserving first-seen order.
        let mut by_file: BTreeMap<usize, (&str, Vec<&Modification>)> = BTreeMap::new();
        let order = patch_set.touched_paths();
        for patch in &patch_set.patches {
            let Some(pos) = order.iter().position(|p| *p == patch.file_path) else {
                continue;
            };
            by_file
                .entry(pos)
                .or_insert_with(|| (patch.file_path.as_str(), Vec::new()))
                .1
                .extend(patch.modifications.iter());
        }

        // Compute every new file in memory before touching disk.
        let mut staged = Vec::new();
        for (path, mods) in by_file.into_values() {
            let full = self.resolve(path)?;
            let original = if full.is_file() {
                Some(fs::read(&full)?)
            } else {
                None
            };
            let original_text = original
                .as_deref()
                .map(|b| {
                    std::str::from_utf8(b).map_err(|_| patch_error(path, "file is not valid UTF-8"))
                })
                .transpose()?;
            let updated = apply_modifications(path, original_text, &mods)?;
            staged.push((path, full, original, updated));
        }

        let backup_dir = self.backups.join(patch_set.id.to_string());
        fs::create_dir_all(&backup_dir)?;
        let mut files = Vec::new();
        for (idx, (path, _, original, _)) in staged.iter().enumerate() {
            let backup = match original {
                Some(bytes) => {
                    let backup_file = backup_dir.join(format!("{idx}.bak"));
                    write_atomic(&backup_file, bytes)?;
                    FileBackup {
                        path: path.to_string(),
                        existed: true,
                        backup_file: Some(backup_file),
                        original_sha256: Some(sha256_hex(bytes)),
                    }
                }
                None => FileBackup {
                    path: path.to_string(),
                    existed: false,
                    backup_file: None,
                    original_sha256: None,
                },
            };
            files.push(backup);
        }
        let applied = AppliedPatch {
            patch_set_id: patch_set.id,
            backup_dir,
            files,
        };

        for (written, (path, full, _, updated)) in staged.iter().enumerate() {
            if let Err(err) = write_atomic(full, updated.as_bytes()) {
                tracing::warn!(path, error = %err, "patch write failed, restoring");
                let partial = AppliedPatch {
                    files: applied.files[..written].to_vec(),
                    ..applied.clone()
                };
                self.rollback(&partial)?;
                return Err(patch_error(path, err.to_string()));
            }
        }

        tracing::debug!(
            patch_set = %patch_set.id,
            files = applied.files.len(),
            "patch set applied"
        );
        Ok(applied)
    }

    fn rollback(&self, applied: &AppliedPatch) -> Result<()> {
        for backup in applied.files.iter().rev() {
            let full = self.resolve(&backup.path)?;
            match (&backup.backup_file, backup.existed) {
                (Some(backup_file), true) => {
                    let bytes = fs::read(backup_file)?;
                    if let Some(expected) = &backup.original_sha256 {
                        if sha256_hex(&bytes) != *expected {
                            return Err(PatcherError::unrecoverable(format!(
                                "backup of {} is corrupt",
                                backup.path
                            )));
                        }
                    }
                    write_atomic(&full, &bytes)?;
                }
                _ => {
                    if full.is_file() {
                        fs::remove_file(&full)?;
                    }
                }
            }
        }
        remove_dir_if_present(&applied.backup_dir)?;
        Ok(())
    }

    fn commit(&self, applied: &AppliedPatch) -> Result<()> {
        remove_dir_if_present(&applied.backup_dir)
    }
}

fn remove_dir_if_present(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
