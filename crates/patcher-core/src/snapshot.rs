//! Versioned session snapshots for resume and replay.
//!
//! Each session is persisted as `<dir>/<session-id>.json`: an envelope
//! holding the snapshot and the SHA-256 of its canonical JSON. The file is
//! replaced atomically after every state transition, so the digest and the
//! snapshot it covers are never out of step. The revision number only ever
//! grows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::context::SessionContext;
use crate::domain::{PatcherError, Result, Session};
use crate::runtime::ResolvedRuntime;
use crate::workspace::AppliedPatch;

pub const SCHEMA_VERSION: u32 = 1;

/// Everything needed to resume a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub schema_version: u32,
    pub revision: u64,
    pub session: Session,
    pub context: SessionContext,
    /// Applied patch sets whose backups are still on disk, oldest first.
    #[serde(default)]
    pub applied: Vec<AppliedPatch>,
    pub saved_at: DateTime<Utc>,
}

impl SessionSnapshot {
    pub fn runtime(&self) -> Option<&ResolvedRuntime> {
        self.context.code.runtime.as_ref()
    }
}

/// On-disk form of a snapshot.
#[derive(Serialize, Deserialize)]
struct Envelope {
    sha256: String,
    snapshot: serde_json::Value,
}

/// Digest of the canonical (compact, key-sorted) encoding of `value`.
fn canonical_digest(value: &serde_json::Value) -> Result<String> {
    Ok(hex::encode(Sha256::digest(serde_json::to_vec(value)?)))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| PatcherError::Snapshot(format!("no parent for {}", path.display())))?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Read and verify a snapshot file.
pub fn load_snapshot(path: &Path) -> Result<SessionSnapshot> {
    let bytes = fs::read(path)
        .map_err(|e| PatcherError::Snapshot(format!("cannot read {}: {e}", path.display())))?;
    let envelope: Envelope = serde_json::from_slice(&bytes)
        .map_err(|e| PatcherError::Snapshot(format!("malformed snapshot {}: {e}", path.display())))?;
    let actual = canonical_digest(&envelope.snapshot)?;
    if envelope.sha256 != actual {
        return Err(PatcherError::Snapshot(format!(
            "digest mismatch for {}: expected {}, got {actual}",
            path.display(),
            envelope.sha256
        )));
    }
    let snapshot: SessionSnapshot = serde_json::from_value(envelope.snapshot)?;
    if snapshot.schema_version != SCHEMA_VERSION {
        return Err(PatcherError::Snapshot(format!(
            "unsupported schema version {} (expected {SCHEMA_VERSION})",
            snapshot.schema_version
        )));
    }
    Ok(snapshot)
}

/// Directory of session snapshots.
#[derive(Debug)]
pub struct SnapshotStore {
    dir: PathBuf,
    revisions: Mutex<HashMap<Uuid, u64>>,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            revisions: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, session_id: Uuid) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }

    fn revision_on_disk(&self, session_id: Uuid) -> u64 {
        let path = self.path_for(session_id);
        if !path.is_file() {
            return 0;
        }
        match load_snapshot(&path) {
            Ok(snapshot) => snapshot.revision,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable snapshot");
                0
            }
        }
    }

    /// Persist a new revision. Returns the revision written.
    pub fn save(
        &self,
        session: &Session,
        context: &SessionContext,
        applied: &[AppliedPatch],
    ) -> Result<u64> {
        let id = session.id();
        let mut revisions = self
            .revisions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let last = match revisions.get(&id) {
            Some(rev) => *rev,
            None => self.revision_on_disk(id),
        };
        let revision = last + 1;

        let snapshot = SessionSnapshot {
            schema_version: SCHEMA_VERSION,
            revision,
            session: session.clone(),
            context: context.clone(),
            applied: applied.to_vec(),
            saved_at: Utc::now(),
        };
        self.write(&snapshot)?;
        revisions.insert(id, revision);
        tracing::trace!(session = %id, revision, state = %session.state(), "snapshot saved");
        Ok(revision)
    }

    /// Write an externally built snapshot, rejecting revision regressions.
    pub fn write(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let path = self.path_for(snapshot.session.id());
        if path.is_file() {
            let current = self.revision_on_disk(snapshot.session.id());
            if snapshot.revision <= current {
                return Err(PatcherError::Snapshot(format!(
                    "revision regression: {} <= {current}",
                    snapshot.revision
                )));
            }
        }
        let snapshot = serde_json::to_value(snapshot)?;
        let envelope = Envelope {
            sha256: canonical_digest(&snapshot)?,
            snapshot,
        };
        write_atomic(&path, &serde_json::to_vec_pretty(&envelope)?)
    }

    pub fn load(&self, session_id: Uuid) -> Result<SessionSnapshot> {
        let snapshot = load_snapshot(&self.path_for(session_id))?;
        self.revisions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(session_id, snapshot.revision);
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Budgets;

    fn store() -> (tempfile::TempDir, SnapshotStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path().join("sessions")).expect("store");
        (dir, store)
    }

    #[test]
    fn test_revisions_are_monotonic() {
        let (_dir, store) = store();
        let session = Session::new("/tmp/repo", Budgets::default());
        let ctx = SessionContext::default();
        assert_eq!(store.save(&session, &ctx, &[]).expect("save"), 1);
        assert_eq!(store.save(&session, &ctx, &[]).expect("save"), 2);

        let loaded = store.load(session.id()).expect("load");
        assert_eq!(loaded.revision, 2);
        assert_eq!(loaded.schema_version, SCHEMA_VERSION);
        assert_eq!(loaded.session, session);
    }

    #[test]
    fn test_revision_continues_from_disk() {
        let (dir, store) = store();
        let session = Session::new("/tmp/repo", Budgets::default());
        store.save(&session, &SessionContext::default(), &[]).expect("save");
        drop(store);

        let reopened = SnapshotStore::new(dir.path().join("sessions")).expect("store");
        assert_eq!(
            reopened.save(&session, &SessionContext::default(), &[]).expect("save"),
            2
        );
    }

    #[test]
    fn test_regression_is_rejected() {
        let (_dir, store) = store();
        let session = Session::new("/tmp/repo", Budgets::default());
        store.save(&session, &SessionContext::default(), &[]).expect("save");
        store.save(&session, &SessionContext::default(), &[]).expect("save");

        let mut stale = store.load(session.id()).expect("load");
        stale.revision = 1;
        let err = store.write(&stale).expect_err("regression");
        assert!(matches!(err, PatcherError::Snapshot(ref m) if m.contains("regression")));
    }

    #[test]
    fn test_tampered_snapshot_fails_digest_check() {
        let (_dir, store) = store();
        let session = Session::new("/tmp/repo", Budgets::default());
        store.save(&session, &SessionContext::default(), &[]).expect("save");
        let path = store.path_for(session.id());
        let mut text = fs::read_to_string(&path).expect("read");
        text = text.replace("\"ingest\"", "\"plan\"");
        fs::write(&path, text).expect("write");

        let err = load_snapshot(&path).expect_err("tampered");
        assert!(matches!(err, PatcherError::Snapshot(ref m) if m.contains("digest mismatch")));
    }

    #[test]
    fn test_snapshot_and_digest_share_one_file() {
        let (_dir, store) = store();
        let session = Session::new("/tmp/repo", Budgets::default());
        store.save(&session, &SessionContext::default(), &[]).expect("save");
        store.save(&session, &SessionContext::default(), &[]).expect("save");

        let entries: Vec<_> = fs::read_dir(store.dir())
            .expect("read dir")
            .map(|e| e.expect("entry").file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from(format!("{}.json", session.id()))]);

        let path = store.path_for(session.id());
        let envelope: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).expect("read")).expect("json");
        assert_eq!(envelope["sha256"].as_str().map(str::len), Some(64));
        assert_eq!(envelope["snapshot"]["revision"], 2);
        assert_eq!(load_snapshot(&path).expect("load").revision, 2);
    }
}
