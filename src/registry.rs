//! SessionRegistry (C5): the process-wide directory of sessions.
//!
//! On startup, scans the control directory, reads each `meta.json`, and
//! flips the status of any entry whose recorded pid is no longer alive —
//! also writing the `exit` marker file so a later `cleanup_exited` can find
//! directories orphaned by a previous process run.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;
use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::protocol::{CreateSessionRequest, SessionInfo, SessionStatus};
use crate::session::Session;

/// Directory-scan check for whether a pid is still alive and not a zombie.
/// A zombie has already exited from the kernel's point of view but hasn't
/// been reaped by its parent; treating it as alive would let a registry
/// reconcile mistake a dead child for a running one.
pub fn is_pid_alive(pid: u32) -> bool {
    let output = ProcessCommand::new("ps")
        .args(["-p", &pid.to_string(), "-o", "stat="])
        .output();

    match output {
        Ok(output) if output.status.success() => {
            let stat = String::from_utf8_lossy(&output.stdout);
            !stat.trim().starts_with('Z')
        }
        _ => false,
    }
}

/// Process-wide directory of sessions. `create`/`delete` take the exclusive
/// lock; `get`/`list` take the shared lock (single-writer/multi-reader).
/// Sessions this process did not spawn (found on disk after a restart) are
/// never re-adopted as live `Session`s, but their `meta.json` descriptor is
/// still surfaced by `list`/`get` until `cleanup_exited` removes the
/// directory.
pub struct SessionRegistry {
    control_path: PathBuf,
    live: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new(control_path: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            control_path,
            live: RwLock::new(HashMap::new()),
        })
    }

    pub fn control_path(&self) -> &Path {
        &self.control_path
    }

    /// Scans the control directory for leftover sessions from a previous
    /// process and patches their on-disk status so `cleanup_exited` can find
    /// them. Must run once, before the HTTP listener binds.
    pub fn reconcile_on_start(&self) {
        let Ok(entries) = fs::read_dir(&self.control_path) else {
            return;
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if let Err(err) = self.reconcile_one(&path) {
                warn!(dir = %path.display(), %err, "failed to reconcile control directory entry");
            }
        }
    }

    fn reconcile_one(&self, dir: &Path) -> Result<()> {
        let meta_path = dir.join("meta.json");
        let Ok(content) = fs::read_to_string(&meta_path) else {
            return Ok(());
        };
        let mut info: SessionInfo = serde_json::from_str(&content)?;

        if info.status != SessionStatus::Running {
            return Ok(());
        }
        if let Some(pid) = info.pid {
            if is_pid_alive(pid) {
                return Ok(());
            }
        }

        info!(session_id = %info.id, "reconciling orphaned session as exited");
        info.status = SessionStatus::Exited;
        info.exit_code.get_or_insert(-1);
        info.pid = None;

        fs::write(&meta_path, serde_json::to_string_pretty(&info)?)?;
        let exit_path = dir.join("exit");
        if !exit_path.exists() {
            fs::write(exit_path, info.exit_code.unwrap_or(-1).to_string())?;
        }
        Ok(())
    }

    pub fn create(&self, req: CreateSessionRequest) -> Result<String> {
        let session = Session::create(&self.control_path, req)?;
        let id = session.id.clone();
        self.live.write().unwrap().insert(id.clone(), session);
        Ok(id)
    }

    /// Returns the live handle for `id`, if this process holds one. `None`
    /// for an unknown id *and* for a disk-only descriptor left by a prior
    /// process run (callers needing the descriptor should use `get`).
    pub fn get_live(&self, id: &str) -> Option<Arc<Session>> {
        self.live.read().unwrap().get(id).cloned()
    }

    pub fn get(&self, id: &str) -> Result<SessionInfo> {
        if let Some(session) = self.get_live(id) {
            return session.info();
        }
        read_disk_descriptor(&self.control_path, id)
            .ok_or_else(|| Error::NotFound(format!("session {id} not found")))
    }

    pub fn list(&self) -> Result<Vec<SessionInfo>> {
        let live = self.live.read().unwrap();
        let mut descriptors: Vec<SessionInfo> = live
            .values()
            .filter_map(|session| session.info().ok())
            .collect();
        let known_ids: std::collections::HashSet<&str> =
            live.keys().map(String::as_str).collect();

        if let Ok(entries) = fs::read_dir(&self.control_path) {
            for entry in entries.flatten() {
                let path = entry.path();
                let Some(id) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if known_ids.contains(id) {
                    continue;
                }
                if let Some(info) = read_disk_descriptor(&self.control_path, id) {
                    descriptors.push(info);
                }
            }
        }

        descriptors.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(descriptors)
    }

    /// Terminates a running session (if live in this process) and removes
    /// its on-disk control directory. Idempotent: deleting an already-gone
    /// id is not an error.
    pub fn delete(&self, id: &str) -> Result<()> {
        if let Some(session) = self.live.write().unwrap().remove(id) {
            Session::kill(&session)?;
            // best-effort: give the kill protocol a brief head start so the
            // recording file is flushed and closed before we unlink it.
            for _ in 0..20 {
                if session.is_exited() {
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
        }

        let dir = self.control_path.join(id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    pub fn cleanup_exited(&self) -> Result<Vec<String>> {
        let mut removed = Vec::new();

        let exited_live: Vec<String> = self
            .live
            .read()
            .unwrap()
            .iter()
            .filter(|(_, s)| s.is_exited())
            .map(|(id, _)| id.clone())
            .collect();
        for id in exited_live {
            self.live.write().unwrap().remove(&id);
            let dir = self.control_path.join(&id);
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
            removed.push(id);
        }

        if let Ok(entries) = fs::read_dir(&self.control_path) {
            for entry in entries.flatten() {
                let path = entry.path();
                let Some(id) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if self.live.read().unwrap().contains_key(id) {
                    continue;
                }
                if let Some(info) = read_disk_descriptor(&self.control_path, id) {
                    if info.status == SessionStatus::Exited {
                        fs::remove_dir_all(&path)?;
                        removed.push(id.to_string());
                    }
                }
            }
        }

        Ok(removed)
    }
}

fn read_disk_descriptor(control_path: &Path, id: &str) -> Option<SessionInfo> {
    let content = fs::read_to_string(control_path.join(id).join("meta.json")).ok()?;
    serde_json::from_str(&content).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn create_req(command: Vec<String>) -> CreateSessionRequest {
        CreateSessionRequest {
            command,
            working_dir: None,
            env: HashMap::new(),
            width: 80,
            height: 24,
            term: None,
            name: None,
        }
    }

    #[test]
    fn create_then_list_then_delete() {
        let dir = TempDir::new().unwrap();
        let registry = SessionRegistry::new(dir.path().to_path_buf());

        let id = registry
            .create(create_req(vec!["/bin/sleep".to_string(), "5".to_string()]))
            .unwrap();

        let list = registry.list().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, id);

        registry.delete(&id).unwrap();
        assert!(registry.get(&id).is_err());
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let registry = SessionRegistry::new(dir.path().to_path_buf());
        let id = registry
            .create(create_req(vec!["/bin/echo".to_string(), "hi".to_string()]))
            .unwrap();

        registry.delete(&id).unwrap();
        // Second delete of the same (now-unknown) id must not error.
        registry.delete(&id).unwrap();
    }

    #[test]
    fn cleanup_exited_removes_only_finished_sessions() {
        let dir = TempDir::new().unwrap();
        let registry = SessionRegistry::new(dir.path().to_path_buf());

        let short = registry
            .create(create_req(vec!["/bin/echo".to_string(), "done".to_string()]))
            .unwrap();
        let long = registry
            .create(create_req(vec!["/bin/sleep".to_string(), "5".to_string()]))
            .unwrap();

        for _ in 0..100 {
            if registry.get_live(&short).unwrap().is_exited() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }

        let removed = registry.cleanup_exited().unwrap();
        assert_eq!(removed, vec![short.clone()]);
        assert!(registry.get(&short).is_err());
        assert!(registry.get(&long).is_ok());

        registry.delete(&long).unwrap();
    }

    #[test]
    fn reconcile_marks_orphaned_running_descriptor_as_exited() {
        let dir = TempDir::new().unwrap();
        let id = "orphan-1";
        let session_dir = dir.path().join(id);
        fs::create_dir_all(&session_dir).unwrap();
        let info = SessionInfo {
            id: id.to_string(),
            command: vec!["/bin/sh".to_string()],
            working_dir: "/tmp".to_string(),
            env: HashMap::new(),
            width: 80,
            height: 24,
            term: "xterm-256color".to_string(),
            name: "sh".to_string(),
            started_at: jiff::Timestamp::now(),
            status: SessionStatus::Running,
            exit_code: None,
            pid: Some(999_999),
            waiting: false,
            recording_truncated: false,
        };
        fs::write(session_dir.join("meta.json"), serde_json::to_string(&info).unwrap()).unwrap();

        let registry = SessionRegistry::new(dir.path().to_path_buf());
        registry.reconcile_on_start();

        let reconciled = registry.get(id).unwrap();
        assert_eq!(reconciled.status, SessionStatus::Exited);
        assert!(session_dir.join("exit").exists());
    }
}
