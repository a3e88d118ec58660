// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The shared session table (spec.md §4.1), grounded on the teacher's
//! `Server.shells: Arc<Mutex<HashMap<String, Box<Session>>>>` plus
//! `AnalyseDeCircuit-OxideTerm`'s `BridgeManager` register/unregister/
//! broadcast shape.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, instrument, warn};

use super::Session;
use crate::host::HostChannel;

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    default_idle_timeout: Duration,
    host: Arc<HostChannel>,
    log_dir: PathBuf,
}

impl SessionRegistry {
    pub fn new(default_idle_timeout: Duration, host: Arc<HostChannel>, log_dir: PathBuf) -> Arc<Self> {
        Arc::new(SessionRegistry {
            sessions: Mutex::new(HashMap::new()),
            default_idle_timeout,
            host,
            log_dir,
        })
    }

    /// Creates a fresh session with a generated id and registers it.
    #[instrument(skip(self))]
    pub fn create(&self, idle_timeout: Option<Duration>) -> Arc<Session> {
        let id = uuid::Uuid::new_v4().to_string();
        self.create_with_id(id, idle_timeout)
    }

    fn create_with_id(&self, id: String, idle_timeout: Option<Duration>) -> Arc<Session> {
        let session = super::Session::new_internal(
            id.clone(),
            idle_timeout.unwrap_or(self.default_idle_timeout),
            Arc::clone(&self.host),
            &self.log_dir,
        );
        self.sessions.lock().unwrap().insert(id, Arc::clone(&session));
        session
    }

    /// Looks up an existing, non-terminal, non-expired session by id.
    /// Returns `None` when the id was never seen, has already expired (even
    /// if the periodic sweep hasn't caught it yet), or been removed,
    /// matching spec.md's undifferentiated `SESSION_NOT_FOUND` for all
    /// three cases. An already-expired session found here is terminated
    /// and dropped from the table on the spot rather than left for the
    /// next sweep tick.
    #[instrument(skip(self))]
    pub fn resume(&self, id: &str) -> Option<Arc<Session>> {
        let session = {
            let sessions = self.sessions.lock().unwrap();
            let session = sessions.get(id)?;
            if session.state() == super::SessionState::Terminal {
                return None;
            }
            Arc::clone(session)
        };

        if session.is_expired() {
            self.remove(id);
            return None;
        }

        Some(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap().get(id).cloned()
    }

    /// Marks a session terminal and drops it from the table.
    #[instrument(skip(self))]
    pub fn remove(&self, id: &str) {
        if let Some(session) = self.sessions.lock().unwrap().remove(id) {
            tokio::spawn(async move { session.expire().await });
        }
    }

    /// Fans a host-originated event out to every attached session. Used
    /// for `tabUpdate`, which the host can't target at a single session
    /// because it has no notion of which client cares.
    pub fn broadcast(&self, f: impl Fn(&Session)) {
        let sessions = self.sessions.lock().unwrap();
        for session in sessions.values() {
            f(session);
        }
    }

    /// Removes every expired session and warns every session approaching
    /// expiry. Driven by a background `tokio::time::interval` task, the
    /// async analogue of the teacher's dedicated TTL-reaper thread.
    #[instrument(skip(self))]
    pub async fn sweep(&self) {
        let expired: Vec<(String, Arc<Session>)> = {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .iter()
                .filter(|(_, s)| s.is_expired())
                .map(|(id, s)| (id.clone(), Arc::clone(s)))
                .collect()
        };
        for (id, session) in &expired {
            info!(session = %id, "expiring idle session");
            session.expire().await;
        }
        if !expired.is_empty() {
            let mut sessions = self.sessions.lock().unwrap();
            for (id, _) in &expired {
                sessions.remove(id);
            }
        }

        let warn_targets: Vec<Arc<Session>> = {
            let sessions = self.sessions.lock().unwrap();
            sessions.values().cloned().collect()
        };
        for session in warn_targets {
            session.maybe_warn();
        }
    }

    /// Tears down every live session as part of process shutdown (spec.md
    /// §4.4, §5: a dead host channel or a shutdown signal cancels every
    /// session rather than leaving them to time out one by one).
    #[instrument(skip(self))]
    pub async fn shutdown_all(&self) {
        let sessions: Vec<Arc<Session>> = {
            let sessions = self.sessions.lock().unwrap();
            sessions.values().cloned().collect()
        };
        for session in &sessions {
            session.cancel_for_shutdown().await;
        }
        self.sessions.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::host::HostChannel;

    fn test_host() -> Arc<HostChannel> {
        HostChannel::new_detached_for_test()
    }

    fn test_registry(idle_timeout: Duration) -> (tempfile::TempDir, Arc<SessionRegistry>) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let registry = SessionRegistry::new(idle_timeout, test_host(), tmp.path().to_path_buf());
        (tmp, registry)
    }

    #[tokio::test]
    async fn create_then_resume_returns_same_session() {
        let (_tmp, registry) = test_registry(Duration::from_secs(60));
        let session = registry.create(None);
        let resumed = registry.resume(&session.id).expect("session should resume");
        assert_eq!(session.id, resumed.id);
    }

    #[tokio::test]
    async fn resume_of_unknown_id_is_none() {
        let (_tmp, registry) = test_registry(Duration::from_secs(60));
        assert!(registry.resume("does-not-exist").is_none());
    }

    #[tokio::test]
    async fn sweep_expires_idle_sessions() {
        let (_tmp, registry) = test_registry(Duration::from_millis(1));
        let session = registry.create(None);
        tokio::time::sleep(Duration::from_millis(5)).await;
        registry.sweep().await;
        assert!(registry.resume(&session.id).is_none());
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn remove_marks_session_terminal_and_unresumable() {
        let (_tmp, registry) = test_registry(Duration::from_secs(60));
        let session = registry.create(None);
        registry.remove(&session.id);
        // give the spawned expire() a tick to land
        tokio::task::yield_now().await;
        assert!(registry.resume(&session.id).is_none());
    }

    #[tokio::test]
    async fn resume_rejects_an_already_expired_session_before_the_sweep_runs() {
        let (_tmp, registry) = test_registry(Duration::from_millis(1));
        let session = registry.create(None);
        tokio::time::sleep(Duration::from_millis(5)).await;
        // no sweep() call: resume() itself must catch the lapsed timer
        assert!(registry.resume(&session.id).is_none());
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn session_log_is_mirrored_to_a_file_under_log_dir() {
        let (tmp, registry) = test_registry(Duration::from_secs(60));
        let session = registry.create(None);
        session.record_host_log(
            hostbridge_protocol::LogDirection::Request,
            serde_json::json!({"action": "listTabs"}),
        );

        let entries: Vec<_> = std::fs::read_dir(tmp.path()).expect("read log dir").collect();
        assert_eq!(entries.len(), 1);
        let path = entries.into_iter().next().unwrap().unwrap().path();
        assert!(path.file_name().unwrap().to_string_lossy().starts_with(&format!("session-{}-", session.id)));
        let contents = std::fs::read_to_string(path).expect("read log file");
        assert_eq!(contents.lines().count(), 1);
    }
}
