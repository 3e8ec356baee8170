//! Attendance session: deduplicates observed identities and commits them.

use crate::types::{
    AttendanceRecord, AttendanceStatus, CaptureMethod, IdentityId, SessionContext,
};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("no open session")]
    NotOpen,
    #[error("session has no observed identities")]
    EmptySession,
    #[error("session is not bound to a class or course")]
    MissingContext,
    #[error("{count} observation(s) came from the simulated model; operator override required")]
    SimulatedObservations { count: usize },
    #[error("record store rejected the commit: {0}")]
    Store(#[from] RecordStoreError),
}

#[derive(Error, Debug)]
#[error("{0}")]
pub struct RecordStoreError(pub String);

/// Collaborator that persists committed attendance records.
///
/// `save` must be all-or-nothing.
pub trait RecordStore: Send + Sync {
    fn save(&self, records: &[AttendanceRecord]) -> Result<(), RecordStoreError>;
}

/// Where an observation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationOrigin {
    Live,
    Simulated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitPolicy {
    /// Refuse to commit when any observation is simulated.
    #[default]
    LiveOnly,
    /// Operator explicitly accepts simulated observations.
    AllowSimulated,
}

#[derive(Debug)]
struct Session {
    context: Option<SessionContext>,
    observed: BTreeMap<IdentityId, ObservationOrigin>,
}

/// Serializable view of the current session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub is_open: bool,
    pub context: Option<SessionContext>,
    pub observed: Vec<IdentityId>,
    pub simulated: usize,
}

/// Holds at most one open session.
#[derive(Debug, Default)]
pub struct SessionAggregator {
    session: Option<Session>,
}

impl SessionAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a fresh session, discarding anything uncommitted.
    pub fn start(&mut self, context: Option<SessionContext>) {
        if let Some(previous) = self.session.take() {
            if !previous.observed.is_empty() {
                tracing::warn!(
                    discarded = previous.observed.len(),
                    "starting new session; uncommitted observations discarded"
                );
            }
        }
        self.session = Some(Session {
            context,
            observed: BTreeMap::new(),
        });
    }

    /// Bind or replace the context of the open session.
    pub fn bind_context(&mut self, context: SessionContext) -> Result<(), SessionError> {
        let session = self.session.as_mut().ok_or(SessionError::NotOpen)?;
        session.context = Some(context);
        Ok(())
    }

    /// Record a live observation. Returns true the first time an id is seen.
    pub fn observe(&mut self, identity_id: IdentityId) -> bool {
        self.observe_from(identity_id, ObservationOrigin::Live)
    }

    /// Record an observation from the degraded-mode model.
    pub fn observe_simulated(&mut self, identity_id: IdentityId) -> bool {
        self.observe_from(identity_id, ObservationOrigin::Simulated)
    }

    pub fn observe_from(&mut self, identity_id: IdentityId, origin: ObservationOrigin) -> bool {
        let Some(session) = self.session.as_mut() else {
            tracing::debug!(identity = %identity_id, "observation without open session ignored");
            return false;
        };

        match session.observed.get_mut(&identity_id) {
            Some(existing) => {
                // A live sighting supersedes a simulated one.
                if origin == ObservationOrigin::Live {
                    *existing = ObservationOrigin::Live;
                }
                false
            }
            None => {
                session.observed.insert(identity_id, origin);
                true
            }
        }
    }

    /// Persist one Present record per observed identity and close the session.
    ///
    /// On any failure nothing is persisted and the session stays open.
    pub fn commit(
        &mut self,
        store: &dyn RecordStore,
        policy: CommitPolicy,
    ) -> Result<Vec<AttendanceRecord>, SessionError> {
        let session = self.session.as_ref().ok_or(SessionError::NotOpen)?;
        if session.observed.is_empty() {
            return Err(SessionError::EmptySession);
        }
        let context = session.context.clone().ok_or(SessionError::MissingContext)?;

        let simulated = session
            .observed
            .values()
            .filter(|o| **o == ObservationOrigin::Simulated)
            .count();
        if simulated > 0 && policy == CommitPolicy::LiveOnly {
            return Err(SessionError::SimulatedObservations { count: simulated });
        }

        let timestamp = Utc::now();
        let records: Vec<AttendanceRecord> = session
            .observed
            .iter()
            .map(|(id, origin)| AttendanceRecord {
                record_id: Uuid::new_v4(),
                identity_id: id.clone(),
                context: context.clone(),
                timestamp,
                status: AttendanceStatus::Present,
                capture_method: match origin {
                    ObservationOrigin::Live => CaptureMethod::Automatic,
                    ObservationOrigin::Simulated => CaptureMethod::Simulated,
                },
            })
            .collect();

        store.save(&records)?;
        self.session = None;

        tracing::info!(
            context = context.as_str(),
            records = records.len(),
            simulated,
            "session committed"
        );
        Ok(records)
    }

    /// Close the session without committing.
    pub fn stop(&mut self) -> usize {
        self.session
            .take()
            .map(|s| s.observed.len())
            .unwrap_or(0)
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn observed_count(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.observed.len())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        match &self.session {
            Some(s) => SessionSnapshot {
                is_open: true,
                context: s.context.clone(),
                observed: s.observed.keys().cloned().collect(),
                simulated: s
                    .observed
                    .values()
                    .filter(|o| **o == ObservationOrigin::Simulated)
                    .count(),
            },
            None => SessionSnapshot {
                is_open: false,
                context: None,
                observed: Vec::new(),
                simulated: 0,
            },
        }
    }
}
