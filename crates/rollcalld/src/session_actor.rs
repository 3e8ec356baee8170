//! Session aggregator task. Observations and operator commands arrive as
//! messages; the aggregator itself is owned by one task and never shared.

use rollcall_core::{
    AttendanceRecord, CommitPolicy, DiagnosticEvent, DiagnosticSink, EventKind, IdentityId,
    ObservationOrigin, RecordStore, RecordStoreError, SessionAggregator, SessionContext, SessionError,
    SessionSnapshot,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum SessionActorError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("session task exited")]
    ChannelClosed,
}

enum SessionRequest {
    Start {
        context: Option<SessionContext>,
        reply: oneshot::Sender<()>,
    },
    Observe {
        identity_id: IdentityId,
        origin: ObservationOrigin,
        reply: oneshot::Sender<bool>,
    },
    Commit {
        policy: CommitPolicy,
        reply: oneshot::Sender<Result<Vec<AttendanceRecord>, SessionError>>,
    },
    Stop {
        reply: oneshot::Sender<usize>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
}

/// Clone-safe handle to the session task.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionRequest>,
}

impl SessionHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionRequest,
    ) -> Result<T, SessionActorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| SessionActorError::ChannelClosed)?;
        reply_rx.await.map_err(|_| SessionActorError::ChannelClosed)
    }

    /// Open a new, empty session.
    pub async fn start(&self, context: Option<SessionContext>) -> Result<(), SessionActorError> {
        self.request(|reply| SessionRequest::Start { context, reply }).await
    }

    /// Returns true when the identity is new to the open session.
    pub async fn observe(
        &self,
        identity_id: IdentityId,
        origin: ObservationOrigin,
    ) -> Result<bool, SessionActorError> {
        self.request(|reply| SessionRequest::Observe {
            identity_id,
            origin,
            reply,
        })
        .await
    }

    pub async fn commit(&self, policy: CommitPolicy) -> Result<Vec<AttendanceRecord>, SessionActorError> {
        Ok(self.request(|reply| SessionRequest::Commit { policy, reply }).await??)
    }

    /// Discard the open session. Returns how many observations were dropped.
    pub async fn stop(&self) -> Result<usize, SessionActorError> {
        self.request(|reply| SessionRequest::Stop { reply }).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionActorError> {
        self.request(|reply| SessionRequest::Snapshot { reply }).await
    }
}

/// Spawn the session task on the current runtime.
pub fn spawn_sessions(store: Arc<dyn RecordStore>, sink: Arc<dyn DiagnosticSink>) -> SessionHandle {
    let (tx, mut rx) = mpsc::channel::<SessionRequest>(64);

    tokio::spawn(async move {
        let mut aggregator = SessionAggregator::new();
        while let Some(req) = rx.recv().await {
            match req {
                SessionRequest::Start { context, reply } => {
                    let label = context.as_ref().map(|c| c.as_str().to_string());
                    aggregator.start(context);
                    sink.emit(DiagnosticEvent::info(
                        EventKind::SessionStarted,
                        format!("session started for {}", label.as_deref().unwrap_or("<unbound>")),
                    ));
                    let _ = reply.send(());
                }
                SessionRequest::Observe {
                    identity_id,
                    origin,
                    reply,
                } => {
                    let is_new = aggregator.observe_from(identity_id.clone(), origin);
                    if is_new {
                        sink.emit(DiagnosticEvent::info(
                            EventKind::IdentityObserved,
                            format!("{identity_id} observed ({origin:?})"),
                        ));
                    }
                    let _ = reply.send(is_new);
                }
                SessionRequest::Commit { policy, reply } => {
                    // RecordStore::save blocks; hand the aggregator to the blocking pool and take it back.
                    let store = Arc::clone(&store);
                    let mut owned = std::mem::take(&mut aggregator);
                    let result = match tokio::task::spawn_blocking(move || {
                        let result = owned.commit(store.as_ref(), policy);
                        (owned, result)
                    })
                    .await
                    {
                        Ok((owned, result)) => {
                            aggregator = owned;
                            result
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "commit task ended abnormally; session lost");
                            Err(SessionError::Store(RecordStoreError(e.to_string())))
                        }
                    };
                    match &result {
                        Ok(records) => sink.emit(DiagnosticEvent::info(
                            EventKind::SessionCommitted,
                            format!("{} attendance record(s) committed", records.len()),
                        )),
                        Err(e) => sink.emit(
                            DiagnosticEvent::warning(EventKind::SessionRejected, format!("commit rejected: {e}"))
                                .with_code(commit_error_code(e)),
                        ),
                    }
                    let _ = reply.send(result);
                }
                SessionRequest::Stop { reply } => {
                    let discarded = aggregator.stop();
                    sink.emit(DiagnosticEvent::info(
                        EventKind::SessionStopped,
                        format!("session closed without commit; {discarded} observation(s) discarded"),
                    ));
                    let _ = reply.send(discarded);
                }
                SessionRequest::Snapshot { reply } => {
                    let _ = reply.send(aggregator.snapshot());
                }
            }
        }
        tracing::debug!("session task exiting");
    });

    SessionHandle { tx }
}

fn commit_error_code(e: &SessionError) -> &'static str {
    match e {
        SessionError::NotOpen => "session_not_open",
        SessionError::EmptySession => "empty_session",
        SessionError::MissingContext => "missing_context",
        SessionError::SimulatedObservations { .. } => "simulated_observations",
        SessionError::Store(_) => "record_store",
    }
}
