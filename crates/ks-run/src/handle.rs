// handle.rs — SessionHandle: a session shared between tasks.
//
// The session sits behind a mutex; every committed change publishes a new
// `CommittedView` that readers take without waiting on the mutex. Calls to
// collaborators run with the mutex released: the request is prepared under
// the lock, the call is made without it, and the result is re-checked under
// the lock before it is applied.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use ks_graph::{ArtifactId, ArtifactType};
use ks_metrics::MetricReport;
use ks_policy::GovernanceState;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::collaborator::{GenerationService, MetricService};
use crate::error::RunError;
use crate::run::Run;
use crate::session::Session;
use crate::signal::Signal;

/// Read-only picture of the last committed state.
#[derive(Debug, Clone, Serialize)]
pub struct CommittedView {
    pub run: Run,
    pub state: GovernanceState,
    pub context: String,
    pub ledger_entries: usize,
    pub pending_signal: Option<Signal>,
}

impl CommittedView {
    fn of(session: &Session) -> Self {
        Self {
            run: session.run().clone(),
            state: session.state().clone(),
            context: session.context_projection(),
            ledger_entries: session.ledger().len(),
            pending_signal: session.signals().pending().cloned(),
        }
    }
}

/// Cloneable handle to a session.
#[derive(Clone)]
pub struct SessionHandle {
    session: Arc<Mutex<Session>>,
    view: Arc<RwLock<Arc<CommittedView>>>,
}

impl SessionHandle {
    pub fn new(session: Session) -> Self {
        let view = Arc::new(CommittedView::of(&session));
        Self {
            session: Arc::new(Mutex::new(session)),
            view: Arc::new(RwLock::new(view)),
        }
    }

    /// The last published view. Never blocks on a running operation.
    pub fn view(&self) -> Result<Arc<CommittedView>, RunError> {
        let view = self.view.read().map_err(|_| RunError::LockPoisoned)?;
        Ok(Arc::clone(&view))
    }

    /// Run `f` with exclusive access to the session, then publish the
    /// resulting view whether `f` succeeded or not.
    pub fn with_session<T>(
        &self,
        f: impl FnOnce(&mut Session) -> Result<T, RunError>,
    ) -> Result<T, RunError> {
        let mut session = self.session.lock().map_err(|_| RunError::LockPoisoned)?;
        let result = f(&mut session);
        self.publish(&session)?;
        result
    }

    fn publish(&self, session: &Session) -> Result<(), RunError> {
        let view = Arc::new(CommittedView::of(session));
        *self.view.write().map_err(|_| RunError::LockPoisoned)? = view;
        Ok(())
    }

    /// Generate an artifact without holding the session during the call.
    pub fn generate(
        &self,
        service: &dyn GenerationService,
        artifact_type: ArtifactType,
        instruction: &str,
    ) -> Result<ArtifactId, RunError> {
        let (pending, retry) =
            self.with_session(|s| Ok((s.prepare_generation(artifact_type, instruction)?, s.retry_policy())))?;
        let content = retry.run(|_| service.generate(&pending.request))?;
        self.with_session(|s| s.finish_generation(pending, content))
    }

    /// Score the current stage without holding the session during the call.
    pub fn evaluate_with_service(
        &self,
        service: &dyn MetricService,
    ) -> Result<MetricReport, RunError> {
        let (pending, retry) =
            self.with_session(|s| Ok((s.prepare_evaluation()?, s.retry_policy())))?;
        let results = retry.run(|_| service.evaluate(&pending.request))?;
        self.with_session(|s| s.finish_evaluation(pending, results))
    }

    pub fn save_snapshot(&self) -> Result<bool, RunError> {
        self.with_session(|s| s.save_snapshot())
    }

    /// Save the snapshot every `period` while there is something to save.
    /// The task ends after the run is closed and its final state saved, or
    /// when the returned task is shut down.
    pub fn spawn_autosave(&self, period: Duration) -> AutosaveTask {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let handle = self.clone();
        let join = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = stop_rx.changed() => break,
                }
                let saver = handle.clone();
                let outcome = tokio::task::spawn_blocking(move || {
                    saver.with_session(|s| {
                        let saved = s.autosave()?;
                        Ok((saved, s.run().status.is_terminal() && !s.is_dirty()))
                    })
                })
                .await;
                match outcome {
                    Ok(Ok((saved, finished))) => {
                        if saved {
                            tracing::debug!("autosave wrote snapshot");
                        }
                        if finished {
                            break;
                        }
                    }
                    Ok(Err(e)) => tracing::warn!(error = %e, "autosave failed"),
                    Err(e) => {
                        tracing::error!(error = %e, "autosave task failed");
                        break;
                    }
                }
            }
        });
        AutosaveTask {
            stop: stop_tx,
            join,
        }
    }
}

/// Background autosave started by [`SessionHandle::spawn_autosave`].
pub struct AutosaveTask {
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl AutosaveTask {
    /// Stop the task and wait for it to finish.
    pub async fn shutdown(self) -> Result<(), RunError> {
        // The task may already have ended on its own.
        let _ = self.stop.send(true);
        self.join
            .await
            .map_err(|e| RunError::TaskFailed(e.to_string()))
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}
