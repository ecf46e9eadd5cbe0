//! Session timeout supervisor — warning and expiry timers gated on
//! authentication.
//!
//! Two timers run while the user is authenticated: the warning timer fires
//! `warning_lead` before the deadline and then counts down once a second; the
//! expiry timer fires at the deadline, clears persisted state and publishes
//! [`SessionEvent::Expired`]. Arming publishes the deadline to the
//! persistence manager, which caps every envelope written afterwards, so the
//! stored state never outlives the session. `extend()` re-arms both timers
//! and moves the stored expiry along with the new deadline.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, sleep};
use tracing::{debug, info};

use crate::config::FlowConfig;
use crate::persistence::{AutoSaver, PersistenceManager};

const EVENT_CAPACITY: usize = 256;

/// Events published by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The session will expire soon; offer "continue".
    Warning { seconds_remaining: u64 },
    /// Once-a-second countdown after the warning.
    Countdown { seconds_remaining: u64 },
    /// The user extended the session.
    Extended,
    /// The session expired and stored state was cleared.
    Expired,
}

struct Timers {
    warning: JoinHandle<()>,
    expiry: JoinHandle<()>,
}

impl Timers {
    fn abort(self) {
        self.warning.abort();
        self.expiry.abort();
    }
}

#[derive(Default)]
struct Inner {
    authenticated: bool,
    disposed: bool,
    generation: u64,
    timers: Option<Timers>,
}

/// Runs the session timers for one workflow.
pub struct SessionSupervisor {
    persistence: Arc<PersistenceManager>,
    autosave: Option<Arc<AutoSaver>>,
    timeout: Duration,
    warning_lead: Duration,
    tx: broadcast::Sender<SessionEvent>,
    inner: Arc<Mutex<Inner>>,
}

impl SessionSupervisor {
    pub fn new(persistence: Arc<PersistenceManager>, config: &FlowConfig) -> Self {
        Self::with_timeout(persistence, config.session_timeout, config.warning_lead)
    }

    pub fn with_timeout(
        persistence: Arc<PersistenceManager>,
        timeout: Duration,
        warning_lead: Duration,
    ) -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self {
            persistence,
            autosave: None,
            timeout,
            warning_lead: warning_lead.min(timeout),
            tx,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Drop pending auto-saves on expiry so none lands after the clear.
    pub fn with_autosave(mut self, autosave: Arc<AutoSaver>) -> Self {
        self.autosave = Some(autosave);
        self
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Arm the timers when the user becomes authenticated; cancel them when
    /// they stop being authenticated.
    pub async fn set_authenticated(&self, authenticated: bool) {
        let mut inner = self.inner.lock().await;
        if inner.disposed || inner.authenticated == authenticated {
            return;
        }
        inner.authenticated = authenticated;
        if authenticated {
            self.arm(&mut inner, self.timeout);
            info!(timeout_secs = self.timeout.as_secs(), "Session timers armed");
        } else {
            Self::disarm(&mut inner);
            self.persistence.set_session_deadline(None);
            info!("Session timers cancelled");
        }
    }

    /// Re-arm a recovered session for the time it had left.
    ///
    /// `expires_at_ms` is the recovered envelope's expiry; a session already
    /// past it expires immediately.
    pub async fn resume_until(&self, expires_at_ms: i64) {
        let mut inner = self.inner.lock().await;
        if inner.disposed {
            return;
        }
        let now = self.persistence.clock().now_millis();
        let left_ms = u64::try_from(expires_at_ms.saturating_sub(now)).unwrap_or(0);
        let remaining = Duration::from_millis(left_ms).min(self.timeout);
        Self::disarm(&mut inner);
        inner.authenticated = true;
        self.arm(&mut inner, remaining);
        info!(remaining_secs = remaining.as_secs(), "Recovered session timers armed");
    }

    /// Restart both timers and extend the stored envelope to match.
    ///
    /// Returns `false` when there is no authenticated session to extend.
    pub async fn extend(&self) -> bool {
        {
            let mut inner = self.inner.lock().await;
            if inner.disposed || !inner.authenticated {
                return false;
            }
            Self::disarm(&mut inner);
            self.arm(&mut inner, self.timeout);
        }
        let minutes = (self.timeout.as_secs() as i64 + 59) / 60;
        self.persistence.extend_expiry(minutes).await;
        let _ = self.tx.send(SessionEvent::Extended);
        info!("Session extended");
        true
    }

    /// Cancel the timers and forget the authenticated status.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.authenticated = false;
        Self::disarm(&mut inner);
        self.persistence.set_session_deadline(None);
    }

    /// Cancel everything; later calls are no-ops.
    pub async fn dispose(&self) {
        let mut inner = self.inner.lock().await;
        inner.authenticated = false;
        inner.disposed = true;
        Self::disarm(&mut inner);
        debug!("Session supervisor disposed");
    }

    /// Whether timers are currently running.
    pub async fn is_armed(&self) -> bool {
        self.inner.lock().await.timers.is_some()
    }

    fn disarm(inner: &mut Inner) {
        inner.generation += 1;
        if let Some(timers) = inner.timers.take() {
            timers.abort();
        }
    }

    fn arm(&self, inner: &mut Inner, timeout: Duration) {
        inner.generation += 1;
        let generation = inner.generation;
        let timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
        let deadline = self.persistence.clock().now_millis().saturating_add(timeout_ms);
        self.persistence.set_session_deadline(Some(deadline));

        let lead = self.warning_lead.min(timeout);
        let warn_after = timeout - lead;
        let lead_secs = lead.as_secs();

        let tx = self.tx.clone();
        let warning = tokio::spawn(async move {
            sleep(warn_after).await;
            debug!(seconds_remaining = lead_secs, "Session warning");
            let _ = tx.send(SessionEvent::Warning {
                seconds_remaining: lead_secs,
            });

            let tick = Duration::from_secs(1);
            let mut interval = interval_at(Instant::now() + tick, tick);
            for seconds_remaining in (1..lead_secs).rev() {
                interval.tick().await;
                let _ = tx.send(SessionEvent::Countdown { seconds_remaining });
            }
        });

        let tx = self.tx.clone();
        let state = Arc::clone(&self.inner);
        let persistence = Arc::clone(&self.persistence);
        let autosave = self.autosave.clone();
        let expiry = tokio::spawn(async move {
            sleep(timeout).await;
            {
                let mut inner = state.lock().await;
                if inner.generation != generation {
                    return;
                }
                inner.authenticated = false;
                if let Some(timers) = inner.timers.take() {
                    // Dropping our own handle detaches; only the warning
                    // task needs stopping.
                    timers.warning.abort();
                }
            }
            // The deadline stays in place: anything saved from here on is
            // already expired.
            match autosave {
                Some(autosave) => autosave.discard().await,
                None => persistence.clear().await,
            };
            info!("Session expired, stored state cleared");
            let _ = tx.send(SessionEvent::Expired);
        });

        inner.timers = Some(Timers { warning, expiry });
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStorage;
    use crate::workflow::{Step, WorkflowState};

    const MINUTE: Duration = Duration::from_secs(60);

    async fn setup(timeout_min: u64) -> (Arc<MemoryStorage>, Arc<PersistenceManager>, SessionSupervisor) {
        let storage = Arc::new(MemoryStorage::new());
        let persistence = Arc::new(PersistenceManager::new(
            storage.clone(),
            Arc::new(ManualClock::new(Utc::now())),
            &FlowConfig::default(),
        ));
        persistence
            .save(&WorkflowState {
                current_step: Step::Facility,
                is_authenticated: true,
                phone_number: Some("+919876543210".to_string()),
                ..Default::default()
            })
            .await;
        let supervisor =
            SessionSupervisor::with_timeout(persistence.clone(), MINUTE * timeout_min as u32, 2 * MINUTE);
        (storage, persistence, supervisor)
    }

    #[tokio::test(start_paused = true)]
    async fn warning_at_eight_expiry_at_ten() {
        let (storage, _, supervisor) = setup(10).await;
        let mut rx = supervisor.subscribe();
        let start = Instant::now();
        supervisor.set_authenticated(true).await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event, SessionEvent::Warning { seconds_remaining: 120 });
        assert_eq!(start.elapsed(), 8 * MINUTE);
        assert!(!storage.is_empty().await);

        let event = rx.recv().await.unwrap();
        assert_eq!(event, SessionEvent::Countdown { seconds_remaining: 119 });
        assert_eq!(start.elapsed(), 8 * MINUTE + Duration::from_secs(1));

        let mut countdowns = 1;
        loop {
            match rx.recv().await.unwrap() {
                SessionEvent::Countdown { .. } => countdowns += 1,
                SessionEvent::Expired => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(countdowns, 119);
        assert_eq!(start.elapsed(), 10 * MINUTE);
        assert!(storage.is_empty().await, "expiry clears stored state");
        assert!(!supervisor.is_armed().await);
    }

    #[tokio::test(start_paused = true)]
    async fn arming_publishes_the_deadline() {
        let (_, persistence, supervisor) = setup(10).await;
        let now = persistence.clock().now_millis();
        supervisor.set_authenticated(true).await;
        assert_eq!(persistence.session_deadline(), Some(now + 10 * 60 * 1000));

        supervisor.set_authenticated(false).await;
        assert_eq!(persistence.session_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_drops_a_pending_autosave() {
        let (storage, persistence, supervisor) = setup(10).await;
        let autosave = Arc::new(AutoSaver::new(persistence.clone(), Duration::from_millis(500)));
        let supervisor = supervisor.with_autosave(autosave.clone());
        let mut rx = supervisor.subscribe();
        supervisor.set_authenticated(true).await;

        sleep(10 * MINUTE - Duration::from_millis(200)).await;
        autosave.schedule(WorkflowState {
            current_step: Step::Pricing,
            is_authenticated: true,
            phone_number: Some("+919876543210".to_string()),
            ..Default::default()
        });

        while rx.recv().await.unwrap() != SessionEvent::Expired {}
        assert!(storage.is_empty().await);
        sleep(Duration::from_secs(1)).await;
        assert!(storage.is_empty().await, "no save may land after expiry");
        assert!(!autosave.has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn resumed_session_keeps_its_remaining_time() {
        let (storage, persistence, supervisor) = setup(10).await;
        let mut rx = supervisor.subscribe();
        let start = Instant::now();
        let expires_at = persistence.clock().now_millis() + 3 * 60 * 1000;

        supervisor.resume_until(expires_at).await;
        assert!(supervisor.is_armed().await);
        assert_eq!(persistence.session_deadline(), Some(expires_at));

        assert_eq!(
            rx.recv().await.unwrap(),
            SessionEvent::Warning { seconds_remaining: 120 }
        );
        assert_eq!(start.elapsed(), MINUTE);
        while rx.recv().await.unwrap() != SessionEvent::Expired {}
        assert_eq!(start.elapsed(), 3 * MINUTE);
        assert!(storage.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn resuming_past_the_deadline_expires_at_once() {
        let (storage, persistence, supervisor) = setup(10).await;
        let mut rx = supervisor.subscribe();
        let start = Instant::now();

        supervisor
            .resume_until(persistence.clock().now_millis() - 1000)
            .await;
        while rx.recv().await.unwrap() != SessionEvent::Expired {}
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(storage.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn unauthenticated_never_arms() {
        let (storage, _, supervisor) = setup(10).await;
        supervisor.set_authenticated(false).await;
        assert!(!supervisor.is_armed().await);
        sleep(11 * MINUTE).await;
        assert!(!storage.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn logout_cancels_timers() {
        let (storage, _, supervisor) = setup(10).await;
        let mut rx = supervisor.subscribe();
        supervisor.set_authenticated(true).await;
        sleep(5 * MINUTE).await;
        supervisor.set_authenticated(false).await;
        sleep(10 * MINUTE).await;
        assert!(rx.try_recv().is_err());
        assert!(!storage.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn extend_resets_timers_and_storage_expiry() {
        let (storage, persistence, supervisor) = setup(10).await;
        let mut rx = supervisor.subscribe();
        let start = Instant::now();
        supervisor.set_authenticated(true).await;

        assert!(matches!(rx.recv().await.unwrap(), SessionEvent::Warning { .. }));
        assert!(supervisor.extend().await);
        let extended_at = start.elapsed();

        // Skip the tail of the aborted countdown, if any, up to Extended.
        loop {
            if rx.recv().await.unwrap() == SessionEvent::Extended {
                break;
            }
        }
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, SessionEvent::Warning { .. }));
        assert_eq!(start.elapsed(), extended_at + 8 * MINUTE);
        assert!(persistence.load().await.is_some());
        assert!(!storage.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn extend_without_session_is_noop() {
        let (_, _, supervisor) = setup(10).await;
        assert!(!supervisor.extend().await);
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_is_final() {
        let (_, _, supervisor) = setup(10).await;
        supervisor.dispose().await;
        supervisor.set_authenticated(true).await;
        assert!(!supervisor.is_armed().await);
    }
}
