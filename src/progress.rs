//! Sessioned progress reporting for model acquisition.
//!
//! A single event stream covers the whole acquisition lifecycle
//! (download, build, ready, error). Every state change is tagged with the
//! session that produced it; events from superseded sessions are dropped,
//! so an abandoned load racing against a newer one cannot corrupt what
//! subscribers see.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// Download progress never reaches 100; that value is reserved for `Ready`.
const DOWNLOAD_CEILING: u8 = 99;

/// `Building` pins progress near the top without claiming completion.
const BUILDING_FLOOR: u8 = 99;

/// Phase of the model acquisition lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressPhase {
    Idle,
    Downloading,
    Building,
    Ready,
    Error,
}

/// Snapshot of acquisition progress, tagged with the session that owns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressState {
    pub phase: ProgressPhase,
    /// 0..=100. Non-decreasing within a session; resets on error and on a
    /// new session. Only `Ready` sets exactly 100.
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub session_id: u64,
}

type Listener = Arc<dyn Fn(&ProgressState) + Send + Sync>;

struct Registered {
    id: u64,
    listener: Listener,
}

struct Inner {
    state: ProgressState,
    listeners: Vec<Registered>,
    next_listener_id: u64,
    next_session_id: u64,
}

/// Broadcast channel for progress state changes.
///
/// Cloning is cheap and every clone reports into the same stream.
/// Transitions are synchronous; listeners run on the reporting thread,
/// outside the state lock.
#[derive(Clone)]
pub struct ProgressChannel {
    inner: Arc<Mutex<Inner>>,
}

impl Default for ProgressChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressChannel {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: ProgressState {
                    phase: ProgressPhase::Idle,
                    progress: 0,
                    error: None,
                    session_id: 0,
                },
                listeners: Vec::new(),
                next_listener_id: 0,
                next_session_id: 0,
            })),
        }
    }

    /// Session id reports are currently accepted for.
    pub fn active_session(&self) -> u64 {
        self.inner.lock().unwrap().state.session_id
    }

    /// Start a new session: allocate the next id, reset to idle/0 and
    /// notify subscribers. Reports tagged with older ids are dropped from
    /// here on.
    pub fn begin_session(&self) -> u64 {
        let (snapshot, listeners) = {
            let mut inner = self.inner.lock().unwrap();
            inner.next_session_id += 1;
            let id = inner.next_session_id;
            inner.state = ProgressState {
                phase: ProgressPhase::Idle,
                progress: 0,
                error: None,
                session_id: id,
            };
            (inner.state.clone(), Self::listener_snapshot(&inner))
        };
        debug!("progress session {} begun", snapshot.session_id);
        Self::deliver(&snapshot, &listeners);
        snapshot.session_id
    }

    /// Report download progress for `session`. Clamped below 100 and never
    /// regressing within the session; ignored when the session is stale.
    pub fn report_download(&self, percent: u8, session: u64) {
        self.transition(session, |state| {
            state.phase = ProgressPhase::Downloading;
            state.progress = state.progress.max(percent.min(DOWNLOAD_CEILING));
            state.error = None;
        });
    }

    /// Downloads are done and the inference engine is being built.
    pub fn report_building(&self, session: u64) {
        self.transition(session, |state| {
            state.phase = ProgressPhase::Building;
            state.progress = state.progress.max(BUILDING_FLOOR);
            state.error = None;
        });
    }

    /// The session's handles are usable.
    pub fn report_ready(&self, session: u64) {
        self.transition(session, |state| {
            state.phase = ProgressPhase::Ready;
            state.progress = 100;
            state.error = None;
        });
    }

    /// The session failed. Progress resets to 0 with the message attached.
    pub fn report_error(&self, session: u64, message: impl Into<String>) {
        let message = message.into();
        self.transition(session, move |state| {
            state.phase = ProgressPhase::Error;
            state.progress = 0;
            state.error = Some(message);
        });
    }

    /// Register a listener. The current state is replayed to it
    /// immediately, then every subsequent accepted transition is delivered.
    pub fn subscribe(
        &self,
        listener: impl Fn(&ProgressState) + Send + Sync + 'static,
    ) -> Subscription {
        let listener: Listener = Arc::new(listener);
        let (id, snapshot) = {
            let mut inner = self.inner.lock().unwrap();
            inner.next_listener_id += 1;
            let id = inner.next_listener_id;
            inner.listeners.push(Registered {
                id,
                listener: listener.clone(),
            });
            (id, inner.state.clone())
        };
        Self::deliver(&snapshot, std::slice::from_ref(&listener));
        Subscription {
            channel: Arc::downgrade(&self.inner),
            id,
            active: AtomicBool::new(true),
        }
    }

    fn transition(&self, session: u64, apply: impl FnOnce(&mut ProgressState)) {
        let (snapshot, listeners) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state.session_id != session {
                debug!(
                    "dropping progress event for stale session {} (active: {})",
                    session, inner.state.session_id
                );
                return;
            }
            apply(&mut inner.state);
            (inner.state.clone(), Self::listener_snapshot(&inner))
        };
        Self::deliver(&snapshot, &listeners);
    }

    fn listener_snapshot(inner: &Inner) -> Vec<Listener> {
        inner.listeners.iter().map(|r| r.listener.clone()).collect()
    }

    /// Invoke each listener, isolating panics so one bad subscriber cannot
    /// block delivery to the rest.
    fn deliver(state: &ProgressState, listeners: &[Listener]) {
        for listener in listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(state))).is_err() {
                warn!("progress listener panicked; continuing with remaining listeners");
            }
        }
    }
}

/// Handle returned by [`ProgressChannel::subscribe`].
///
/// Dropping the handle does NOT remove the listener; call
/// [`Subscription::unsubscribe`], which is safe to call more than once.
pub struct Subscription {
    channel: Weak<Mutex<Inner>>,
    id: u64,
    active: AtomicBool,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(inner) = self.channel.upgrade() {
            let mut inner = inner.lock().unwrap();
            inner.listeners.retain(|r| r.id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording_channel() -> (ProgressChannel, Arc<Mutex<Vec<(ProgressPhase, u8)>>>) {
        let channel = ProgressChannel::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        channel.subscribe(move |state| {
            sink.lock().unwrap().push((state.phase, state.progress));
        });
        (channel, seen)
    }

    #[test]
    fn download_build_ready_sequence_is_observed_exactly() {
        let (channel, seen) = recording_channel();
        seen.lock().unwrap().clear(); // drop the subscribe replay

        let session = channel.begin_session();
        channel.report_download(10, session);
        channel.report_download(55, session);
        channel.report_building(session);
        channel.report_ready(session);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (ProgressPhase::Idle, 0),
                (ProgressPhase::Downloading, 10),
                (ProgressPhase::Downloading, 55),
                (ProgressPhase::Building, 99),
                (ProgressPhase::Ready, 100),
            ]
        );
    }

    #[test]
    fn stale_session_reports_are_dropped() {
        let (channel, seen) = recording_channel();
        let first = channel.begin_session();
        let second = channel.begin_session();
        seen.lock().unwrap().clear();

        channel.report_download(40, first);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(channel.active_session(), second);

        channel.report_download(40, second);
        assert_eq!(*seen.lock().unwrap(), vec![(ProgressPhase::Downloading, 40)]);
    }

    #[test]
    fn download_progress_never_regresses_or_reaches_100() {
        let (channel, seen) = recording_channel();
        let session = channel.begin_session();
        seen.lock().unwrap().clear();

        channel.report_download(80, session);
        channel.report_download(20, session);
        channel.report_download(100, session);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (ProgressPhase::Downloading, 80),
                (ProgressPhase::Downloading, 80),
                (ProgressPhase::Downloading, 99),
            ]
        );
    }

    #[test]
    fn error_resets_progress_and_attaches_message() {
        let channel = ProgressChannel::new();
        let session = channel.begin_session();
        channel.report_download(70, session);

        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        channel.subscribe(move |state| {
            *sink.lock().unwrap() = Some(state.clone());
        });

        channel.report_error(session, "connection reset");
        let state = seen.lock().unwrap().clone().unwrap();
        assert_eq!(state.phase, ProgressPhase::Error);
        assert_eq!(state.progress, 0);
        assert_eq!(state.error.as_deref(), Some("connection reset"));
    }

    #[test]
    fn subscribe_replays_current_state_immediately() {
        let channel = ProgressChannel::new();
        let session = channel.begin_session();
        channel.report_download(33, session);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        channel.subscribe(move |state| {
            sink.lock().unwrap().push((state.phase, state.progress));
        });

        assert_eq!(*seen.lock().unwrap(), vec![(ProgressPhase::Downloading, 33)]);
    }

    #[test]
    fn unsubscribe_is_idempotent_and_stops_delivery() {
        let (channel, _) = recording_channel();
        let seen = Arc::new(Mutex::new(0u32));
        let sink = seen.clone();
        let subscription = channel.subscribe(move |_| {
            *sink.lock().unwrap() += 1;
        });
        assert_eq!(*seen.lock().unwrap(), 1); // replay

        subscription.unsubscribe();
        subscription.unsubscribe();
        channel.begin_session();
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let channel = ProgressChannel::new();
        channel.subscribe(|state| {
            if state.phase == ProgressPhase::Downloading {
                panic!("listener bug");
            }
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        channel.subscribe(move |state| {
            sink.lock().unwrap().push(state.progress);
        });

        let session = channel.begin_session();
        channel.report_download(12, session);
        // replay (0), begin (0), download (12) all arrived at the healthy listener
        assert_eq!(*seen.lock().unwrap(), vec![0, 0, 12]);
    }
}
