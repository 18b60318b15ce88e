use chrono::Utc;
use spc_core::{
    AgentRegistry, ChatMessage, CoreError, PartyGrammar, StatusReport, ViewerEvent,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};
use tracing::{debug, info};

use crate::broadcast::{self, PublishReport, Viewer};

pub const HISTORY_CAPACITY: usize = 100;

#[derive(Clone, Debug)]
pub struct ChannelConfig {
    pub feature: Option<String>,
    /// `None` disables the idle shutdown.
    pub idle_timeout: Option<Duration>,
    pub history_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            feature: None,
            idle_timeout: Some(Duration::from_secs(30 * 60)),
            history_capacity: HISTORY_CAPACITY,
        }
    }
}

/// What a viewer was handed at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectSnapshot {
    pub history: Vec<ChatMessage>,
    pub feature: Option<String>,
    pub remaining_seconds: u64,
}

struct ChannelInner {
    history: VecDeque<ChatMessage>,
    viewers: HashMap<String, Viewer>,
    last_activity: Instant,
    /// Set once by `shutdown`; no viewer is admitted afterwards.
    closed: Option<String>,
}

impl ChannelInner {
    fn touch(&mut self, now: Instant) {
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    fn push(&mut self, message: ChatMessage, capacity: usize) {
        self.history.push_back(message);
        while self.history.len() > capacity {
            self.history.pop_front();
        }
    }

    fn publish(&self, event: &ViewerEvent) -> PublishReport {
        broadcast::publish(self.viewers.values(), event)
    }
}

/// Sole owner of the history, the viewer set and the activity clock.
///
/// Every mutation takes the same lock and finishes its fan-out before
/// releasing it. That keeps append order equal to broadcast order, and makes
/// "join the viewer set" and "snapshot the history" one step, so a viewer
/// never misses or double-receives a message racing its connect.
pub struct ChannelState {
    registry: AgentRegistry,
    grammar: PartyGrammar,
    config: ChannelConfig,
    started_at: Instant,
    conn_counter: AtomicU64,
    message_counter: AtomicU64,
    inner: Mutex<ChannelInner>,
}

impl ChannelState {
    pub fn new(registry: AgentRegistry, config: ChannelConfig) -> Result<Self, CoreError> {
        let grammar = PartyGrammar::from_registry(&registry)?;
        let now = Instant::now();
        Ok(Self {
            registry,
            grammar,
            config,
            started_at: now,
            conn_counter: AtomicU64::new(0),
            message_counter: AtomicU64::new(0),
            inner: Mutex::new(ChannelInner {
                history: VecDeque::new(),
                viewers: HashMap::new(),
                last_activity: now,
                closed: None,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ChannelInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.config.idle_timeout
    }

    pub fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    fn next_message_id(&self) -> String {
        let seq = self.message_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{seq}", Utc::now().timestamp_millis())
    }

    /// Store `message`, evicting the oldest entry past capacity, refresh the
    /// activity clock and broadcast it.
    pub fn append(&self, message: ChatMessage) -> ChatMessage {
        let mut inner = self.lock();
        self.append_locked(&mut inner, message)
    }

    fn append_locked(&self, inner: &mut ChannelInner, message: ChatMessage) -> ChatMessage {
        inner.push(message.clone(), self.config.history_capacity);
        inner.touch(Instant::now());
        let report = inner.publish(&ViewerEvent::Message(message.clone()));
        debug!(
            event = "message_appended",
            id = %message.id,
            agent = %message.agent,
            delivered = report.delivered,
            failed = report.failed
        );
        message
    }

    /// Extract every chat line in `text` and append each as one message, in
    /// line order. A batch that produced anything is followed by a
    /// `timer_reset`.
    pub fn ingest(&self, text: &str) -> Vec<ChatMessage> {
        let stored: Vec<ChatMessage> = self
            .grammar
            .parse(text)
            .map(|line| {
                let id = self.next_message_id();
                self.append(ChatMessage::from_line(id, &line, &self.registry, Utc::now()))
            })
            .collect();
        if !stored.is_empty() {
            let remaining = self.remaining_idle_seconds();
            let report = self.publish(&ViewerEvent::TimerReset(remaining));
            info!(
                event = "ingest",
                count = stored.len(),
                viewers = report.delivered
            );
        }
        stored
    }

    /// Admit a viewer. Its history, feature label and timer are queued to it
    /// before it joins the set, so live broadcasts can only follow them.
    /// After `shutdown` the viewer is sent a close frame instead and `None`
    /// comes back.
    pub fn connect(&self, viewer: Viewer) -> Option<ConnectSnapshot> {
        let mut inner = self.lock();
        if let Some(reason) = &inner.closed {
            viewer.close(reason);
            return None;
        }
        let now = Instant::now();
        inner.touch(now);
        let snapshot = ConnectSnapshot {
            history: inner.history.iter().cloned().collect(),
            feature: self.config.feature.clone(),
            remaining_seconds: self.remaining_locked(&inner, now),
        };
        viewer.send_event(&ViewerEvent::History(snapshot.history.clone()));
        if let Some(feature) = &snapshot.feature {
            viewer.send_event(&ViewerEvent::Feature(feature.clone()));
        }
        viewer.send_event(&ViewerEvent::TimerReset(snapshot.remaining_seconds));
        inner.viewers.insert(viewer.conn_id().to_string(), viewer);
        Some(snapshot)
    }

    /// Idempotent; returns whether the viewer was still a member.
    pub fn disconnect(&self, conn_id: &str) -> bool {
        self.lock().viewers.remove(conn_id).is_some()
    }

    /// Refresh the activity clock without a message; returns the new
    /// remaining seconds after broadcasting them.
    pub fn keepalive(&self) -> u64 {
        let mut inner = self.lock();
        let now = Instant::now();
        inner.touch(now);
        let remaining = self.remaining_locked(&inner, now);
        inner.publish(&ViewerEvent::TimerReset(remaining));
        remaining
    }

    pub fn publish(&self, event: &ViewerEvent) -> PublishReport {
        self.lock().publish(event)
    }

    /// Terminal step: broadcast `shutdown`, send every viewer a close frame
    /// and empty the set, all under one lock so nothing is published between
    /// the two. Returns the broadcast report and how many viewers were closed.
    pub fn shutdown(&self, reason: &str) -> (PublishReport, usize) {
        let mut inner = self.lock();
        let report = inner.publish(&ViewerEvent::Shutdown(reason.to_string()));
        let closed = inner.viewers.len();
        for (_, viewer) in inner.viewers.drain() {
            viewer.close(reason);
        }
        inner.closed = Some(reason.to_string());
        (report, closed)
    }

    pub fn remaining_idle_seconds(&self) -> u64 {
        self.remaining_idle_seconds_at(Instant::now())
    }

    pub fn remaining_idle_seconds_at(&self, now: Instant) -> u64 {
        let inner = self.lock();
        self.remaining_locked(&inner, now)
    }

    fn remaining_locked(&self, inner: &ChannelInner, now: Instant) -> u64 {
        let Some(timeout) = self.config.idle_timeout else {
            return 0;
        };
        let idle = now.saturating_duration_since(inner.last_activity);
        let remaining = timeout.saturating_sub(idle);
        if remaining.subsec_nanos() > 0 {
            remaining.as_secs() + 1
        } else {
            remaining.as_secs()
        }
    }

    pub fn history(&self) -> Vec<ChatMessage> {
        self.lock().history.iter().cloned().collect()
    }

    pub fn message_count(&self) -> usize {
        self.lock().history.len()
    }

    pub fn viewer_count(&self) -> usize {
        self.lock().viewers.len()
    }

    pub fn status(&self) -> StatusReport {
        let now = Instant::now();
        let inner = self.lock();
        StatusReport {
            uptime: now.saturating_duration_since(self.started_at).as_secs(),
            idle_timeout_seconds: self.config.idle_timeout.map_or(0, |t| t.as_secs()),
            remaining_seconds: self.remaining_locked(&inner, now),
            connected_clients: inner.viewers.len(),
            message_count: inner.history.len(),
            feature: self.config.feature.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_last_activity(&self, at: Instant) {
        self.lock().last_activity = at;
    }
}
