//! Channel lifecycle: `Active` until the idle clock runs out or someone asks
//! to stop, then `ShuttingDown` for good.
//!
//! ```text
//! Tick (remaining > 60)    ──► stay Active
//! Tick (0 < remaining <= 60) ► stay Active, broadcast timer_warning
//! Tick (remaining == 0)    ──► ShuttingDown("idle-timeout")
//! ShutdownRequested        ──► ShuttingDown("manual-shutdown")
//! Interrupted / Terminated ──► ShuttingDown("manual-interrupt" / "terminated")
//! ```
//!
//! All events funnel through one task so the state machine is the only
//! place the transition happens.

use spc_core::ViewerEvent;
use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::{mpsc, watch},
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use crate::channel::ChannelState;

pub const TICK_PERIOD: Duration = Duration::from_secs(1);
pub const WARNING_WINDOW_SECS: u64 = 60;
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);
pub const SHUTDOWN_FLUSH: Duration = Duration::from_millis(500);
const EVENT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    IdleTimeout,
    ManualShutdown,
    ManualInterrupt,
    Terminated,
}

impl ShutdownReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownReason::IdleTimeout => "idle-timeout",
            ShutdownReason::ManualShutdown => "manual-shutdown",
            ShutdownReason::ManualInterrupt => "manual-interrupt",
            ShutdownReason::Terminated => "terminated",
        }
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    Active,
    ShuttingDown(ShutdownReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    ViewerConnected { conn_id: String },
    ViewerDisconnected { conn_id: String },
    Tick,
    ShutdownRequested,
    Interrupted,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Quiet,
    Warning(u64),
    Expired,
}

pub fn evaluate_tick(remaining: u64) -> TickOutcome {
    if remaining == 0 {
        TickOutcome::Expired
    } else if remaining <= WARNING_WINDOW_SECS {
        TickOutcome::Warning(remaining)
    } else {
        TickOutcome::Quiet
    }
}

/// Cheap cloneable handle for everything outside the supervisor task.
#[derive(Clone)]
pub struct SupervisorHandle {
    events: mpsc::Sender<LifecycleEvent>,
    state: watch::Receiver<LifecycleState>,
}

impl SupervisorHandle {
    pub async fn send(&self, event: LifecycleEvent) {
        if self.events.send(event).await.is_err() {
            debug!(event = "supervisor_gone");
        }
    }

    /// Fire-and-forget variant for notifications that may be dropped.
    pub fn notify(&self, event: LifecycleEvent) {
        let _ = self.events.try_send(event);
    }

    #[cfg(test)]
    pub fn state(&self) -> LifecycleState {
        self.state.borrow().clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        matches!(*self.state.borrow(), LifecycleState::ShuttingDown(_))
    }

    /// Resolves once the channel has entered `ShuttingDown`. If the
    /// supervisor vanished without getting there, reports an interrupt.
    pub async fn wait_for_shutdown(&self) -> ShutdownReason {
        let mut state = self.state.clone();
        loop {
            if let LifecycleState::ShuttingDown(reason) = *state.borrow_and_update() {
                return reason;
            }
            if state.changed().await.is_err() {
                return ShutdownReason::ManualInterrupt;
            }
        }
    }
}

pub struct IdleSupervisor {
    channel: Arc<ChannelState>,
    state: watch::Sender<LifecycleState>,
    events: mpsc::Receiver<LifecycleEvent>,
}

impl IdleSupervisor {
    pub fn new(channel: Arc<ChannelState>) -> (Self, SupervisorHandle) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (state_tx, state_rx) = watch::channel(LifecycleState::Active);
        let supervisor = Self {
            channel,
            state: state_tx,
            events: events_rx,
        };
        let handle = SupervisorHandle {
            events: events_tx,
            state: state_rx,
        };
        (supervisor, handle)
    }

    pub fn is_shutting_down(&self) -> bool {
        matches!(*self.state.borrow(), LifecycleState::ShuttingDown(_))
    }

    /// Tick every second until the channel shuts down. The ticker is dropped
    /// on the way out, which is the only place it stops.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(TICK_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            let event = tokio::select! {
                _ = ticker.tick() => LifecycleEvent::Tick,
                received = self.events.recv() => match received {
                    Some(event) => event,
                    None => break,
                },
            };
            if let Some(reason) = self.dispatch(event) {
                self.enter_shutdown(reason);
                break;
            }
        }
        debug!(event = "supervisor_stopped");
    }

    pub fn dispatch(&mut self, event: LifecycleEvent) -> Option<ShutdownReason> {
        self.dispatch_at(event, Instant::now())
    }

    /// Decide the transition for `event`. Once shutting down, every event is
    /// ignored.
    pub fn dispatch_at(&mut self, event: LifecycleEvent, now: Instant) -> Option<ShutdownReason> {
        if self.is_shutting_down() {
            return None;
        }
        match event {
            LifecycleEvent::Tick => self.on_tick(now),
            LifecycleEvent::ViewerConnected { conn_id } => {
                debug!(event = "viewer_joined", conn_id = %conn_id, viewers = self.channel.viewer_count());
                None
            }
            LifecycleEvent::ViewerDisconnected { conn_id } => {
                debug!(event = "viewer_left", conn_id = %conn_id, viewers = self.channel.viewer_count());
                None
            }
            LifecycleEvent::ShutdownRequested => Some(ShutdownReason::ManualShutdown),
            LifecycleEvent::Interrupted => Some(ShutdownReason::ManualInterrupt),
            LifecycleEvent::Terminated => Some(ShutdownReason::Terminated),
        }
    }

    fn on_tick(&self, now: Instant) -> Option<ShutdownReason> {
        self.channel.idle_timeout()?;
        match evaluate_tick(self.channel.remaining_idle_seconds_at(now)) {
            TickOutcome::Quiet => None,
            TickOutcome::Warning(remaining) => {
                self.channel.publish(&ViewerEvent::TimerWarning(remaining));
                debug!(event = "idle_warning", remaining = remaining);
                None
            }
            TickOutcome::Expired => Some(ShutdownReason::IdleTimeout),
        }
    }

    /// Broadcast the shutdown, close every viewer and flip the state. Only
    /// the first call does anything.
    pub fn enter_shutdown(&mut self, reason: ShutdownReason) -> bool {
        if self.is_shutting_down() {
            warn!(event = "shutdown_repeat", reason = %reason);
            return false;
        }
        self.state.send_replace(LifecycleState::ShuttingDown(reason));
        let (report, closed) = self.channel.shutdown(reason.as_str());
        info!(
            event = "shutdown",
            reason = %reason,
            notified = report.delivered,
            closed = closed
        );
        true
    }
}
