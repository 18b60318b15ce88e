//! Best-effort fan-out to viewer sockets.
//!
//! Each viewer owns a bounded outbound queue drained by its socket writer
//! task. Publishing never waits: a full or closed queue counts as a failed
//! send for that viewer and the event is dropped for it. There is no retry
//! and no backpressure on the publisher; delivery is at most once per viewer
//! per event, in publish order.

use axum::extract::ws::{CloseFrame, Message};
use spc_core::ViewerEvent;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

pub const VIEWER_QUEUE_CAPACITY: usize = 256;
pub const CLOSE_GOING_AWAY: u16 = 1001;

#[derive(Debug, Clone)]
pub struct Viewer {
    conn_id: String,
    sender: mpsc::Sender<Message>,
}

impl Viewer {
    pub fn new(conn_id: String, sender: mpsc::Sender<Message>) -> Self {
        Self { conn_id, sender }
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }

    pub fn send_event(&self, event: &ViewerEvent) -> bool {
        match encode_event(event) {
            Some(text) => self.send_text(&text),
            None => false,
        }
    }

    pub fn send_text(&self, text: &str) -> bool {
        match self.sender.try_send(Message::Text(text.to_string())) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(event = "viewer_queue_full", conn_id = %self.conn_id);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a 1001 close frame. A full or closed queue drops it.
    pub fn close(&self, reason: &str) -> bool {
        let frame = Message::Close(Some(CloseFrame {
            code: CLOSE_GOING_AWAY,
            reason: reason.to_string().into(),
        }));
        match self.sender.try_send(frame) {
            Ok(()) => true,
            Err(err) => {
                debug!(
                    event = "viewer_close_dropped",
                    conn_id = %self.conn_id,
                    reason = reason,
                    error = %err
                );
                false
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub failed: usize,
}

pub fn encode_event(event: &ViewerEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(text) => Some(text),
        Err(err) => {
            warn!(event = "encode_error", kind = event.kind(), error = %err);
            None
        }
    }
}

/// Send `event` to every open viewer. Per-viewer failures are counted and
/// swallowed; they never stop delivery to the rest.
pub fn publish<'a>(viewers: impl IntoIterator<Item = &'a Viewer>, event: &ViewerEvent) -> PublishReport {
    let mut report = PublishReport::default();
    let Some(text) = encode_event(event) else {
        return report;
    };
    for viewer in viewers {
        if viewer.is_open() && viewer.send_text(&text) {
            report.delivered += 1;
        } else {
            report.failed += 1;
            debug!(event = "send_error", conn_id = %viewer.conn_id, kind = event.kind());
        }
    }
    report
}
