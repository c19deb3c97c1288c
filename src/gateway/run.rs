//! Tracking of the active chat run.
//!
//! A run is identified locally by the idempotency key sent with
//! `chat.send`; the gateway may also assign its own run id in the
//! acknowledgement. Events naming any other run are stale and dropped.

use super::GatewayUpdate;
use super::protocol::{ChatEvent, ChatState};
use tracing::debug;

#[derive(Debug)]
struct ActiveRun {
    key: String,
    server_run_id: Option<String>,
    last_emitted: Option<String>,
}

impl ActiveRun {
    fn matches(&self, run_id: &str) -> bool {
        run_id == self.key || self.server_run_id.as_deref() == Some(run_id)
    }
}

/// At most one run is active; starting a new one invalidates the previous.
#[derive(Debug)]
pub(crate) struct RunTracker {
    session_key: String,
    active: Option<ActiveRun>,
}

impl RunTracker {
    pub(crate) fn new(session_key: impl Into<String>) -> Self {
        Self {
            session_key: session_key.into(),
            active: None,
        }
    }

    pub(crate) fn begin(&mut self, key: &str) {
        if let Some(prev) = &self.active {
            debug!(previous = %prev.key, next = %key, "replacing active chat run");
        }
        self.active = Some(ActiveRun {
            key: key.to_owned(),
            server_run_id: None,
            last_emitted: None,
        });
    }

    /// Record the gateway's run id from the `chat.send` acknowledgement.
    pub(crate) fn acknowledge(&mut self, key: &str, server_run_id: Option<String>) {
        if let Some(run) = self.active.as_mut().filter(|r| r.key == key) {
            run.server_run_id = server_run_id;
        }
    }

    /// Drop `key` if it is the active run. Returns the id to abort on the gateway.
    pub(crate) fn end(&mut self, key: &str) -> Option<String> {
        let run = self.active.take_if(|r| r.key == key)?;
        Some(run.server_run_id.unwrap_or(run.key))
    }

    /// Forget the active run, whatever it is. Returns its key.
    pub(crate) fn clear(&mut self) -> Option<String> {
        self.active.take().map(|r| r.key)
    }

    #[cfg(test)]
    pub(crate) fn active_key(&self) -> Option<&str> {
        self.active.as_ref().map(|r| r.key.as_str())
    }

    /// Apply a `chat` event, returning the updates to publish.
    ///
    /// `delta` carries the full text so far and replaces what came before.
    /// `final` first publishes the last text if it was never published, then
    /// ends the run. `error` and `aborted` end the run without more text.
    pub(crate) fn apply(&mut self, event: ChatEvent) -> Vec<GatewayUpdate> {
        let Some(run) = self.active.as_mut() else {
            debug!(state = ?event.state, "chat event with no active run");
            return Vec::new();
        };
        if event
            .session_key
            .as_deref()
            .is_some_and(|s| s != self.session_key)
        {
            return Vec::new();
        }
        if let Some(id) = event.run_id.as_deref()
            && !run.matches(id)
        {
            debug!(run_id = id, active = %run.key, "discarding event for stale run");
            return Vec::new();
        }

        let key = run.key.clone();
        match event.state {
            ChatState::Delta => {
                let Some(text) = event.text() else {
                    return Vec::new();
                };
                if run.last_emitted.as_deref() == Some(text.as_str()) {
                    return Vec::new();
                }
                run.last_emitted = Some(text.clone());
                vec![GatewayUpdate::Delta { run: key, text }]
            }
            ChatState::Final => {
                let text = event
                    .text()
                    .or_else(|| run.last_emitted.clone())
                    .unwrap_or_default();
                let mut out = Vec::with_capacity(2);
                if !text.is_empty() && run.last_emitted.as_deref() != Some(text.as_str()) {
                    out.push(GatewayUpdate::Delta {
                        run: key.clone(),
                        text: text.clone(),
                    });
                }
                out.push(GatewayUpdate::Final { run: key, text });
                self.active = None;
                out
            }
            ChatState::Error => {
                let message = event
                    .error_message
                    .unwrap_or_else(|| "chat run failed".to_owned());
                self.active = None;
                vec![GatewayUpdate::Failed { run: key, message }]
            }
            ChatState::Aborted => {
                self.active = None;
                vec![GatewayUpdate::Aborted { run: key }]
            }
            ChatState::Unknown => Vec::new(),
        }
    }
}
