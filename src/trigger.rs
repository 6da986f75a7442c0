//! Display trigger: fires due agenda entries at most once.
//!
//! An entry moves `Pending -> Dispatched -> Shown` and never back. The claim is
//! the conditional update in [`Cache::mark_shown`]: whichever scan flips
//! `shown` first owns the display, every other scan sees `false` and skips.

use crate::activity::ActivityMonitor;
use crate::cache::Cache;
use crate::model::{
    AgendaEntry, Content, EngagementOutcome, EngagementState, Message, SurfaceSignals,
};
use crate::outcome::OutcomeSink;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// What the display surface is asked to show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderRequest {
    pub message_id: i64,
    pub content: Content,
    /// 0..=8, row-major over a 3x3 screen grid.
    pub zone: u8,
    pub duration_seconds: u32,
    pub link: Option<String>,
}

impl From<Message> for RenderRequest {
    fn from(message: Message) -> Self {
        Self {
            message_id: message.id,
            content: message.content,
            zone: message.zone,
            duration_seconds: message.duration_seconds,
            link: message.link,
        }
    }
}

/// Platform collaborator that paints content. `present` resolves when the
/// window has closed, carrying what the user did with it.
#[async_trait]
pub trait DisplaySurface: Send + Sync {
    async fn present(&self, request: RenderRequest) -> Result<SurfaceSignals>;
}

pub struct DisplayTrigger {
    cache: Cache,
    surface: Arc<dyn DisplaySurface>,
    monitor: ActivityMonitor,
    outcomes: Arc<dyn OutcomeSink>,
}

impl DisplayTrigger {
    pub fn new(
        cache: Cache,
        surface: Arc<dyn DisplaySurface>,
        monitor: ActivityMonitor,
        outcomes: Arc<dyn OutcomeSink>,
    ) -> Self {
        Self {
            cache,
            surface,
            monitor,
            outcomes,
        }
    }

    /// Fire every unshown entry scheduled in the minute of `now`, one after the
    /// other. Returns the number of entries displayed by this pass.
    pub async fn scan_and_fire(&self, now: NaiveDateTime) -> Result<usize> {
        let claimed = self.claim_due(now).await?;
        let fired = claimed.len();
        for message in claimed {
            self.dispatch(message).await;
        }
        Ok(fired)
    }

    /// Claim every displayable entry due in the minute of `now` and return the
    /// parsed messages. Claimed entries are already marked shown; the caller
    /// owns their dispatch.
    #[instrument(skip_all, fields(now = %now))]
    pub async fn claim_due(&self, now: NaiveDateTime) -> Result<Vec<Message>> {
        let due: Vec<AgendaEntry> = self
            .cache
            .list_agenda()
            .await?
            .into_iter()
            .filter(|entry| entry.is_due(now))
            .collect();
        if due.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = due.iter().map(|e| e.message_id).collect();
        let bodies = self.cache.get_messages(&ids).await.unwrap_or_else(|err| {
            warn!(?err, "failed to read cached message bodies; retrying next scan");
            HashMap::new()
        });

        let mut claimed = Vec::new();
        for entry in due {
            let Some(message) = resolve(&entry, &bodies) else {
                continue;
            };
            match self.cache.mark_shown(entry.message_id, entry.scheduled_at).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(message_id = entry.message_id, "entry already claimed");
                    continue;
                }
                Err(err) => {
                    warn!(?err, message_id = entry.message_id, "failed to claim agenda entry");
                    continue;
                }
            }
            info!(
                message_id = entry.message_id,
                scheduled_at = %entry.scheduled_at,
                "firing agenda entry"
            );
            claimed.push(message);
        }
        Ok(claimed)
    }

    /// Show a listed entry right away. The entry is marked shown so the
    /// scheduled scan will not display it again; an entry that was already
    /// shown is displayed anyway, as the user asked for it.
    #[instrument(skip_all, fields(message_id = message_id, scheduled_at = %scheduled_at))]
    pub async fn fire_on_demand(
        &self,
        message_id: i64,
        scheduled_at: NaiveDateTime,
    ) -> Result<Option<EngagementOutcome>> {
        let bodies = self.cache.get_messages(&[message_id]).await?;
        let entry = AgendaEntry {
            message_id,
            scheduled_at,
            shown: false,
        };
        let Some(message) = resolve(&entry, &bodies) else {
            return Ok(None);
        };
        let claimed = self.cache.mark_shown(message_id, scheduled_at).await?;
        debug!(claimed, "on-demand display");
        Ok(Some(self.dispatch(message).await))
    }

    /// Present `message`, observe the user meanwhile and submit the outcome.
    pub async fn dispatch(&self, message: Message) -> EngagementOutcome {
        let message_id = message.id;
        let zone = message.zone;
        let duration = message.duration_seconds;
        let (rendered, activity) = tokio::join!(
            self.surface.present(RenderRequest::from(message)),
            self.monitor.observe(duration)
        );
        let signals = rendered.unwrap_or_else(|err| {
            warn!(?err, message_id, "display surface failed");
            SurfaceSignals::default()
        });
        let outcome = EngagementOutcome {
            message_id,
            state: EngagementState::classify(signals, activity),
            zone,
            timestamp: Utc::now(),
        };
        info!(message_id, zone, state = outcome.state.as_str(), "display finished");
        self.outcomes.submit(outcome.clone());
        outcome
    }
}

/// Parse the cached body for `entry`, or log why it is skipped this cycle.
fn resolve(entry: &AgendaEntry, bodies: &HashMap<i64, Value>) -> Option<Message> {
    let Some(body) = bodies.get(&entry.message_id) else {
        debug!(message_id = entry.message_id, "message body not cached yet; retrying later");
        return None;
    };
    match Message::parse(entry.message_id, body) {
        Ok(message) => Some(message),
        Err(err) => {
            warn!(%err, message_id = entry.message_id, "skipping undisplayable message");
            None
        }
    }
}
