//! Sync reconciler: merges the remote catalog into the local cache.
//!
//! A cycle never fails because of the network. Unreachable endpoints fall back
//! to whatever the cache already holds; one group's or one message's failure is
//! logged and the rest of the batch continues. The only error a cycle returns
//! is a local write failure while persisting agenda entries.

use crate::cache::Cache;
use crate::catalog::CatalogService;
use crate::model::{Message, MessageError, ScheduleTuple};
use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate};
use futures::future::join_all;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Minimum spacing between kept entries of the same message.
pub const DEDUP_WINDOW_MINUTES: i64 = 30;

/// Sort by `(message_id, scheduled_at)` and drop every tuple that falls less
/// than [`DEDUP_WINDOW_MINUTES`] after the last kept tuple of the same message.
pub fn dedup_schedule(mut tuples: Vec<ScheduleTuple>) -> Vec<ScheduleTuple> {
    tuples.sort();
    let window = Duration::minutes(DEDUP_WINDOW_MINUTES);
    let mut kept: Vec<ScheduleTuple> = Vec::with_capacity(tuples.len());
    for tuple in tuples {
        if let Some(last) = kept.last() {
            if last.message_id == tuple.message_id && tuple.scheduled_at - last.scheduled_at < window {
                continue;
            }
        }
        kept.push(tuple);
    }
    kept
}

/// Counters describing one reconciliation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub groups: usize,
    /// Group membership came from the cache because the catalog was unreachable.
    pub offline: bool,
    pub failed_groups: usize,
    pub purged: u64,
    pub fetched: usize,
    pub kept: usize,
    pub inserted: usize,
    pub messages_cached: usize,
}

pub struct Reconciler {
    cache: Cache,
    catalog: Arc<dyn CatalogService>,
    identity: Option<String>,
}

impl Reconciler {
    pub fn new(cache: Cache, catalog: Arc<dyn CatalogService>, identity: Option<String>) -> Self {
        Self {
            cache,
            catalog,
            identity,
        }
    }

    /// Run one full cycle; `today` is the local date used by the stale sweep.
    #[instrument(skip_all, fields(today = %today))]
    pub async fn run_cycle(&self, today: NaiveDate) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        if let Some(identity) = &self.identity {
            self.ensure_registered(identity).await;
        }

        let groups = self.resolve_groups(&mut report).await;
        report.groups = groups.len();

        match self.cache.purge_stale(today).await {
            Ok(purged) => report.purged = purged,
            Err(err) => warn!(?err, "failed to purge stale agenda entries"),
        }

        let fetches = groups.iter().map(|group| async move {
            (group, self.catalog.fetch_schedule(group).await)
        });
        let mut tuples = Vec::new();
        for (group, result) in join_all(fetches).await {
            match result {
                Ok(items) => {
                    debug!(%group, count = items.len(), "fetched schedule");
                    tuples.extend(items);
                }
                Err(err) if err.is_not_found() => debug!(%group, "group has no schedule"),
                Err(err) => {
                    warn!(%err, %group, "failed to fetch group schedule; skipping group");
                    report.failed_groups += 1;
                }
            }
        }
        report.fetched = tuples.len();

        let kept = dedup_schedule(tuples);
        report.kept = kept.len();

        for tuple in &kept {
            let exists = self
                .cache
                .agenda_exists(tuple.message_id, tuple.scheduled_at)
                .await
                .context("failed to read agenda")?;
            if exists {
                continue;
            }
            let inserted = self
                .cache
                .upsert_agenda(tuple.message_id, tuple.scheduled_at)
                .await
                .context("failed to persist agenda entry")?;
            if inserted {
                report.inserted += 1;
                info!(
                    message_id = tuple.message_id,
                    scheduled_at = %tuple.scheduled_at,
                    "new agenda entry"
                );
            }
        }

        let mut ids: BTreeSet<i64> = kept.iter().map(|t| t.message_id).collect();
        match self.cache.agenda_message_ids().await {
            Ok(existing) => ids.extend(existing),
            Err(err) => warn!(?err, "failed to list cached agenda ids"),
        }
        for id in ids {
            if self.backfill_message(id).await {
                report.messages_cached += 1;
            }
        }

        info!(
            groups = report.groups,
            offline = report.offline,
            fetched = report.fetched,
            kept = report.kept,
            inserted = report.inserted,
            messages = report.messages_cached,
            "reconciliation cycle finished"
        );
        Ok(report)
    }

    async fn ensure_registered(&self, identity: &str) {
        match self.catalog.identity_exists(identity).await {
            Ok(true) => debug!(%identity, "identity already registered"),
            Ok(false) => match self.catalog.register_identity(identity).await {
                Ok(()) => info!(%identity, "registered identity"),
                Err(err) => warn!(%err, %identity, "failed to register identity"),
            },
            Err(err) => warn!(%err, %identity, "failed to look up identity"),
        }
    }

    /// Fresh memberships when the catalog answers, the cached snapshot otherwise.
    async fn resolve_groups(&self, report: &mut SyncReport) -> Vec<String> {
        let fetched = match &self.identity {
            Some(identity) => self.catalog.fetch_groups(identity).await,
            None => {
                warn!("no local identity; using cached groups");
                return self.cached_groups(report).await;
            }
        };
        let groups = match fetched {
            Ok(groups) => groups,
            Err(err) if err.is_not_found() => {
                info!("identity has no group memberships");
                Vec::new()
            }
            Err(err) => {
                warn!(%err, "failed to fetch groups; using cached groups");
                return self.cached_groups(report).await;
            }
        };
        if let Err(err) = self.cache.replace_groups(&groups).await {
            warn!(?err, "failed to store group snapshot");
        }
        info!(groups = ?groups, "group memberships");
        groups
    }

    async fn cached_groups(&self, report: &mut SyncReport) -> Vec<String> {
        report.offline = true;
        self.cache.list_groups().await.unwrap_or_else(|err| {
            warn!(?err, "failed to read cached groups");
            Vec::new()
        })
    }

    /// Fetch and cache the body of `id` if it is not cached yet. Returns
    /// whether a new body was stored.
    async fn backfill_message(&self, id: i64) -> bool {
        match self.cache.has_message(id).await {
            Ok(true) => return false,
            Ok(false) => {}
            Err(err) => {
                warn!(?err, id, "failed to check message cache");
                return false;
            }
        }
        let body = match self.catalog.fetch_message(id).await {
            Ok(body) => body,
            Err(err) if err.is_not_found() => {
                debug!(id, "message not in catalog yet");
                return false;
            }
            Err(err) => {
                warn!(%err, id, "failed to fetch message");
                return false;
            }
        };
        match Message::parse(id, &body) {
            Ok(_) => {}
            Err(MessageError::UnsupportedKind(kind)) => {
                warn!(id, %kind, "caching message with unsupported kind");
            }
            Err(err) => {
                warn!(%err, id, "skipping malformed message");
                return false;
            }
        }
        match self.cache.put_message(id, &body).await {
            Ok(()) => {
                info!(id, "new message cached");
                true
            }
            Err(err) => {
                warn!(?err, id, "failed to cache message");
                false
            }
        }
    }
}
