use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::extract;
use crate::fetch::{FetchError, Fetchers};
use crate::notify::{NotificationBatch, Notifier, NotifyError};
use crate::settings::Target;
use crate::store::SeenItemStore;

#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("notification for {target} failed ({count} new items already marked seen): {source}")]
    Notify {
        target: String,
        count: usize,
        #[source]
        source: NotifyError,
    },
}

/// Fetch → extract → diff → notify for a single target.
pub struct TargetChecker {
    fetchers: Fetchers,
    notifier: Arc<dyn Notifier>,
    subject_prefix: String,
}

impl TargetChecker {
    pub fn new(fetchers: Fetchers, notifier: Arc<dyn Notifier>, subject_prefix: &str) -> Self {
        Self {
            fetchers,
            notifier,
            subject_prefix: subject_prefix.to_string(),
        }
    }

    /// Check one target and return the items that were new.
    ///
    /// A failed fetch is logged and yields an empty batch. New identifiers are
    /// added to `store` before the notifier runs, so a failed notification never
    /// makes them new again; the failure is returned for the caller to log.
    ///
    /// `shutdown` only interrupts the fetch. Once items are added to `store`
    /// the notification runs to completion.
    pub async fn check(
        &self,
        target: &Target,
        store: &mut SeenItemStore,
        shutdown: &CancellationToken,
    ) -> Result<NotificationBatch, CheckError> {
        info!(target_name = %target.name, url = %target.url, mode = %target.fetch_mode, "Checking");

        let mut batch = NotificationBatch::new(&target.name);

        let fetched = tokio::select! {
            res = self.fetch(target) => res,
            _ = shutdown.cancelled() => {
                info!(target_name = %target.name, "Fetch interrupted by shutdown");
                return Ok(batch);
            }
        };

        let html = match fetched {
            Ok(html) => html,
            Err(e) => {
                warn!(target_name = %target.name, url = %target.url, "Fetch failed: {}", e);
                return Ok(batch);
            }
        };

        let items = extract::extract(&html, &target.selector, &target.base_url);
        debug!(target_name = %target.name, extracted = items.len(), "Extracted items");

        for item in items {
            if !store.contains(&item.id) {
                store.add(item.id.clone());
                batch.items.push(item);
            }
        }

        if batch.is_empty() {
            debug!(target_name = %target.name, "No new items");
            return Ok(batch);
        }

        info!(target_name = %target.name, count = batch.len(), "Found new items");

        let subject = batch.subject(&self.subject_prefix);
        self.notifier
            .notify(&subject, &batch.items)
            .await
            .map_err(|source| CheckError::Notify {
                target: target.name.clone(),
                count: batch.len(),
                source,
            })?;

        Ok(batch)
    }

    async fn fetch(&self, target: &Target) -> Result<String, FetchError> {
        self.fetchers
            .for_mode(target.fetch_mode)?
            .fetch(&target.url)
            .await
    }
}
