use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::sync::watch;

use crate::{
    predictions::{
        error::{PredictionError, disposed, invalid_request, invalid_scope, scope_changed},
        subscription::{Subscription, UpdateSink},
        types::{
            ItemId, PredictionEntry, PredictionMap, PredictionSnapshot, PredictionStoreConfig,
            PredictionUpdate, PredictionUpdateKind, RequestStatus, VendorId,
        },
    },
    service::PredictionServicePort,
};

struct StoreState {
    vendor_id: Option<VendorId>,
    // Bumped on every scope change and on dispose; responses carry the epoch
    // they were issued under.
    epoch: u64,
    batch_seq: u64,
    predictions: Arc<PredictionMap>,
    status: RequestStatus,
    last_error: Option<String>,
    subscription: Option<Subscription>,
    disposed: bool,
}

impl StoreState {
    fn new() -> Self {
        Self {
            vendor_id: None,
            epoch: 0,
            batch_seq: 0,
            predictions: Arc::new(PredictionMap::new()),
            status: RequestStatus::Idle,
            last_error: None,
            subscription: None,
            disposed: false,
        }
    }

    fn snapshot(&self) -> PredictionSnapshot {
        PredictionSnapshot {
            vendor_id: self.vendor_id.clone(),
            predictions: Arc::clone(&self.predictions),
            status: self.status.clone(),
            last_error: self.last_error.clone(),
            disposed: self.disposed,
        }
    }

    fn ensure_live(&self) -> Result<(), PredictionError> {
        if self.disposed {
            return Err(disposed());
        }
        Ok(())
    }

    fn active_vendor(&self) -> Result<VendorId, PredictionError> {
        self.ensure_live()?;
        self.vendor_id
            .clone()
            .ok_or_else(|| invalid_scope("no vendor scope is active"))
    }

    fn is_current(&self, epoch: u64) -> bool {
        !self.disposed && self.epoch == epoch
    }

    fn merge_entry(&mut self, item_id: ItemId, entry: PredictionEntry) -> bool {
        if self.predictions.get(&item_id) == Some(&entry) {
            return false;
        }
        let mut next = PredictionMap::clone(&self.predictions);
        next.insert(item_id, entry);
        self.predictions = Arc::new(next);
        true
    }

    fn leave_scope(&mut self, clear_predictions: bool) -> Option<Subscription> {
        self.epoch = self.epoch.saturating_add(1);
        self.status = RequestStatus::Idle;
        self.last_error = None;
        if clear_predictions && !self.predictions.is_empty() {
            self.predictions = Arc::new(PredictionMap::new());
        }
        self.subscription.take()
    }
}

struct StoreInner {
    service: Arc<dyn PredictionServicePort>,
    config: PredictionStoreConfig,
    state: Mutex<StoreState>,
    state_tx: watch::Sender<PredictionSnapshot>,
}

impl StoreInner {
    // Never held across an await.
    fn lock_state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &StoreState) {
        self.state_tx.send_replace(state.snapshot());
    }

    fn apply_feed_update(&self, epoch: u64, update: PredictionUpdate) {
        if update.kind != PredictionUpdateKind::PredictionUpdate
            || update.item_id.trim().is_empty()
        {
            tracing::trace!(
                target: "predictions.store",
                item_id = %update.item_id,
                kind = ?update.kind,
                "prediction_feed_message_ignored"
            );
            return;
        }

        let mut state = self.lock_state();
        if !state.is_current(epoch) {
            tracing::debug!(
                target: "predictions.store",
                item_id = %update.item_id,
                feed_epoch = epoch,
                current_epoch = state.epoch,
                "stale_push_update_dropped"
            );
            return;
        }
        if state.merge_entry(update.item_id, update.prediction) {
            self.publish(&state);
        }
    }
}

/// Client-side prediction state for one vendor scope at a time.
///
/// Cloning yields another handle to the same state. Observers follow changes
/// through [`PredictionStore::watch_state`]; every change publishes a new
/// snapshot.
#[derive(Clone)]
pub struct PredictionStore {
    inner: Arc<StoreInner>,
}

impl PredictionStore {
    pub fn new(service: Arc<dyn PredictionServicePort>, config: PredictionStoreConfig) -> Self {
        let (state_tx, _) = watch::channel(PredictionSnapshot::default());
        Self {
            inner: Arc::new(StoreInner {
                service,
                config,
                state: Mutex::new(StoreState::new()),
                state_tx,
            }),
        }
    }

    pub async fn for_vendor(
        service: Arc<dyn PredictionServicePort>,
        config: PredictionStoreConfig,
        vendor_id: impl Into<VendorId>,
    ) -> Result<Self, PredictionError> {
        let store = Self::new(service, config);
        store.set_scope(vendor_id).await?;
        Ok(store)
    }

    pub fn snapshot(&self) -> PredictionSnapshot {
        self.inner.lock_state().snapshot()
    }

    pub fn watch_state(&self) -> watch::Receiver<PredictionSnapshot> {
        self.inner.state_tx.subscribe()
    }

    pub fn vendor_id(&self) -> Option<VendorId> {
        self.inner.lock_state().vendor_id.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock_state().disposed
    }

    pub fn has_live_subscription(&self) -> bool {
        self.inner
            .lock_state()
            .subscription
            .as_ref()
            .is_some_and(|subscription| !subscription.is_released())
    }

    /// Fetches a quick estimate for one item and merges it into the map.
    ///
    /// Unlike [`PredictionStore::fetch_batch`], failures are returned to the
    /// caller and the loading status is left alone.
    #[tracing::instrument(
        name = "prediction_fetch_one",
        target = "predictions.store",
        skip(self)
    )]
    pub async fn fetch_one(&self, item_id: &str) -> Result<PredictionEntry, PredictionError> {
        let (vendor_id, epoch) = {
            let state = self.inner.lock_state();
            state.ensure_live()?;
            if item_id.trim().is_empty() {
                return Err(invalid_request("item_id cannot be empty"));
            }
            (state.active_vendor()?, state.epoch)
        };

        let result = self.inner.service.quick_estimate(&vendor_id, item_id).await;

        let mut state = self.inner.lock_state();
        if state.disposed {
            return Err(disposed());
        }
        if state.epoch != epoch {
            tracing::debug!(
                target: "predictions.store",
                vendor_id = %vendor_id,
                item_id = %item_id,
                "stale_fetch_one_dropped"
            );
            return Err(scope_changed(format!(
                "vendor scope changed while fetching '{item_id}' for '{vendor_id}'"
            )));
        }

        match result {
            Ok(entry) => {
                if state.merge_entry(item_id.to_string(), entry.clone()) {
                    self.inner.publish(&state);
                }
                Ok(entry)
            }
            Err(err) => {
                tracing::warn!(
                    target: "predictions.store",
                    vendor_id = %vendor_id,
                    item_id = %item_id,
                    error = %err,
                    "fetch_one_failed"
                );
                state.last_error = Some(err.to_string());
                self.inner.publish(&state);
                Err(err.into())
            }
        }
    }

    /// Replaces the whole map with a fresh batch from the service.
    ///
    /// Service failures only surface through `status` and `last_error`; the
    /// previous predictions stay visible. A batch superseded by a later one,
    /// or by a scope change, is discarded when it lands.
    #[tracing::instrument(
        name = "prediction_fetch_batch",
        target = "predictions.store",
        skip(self, item_ids)
    )]
    pub async fn fetch_batch<I, S>(&self, item_ids: I) -> Result<(), PredictionError>
    where
        I: IntoIterator<Item = S>,
        S: Into<ItemId>,
    {
        let item_ids: BTreeSet<ItemId> = item_ids.into_iter().map(Into::into).collect();

        let (vendor_id, epoch, batch_seq) = {
            let mut state = self.inner.lock_state();
            let vendor_id = state.active_vendor()?;
            state.batch_seq = state.batch_seq.saturating_add(1);
            state.status = RequestStatus::Loading;
            state.last_error = None;
            self.inner.publish(&state);
            (vendor_id, state.epoch, state.batch_seq)
        };
        tracing::debug!(
            target: "predictions.store",
            vendor_id = %vendor_id,
            batch_seq = batch_seq,
            item_count = item_ids.len(),
            "fetch_batch_started"
        );

        let result = self
            .inner
            .service
            .batch_predictions(&vendor_id, &item_ids)
            .await;

        let mut state = self.inner.lock_state();
        if !state.is_current(epoch) || state.batch_seq != batch_seq {
            tracing::debug!(
                target: "predictions.store",
                vendor_id = %vendor_id,
                batch_seq = batch_seq,
                latest_batch_seq = state.batch_seq,
                "stale_fetch_batch_dropped"
            );
            return Ok(());
        }

        match result {
            Ok(predictions) => {
                tracing::debug!(
                    target: "predictions.store",
                    vendor_id = %vendor_id,
                    batch_seq = batch_seq,
                    prediction_count = predictions.len(),
                    "fetch_batch_completed"
                );
                state.predictions = Arc::new(predictions);
                state.status = RequestStatus::Ready;
            }
            Err(err) => {
                tracing::warn!(
                    target: "predictions.store",
                    vendor_id = %vendor_id,
                    batch_seq = batch_seq,
                    error = %err,
                    "fetch_batch_failed"
                );
                let reason = err.to_string();
                state.status = RequestStatus::Failed {
                    reason: reason.clone(),
                };
                state.last_error = Some(reason);
            }
        }
        self.inner.publish(&state);
        Ok(())
    }

    /// Merges one pushed prediction. Other keys and the status are untouched.
    pub fn on_push_update(
        &self,
        item_id: impl Into<ItemId>,
        entry: PredictionEntry,
    ) -> Result<(), PredictionError> {
        let item_id = item_id.into();
        let mut state = self.inner.lock_state();
        state.ensure_live()?;
        if item_id.trim().is_empty() {
            return Err(invalid_request("item_id cannot be empty"));
        }
        if state.merge_entry(item_id, entry) {
            self.inner.publish(&state);
        }
        Ok(())
    }

    /// Binds the store to `vendor_id` and opens its live-update feed.
    ///
    /// A no-op when the vendor is unchanged. If the feed cannot be opened the
    /// scope still changes; the error is recorded and returned.
    #[tracing::instrument(
        name = "prediction_set_scope",
        target = "predictions.store",
        skip(self, vendor_id)
    )]
    pub async fn set_scope(&self, vendor_id: impl Into<VendorId>) -> Result<(), PredictionError> {
        let vendor_id = vendor_id.into().trim().to_string();

        let (epoch, previous) = {
            let mut state = self.inner.lock_state();
            state.ensure_live()?;
            if vendor_id.is_empty() {
                return Err(invalid_scope("vendor_id cannot be empty"));
            }
            if state.vendor_id.as_deref() == Some(vendor_id.as_str()) {
                return Ok(());
            }

            let previous = state.leave_scope(self.inner.config.clear_on_scope_change);
            state.vendor_id = Some(vendor_id.clone());
            self.inner.publish(&state);
            (state.epoch, previous)
        };

        if let Some(mut previous) = previous {
            previous.release();
        }
        tracing::info!(
            target: "predictions.store",
            vendor_id = %vendor_id,
            epoch = epoch,
            "prediction_scope_changed"
        );

        self.open_feed(vendor_id, epoch).await
    }

    /// Leaves the current vendor scope without entering a new one.
    pub fn clear_scope(&self) -> Result<(), PredictionError> {
        let previous = {
            let mut state = self.inner.lock_state();
            state.ensure_live()?;
            if state.vendor_id.is_none() {
                return Ok(());
            }
            let previous = state.leave_scope(self.inner.config.clear_on_scope_change);
            state.vendor_id = None;
            self.inner.publish(&state);
            previous
        };

        if let Some(mut previous) = previous {
            previous.release();
        }
        Ok(())
    }

    /// Releases the live-update feed and publishes a final snapshot with
    /// `disposed` set. Every later call fails with `Disposed`.
    pub fn dispose(&self) {
        let previous = {
            let mut state = self.inner.lock_state();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.epoch = state.epoch.saturating_add(1);
            self.inner.publish(&state);
            state.subscription.take()
        };

        if let Some(mut previous) = previous {
            previous.release();
        }
        tracing::debug!(target: "predictions.store", "prediction_store_disposed");
    }

    async fn open_feed(&self, vendor_id: VendorId, epoch: u64) -> Result<(), PredictionError> {
        let feed = match self.inner.service.subscribe(&vendor_id).await {
            Ok(feed) => feed,
            Err(err) => {
                tracing::warn!(
                    target: "predictions.store",
                    vendor_id = %vendor_id,
                    error = %err,
                    "prediction_subscribe_failed"
                );
                let mut state = self.inner.lock_state();
                if state.is_current(epoch) {
                    state.last_error = Some(err.to_string());
                    self.inner.publish(&state);
                }
                return Err(err.into());
            }
        };

        let weak = Arc::downgrade(&self.inner);
        let sink: UpdateSink = Arc::new(move |update| {
            if let Some(inner) = weak.upgrade() {
                inner.apply_feed_update(epoch, update);
            }
        });
        let mut subscription = Subscription::start(vendor_id.clone(), feed, sink);

        let mut state = self.inner.lock_state();
        if !state.is_current(epoch) {
            let was_disposed = state.disposed;
            drop(state);
            subscription.release();
            tracing::debug!(
                target: "predictions.store",
                vendor_id = %vendor_id,
                epoch = epoch,
                "late_subscription_released"
            );
            if was_disposed {
                return Err(disposed());
            }
            return Ok(());
        }

        let replaced = state.subscription.replace(subscription);
        drop(state);
        if let Some(mut replaced) = replaced {
            replaced.release();
        }
        Ok(())
    }
}
