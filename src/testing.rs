use std::{
    collections::{BTreeSet, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    predictions::types::{
        CartItem, ItemId, PredictionEntry, PredictionMap, PredictionUpdate, VendorId,
    },
    service::{PredictionFeed, PredictionServicePort, ServiceError},
};

type Scripted<T> = Result<T, ServiceError>;

enum Reply<T> {
    Ready(Scripted<T>),
    Gated(oneshot::Receiver<Scripted<T>>),
}

impl<T> Reply<T> {
    async fn resolve(self) -> Scripted<T> {
        match self {
            Reply::Ready(result) => result,
            Reply::Gated(rx) => rx.await.unwrap_or_else(|_| {
                Err(ServiceError::Unavailable(
                    "scripted reply gate was dropped".to_string(),
                ))
            }),
        }
    }
}

struct Replies<T> {
    queue: Mutex<VecDeque<Reply<T>>>,
}

impl<T> Default for Replies<T> {
    fn default() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }
}

impl<T> Replies<T> {
    fn push_ready(&self, result: Scripted<T>) {
        lock(&self.queue).push_back(Reply::Ready(result));
    }

    fn push_gated(&self) -> oneshot::Sender<Scripted<T>> {
        let (tx, rx) = oneshot::channel();
        lock(&self.queue).push_back(Reply::Gated(rx));
        tx
    }

    fn next(&self, operation: &str) -> Reply<T> {
        lock(&self.queue).pop_front().unwrap_or_else(|| {
            Reply::Ready(Err(ServiceError::Unavailable(format!(
                "no scripted reply for {operation}"
            ))))
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceCalls {
    pub order_estimates: usize,
    pub quick_estimates: Vec<(VendorId, ItemId)>,
    pub batches: Vec<(VendorId, BTreeSet<ItemId>)>,
    pub subscribes: Vec<VendorId>,
}

struct FeedSlot {
    vendor_id: VendorId,
    tx: mpsc::UnboundedSender<Result<PredictionUpdate, ServiceError>>,
    cancelled: Arc<AtomicBool>,
}

impl FeedSlot {
    fn is_live(&self) -> bool {
        !self.cancelled.load(Ordering::SeqCst) && !self.tx.is_closed()
    }
}

/// Prediction service double whose replies are queued up front.
///
/// Gated replies let a test decide when (and in which order) an in-flight call
/// completes. Calls with no queued reply fail with `Unavailable`.
pub struct ScriptedPredictionService {
    order_replies: Replies<PredictionEntry>,
    estimate_replies: Replies<PredictionEntry>,
    batch_replies: Replies<PredictionMap>,
    subscribe_failures: Mutex<VecDeque<ServiceError>>,
    subscribe_holds: Mutex<VecDeque<oneshot::Receiver<()>>>,
    feeds: Mutex<Vec<FeedSlot>>,
    calls: watch::Sender<ServiceCalls>,
}

impl Default for ScriptedPredictionService {
    fn default() -> Self {
        let (calls, _) = watch::channel(ServiceCalls::default());
        Self {
            order_replies: Replies::default(),
            estimate_replies: Replies::default(),
            batch_replies: Replies::default(),
            subscribe_failures: Mutex::new(VecDeque::new()),
            subscribe_holds: Mutex::new(VecDeque::new()),
            feeds: Mutex::new(Vec::new()),
            calls,
        }
    }
}

impl ScriptedPredictionService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_order_estimate(&self, result: Scripted<PredictionEntry>) {
        self.order_replies.push_ready(result);
    }

    pub fn push_gated_order_estimate(&self) -> oneshot::Sender<Scripted<PredictionEntry>> {
        self.order_replies.push_gated()
    }

    pub fn push_estimate(&self, result: Scripted<PredictionEntry>) {
        self.estimate_replies.push_ready(result);
    }

    pub fn push_gated_estimate(&self) -> oneshot::Sender<Scripted<PredictionEntry>> {
        self.estimate_replies.push_gated()
    }

    pub fn push_batch(&self, result: Scripted<PredictionMap>) {
        self.batch_replies.push_ready(result);
    }

    pub fn push_gated_batch(&self) -> oneshot::Sender<Scripted<PredictionMap>> {
        self.batch_replies.push_gated()
    }

    pub fn fail_next_subscribe(&self, err: ServiceError) {
        lock(&self.subscribe_failures).push_back(err);
    }

    /// The next `subscribe` call waits until the returned sender fires (or drops).
    pub fn hold_next_subscribe(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        lock(&self.subscribe_holds).push_back(rx);
        tx
    }

    /// Pushes `update` to every live feed for `vendor_id`; returns how many got it.
    pub fn push_update(&self, vendor_id: &str, update: PredictionUpdate) -> usize {
        lock(&self.feeds)
            .iter()
            .filter(|slot| slot.vendor_id == vendor_id && slot.is_live())
            .filter(|slot| slot.tx.send(Ok(update.clone())).is_ok())
            .count()
    }

    /// Like [`Self::push_update`] but also reaches feeds the store already
    /// released, as long as their pump has not stopped reading yet.
    pub fn push_update_ignoring_release(&self, vendor_id: &str, update: PredictionUpdate) -> usize {
        lock(&self.feeds)
            .iter()
            .filter(|slot| slot.vendor_id == vendor_id && !slot.tx.is_closed())
            .filter(|slot| slot.tx.send(Ok(update.clone())).is_ok())
            .count()
    }

    /// Fails every live feed for `vendor_id` with `err`.
    pub fn fail_feeds(&self, vendor_id: &str, err: ServiceError) {
        for slot in lock(&self.feeds)
            .iter()
            .filter(|slot| slot.vendor_id == vendor_id && slot.is_live())
        {
            let _ = slot.tx.send(Err(err.clone()));
        }
    }

    /// Ends every feed for `vendor_id` as if the service hung up.
    pub fn close_feeds(&self, vendor_id: &str) {
        lock(&self.feeds).retain(|slot| slot.vendor_id != vendor_id);
    }

    pub fn live_feeds(&self, vendor_id: &str) -> usize {
        lock(&self.feeds)
            .iter()
            .filter(|slot| slot.vendor_id == vendor_id && slot.is_live())
            .count()
    }

    pub fn calls(&self) -> ServiceCalls {
        self.calls.borrow().clone()
    }

    pub async fn wait_for_calls(&self, predicate: impl FnMut(&ServiceCalls) -> bool) {
        let mut rx = self.calls.subscribe();
        let _ = rx.wait_for(predicate).await;
    }

    fn record(&self, update: impl FnOnce(&mut ServiceCalls)) {
        self.calls.send_modify(update);
    }
}

#[async_trait]
impl PredictionServicePort for ScriptedPredictionService {
    async fn predict_order_ready_time(
        &self,
        _cart_items: &[CartItem],
        _vendor_id: &str,
    ) -> Result<PredictionEntry, ServiceError> {
        let reply = self.order_replies.next("predict_order_ready_time");
        self.record(|calls| calls.order_estimates += 1);
        reply.resolve().await
    }

    async fn quick_estimate(
        &self,
        vendor_id: &str,
        item_id: &str,
    ) -> Result<PredictionEntry, ServiceError> {
        let reply = self.estimate_replies.next("quick_estimate");
        self.record(|calls| {
            calls
                .quick_estimates
                .push((vendor_id.to_string(), item_id.to_string()))
        });
        reply.resolve().await
    }

    async fn batch_predictions(
        &self,
        vendor_id: &str,
        item_ids: &BTreeSet<ItemId>,
    ) -> Result<PredictionMap, ServiceError> {
        let reply = self.batch_replies.next("batch_predictions");
        self.record(|calls| calls.batches.push((vendor_id.to_string(), item_ids.clone())));
        reply.resolve().await
    }

    async fn subscribe(&self, vendor_id: &str) -> Result<PredictionFeed, ServiceError> {
        let hold = lock(&self.subscribe_holds).pop_front();
        let failure = lock(&self.subscribe_failures).pop_front();
        self.record(|calls| calls.subscribes.push(vendor_id.to_string()));

        if let Some(hold) = hold {
            let _ = hold.await;
        }
        if let Some(err) = failure {
            return Err(err);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        lock(&self.feeds).push(FeedSlot {
            vendor_id: vendor_id.to_string(),
            tx,
            cancelled: Arc::clone(&cancelled),
        });

        let cancel = Arc::new(move || cancelled.store(true, Ordering::SeqCst));
        Ok(PredictionFeed {
            stream: Box::pin(UnboundedReceiverStream::new(rx)),
            cancel: Some(cancel),
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
