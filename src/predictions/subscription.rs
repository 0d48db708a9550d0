use std::sync::Arc;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    predictions::types::{PredictionUpdate, VendorId},
    service::{FeedCancelHandle, PredictionFeed},
};

pub(crate) type UpdateSink = Arc<dyn Fn(PredictionUpdate) + Send + Sync>;

/// Owns one live-update feed and the task pumping it into the store.
///
/// Released exactly once: either explicitly through [`Subscription::release`]
/// or when dropped. A feed that ends on its own (error or close) counts as
/// released as soon as the pump exits.
pub struct Subscription {
    vendor_id: VendorId,
    shutdown: CancellationToken,
    cancel: Option<FeedCancelHandle>,
    released: bool,
}

impl Subscription {
    pub(crate) fn start(vendor_id: VendorId, feed: PredictionFeed, sink: UpdateSink) -> Self {
        let shutdown = CancellationToken::new();
        let task_shutdown = shutdown.clone();
        let PredictionFeed { mut stream, cancel } = feed;
        let span = tracing::debug_span!(
            target: "predictions.store",
            "prediction_feed_pump",
            vendor_id = %vendor_id
        );

        tokio::spawn(
            async move {
                let mut delivered = 0_u64;
                loop {
                    tokio::select! {
                        _ = task_shutdown.cancelled() => {
                            tracing::debug!(
                                target: "predictions.store",
                                delivered = delivered,
                                "prediction_feed_released"
                            );
                            break;
                        }
                        item = stream.next() => match item {
                            Some(Ok(update)) => {
                                delivered = delivered.saturating_add(1);
                                sink(update);
                            }
                            Some(Err(err)) => {
                                tracing::warn!(
                                    target: "predictions.store",
                                    error = %err,
                                    delivered = delivered,
                                    "prediction_feed_failed"
                                );
                                break;
                            }
                            None => {
                                tracing::debug!(
                                    target: "predictions.store",
                                    delivered = delivered,
                                    "prediction_feed_closed"
                                );
                                break;
                            }
                        }
                    }
                }
                task_shutdown.cancel();
            }
            .instrument(span),
        );

        Self {
            vendor_id,
            shutdown,
            cancel,
            released: false,
        }
    }

    pub fn vendor_id(&self) -> &str {
        &self.vendor_id
    }

    pub fn is_released(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.shutdown.cancel();
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
        tracing::debug!(
            target: "predictions.store",
            vendor_id = %self.vendor_id,
            "prediction_subscription_released"
        );
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
