pub mod error;
pub mod http;

use std::{collections::BTreeSet, pin::Pin, sync::Arc};

use async_trait::async_trait;
use futures_core::Stream;

pub use error::ServiceError;
pub use http::HttpPredictionService;

use crate::predictions::types::{
    CartItem, ItemId, PredictionEntry, PredictionMap, PredictionUpdate,
};

pub type FeedCancelHandle = Arc<dyn Fn() + Send + Sync>;
pub type UpdateStream =
    Pin<Box<dyn Stream<Item = Result<PredictionUpdate, ServiceError>> + Send>>;

/// Live-update feed for one vendor. The stream ends when the service closes
/// the feed or `cancel` is invoked; `cancel` may be called any number of times.
pub struct PredictionFeed {
    pub stream: UpdateStream,
    pub cancel: Option<FeedCancelHandle>,
}

#[async_trait]
pub trait PredictionServicePort: Send + Sync {
    async fn predict_order_ready_time(
        &self,
        cart_items: &[CartItem],
        vendor_id: &str,
    ) -> Result<PredictionEntry, ServiceError>;

    async fn quick_estimate(
        &self,
        vendor_id: &str,
        item_id: &str,
    ) -> Result<PredictionEntry, ServiceError>;

    async fn batch_predictions(
        &self,
        vendor_id: &str,
        item_ids: &BTreeSet<ItemId>,
    ) -> Result<PredictionMap, ServiceError>;

    async fn subscribe(&self, vendor_id: &str) -> Result<PredictionFeed, ServiceError>;
}
