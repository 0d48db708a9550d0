use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use crate::{
    predictions::{CartItem, PredictionEntry, PredictionError, error::disposed},
    service::PredictionServicePort,
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderEstimateSnapshot {
    pub prediction: Option<PredictionEntry>,
    pub loading: bool,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct EstimatorState {
    snapshot: OrderEstimateSnapshot,
    request_seq: u64,
    disposed: bool,
}

/// Ready-time estimate for a whole cart.
///
/// Only the most recently issued request may write state; older responses are
/// dropped when they land.
#[derive(Clone)]
pub struct OrderEstimator {
    service: Arc<dyn PredictionServicePort>,
    state: Arc<Mutex<EstimatorState>>,
    state_tx: Arc<watch::Sender<OrderEstimateSnapshot>>,
}

impl OrderEstimator {
    pub fn new(service: Arc<dyn PredictionServicePort>) -> Self {
        let (state_tx, _) = watch::channel(OrderEstimateSnapshot::default());
        Self {
            service,
            state: Arc::new(Mutex::new(EstimatorState::default())),
            state_tx: Arc::new(state_tx),
        }
    }

    pub fn snapshot(&self) -> OrderEstimateSnapshot {
        self.lock_state().snapshot.clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<OrderEstimateSnapshot> {
        self.state_tx.subscribe()
    }

    /// Requests a ready-time prediction for `cart_items` at `vendor_id`.
    ///
    /// An empty cart or vendor resets the prediction without calling the
    /// service. Service failures are recorded in `last_error` and clear the
    /// prediction; they are not returned.
    #[tracing::instrument(
        name = "order_estimate",
        target = "predictions.order",
        skip(self, cart_items),
        fields(cart_size = cart_items.len())
    )]
    pub async fn estimate(
        &self,
        cart_items: &[CartItem],
        vendor_id: &str,
    ) -> Result<(), PredictionError> {
        let vendor_id = vendor_id.trim();
        let request_seq = {
            let mut state = self.lock_state();
            if state.disposed {
                return Err(disposed());
            }
            state.request_seq = state.request_seq.saturating_add(1);

            if cart_items.is_empty() || vendor_id.is_empty() {
                state.snapshot.prediction = None;
                state.snapshot.loading = false;
                self.publish(&state);
                return Ok(());
            }

            state.snapshot.loading = true;
            state.snapshot.last_error = None;
            self.publish(&state);
            state.request_seq
        };

        let result = self
            .service
            .predict_order_ready_time(cart_items, vendor_id)
            .await;

        let mut state = self.lock_state();
        if state.disposed || state.request_seq != request_seq {
            tracing::debug!(
                target: "predictions.order",
                vendor_id = %vendor_id,
                request_seq = request_seq,
                "stale_order_estimate_dropped"
            );
            return Ok(());
        }

        match result {
            Ok(prediction) => {
                state.snapshot.prediction = Some(prediction);
            }
            Err(err) => {
                tracing::error!(
                    target: "predictions.order",
                    vendor_id = %vendor_id,
                    error = %err,
                    "order_estimate_failed"
                );
                state.snapshot.last_error = Some(err.to_string());
                state.snapshot.prediction = None;
            }
        }
        state.snapshot.loading = false;
        self.publish(&state);
        Ok(())
    }

    pub fn dispose(&self) {
        let mut state = self.lock_state();
        state.disposed = true;
        state.request_seq = state.request_seq.saturating_add(1);
    }

    fn lock_state(&self) -> MutexGuard<'_, EstimatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &EstimatorState) {
        self.state_tx.send_replace(state.snapshot.clone());
    }
}
