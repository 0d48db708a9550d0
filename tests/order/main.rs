
use prediction_state::predictions::{CartItem, PredictionEntry};
use serde_json::Value;

pub fn entry(value: impl Into<Value>) -> PredictionEntry {
    PredictionEntry::new(value)
}

pub fn cart(item_ids: &[&str]) -> Vec<CartItem> {
    item_ids
        .iter()
        .map(|item_id| CartItem {
            item_id: item_id.to_string(),
            quantity: 1,
        })
        .collect()
}
