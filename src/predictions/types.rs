use std::{collections::BTreeMap, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type ItemId = String;
pub type VendorId = String;

/// Opaque prediction produced by the service for one item (or one cart).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PredictionEntry(Value);

impl PredictionEntry {
    pub fn new(value: impl Into<Value>) -> Self {
        Self(value.into())
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl From<Value> for PredictionEntry {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

pub type PredictionMap = BTreeMap<ItemId, PredictionEntry>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RequestStatus {
    Idle,
    Loading,
    Ready,
    Failed { reason: String },
}

impl RequestStatus {
    pub fn is_loading(&self) -> bool {
        matches!(self, RequestStatus::Loading)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredictionUpdateKind {
    #[serde(rename = "PREDICTION_UPDATE")]
    PredictionUpdate,
    #[serde(other)]
    Other,
}

/// One message pushed by the live-update feed. Messages of other kinds
/// (heartbeats and the like) may carry no item at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionUpdate {
    #[serde(rename = "type")]
    pub kind: PredictionUpdateKind,
    #[serde(rename = "itemId", alias = "item_id", default)]
    pub item_id: ItemId,
    #[serde(default)]
    pub prediction: PredictionEntry,
}

impl PredictionUpdate {
    pub fn new(item_id: impl Into<ItemId>, prediction: PredictionEntry) -> Self {
        Self {
            kind: PredictionUpdateKind::PredictionUpdate,
            item_id: item_id.into(),
            prediction,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
    #[serde(rename = "itemId", alias = "item_id")]
    pub item_id: ItemId,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

fn default_quantity() -> u32 {
    1
}

/// What observers see. `predictions` is swapped for a new `Arc` on every map
/// change, so `Arc::ptr_eq` tells whether the map moved. The last snapshot a
/// store publishes has `disposed` set.
#[derive(Debug, Clone)]
pub struct PredictionSnapshot {
    pub vendor_id: Option<VendorId>,
    pub predictions: Arc<PredictionMap>,
    pub status: RequestStatus,
    pub last_error: Option<String>,
    pub disposed: bool,
}

impl PredictionSnapshot {
    pub fn is_loading(&self) -> bool {
        self.status.is_loading()
    }

    pub fn get(&self, item_id: &str) -> Option<&PredictionEntry> {
        self.predictions.get(item_id)
    }
}

impl Default for PredictionSnapshot {
    fn default() -> Self {
        Self {
            vendor_id: None,
            predictions: Arc::new(PredictionMap::new()),
            status: RequestStatus::Idle,
            last_error: None,
            disposed: false,
        }
    }
}

fn default_clear_on_scope_change() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionStoreConfig {
    #[serde(default = "default_clear_on_scope_change")]
    pub clear_on_scope_change: bool,
}

impl Default for PredictionStoreConfig {
    fn default() -> Self {
        Self {
            clear_on_scope_change: default_clear_on_scope_change(),
        }
    }
}
