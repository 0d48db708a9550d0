pub mod error;
pub mod store;
pub mod subscription;
pub mod types;

pub use error::{PredictionError, PredictionErrorKind};
pub use store::PredictionStore;
pub use subscription::Subscription;
pub use types::{
    CartItem, ItemId, PredictionEntry, PredictionMap, PredictionSnapshot, PredictionStoreConfig,
    PredictionUpdate, PredictionUpdateKind, RequestStatus, VendorId,
};
