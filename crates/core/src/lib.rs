//! Process-local infrastructure for maestro: the pub/sub event bus and the
//! path-keyed key/value storage every store is built on.

pub mod bus;
pub mod storage;

pub use bus::{topics, BusEvent, EventBus, SubscriptionId};
pub use storage::{LocalStorage, Storage, StorageBackend};
