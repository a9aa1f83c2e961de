//! Per-user adapters: weight bundles and their on-disk store

pub mod bundle;
pub mod store;

pub use bundle::{AdapterBundle, AdapterMeta};
pub use store::{AdapterStore, SavedAdapter};
