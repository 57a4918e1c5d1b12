//! MySQL persistence for the models that carry encrypted credentials.

pub mod models;
pub mod pool;
pub mod store;

pub use pool::{Database, DbError};
pub use store::MySqlModelStore;
