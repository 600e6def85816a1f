pub mod api;
pub mod auth;
pub mod completion;
pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod publisher;
pub mod reallocation;
pub mod saga;
pub mod schema;
pub mod service;
pub mod store;

pub use error::{Disposition, Result, WarehouseError};
pub use service::{Warehouse, WarehouseConfig};
