pub mod alert;
pub mod health;
pub mod metrics;
pub mod store;
