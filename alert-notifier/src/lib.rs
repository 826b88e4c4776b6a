pub mod app;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod poller;
pub mod registry;
pub mod subscriber;

pub use app::{create_router, AppState};
pub use config::Config;
pub use dispatcher::Dispatcher;
pub use poller::QueuePoller;
pub use registry::StreamRegistry;
