pub mod config;
pub mod controller;
pub mod dynamic_filters;
pub mod metrics;
pub mod transport;

#[cfg(test)]
mod testing;

pub use controller::RemoteTaskController;
pub use dynamic_filters::DynamicFilterRegistry;
pub use transport::{HttpTaskTransport, TaskTransport};
