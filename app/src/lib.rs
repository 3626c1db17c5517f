pub mod config;
pub mod logging;
pub mod service;

pub use config::ServiceConfig;
pub use service::Service;
