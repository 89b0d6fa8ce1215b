pub mod auth;
pub mod cache;
pub mod clock;
pub mod config;
pub mod endpoints;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod health;
pub mod key_generator;
pub mod middleware;
pub mod pipeline;
pub mod rate_limiter;
pub mod request;
pub mod response;
pub mod server;
pub mod token_store;
pub mod upstream;
pub mod validation;

pub use config::Config;
pub use error::{GatewayError, Result};
pub use gateway::Gateway;
pub use pipeline::RequestPipeline;
pub use request::{Method, NormalizedRequest};
pub use server::create_app;
