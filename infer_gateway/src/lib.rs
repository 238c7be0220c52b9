mod routes;
mod server;

pub mod accumulator;
pub mod app;
pub mod batch;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod pipeline;
pub mod pool;
pub mod postprocess;
pub mod preprocess;
pub mod request;
pub mod telemetry;

pub use app::start_app;
pub use error::{ExecutorError, ExecutorErrorKind, GatewayError};
pub use gateway::Gateway;
pub use pipeline::VariantInfo;
pub use server::{router, HttpServer};
