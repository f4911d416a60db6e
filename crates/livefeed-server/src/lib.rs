pub mod config;
pub mod error;
pub mod server;
pub mod stream;

pub use config::{Args, ServerConfig};
pub use server::{AppState, router, run, serve};
