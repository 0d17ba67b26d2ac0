pub mod config;
pub mod engine;
pub mod http;

pub use config::Config;
pub use engine::Engine;
