pub mod ai;
pub mod auth;
pub mod messages;
pub mod rooms;
pub mod router;

pub use ai::{AiBackend, AiBridge};
pub use router::Router;
