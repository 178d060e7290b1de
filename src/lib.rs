pub mod cancellation;
pub mod constants;
pub mod conversation;
pub mod db;
pub mod dispatch;
pub mod engine;
pub mod generation_info;
pub mod hardening;
pub mod logging;
pub mod main_helper;
pub mod projections;
pub mod session;
pub mod specs;
pub mod streaming;
pub mod tool_schema;
pub mod types;

pub use types::*;

pub use main_helper::Args;
