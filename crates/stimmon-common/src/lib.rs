#![doc = "Common types shared across the stimmon workspace."]

pub mod config;
pub mod error;
pub mod event;
pub mod format;
pub mod state;
pub mod time;

pub use config::*;
pub use error::*;
pub use event::*;
pub use format::*;
pub use state::*;
pub use time::*;
