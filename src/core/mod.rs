pub mod circular_buffer;
pub mod classify;
pub mod config;
pub mod health;
pub mod queue;
pub mod rate_limit;
pub mod reconnect;
pub mod state;
pub mod types;

pub use circular_buffer::*;
pub use classify::*;
pub use config::*;
pub use health::*;
pub use queue::*;
pub use rate_limit::*;
pub use reconnect::*;
pub use state::*;
pub use types::*;
