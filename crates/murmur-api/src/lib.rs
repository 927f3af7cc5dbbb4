pub mod chats;
pub mod error;
pub mod groups;
pub mod messages;
pub mod middleware;
pub mod state;

pub use state::{AppState, AppStateInner};
