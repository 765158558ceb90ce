pub mod call;
pub mod chat;

pub use chat::{ChatMessage, User};
