pub mod channel;
pub mod protocol;
pub mod server;

pub use channel::{Session, ToolChannel};
