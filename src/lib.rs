pub mod bus;
pub mod chat;
pub mod client;
pub mod config;
pub mod detector;
pub mod error;
pub mod files;
pub mod inference;
pub mod monitor;
pub mod sandbox;
pub mod scrub;
pub mod server;
pub mod tool;

pub use bus::ObserverBus;
pub use config::Config;
pub use detector::{Detector, Verdict};
pub use error::Error;
pub use monitor::ActivityMonitor;
pub use sandbox::PathSandbox;
pub use server::{AppState, start_server};
pub use tool::ToolChannel;
