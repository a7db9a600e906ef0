pub mod board;
pub mod config;
pub mod connection;
pub mod control;

pub use board::{spawn_board_feed, TaskBoard};
pub use config::{ClientConfig, ReconnectPolicy};
pub use connection::{ConnectError, ConnectionManager, ConnectionState};
pub use control::{ControlClient, ControlError};
