//! IPC module for daemon communication with the UI, the host and agents

mod protocol;
mod server;

pub use protocol::{DaemonStatus, Notification, Request, Response, MAX_FRAME_LEN};
pub use server::{read_frame, send_message, Server};
