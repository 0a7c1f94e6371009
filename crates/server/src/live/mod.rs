//! Live project monitoring: file watching, change dispatch and the
//! realtime hub.

pub mod dispatcher;
pub mod events;
pub mod hub;
pub mod log_cursor;
pub mod monitor;
pub mod watcher;
