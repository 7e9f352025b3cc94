//! The `rtd` module adapts the connection core to a polling host such as a
//! spreadsheet real-time-data server: cells bind to (topic, field) pairs,
//! a timer tells the host to poll, and each poll reads the message cache.

pub mod server;

pub use server::{
    CellBinding, CellId, CellValue, ERROR_STATUS, LiveDataServer, NOT_CONNECTED_STATUS,
    UpdateNotifier,
};
