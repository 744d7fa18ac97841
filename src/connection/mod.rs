pub mod bus;
pub mod connection;
pub mod control;
pub mod directory;
pub mod file_connection;
mod listener;
