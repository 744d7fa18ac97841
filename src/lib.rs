pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod log;
pub mod registry;
pub mod util;
pub mod wire;
pub mod test_util;
