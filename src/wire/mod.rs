pub mod codec;
pub mod cookie;
pub mod message;
pub mod system;
