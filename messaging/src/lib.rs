pub mod codec;
pub mod errors;
pub mod handler;
