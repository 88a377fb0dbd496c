mod logger;

pub mod errors;

pub use logger::setup;
