pub mod import;
pub mod subscriber;

pub use import::*;
pub use subscriber::*;
