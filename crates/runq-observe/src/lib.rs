mod logger;
pub use logger::*;

#[cfg(feature = "listener")]
mod listener;
#[cfg(feature = "listener")]
pub use listener::{LoggingListener, message_for};
