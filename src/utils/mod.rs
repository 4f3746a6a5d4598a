//! Small shared utilities

pub mod logging;
pub mod time;
pub mod timeout;

pub use logging::{init_logging, init_logging_from_config};
#[cfg(feature = "json-logging")]
pub use logging::init_json_logging;
pub use time::current_timestamp;
pub use timeout::with_hook_timeout;
