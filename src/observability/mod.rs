//! Observability: structured logging and span helpers

pub mod logging;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat, LoggingError};

pub use logging::{dispatch_span, mqtt_span};
