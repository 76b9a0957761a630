//! Logging setup for the worker binary.

mod logging;

pub use logging::{default_log_dir, init_from_config, init_production_logging, init_simple_logging};
