//! Error handling foundation for replyflow.
//!
//! Library crates define their own domain error enums. At wiring boundaries
//! (store setup, configuration, server bootstrap) those errors are wrapped in
//! a rootcause `Report` so context can be attached as they propagate.

use rootcause::Report;

/// A Result type alias using rootcause's Report for error handling.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;
