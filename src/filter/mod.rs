//! Request-filtering middleware.
//!
//! Composes safelists, blocklists, throttles, trackers, and ban rules into
//! a single admission decision per request, rendered as a tower layer over
//! any axum router.

mod config;
mod fingerprint;
mod layer;

pub use config::{FilterConfig, FilterConfigBuilder, Responder};
pub use fingerprint::{ClientIp, client_ip};
pub use layer::{Filter, FilterLayer, FilterService};
