//! Host runtime discovery.
//!
//! This module locates a Python interpreter on the host for bootstrapping
//! fresh environments and for running code in sandboxes that have none.

mod runtime;

pub use runtime::{
    DEFAULT_PROBE_TIMEOUT, RuntimeInfo, RuntimeLocator, candidate_runtimes, is_decoy,
    probe_runtime,
};
