//! Provisions disposable spot workers for queued CI jobs.
//!
//! A `workflow_job` delivery is routed to a machine profile, claimed exactly once in the
//! lifecycle store and turned into a single worker machine that runs the job and terminates
//! itself afterwards. Reconcilers running on a schedule clean up workers and image records
//! that got stuck.
pub mod build;
pub mod common;
pub mod compute;
pub mod images;
pub mod intake;
pub mod provision;
pub mod reconcile;
pub mod router;
pub mod server;
pub mod status;
pub mod store;
pub mod upstream;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::SpotError;
pub type Result<T> = std::result::Result<T, Error>;

pub type Map<K, V> = hashbrown::HashMap<K, V>;
pub type Set<T> = hashbrown::HashSet<T>;

/// Label namespace used when the configuration does not override it.
pub const DEFAULT_NAMESPACE: &str = "spotrunner";

pub const SPOTRUNNER_VERSION: &str = {
    match option_env!("SPOTRUNNER_BUILD_VERSION") {
        Some(version) => version,
        None => const_format::concatcp!(env!("CARGO_PKG_VERSION"), "-dev"),
    }
};

// Reexports
pub use spotrunner_boot;
