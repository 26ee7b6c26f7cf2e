//! Resolution of job labels into machine profiles.
pub mod labels;
pub mod profile;
pub mod store;

use std::sync::Arc;

use thiserror::Error;

use crate::router::labels::{LabelOptions, find_route};
use crate::router::profile::{DEFAULT_PROFILE, MachineProfile, ProfileError};
use crate::router::store::ProfileStore;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    InvalidProfile(#[from] ProfileError),
    #[error("Cannot read profile configuration: {0}")]
    Store(#[from] crate::Error),
}

#[derive(Debug)]
pub struct RoutedJob {
    /// Profile name that was requested by the job label.
    pub requested: String,
    /// Resolved profile, possibly the `default` one.
    pub profile: MachineProfile,
    pub options: LabelOptions,
}

#[derive(Debug)]
pub enum RouteOutcome {
    /// No label of the job is a routing label.
    NoRoute,
    /// Neither the requested profile nor the default profile exists.
    NoConfiguration { requested: String },
    Routed(RoutedJob),
}

pub struct LabelRouter {
    namespace: String,
    profiles: Arc<dyn ProfileStore>,
}

impl LabelRouter {
    pub fn new(namespace: String, profiles: Arc<dyn ProfileStore>) -> Self {
        Self {
            namespace,
            profiles,
        }
    }

    pub fn route<S: AsRef<str>>(&self, labels: &[S]) -> Result<RouteOutcome, RouteError> {
        let Some(route) = find_route(labels, &self.namespace) else {
            return Ok(RouteOutcome::NoRoute);
        };

        let (name, document) = match self.profiles.get(&route.profile)? {
            Some(document) => (route.profile.clone(), document),
            None => match self.profiles.get(DEFAULT_PROFILE)? {
                Some(document) => {
                    log::debug!(
                        "Profile `{}` not found, using the `{DEFAULT_PROFILE}` profile",
                        route.profile
                    );
                    (DEFAULT_PROFILE.to_string(), document)
                }
                None => {
                    return Ok(RouteOutcome::NoConfiguration {
                        requested: route.profile,
                    });
                }
            },
        };
        let profile = MachineProfile::from_document(&name, document)?;
        Ok(RouteOutcome::Routed(RoutedJob {
            requested: route.profile,
            profile,
            options: route.options,
        }))
    }
}
