//! ---
//! deploy_section: "14-versioning"
//! deploy_subsection: "module"
//! deploy_type: "source"
//! deploy_scope: "code"
//! deploy_description: "Version assignment policies for updates."
//! deploy_version: "v0.0.0-prealpha"
//! deploy_owner: "tbd"
//! ---
use std::fmt::Debug;

use semver::Version;
use thiserror::Error;

/// Errors raised while handling version strings.
#[derive(Debug, Error)]
pub enum VersionError {
    /// The supplied string is not a valid semantic version.
    #[error("invalid semver '{input}': {source}")]
    Invalid {
        /// Raw input that failed to parse.
        input: String,
        /// Parser failure.
        #[source]
        source: semver::Error,
    },
}

/// Parse a version string, tolerating a leading `v`.
pub fn parse_version(input: &str) -> Result<Version, VersionError> {
    let trimmed = input.trim().trim_start_matches('v');
    Version::parse(trimmed).map_err(|source| VersionError::Invalid {
        input: input.to_owned(),
        source,
    })
}

/// Increment the patch component, dropping any pre-release or build metadata.
#[must_use]
pub fn bump_patch(current: &Version) -> Version {
    Version::new(current.major, current.minor, current.patch + 1)
}

/// Decides the version assigned to a newly created update.
///
/// The policy receives the currently active version together with the update
/// type and risk labels so an external policy may choose a minor or major bump.
pub trait VersionPolicy: Send + Sync + Debug {
    /// Compute the next version from the active one.
    fn next_version(&self, active: &Version, update_type: &str, risk_level: &str) -> Version;
}

/// Default policy: every update increments the patch component.
#[derive(Debug, Default, Clone, Copy)]
pub struct PatchBump;

impl VersionPolicy for PatchBump {
    fn next_version(&self, active: &Version, _update_type: &str, _risk_level: &str) -> Version {
        bump_patch(active)
    }
}
