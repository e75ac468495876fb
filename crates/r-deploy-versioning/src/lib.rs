//! ---
//! deploy_section: "14-versioning"
//! deploy_subsection: "module"
//! deploy_type: "source"
//! deploy_scope: "code"
//! deploy_description: "Version assignment policies for updates."
//! deploy_version: "v0.0.0-prealpha"
//! deploy_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! Version helpers: parsing, the pluggable [`semver::VersionPolicy`] seam, and
//! the default patch-increment policy applied when updates are created.

pub mod semver;

pub use crate::semver::{bump_patch, parse_version, PatchBump, VersionError, VersionPolicy};
