//! ---
//! mtr_section: "01-core-functionality"
//! mtr_subsection: "module"
//! mtr_type: "source"
//! mtr_scope: "code"
//! mtr_description: "Shared primitives and utilities for the hub runtime."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
use serde::Serialize;

/// Build metadata captured at compile time.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct VersionInfo {
    pub semver: String,
    pub build_timestamp: String,
    pub target: String,
    pub profile: String,
}

impl VersionInfo {
    pub fn current() -> Self {
        let profile = if env!("VERGEN_CARGO_DEBUG") == "true" {
            "debug"
        } else {
            "release"
        };
        Self {
            semver: env!("CARGO_PKG_VERSION").to_owned(),
            build_timestamp: env!("VERGEN_BUILD_TIMESTAMP").to_owned(),
            target: env!("VERGEN_CARGO_TARGET_TRIPLE").to_owned(),
            profile: profile.to_owned(),
        }
    }

    /// Short form used in startup logs.
    pub fn cli_string(&self) -> String {
        format!("{} ({})", self.semver, self.profile)
    }

    /// Multi-line form printed by `--version`.
    pub fn extended(&self) -> String {
        format!(
            "mtr-hub {}\nbuilt: {}\ntarget: {}\nprofile: {}",
            self.semver, self.build_timestamp, self.target, self.profile
        )
    }
}
