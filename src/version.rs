//! XML state document versions and upgrades of older documents.

use std::fmt;
use std::str::FromStr;

use crate::error::{SmError, SmResult};
use crate::xml::XmlElement;

/// Version written into saved state documents.
pub const CURRENT_STATE_VERSION: StateVersion = StateVersion::new(5, 11, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StateVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl StateVersion {
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }
}

impl fmt::Display for StateVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for StateVersion {
    type Err = SmError;

    /// Parses `M`, `M.m` or `M.m.p`; missing components are zero.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = [0u32; 3];
        let mut count = 0;
        for (slot, part) in parts.iter_mut().zip(s.trim().split('.')) {
            *slot = part.parse().map_err(|_| SmError::UnsupportedStateVersion(s.to_owned()))?;
            count += 1;
        }
        if count == 0 || s.trim().split('.').count() > 3 {
            return Err(SmError::UnsupportedStateVersion(s.to_owned()));
        }
        Ok(Self::new(parts[0], parts[1], parts[2]))
    }
}

type Upgrade = fn(&mut XmlElement);

/// Upgrades applied to documents older than the paired version, in order.
const UPGRADES: &[(StateVersion, Upgrade)] = &[(StateVersion::new(1, 0, 0), rename_legacy_groups)];

const LEGACY_GROUPS: &[(&str, &str)] = &[("displays", "representations"), ("view_modules", "views")];

fn rename_legacy_groups(state: &mut XmlElement) {
    state.walk_mut(&mut |element| {
        let key = match element.name.as_str() {
            "Proxy" => "group",
            "ProxyCollection" => "name",
            _ => return,
        };
        let Some(current) = element.attribute(key) else {
            return;
        };
        if let Some((_, renamed)) = LEGACY_GROUPS.iter().find(|(old, _)| *old == current) {
            element.set_attribute(key, renamed);
        }
    });
}

/// Brings state documents up to [`CURRENT_STATE_VERSION`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StateVersionController;

impl StateVersionController {
    /// Version a document declares. Documents without one are treated as
    /// predating versioning.
    ///
    /// # Errors
    ///
    /// Fails for malformed version strings.
    pub fn document_version(root: &XmlElement) -> SmResult<StateVersion> {
        let declared = state_element(root).and_then(|s| s.attribute("version")).or_else(|| root.attribute("version"));
        match declared {
            Some(text) => text.parse(),
            None => Ok(StateVersion::default()),
        }
    }

    /// Upgrade `root` in place and stamp it with the current version.
    /// Returns the version the document had.
    ///
    /// # Errors
    ///
    /// Returns [`SmError::UnsupportedStateVersion`] for documents written by
    /// a newer major version.
    pub fn upgrade(root: &mut XmlElement) -> SmResult<StateVersion> {
        let version = Self::document_version(root)?;
        if version.major > CURRENT_STATE_VERSION.major {
            return Err(SmError::UnsupportedStateVersion(version.to_string()));
        }
        for (introduced, upgrade) in UPGRADES {
            if version < *introduced {
                tracing::info!(from = %version, to = %introduced, "state: upgrading document");
                upgrade(root);
            }
        }
        root.set_attribute("version", CURRENT_STATE_VERSION);
        if let Some(state) = root.child_mut("ServerManagerState") {
            state.set_attribute("version", CURRENT_STATE_VERSION);
        }
        Ok(version)
    }
}

/// The `<ServerManagerState>` element of a document (the root itself, or
/// its child when wrapped in `<ServerManagerApplication>`).
#[must_use]
pub fn state_element(root: &XmlElement) -> Option<&XmlElement> {
    if root.name == "ServerManagerState" { Some(root) } else { root.child("ServerManagerState") }
}

#[cfg(test)]
#[path = "version_test.rs"]
mod tests;
