//! Permission set attached to a connecting channel.
//!
//! The authorizer that produces it lives outside this crate; rooms only
//! consult the `contents:write` capability to decide whether incoming
//! updates may touch the shared document.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// `{resource: [actions]}`. `None` means the caller is unrestricted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions(Option<HashMap<String, HashSet<String>>>);

impl Permissions {
    /// No restrictions at all.
    pub fn unrestricted() -> Self {
        Self(None)
    }

    /// Read-only access to document contents.
    pub fn read_only() -> Self {
        Self::from_pairs([("contents", &["read"][..])])
    }

    pub fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a [&'a str])>,
    {
        let map = pairs
            .into_iter()
            .map(|(resource, actions)| {
                (
                    resource.to_string(),
                    actions.iter().map(|a| a.to_string()).collect(),
                )
            })
            .collect();
        Self(Some(map))
    }

    pub fn allows(&self, resource: &str, action: &str) -> bool {
        match &self.0 {
            None => true,
            Some(map) => map
                .get(resource)
                .is_some_and(|actions| actions.contains(action)),
        }
    }

    pub fn can_write(&self) -> bool {
        self.allows("contents", "write")
    }
}
