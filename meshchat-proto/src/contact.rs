//! Identity records: the local user's profiles and their contacts.
//!
//! Both are read-only from the delivery engine's point of view.

use serde::{Deserialize, Serialize};

use crate::ids::{ContactId, Fingerprint, ProfileId};

/// Base URL for generated avatars when a contact has none.
const AVATAR_BASE_URL: &str = "https://api.dicebear.com/7.x/avataaars/svg?seed=";

/// Builds the default avatar URL for a username.
#[must_use]
pub fn default_avatar_url(username: &str) -> String {
    format!("{AVATAR_BASE_URL}{username}")
}

/// A remote identity the user can chat with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    /// Unique identifier.
    pub id: ContactId,
    /// Handle, unique among contacts.
    pub username: String,
    /// Human-friendly name.
    pub display_name: String,
    /// Network identity, unique among contacts.
    pub fingerprint: Fingerprint,
    /// Avatar image URL.
    pub avatar_url: String,
    /// Whether the user blocked this contact.
    pub blocked: bool,
}

impl Contact {
    /// Case-insensitive match against display name or username.
    #[must_use]
    pub fn matches_search(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.display_name.to_lowercase().contains(&needle)
            || self.username.to_lowercase().contains(&needle)
    }
}

/// Fields of a contact before the store assigns it an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewContact {
    /// Handle.
    pub username: String,
    /// Human-friendly name.
    pub display_name: String,
    /// Network identity.
    pub fingerprint: Fingerprint,
    /// Avatar image URL; derived from the username when absent.
    pub avatar_url: Option<String>,
}

impl NewContact {
    /// Finalizes the draft with an assigned id. New contacts are unblocked.
    #[must_use]
    pub fn with_id(self, id: ContactId) -> Contact {
        let avatar_url = self
            .avatar_url
            .unwrap_or_else(|| default_avatar_url(&self.username));
        Contact {
            id,
            username: self.username,
            display_name: self.display_name,
            fingerprint: self.fingerprint,
            avatar_url,
            blocked: false,
        }
    }
}

/// Partial update for a contact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactPatch {
    /// New display name.
    pub display_name: Option<String>,
    /// New blocked flag.
    pub blocked: Option<bool>,
}

impl ContactPatch {
    /// Applies the patch to a contact in place.
    pub fn apply(self, contact: &mut Contact) {
        if let Some(name) = self.display_name {
            contact.display_name = name;
        }
        if let Some(blocked) = self.blocked {
            contact.blocked = blocked;
        }
    }
}

/// The local user's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    /// Unique identifier.
    pub id: ProfileId,
    /// Handle, unique among profiles.
    pub username: String,
    /// Human-friendly name.
    pub display_name: String,
    /// Network identity.
    pub fingerprint: Fingerprint,
}

/// Fields of a profile before the store assigns it an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProfile {
    /// Handle.
    pub username: String,
    /// Human-friendly name.
    pub display_name: String,
    /// Network identity.
    pub fingerprint: Fingerprint,
}

impl NewProfile {
    /// Finalizes the draft with an assigned id.
    #[must_use]
    pub fn with_id(self, id: ProfileId) -> Profile {
        Profile {
            id,
            username: self.username,
            display_name: self.display_name,
            fingerprint: self.fingerprint,
        }
    }
}

/// Partial update for a profile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfilePatch {
    /// New display name.
    pub display_name: Option<String>,
}

impl ProfilePatch {
    /// Applies the patch to a profile in place.
    pub fn apply(self, profile: &mut Profile) {
        if let Some(name) = self.display_name {
            profile.display_name = name;
        }
    }
}
