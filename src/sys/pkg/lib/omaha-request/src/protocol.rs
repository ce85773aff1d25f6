// Copyright 2019 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::prefs::{keys, Prefs};
use tracing::warn;

pub mod request;
pub mod response;

pub const PROTOCOL_V3: &str = "3.0";

/// The cohort identifies the update 'track' or 'channel', and is used to implement the tracking of
/// membership in a fractional roll-out.
///
/// This is sent to Omaha to identify the cohort that the device is in.  This is returned (with
/// possibly new values) by Omaha to indicate that the device is now in a different cohort.  On
/// the next update check, the updater needs to send the newly returned cohort.
///
/// For more information about cohorts, see the 'cohort', 'cohorthint', and 'cohortname' attributes
/// of the Request.App object at:
///
/// https://github.com/google/omaha/blob/HEAD/doc/ServerProtocolV3.md#app-request
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Cohort {
    /// This is the cohort id itself.
    pub id: Option<String>,
    pub hint: Option<String>,
    pub name: Option<String>,
}

impl Cohort {
    /// Read the cohort persisted by a previous response.
    pub fn load(prefs: &dyn Prefs) -> Cohort {
        Cohort {
            id: prefs.get_string(keys::OMAHA_COHORT),
            hint: prefs.get_string(keys::OMAHA_COHORT_HINT),
            name: prefs.get_string(keys::OMAHA_COHORT_NAME),
        }
    }

    /// Persist the parts of the cohort that the server sent.  If an attribute is transmitted in
    /// the response, even as an empty string, it overwrites the stored one; empty removes it.
    pub fn persist(&self, prefs: &mut dyn Prefs) {
        for (key, value) in [
            (keys::OMAHA_COHORT, &self.id),
            (keys::OMAHA_COHORT_HINT, &self.hint),
            (keys::OMAHA_COHORT_NAME, &self.name),
        ] {
            let ok = match value.as_deref() {
                None => continue,
                Some("") => !prefs.exists(key) || prefs.delete(key),
                Some(value) => prefs.set_string(key, value),
            };
            if !ok {
                warn!("Unable to persist {}", key);
            }
        }
    }

    /// Whether a cohort value can be sent back to the server: at most `max_len` ASCII-7
    /// characters.  Empty values are simply not sent.
    pub fn validate_name(name: &str, max_len: usize) -> bool {
        !name.is_empty() && name.len() <= max_len && name.is_ascii()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefs::MemPrefs;

    #[test]
    fn test_cohort_persist_and_load() {
        let mut prefs = MemPrefs::new();
        prefs.set_string(keys::OMAHA_COHORT_HINT, "old-hint");
        prefs.set_string(keys::OMAHA_COHORT_NAME, "old-name");

        Cohort {
            id: Some("stable".to_string()),
            hint: Some("".to_string()),
            name: None,
        }
        .persist(&mut prefs);

        assert_eq!(
            Cohort::load(&prefs),
            Cohort {
                id: Some("stable".to_string()),
                hint: None,
                name: Some("old-name".to_string()),
            }
        );
    }

    #[test]
    fn test_valid_cohort_names() {
        assert!(Cohort::validate_name("some-channel", 1024));
        assert!(Cohort::validate_name(&"a".repeat(1024), 1024));
        assert!(!Cohort::validate_name(&"a".repeat(1025), 1024));
        assert!(!Cohort::validate_name("", 1024));
        assert!(!Cohort::validate_name("some\u{080}channel", 1024));
    }
}
