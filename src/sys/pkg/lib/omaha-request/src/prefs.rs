// Copyright 2019 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The persisted key-value state consulted and updated across update checks.
//!
//! The storage mechanics live outside this crate; the engine only needs a synchronous
//! read-your-writes key-value interface.  Setters report failure with `false`, mirroring how a
//! flaky stateful partition behaves: callers log and carry on rather than abort.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Keys of the preferences this crate reads or writes.
pub mod keys {
    pub const LAST_ACTIVE_PING_DAY: &str = "last-active-ping-day";
    pub const LAST_ROLL_CALL_PING_DAY: &str = "last-roll-call-ping-day";
    pub const INSTALL_DATE_DAYS: &str = "install-date-days";
    pub const PREVIOUS_VERSION: &str = "previous-version";
    pub const UPDATE_FIRST_SEEN_AT: &str = "update-first-seen-at";
    pub const UPDATE_CHECK_COUNT: &str = "update-check-count";
    pub const OMAHA_COHORT: &str = "omaha-cohort";
    pub const OMAHA_COHORT_HINT: &str = "omaha-cohort-hint";
    pub const OMAHA_COHORT_NAME: &str = "omaha-cohort-name";
    pub const UPDATE_CHECK_RESPONSE_HASH: &str = "update-check-response-hash";
    pub const UPDATE_OVER_CELLULAR_PERMISSION: &str = "update-over-cellular-permission";

    // Resume state written by the payload applier.
    pub const MANIFEST_METADATA_SIZE: &str = "manifest-metadata-size";
    pub const MANIFEST_SIGNATURE_SIZE: &str = "manifest-signature-size";
    pub const UPDATE_STATE_NEXT_OPERATION: &str = "update-state-next-operation";
    pub const UPDATE_STATE_NEXT_DATA_OFFSET: &str = "update-state-next-data-offset";
    pub const UPDATE_STATE_NEXT_DATA_LENGTH: &str = "update-state-next-data-length";
    pub const UPDATE_STATE_SHA_256_CONTEXT: &str = "update-state-sha-256-context";
    pub const UPDATE_STATE_SIGNED_SHA_256_CONTEXT: &str = "update-state-signed-sha-256-context";
    pub const UPDATE_STATE_SIGNATURE_BLOB: &str = "update-state-signature-blob";
    pub const RESUMED_UPDATE_FAILURES: &str = "resumed-update-failures";
}

/// A synchronous key-value store.  Getters return `None` if the key is missing or holds a value
/// that can't be read as the requested type.
pub trait Prefs {
    fn get_string(&self, key: &str) -> Option<String>;
    fn set_string(&mut self, key: &str, value: &str) -> bool;
    fn get_int64(&self, key: &str) -> Option<i64>;
    fn set_int64(&mut self, key: &str, value: i64) -> bool;
    fn get_boolean(&self, key: &str) -> Option<bool>;
    fn set_boolean(&mut self, key: &str, value: bool) -> bool;
    fn exists(&self, key: &str) -> bool;
    fn delete(&mut self, key: &str) -> bool;
}

impl<T> Prefs for Rc<RefCell<T>>
where
    T: Prefs,
{
    fn get_string(&self, key: &str) -> Option<String> {
        self.borrow().get_string(key)
    }
    fn set_string(&mut self, key: &str, value: &str) -> bool {
        self.borrow_mut().set_string(key, value)
    }
    fn get_int64(&self, key: &str) -> Option<i64> {
        self.borrow().get_int64(key)
    }
    fn set_int64(&mut self, key: &str, value: i64) -> bool {
        self.borrow_mut().set_int64(key, value)
    }
    fn get_boolean(&self, key: &str) -> Option<bool> {
        self.borrow().get_boolean(key)
    }
    fn set_boolean(&mut self, key: &str, value: bool) -> bool {
        self.borrow_mut().set_boolean(key, value)
    }
    fn exists(&self, key: &str) -> bool {
        self.borrow().exists(key)
    }
    fn delete(&mut self, key: &str) -> bool {
        self.borrow_mut().delete(key)
    }
}

/// An in-memory Prefs.  Values are stored as strings, the way a file-per-key store keeps them,
/// so reading an int key that holds garbage fails just like it would on disk.
#[derive(Clone, Debug, Default)]
pub struct MemPrefs {
    values: HashMap<String, String>,
    read_only: bool,
}

impl MemPrefs {
    pub fn new() -> Self {
        MemPrefs::default()
    }

    /// Make every subsequent write fail, to exercise the fail-open paths.
    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    /// Store a raw value, bypassing type formatting.
    pub fn set_raw(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    fn set(&mut self, key: &str, value: String) -> bool {
        if self.read_only {
            return false;
        }
        self.values.insert(key.to_string(), value);
        true
    }
}

impl Prefs for MemPrefs {
    fn get_string(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set_string(&mut self, key: &str, value: &str) -> bool {
        self.set(key, value.to_string())
    }

    fn get_int64(&self, key: &str) -> Option<i64> {
        self.values.get(key).and_then(|v| v.trim().parse::<i64>().ok())
    }

    fn set_int64(&mut self, key: &str, value: i64) -> bool {
        self.set(key, value.to_string())
    }

    fn get_boolean(&self, key: &str) -> Option<bool> {
        match self.values.get(key).map(|v| v.trim()) {
            Some("true") => Some(true),
            Some("false") => Some(false),
            _ => None,
        }
    }

    fn set_boolean(&mut self, key: &str, value: bool) -> bool {
        self.set(key, value.to_string())
    }

    fn exists(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    fn delete(&mut self, key: &str) -> bool {
        if self.read_only {
            return false;
        }
        self.values.remove(key);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_prefs_typed_values() {
        let mut prefs = MemPrefs::new();
        assert!(prefs.set_string("s", "value"));
        assert!(prefs.set_int64("i", -42));
        assert!(prefs.set_boolean("b", true));

        assert_eq!(prefs.get_string("s"), Some("value".to_string()));
        assert_eq!(prefs.get_int64("i"), Some(-42));
        assert_eq!(prefs.get_boolean("b"), Some(true));
        assert_eq!(prefs.get_string("missing"), None);
    }

    #[test]
    fn test_mem_prefs_unreadable_int() {
        let mut prefs = MemPrefs::new();
        prefs.set_raw("i", "not a number");
        assert!(prefs.exists("i"));
        assert_eq!(prefs.get_int64("i"), None);
        assert_eq!(prefs.get_boolean("i"), None);
    }

    #[test]
    fn test_mem_prefs_delete() {
        let mut prefs = MemPrefs::new();
        prefs.set_int64("i", 1);
        assert!(prefs.delete("i"));
        assert!(!prefs.exists("i"));
        // Deleting a missing key is fine.
        assert!(prefs.delete("i"));
    }

    #[test]
    fn test_mem_prefs_read_only() {
        let mut prefs = MemPrefs::new();
        prefs.set_int64("i", 1);
        prefs.set_read_only(true);
        assert!(!prefs.set_int64("i", 2));
        assert!(!prefs.delete("i"));
        assert_eq!(prefs.get_int64("i"), Some(1));
    }

    #[test]
    fn test_shared_prefs() {
        let shared = Rc::new(RefCell::new(MemPrefs::new()));
        let mut handle = Rc::clone(&shared);
        assert!(handle.set_string("k", "v"));
        assert_eq!(shared.borrow().get_string("k"), Some("v".to_string()));
    }
}
