// Copyright 2019 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::protocol::response::OmahaResponse;
use std::cell::RefCell;
use std::rc::Rc;

/// The download-attempt bookkeeping that outlives a single update check: which URL to use next,
/// whether p2p may be used, and whether the downloader is currently backing off.
pub trait PayloadState {
    fn using_p2p_for_downloading(&self) -> bool;
    fn set_using_p2p_for_downloading(&mut self, value: bool);

    fn using_p2p_for_sharing(&self) -> bool;
    fn set_using_p2p_for_sharing(&mut self, value: bool);

    /// The URL a peer offered the payload at, empty if none.
    fn p2p_url(&self) -> String;
    fn set_p2p_url(&mut self, url: &str);

    /// The version that was rolled back from, empty if no rollback happened.
    fn rollback_version(&self) -> String;

    /// The payload URL the downloader should use next.
    fn current_url(&self) -> String;

    fn should_backoff_download(&self) -> bool;

    /// Take note of a new response.  Implementations reset their stale state if the response
    /// differs from the previous one.
    fn set_response(&mut self, response: &OmahaResponse);

    /// Count a new p2p attempt.
    fn p2p_new_attempt(&mut self);

    /// Whether another p2p attempt is allowed, given the previous attempts.
    fn p2p_attempt_allowed(&self) -> bool;
}

impl<T: PayloadState> PayloadState for Rc<RefCell<T>> {
    fn using_p2p_for_downloading(&self) -> bool {
        self.borrow().using_p2p_for_downloading()
    }
    fn set_using_p2p_for_downloading(&mut self, value: bool) {
        self.borrow_mut().set_using_p2p_for_downloading(value)
    }
    fn using_p2p_for_sharing(&self) -> bool {
        self.borrow().using_p2p_for_sharing()
    }
    fn set_using_p2p_for_sharing(&mut self, value: bool) {
        self.borrow_mut().set_using_p2p_for_sharing(value)
    }
    fn p2p_url(&self) -> String {
        self.borrow().p2p_url()
    }
    fn set_p2p_url(&mut self, url: &str) {
        self.borrow_mut().set_p2p_url(url)
    }
    fn rollback_version(&self) -> String {
        self.borrow().rollback_version()
    }
    fn current_url(&self) -> String {
        self.borrow().current_url()
    }
    fn should_backoff_download(&self) -> bool {
        self.borrow().should_backoff_download()
    }
    fn set_response(&mut self, response: &OmahaResponse) {
        self.borrow_mut().set_response(response)
    }
    fn p2p_new_attempt(&mut self) {
        self.borrow_mut().p2p_new_attempt()
    }
    fn p2p_attempt_allowed(&self) -> bool {
        self.borrow().p2p_attempt_allowed()
    }
}

/// A PayloadState that records what it is told, for tests and for embedders without retry
/// bookkeeping.
#[derive(Clone, Debug)]
pub struct FakePayloadState {
    pub using_p2p_for_downloading: bool,
    pub using_p2p_for_sharing: bool,
    pub p2p_url: String,
    pub rollback_version: String,
    pub current_url: String,
    pub backoff: bool,
    pub p2p_attempts: u32,
    /// p2p attempts beyond this many are not allowed.
    pub max_p2p_attempts: u32,
    pub last_response: Option<OmahaResponse>,
}

impl Default for FakePayloadState {
    fn default() -> Self {
        FakePayloadState {
            using_p2p_for_downloading: false,
            using_p2p_for_sharing: false,
            p2p_url: String::new(),
            rollback_version: String::new(),
            current_url: String::new(),
            backoff: false,
            p2p_attempts: 0,
            max_p2p_attempts: 10,
            last_response: None,
        }
    }
}

impl PayloadState for FakePayloadState {
    fn using_p2p_for_downloading(&self) -> bool {
        self.using_p2p_for_downloading
    }
    fn set_using_p2p_for_downloading(&mut self, value: bool) {
        self.using_p2p_for_downloading = value;
    }
    fn using_p2p_for_sharing(&self) -> bool {
        self.using_p2p_for_sharing
    }
    fn set_using_p2p_for_sharing(&mut self, value: bool) {
        self.using_p2p_for_sharing = value;
    }
    fn p2p_url(&self) -> String {
        self.p2p_url.clone()
    }
    fn set_p2p_url(&mut self, url: &str) {
        self.p2p_url = url.to_string();
    }
    fn rollback_version(&self) -> String {
        self.rollback_version.clone()
    }
    fn current_url(&self) -> String {
        self.current_url.clone()
    }
    fn should_backoff_download(&self) -> bool {
        self.backoff
    }
    fn set_response(&mut self, response: &OmahaResponse) {
        if self.last_response.as_ref() != Some(response) {
            self.p2p_attempts = 0;
            self.current_url = response.payload_urls.first().cloned().unwrap_or_default();
        }
        self.last_response = Some(response.clone());
    }
    fn p2p_new_attempt(&mut self) {
        self.p2p_attempts += 1;
    }
    fn p2p_attempt_allowed(&self) -> bool {
        self.p2p_attempts <= self.max_p2p_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_response_picks_first_url() {
        let mut state = FakePayloadState::default();
        let response = OmahaResponse {
            update_exists: true,
            payload_urls: vec!["https://a/file".to_string(), "https://b/file".to_string()],
            ..OmahaResponse::default()
        };
        state.set_response(&response);
        assert_eq!(state.current_url(), "https://a/file");
        assert_eq!(state.last_response, Some(response));
    }

    #[test]
    fn test_p2p_attempts_are_limited() {
        let mut state = FakePayloadState { max_p2p_attempts: 1, ..FakePayloadState::default() };
        state.p2p_new_attempt();
        assert!(state.p2p_attempt_allowed());
        state.p2p_new_attempt();
        assert!(!state.p2p_attempt_allowed());

        // A different response starts the count over.
        state.set_response(&OmahaResponse { version: "2.0".to_string(), ..Default::default() });
        assert!(state.p2p_attempt_allowed());
    }
}
