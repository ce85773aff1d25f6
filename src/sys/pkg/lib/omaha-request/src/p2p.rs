// Copyright 2019 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Negotiation of downloading the payload from a peer on the local network instead of the CDN.

use crate::{
    payload_state::PayloadState,
    prefs::{keys, Prefs},
    protocol::response::OmahaResponse,
};
use futures::future::{self, FutureExt as _, LocalBoxFuture};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;
use tracing::info;

/// How long to wait for the peer lookup to find a peer.
pub const MAX_P2P_NETWORK_WAIT: Duration = Duration::from_secs(300);

/// Finds peers that have a given file.
pub trait P2pManager {
    /// Look for a peer that has at least `minimum_size` bytes of the file identified by
    /// `file_id`.  Resolves to the URL of the file on that peer, or None if no peer was found
    /// within `max_wait`.
    fn lookup_url_for_file(
        &mut self,
        file_id: &str,
        minimum_size: u64,
        max_wait: Duration,
    ) -> LocalBoxFuture<'static, Option<String>>;
}

impl<T: P2pManager> P2pManager for Rc<RefCell<T>> {
    fn lookup_url_for_file(
        &mut self,
        file_id: &str,
        minimum_size: u64,
        max_wait: Duration,
    ) -> LocalBoxFuture<'static, Option<String>> {
        self.borrow_mut().lookup_url_for_file(file_id, minimum_size, max_wait)
    }
}

/// A P2pManager that never finds any peer.
#[derive(Debug, Default)]
pub struct StubP2pManager;

impl P2pManager for StubP2pManager {
    fn lookup_url_for_file(
        &mut self,
        _file_id: &str,
        _minimum_size: u64,
        _max_wait: Duration,
    ) -> LocalBoxFuture<'static, Option<String>> {
        future::ready(None).boxed_local()
    }
}

/// A P2pManager that answers lookups from a queue, and records them.
#[derive(Debug, Default)]
pub struct MockP2pManager {
    urls: VecDeque<Option<String>>,
    /// Every lookup as (file_id, minimum_size, max_wait).
    pub lookups: Vec<(String, u64, Duration)>,
}

impl MockP2pManager {
    pub fn new() -> Self {
        MockP2pManager::default()
    }

    pub fn add_url(&mut self, url: Option<&str>) {
        self.urls.push_back(url.map(str::to_string));
    }
}

impl P2pManager for MockP2pManager {
    fn lookup_url_for_file(
        &mut self,
        file_id: &str,
        minimum_size: u64,
        max_wait: Duration,
    ) -> LocalBoxFuture<'static, Option<String>> {
        self.lookups.push((file_id.to_string(), minimum_size, max_wait));
        future::ready(self.urls.pop_front().flatten()).boxed_local()
    }
}

/// The size a peer must have of the payload to be of use: everything up to and including the
/// operation that's currently being applied, so that two peers can't end up waiting on each
/// other.  0 if no update is in progress.
pub fn minimum_peer_size(prefs: &dyn Prefs) -> u64 {
    let get = |key| prefs.get_int64(key);
    let size = (|| {
        let metadata_size = get(keys::MANIFEST_METADATA_SIZE).filter(|v| *v != -1)?;
        let signature_size = get(keys::MANIFEST_SIGNATURE_SIZE).filter(|v| *v != -1)?;
        let next_data_offset = get(keys::UPDATE_STATE_NEXT_DATA_OFFSET).filter(|v| *v != -1)?;
        let next_data_length = get(keys::UPDATE_STATE_NEXT_DATA_LENGTH)?;
        metadata_size
            .checked_add(signature_size)?
            .checked_add(next_data_offset)?
            .checked_add(next_data_length)
    })();
    size.and_then(|size| u64::try_from(size).ok()).unwrap_or(0)
}

/// The id under which peers share the payload with the given hash and size.
pub fn p2p_file_id(hash: &str, size: i64) -> String {
    format!("cros_update_size_{}_hash_{}", size, base64::encode(hash))
}

/// Apply the server's p2p opt-outs.
pub fn apply_omaha_overrides(response: &OmahaResponse, payload_state: &mut dyn PayloadState) {
    if response.disable_p2p_for_downloading {
        info!("Forcibly disabling use of p2p for downloading as requested by Omaha");
        payload_state.set_using_p2p_for_downloading(false);
    }
    if response.disable_p2p_for_sharing {
        info!("Forcibly disabling use of p2p for sharing as requested by Omaha");
        payload_state.set_using_p2p_for_sharing(false);
    }
}

/// Count a new p2p download attempt, and give up on p2p if too many have already failed.
pub fn start_attempt(payload_state: &mut dyn PayloadState) {
    if !payload_state.using_p2p_for_downloading() {
        return;
    }
    payload_state.p2p_new_attempt();
    if !payload_state.p2p_attempt_allowed() {
        info!(
            "Forcibly disabling use of p2p for downloading because of previous failures when \
             using p2p"
        );
        payload_state.set_using_p2p_for_downloading(false);
    }
}

/// Record the outcome of a peer lookup.
pub fn lookup_completed(url: Option<String>, payload_state: &mut dyn PayloadState) {
    let url = url.unwrap_or_default();
    info!("Lookup complete, p2p-client returned URL '{}'", url);
    if url.is_empty() {
        info!("Forcibly disabling use of p2p for downloading because no suitable peer could be found");
        payload_state.set_using_p2p_for_downloading(false);
    } else {
        payload_state.set_p2p_url(&url);
    }
}
