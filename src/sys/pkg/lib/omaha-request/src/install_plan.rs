// Copyright 2019 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The install plan handed to the downloader once an update check has produced an update.

use crate::{
    hardware::{BootControl, Hardware},
    payload_state::PayloadState,
    prefs::{keys, Prefs},
    protocol::response::OmahaResponse,
    request_params::RequestParams,
};
use thiserror::Error;
use tracing::{info, warn};

/// An interrupted update is not resumed after failing to resume this many times.
pub const MAX_RESUMED_UPDATE_FAILURES: i64 = 10;

/// The next operation value that means no update is in progress.
const UPDATE_STATE_OPERATION_INVALID: i64 = -1;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PayloadType {
    Full,
    Delta,
}

/// What to download, from where, and how to apply it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstallPlan {
    /// Whether this continues an interrupted download of the same payload.
    pub is_resume: bool,
    pub payload_type: PayloadType,
    pub download_url: String,
    pub version: String,
    pub payload_size: i64,
    pub payload_hash: String,
    pub metadata_size: i64,
    pub metadata_signature: String,
    pub public_key_rsa: String,
    pub hash_checks_mandatory: bool,
    pub powerwash_required: bool,
    pub source_slot: Option<u32>,
    /// None if the device has nowhere to write an update to.
    pub target_slot: Option<u32>,
}

/// Something that can be installed.
pub trait Plan {
    /// A string that identifies what is being installed.
    fn id(&self) -> String;
}

impl Plan for InstallPlan {
    /// The payload hash, which is also what an interrupted download is matched against.
    fn id(&self) -> String {
        self.payload_hash.clone()
    }
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum InstallPlanError {
    #[error("response doesn't offer an update")]
    NoUpdate,

    #[error("there are no suitable URLs in the response to use")]
    NoDownloadUrl,
}

/// Whether the update progress persisted in prefs belongs to the payload with `response_hash`
/// and is complete enough to continue from.
pub fn can_resume_update(prefs: &dyn Prefs, response_hash: &str) -> bool {
    let next_operation = prefs.get_int64(keys::UPDATE_STATE_NEXT_OPERATION);
    if !matches!(next_operation, Some(op) if op != UPDATE_STATE_OPERATION_INVALID && op > 0) {
        return false;
    }

    let interrupted_hash = prefs.get_string(keys::UPDATE_CHECK_RESPONSE_HASH).unwrap_or_default();
    if interrupted_hash.is_empty() || interrupted_hash != response_hash {
        return false;
    }

    // The failure count is optional, but if it's there it can't be over the limit.
    if let Some(failures) = prefs.get_int64(keys::RESUMED_UPDATE_FAILURES) {
        if failures > MAX_RESUMED_UPDATE_FAILURES {
            return false;
        }
    }

    let next_data_offset = prefs.get_int64(keys::UPDATE_STATE_NEXT_DATA_OFFSET).unwrap_or(-1);
    let sha256_context = prefs.get_string(keys::UPDATE_STATE_SHA_256_CONTEXT).unwrap_or_default();
    let metadata_size = prefs.get_int64(keys::MANIFEST_METADATA_SIZE).unwrap_or(0);
    let signature_size = prefs.get_int64(keys::MANIFEST_SIGNATURE_SIZE).unwrap_or(-1);
    next_data_offset >= 0 && !sha256_context.is_empty() && metadata_size > 0 && signature_size >= 0
}

/// Forget the update progress.  A quick reset only invalidates the next operation, which is
/// enough to make the progress unusable.
pub fn reset_update_progress(prefs: &mut dyn Prefs, quick: bool) -> bool {
    if !prefs.set_int64(keys::UPDATE_STATE_NEXT_OPERATION, UPDATE_STATE_OPERATION_INVALID) {
        return false;
    }
    if !quick {
        prefs.set_string(keys::UPDATE_CHECK_RESPONSE_HASH, "");
        prefs.set_int64(keys::UPDATE_STATE_NEXT_DATA_OFFSET, -1);
        prefs.set_int64(keys::UPDATE_STATE_NEXT_DATA_LENGTH, 0);
        prefs.set_string(keys::UPDATE_STATE_SHA_256_CONTEXT, "");
        prefs.set_string(keys::UPDATE_STATE_SIGNED_SHA_256_CONTEXT, "");
        prefs.set_string(keys::UPDATE_STATE_SIGNATURE_BLOB, "");
        prefs.set_int64(keys::MANIFEST_METADATA_SIZE, -1);
        prefs.set_int64(keys::MANIFEST_SIGNATURE_SIZE, -1);
        prefs.set_int64(keys::RESUMED_UPDATE_FAILURES, 0);
    }
    true
}

pub struct InstallPlanBuilder<'a> {
    params: &'a RequestParams,
    payload_state: &'a dyn PayloadState,
    hardware: &'a dyn Hardware,
    boot_control: &'a dyn BootControl,
    prefs: &'a mut dyn Prefs,
}

impl<'a> InstallPlanBuilder<'a> {
    pub fn new(
        params: &'a RequestParams,
        payload_state: &'a dyn PayloadState,
        hardware: &'a dyn Hardware,
        boot_control: &'a dyn BootControl,
        prefs: &'a mut dyn Prefs,
    ) -> Self {
        InstallPlanBuilder { params, payload_state, hardware, boot_control, prefs }
    }

    /// Derive the install plan for `response`.  Unless the download resumes, this also resets
    /// the persisted update progress and takes note of the new payload.
    pub fn build(self, response: &OmahaResponse) -> Result<InstallPlan, InstallPlanError> {
        if !response.update_exists {
            return Err(InstallPlanError::NoUpdate);
        }

        let p2p_url = self.payload_state.p2p_url();
        let use_p2p = self.payload_state.using_p2p_for_downloading() && !p2p_url.is_empty();
        let download_url = if use_p2p {
            info!(
                "Replacing URL {} with local URL {} since p2p is enabled.",
                self.payload_state.current_url(),
                p2p_url
            );
            p2p_url
        } else {
            self.payload_state.current_url()
        };
        if download_url.is_empty() {
            return Err(InstallPlanError::NoDownloadUrl);
        }

        let hash_checks_mandatory = self.are_hash_checks_mandatory(response, &download_url);

        let current_slot = self.boot_control.current_slot();
        let num_slots = self.boot_control.num_slots();
        let target_slot = if num_slots > 1 { Some((current_slot + 1) % num_slots) } else { None };

        let powerwash_required =
            self.params.to_more_stable_channel() && self.params.is_powerwash_allowed;

        let is_resume = can_resume_update(&*self.prefs, &response.hash);
        if is_resume {
            info!("Resuming the interrupted update");
        } else {
            if !reset_update_progress(&mut *self.prefs, false) {
                warn!("Unable to reset the update progress.");
            }
            if !self.prefs.set_string(keys::UPDATE_CHECK_RESPONSE_HASH, &response.hash) {
                warn!("Unable to save the update check response hash.");
            }
        }

        let plan = InstallPlan {
            is_resume,
            payload_type: if response.is_delta_payload {
                PayloadType::Delta
            } else {
                PayloadType::Full
            },
            download_url,
            version: response.version.clone(),
            payload_size: response.size,
            payload_hash: response.hash.clone(),
            metadata_size: response.metadata_size,
            metadata_signature: response.metadata_signature.clone(),
            public_key_rsa: response.public_key_rsa.clone(),
            hash_checks_mandatory,
            powerwash_required,
            source_slot: Some(current_slot),
            target_slot,
        };
        info!("Using this install plan: {:?}", plan);
        Ok(plan)
    }

    fn are_hash_checks_mandatory(&self, response: &OmahaResponse, download_url: &str) -> bool {
        // Test images and test servers don't always provide hashes.
        if !self.params.is_update_url_official() || !self.hardware.is_official_build() {
            if !response.public_key_rsa.is_empty() {
                info!(
                    "Mandating payload hash checks since Omaha Response for unofficial build \
                     includes public RSA key."
                );
                return true;
            }
            info!("Waiving payload hash checks for unofficial update URL.");
            return false;
        }

        // A p2p download URL can be plain http even if every payload URL is https.
        if !download_url.starts_with("https://") {
            info!("Mandating hash checks since download_url is not HTTPS.");
            return true;
        }

        // The download may move to any of the URLs later on.
        if response.payload_urls.iter().any(|url| !url.starts_with("https://")) {
            info!("Mandating payload hash checks since Omaha response contains non-HTTPS URL(s)");
            return true;
        }
        info!("Waiving payload hash checks since Omaha response only has HTTPS URL(s)");
        false
    }
}
