// Copyright 2019 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Validation of a parsed response document into an `OmahaResponse`.

use crate::{
    common::format_system_time,
    hardware::Hardware,
    prefs::{keys, Prefs},
    protocol::Cohort,
    xml::ParsedBag,
};
use std::time::SystemTime;
use thiserror::Error;
use tracing::{error, info};

/// How many times each payload URL may fail before moving on to the next one, unless the
/// response says otherwise.
pub const DEFAULT_MAX_FAILURE_COUNT_PER_URL: u32 = 10;

/// Jan 1, 2007 0:00 PST, in seconds since the unix epoch.  Install dates are counted in days from
/// here.
const OMAHA_EPOCH_SECS: u64 = 1167638400;
const SECS_PER_WEEK: u64 = 7 * 24 * 3600;

// Attributes of the postinstall action.
const TAG_SHA256: &str = "sha256";
const TAG_MORE_INFO: &str = "MoreInfo";
const TAG_METADATA_SIZE: &str = "MetadataSize";
const TAG_METADATA_SIGNATURE_RSA: &str = "MetadataSignatureRsa";
const TAG_PROMPT: &str = "Prompt";
const TAG_DEADLINE: &str = "deadline";
const TAG_MAX_DAYS_TO_SCATTER: &str = "MaxDaysToScatter";
const TAG_DISABLE_P2P_FOR_DOWNLOADING: &str = "DisableP2PForDownloading";
const TAG_DISABLE_P2P_FOR_SHARING: &str = "DisableP2PForSharing";
const TAG_PUBLIC_KEY_RSA: &str = "PublicKeyRsa";
const TAG_MAX_FAILURE_COUNT_PER_URL: &str = "MaxFailureCountPerUrl";
const TAG_IS_DELTA_PAYLOAD: &str = "IsDeltaPayload";
const TAG_DISABLE_PAYLOAD_BACKOFF: &str = "DisablePayloadBackoff";

/// The validated result of an update check.  If `update_exists` is false, every other field
/// except `poll_interval` and `install_date_days` is meaningless.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OmahaResponse {
    pub update_exists: bool,

    /// How often the server would like to be polled, in seconds, 0 if it has no opinion.
    pub poll_interval: i32,

    pub version: String,
    /// The full payload URLs, in the order offered.
    pub payload_urls: Vec<String>,
    pub more_info_url: String,
    /// The base64 sha256 of the payload.
    pub hash: String,
    pub metadata_signature: String,
    pub deadline: String,
    pub size: i64,
    pub metadata_size: i64,
    pub max_days_to_scatter: i64,
    pub max_failure_count_per_url: u32,
    pub prompt: bool,
    pub is_delta_payload: bool,
    pub disable_payload_backoff: bool,
    pub disable_p2p_for_downloading: bool,
    pub disable_p2p_for_sharing: bool,
    pub public_key_rsa: String,

    /// Days since the Omaha epoch according to the server, -1 if not sent.
    pub install_date_days: i64,
}

impl Default for OmahaResponse {
    fn default() -> Self {
        OmahaResponse {
            update_exists: false,
            poll_interval: 0,
            version: String::new(),
            payload_urls: vec![],
            more_info_url: String::new(),
            hash: String::new(),
            metadata_signature: String::new(),
            deadline: String::new(),
            size: 0,
            metadata_size: 0,
            max_days_to_scatter: 0,
            max_failure_count_per_url: DEFAULT_MAX_FAILURE_COUNT_PER_URL,
            prompt: false,
            is_delta_payload: false,
            disable_payload_backoff: false,
            disable_p2p_for_downloading: false,
            disable_p2p_for_sharing: false,
            public_key_rsa: String::new(),
            install_date_days: -1,
        }
    }
}

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ResponseError {
    #[error("response has no updatecheck status")]
    MissingStatus,

    #[error("unknown updatecheck status: {0:?}")]
    UnknownStatus(String),

    #[error("response has no urls")]
    NoUrls,

    #[error("response url has an empty codebase")]
    EmptyCodebase,

    #[error("response has an empty package name")]
    EmptyPackageName,

    #[error("response has an invalid payload size: {0:?}")]
    InvalidPayloadSize(Option<String>),

    #[error("response has no version in manifest")]
    MissingVersion,

    #[error("response has no postinstall event action")]
    MissingPostinstallAction,

    #[error("response has an empty sha256 value")]
    EmptyHash,
}

/// Where a persisted install date came from.  Only logged.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InstallDateProvisioningSource {
    OmahaResponse,
    Oobe,
}

/// The leading base-10 integer of `s`, or 0 if there isn't one.
fn parse_leading_int(s: &str) -> i64 {
    let s = s.trim_start();
    let end = s
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+'))))
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    s[..end].parse().unwrap_or(0)
}

fn parse_bool(s: Option<&String>) -> bool {
    s.map(String::as_str) == Some("true")
}

/// Persist the install date, unless it's negative or the write fails.
pub fn persist_install_date(
    prefs: &mut dyn Prefs,
    install_date_days: i64,
    source: InstallDateProvisioningSource,
) -> bool {
    if install_date_days < 0 {
        return false;
    }
    if !prefs.set_int64(keys::INSTALL_DATE_DAYS, install_date_days) {
        return false;
    }
    info!("Set the Omaha InstallDate to {} days (from {:?})", install_date_days, source);
    true
}

/// Whole weeks between the Omaha epoch and `time`, in days.  None if `time` predates the epoch.
pub fn omaha_install_date_from_time(time: SystemTime) -> Option<i64> {
    let secs = time.duration_since(SystemTime::UNIX_EPOCH).ok()?.as_secs();
    let omaha_secs = secs.checked_sub(OMAHA_EPOCH_SECS)?;
    Some((omaha_secs / SECS_PER_WEEK * 7) as i64)
}

/// The install date to send with a request, -1 if it isn't known yet.
///
/// Before a response has provided one, the install date is approximated from when OOBE was
/// completed, if it has been.
pub fn get_install_date(prefs: &mut dyn Prefs, hardware: &dyn Hardware) -> i64 {
    if let Some(stored) = prefs.get_int64(keys::INSTALL_DATE_DAYS) {
        if stored >= 0 {
            return stored;
        }
        error!(
            "Dropping stored Omaha InstallData since its value num_days={} looks suspicious",
            stored
        );
        prefs.delete(keys::INSTALL_DATE_DAYS);
    }

    let time_of_oobe = match hardware.is_oobe_complete() {
        Some(time) => time,
        None => {
            info!("Not generating Omaha InstallData as we have no prefs file and OOBE is not complete");
            return -1;
        }
    };
    let days = match omaha_install_date_from_time(time_of_oobe) {
        Some(days) => days,
        None => {
            error!(
                "Not generating Omaha InstallData from time of OOBE as its value {} looks suspicious",
                format_system_time(time_of_oobe)
            );
            return -1;
        }
    };
    if !persist_install_date(prefs, days, InstallDateProvisioningSource::Oobe) {
        return -1;
    }
    days
}

/// Validate the parsed document, persisting the install date and cohort it carries.
///
/// The install date and cohort are persisted even if the response turns out to be invalid, as
/// long as it has an updatecheck status.
pub fn parse_response(
    bag: &ParsedBag,
    prefs: &mut dyn Prefs,
) -> Result<OmahaResponse, ResponseError> {
    let status = match bag.updatecheck_status.as_deref() {
        None | Some("") => return Err(ResponseError::MissingStatus),
        Some(status) => status,
    };

    let mut response = OmahaResponse::default();

    // The poll interval may be sent even when there's no update.
    response.poll_interval =
        bag.updatecheck_poll_interval.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0);

    if let Some(elapsed_days) =
        bag.daystart_elapsed_days.as_deref().and_then(|s| s.parse::<i64>().ok())
    {
        if elapsed_days >= 0 {
            response.install_date_days = elapsed_days;
            if !prefs.exists(keys::INSTALL_DATE_DAYS) {
                persist_install_date(
                    prefs,
                    elapsed_days - elapsed_days % 7,
                    InstallDateProvisioningSource::OmahaResponse,
                );
            }
        }
    }

    Cohort {
        id: bag.app_cohort.clone(),
        hint: bag.app_cohorthint.clone(),
        name: bag.app_cohortname.clone(),
    }
    .persist(prefs);

    match status {
        "noupdate" => {
            info!("No update");
            return Ok(response);
        }
        "ok" => {}
        status => {
            error!("Unknown Omaha response status: {}", status);
            return Err(ResponseError::UnknownStatus(status.to_string()));
        }
    }

    if bag.url_codebases.is_empty() {
        error!("No Omaha Response URLs");
        return Err(ResponseError::NoUrls);
    }
    info!("Found {} url(s)", bag.url_codebases.len());
    if bag.url_codebases.iter().any(String::is_empty) {
        error!("Omaha Response URL has empty codebase");
        return Err(ResponseError::EmptyCodebase);
    }

    let package_name = match bag.package_name.as_deref() {
        None | Some("") => {
            error!("Omaha Response has empty package name");
            return Err(ResponseError::EmptyPackageName);
        }
        Some(name) => name,
    };
    response.payload_urls =
        bag.url_codebases.iter().map(|codebase| format!("{}{}", codebase, package_name)).collect();

    let size = bag.package_size.as_deref().map(parse_leading_int).unwrap_or(0);
    if size <= 0 {
        error!("Omaha Response has invalid payload size: {:?}", bag.package_size);
        return Err(ResponseError::InvalidPayloadSize(bag.package_size.clone()));
    }
    response.size = size;
    info!("Payload size = {} bytes", size);

    response.version = match bag.manifest_version.as_deref() {
        None | Some("") => {
            error!("Omaha Response does not have version in manifest");
            return Err(ResponseError::MissingVersion);
        }
        Some(version) => version.to_string(),
    };
    info!("Received omaha response to update to version {}", response.version);

    let attrs = &bag.postinstall;
    if attrs.is_empty() {
        error!("Omaha Response has no postinstall event action");
        return Err(ResponseError::MissingPostinstallAction);
    }
    let string_attr = |tag: &str| attrs.get(tag).cloned().unwrap_or_default();

    response.hash = string_attr(TAG_SHA256);
    if response.hash.is_empty() {
        error!("Omaha Response has empty sha256 value");
        return Err(ResponseError::EmptyHash);
    }

    response.more_info_url = string_attr(TAG_MORE_INFO);
    response.metadata_size =
        attrs.get(TAG_METADATA_SIZE).map(|s| parse_leading_int(s)).unwrap_or(0);
    response.metadata_signature = string_attr(TAG_METADATA_SIGNATURE_RSA);
    response.prompt = parse_bool(attrs.get(TAG_PROMPT));
    response.deadline = string_attr(TAG_DEADLINE);
    response.max_days_to_scatter =
        attrs.get(TAG_MAX_DAYS_TO_SCATTER).map(|s| parse_leading_int(s)).unwrap_or(0);
    response.disable_p2p_for_downloading = parse_bool(attrs.get(TAG_DISABLE_P2P_FOR_DOWNLOADING));
    response.disable_p2p_for_sharing = parse_bool(attrs.get(TAG_DISABLE_P2P_FOR_SHARING));
    response.public_key_rsa = string_attr(TAG_PUBLIC_KEY_RSA);
    response.max_failure_count_per_url = attrs
        .get(TAG_MAX_FAILURE_COUNT_PER_URL)
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_MAX_FAILURE_COUNT_PER_URL);
    response.is_delta_payload = parse_bool(attrs.get(TAG_IS_DELTA_PAYLOAD));
    response.disable_payload_backoff = parse_bool(attrs.get(TAG_DISABLE_PAYLOAD_BACKOFF));

    response.update_exists = true;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{hardware::FakeHardware, prefs::MemPrefs};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn update_bag() -> ParsedBag {
        ParsedBag {
            updatecheck_status: Some("ok".to_string()),
            daystart_elapsed_days: Some("42".to_string()),
            daystart_elapsed_seconds: Some("100".to_string()),
            url_codebases: vec!["http://code/base/".to_string(), "https://mirror/".to_string()],
            package_name: Some("file.signed".to_string()),
            package_size: Some("123".to_string()),
            manifest_version: Some("1.2.3.4".to_string()),
            postinstall: [
                ("event", "postinstall"),
                ("sha256", "HASH1234="),
                ("MoreInfo", "http://more/info"),
                ("Prompt", "true"),
                ("deadline", "20101020"),
                ("MaxDaysToScatter", "7"),
                ("MetadataSize", "2048"),
                ("MaxFailureCountPerUrl", "3"),
                ("IsDeltaPayload", "true"),
            ]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
            ..ParsedBag::default()
        }
    }

    #[test]
    fn test_parse_update() {
        let mut prefs = MemPrefs::new();
        let response = parse_response(&update_bag(), &mut prefs).unwrap();
        assert_eq!(
            response,
            OmahaResponse {
                update_exists: true,
                version: "1.2.3.4".to_string(),
                payload_urls: vec![
                    "http://code/base/file.signed".to_string(),
                    "https://mirror/file.signed".to_string(),
                ],
                more_info_url: "http://more/info".to_string(),
                hash: "HASH1234=".to_string(),
                deadline: "20101020".to_string(),
                size: 123,
                metadata_size: 2048,
                max_days_to_scatter: 7,
                max_failure_count_per_url: 3,
                prompt: true,
                is_delta_payload: true,
                install_date_days: 42,
                ..OmahaResponse::default()
            }
        );
    }

    #[test]
    fn test_parse_no_update() {
        let bag = ParsedBag {
            updatecheck_status: Some("noupdate".to_string()),
            updatecheck_poll_interval: Some("3600".to_string()),
            ..ParsedBag::default()
        };
        let response = parse_response(&bag, &mut MemPrefs::new()).unwrap();
        assert!(!response.update_exists);
        assert_eq!(response.poll_interval, 3600);
    }

    #[test]
    fn test_parse_missing_or_unknown_status() {
        let mut prefs = MemPrefs::new();
        assert_eq!(
            parse_response(&ParsedBag::default(), &mut prefs),
            Err(ResponseError::MissingStatus)
        );
        let bag = ParsedBag { updatecheck_status: Some("".to_string()), ..update_bag() };
        assert_eq!(parse_response(&bag, &mut prefs), Err(ResponseError::MissingStatus));
        let bag =
            ParsedBag { updatecheck_status: Some("InvalidStatus".to_string()), ..update_bag() };
        assert_eq!(
            parse_response(&bag, &mut prefs),
            Err(ResponseError::UnknownStatus("InvalidStatus".to_string()))
        );
    }

    #[test]
    fn test_parse_invalid_fields() {
        let mut prefs = MemPrefs::new();
        let cases = vec![
            (ParsedBag { url_codebases: vec![], ..update_bag() }, ResponseError::NoUrls),
            (
                ParsedBag { url_codebases: vec!["a".to_string(), "".to_string()], ..update_bag() },
                ResponseError::EmptyCodebase,
            ),
            (ParsedBag { package_name: None, ..update_bag() }, ResponseError::EmptyPackageName),
            (
                ParsedBag { package_size: Some("0".to_string()), ..update_bag() },
                ResponseError::InvalidPayloadSize(Some("0".to_string())),
            ),
            (
                ParsedBag { package_size: Some("-5".to_string()), ..update_bag() },
                ResponseError::InvalidPayloadSize(Some("-5".to_string())),
            ),
            (ParsedBag { manifest_version: None, ..update_bag() }, ResponseError::MissingVersion),
            (
                ParsedBag { postinstall: Default::default(), ..update_bag() },
                ResponseError::MissingPostinstallAction,
            ),
        ];
        for (bag, expected) in cases {
            assert_eq!(parse_response(&bag, &mut prefs), Err(expected));
        }

        let mut bag = update_bag();
        bag.postinstall.remove("sha256");
        assert_eq!(parse_response(&bag, &mut prefs), Err(ResponseError::EmptyHash));
    }

    #[test]
    fn test_optional_fields_defaults() {
        let mut bag = update_bag();
        bag.postinstall.insert("MaxFailureCountPerUrl".to_string(), "many".to_string());
        bag.postinstall.insert("MetadataSize".to_string(), "2048 bytes".to_string());
        bag.postinstall.remove("MaxDaysToScatter");
        let response = parse_response(&bag, &mut MemPrefs::new()).unwrap();
        assert_eq!(response.max_failure_count_per_url, DEFAULT_MAX_FAILURE_COUNT_PER_URL);
        assert_eq!(response.metadata_size, 2048);
        assert_eq!(response.max_days_to_scatter, 0);
    }

    #[test]
    fn test_install_date_is_rounded_to_weeks_and_persisted_once() {
        let mut prefs = MemPrefs::new();
        let bag = ParsedBag { daystart_elapsed_days: Some("3030".to_string()), ..update_bag() };
        let response = parse_response(&bag, &mut prefs).unwrap();
        assert_eq!(response.install_date_days, 3030);
        assert_eq!(prefs.get_int64(keys::INSTALL_DATE_DAYS), Some(3024));

        let bag = ParsedBag { daystart_elapsed_days: Some("4000".to_string()), ..update_bag() };
        parse_response(&bag, &mut prefs).unwrap();
        assert_eq!(prefs.get_int64(keys::INSTALL_DATE_DAYS), Some(3024));
    }

    #[test]
    fn test_install_date_ignores_invalid_elapsed_days() {
        let mut prefs = MemPrefs::new();
        for elapsed_days in ["-1", "forty", ""] {
            let bag = ParsedBag {
                daystart_elapsed_days: Some(elapsed_days.to_string()),
                ..update_bag()
            };
            let response = parse_response(&bag, &mut prefs).unwrap();
            assert_eq!(response.install_date_days, -1);
        }
        assert!(!prefs.exists(keys::INSTALL_DATE_DAYS));
    }

    #[test]
    fn test_cohorts_persisted_even_without_update() {
        let mut prefs = MemPrefs::new();
        prefs.set_string(keys::OMAHA_COHORT_HINT, "old-hint");
        let bag = ParsedBag {
            updatecheck_status: Some("noupdate".to_string()),
            app_cohort: Some("1:2:3".to_string()),
            app_cohorthint: Some("".to_string()),
            ..ParsedBag::default()
        };
        parse_response(&bag, &mut prefs).unwrap();
        assert_eq!(prefs.get_string(keys::OMAHA_COHORT), Some("1:2:3".to_string()));
        assert!(!prefs.exists(keys::OMAHA_COHORT_HINT));
        assert!(!prefs.exists(keys::OMAHA_COHORT_NAME));
    }

    #[test]
    fn test_cohorts_persisted_on_invalid_response() {
        let mut prefs = MemPrefs::new();
        let bag = ParsedBag {
            app_cohortname: Some("beta".to_string()),
            manifest_version: None,
            ..update_bag()
        };
        assert_eq!(parse_response(&bag, &mut prefs), Err(ResponseError::MissingVersion));
        assert_eq!(prefs.get_string(keys::OMAHA_COHORT_NAME), Some("beta".to_string()));
    }

    #[test]
    fn test_omaha_install_date_from_time() {
        let epoch = SystemTime::UNIX_EPOCH + Duration::from_secs(OMAHA_EPOCH_SECS);
        assert_eq!(omaha_install_date_from_time(epoch), Some(0));
        assert_eq!(omaha_install_date_from_time(epoch + Duration::from_secs(6 * 86400)), Some(0));
        assert_eq!(omaha_install_date_from_time(epoch + Duration::from_secs(7 * 86400)), Some(7));
        assert_eq!(
            omaha_install_date_from_time(epoch + Duration::from_secs(1000 * 86400)),
            Some(994)
        );
        assert_eq!(omaha_install_date_from_time(epoch - Duration::from_secs(1)), None);
    }

    #[test]
    fn test_get_install_date() {
        let mut prefs = MemPrefs::new();
        let mut hardware = FakeHardware::default();
        assert_eq!(get_install_date(&mut prefs, &hardware), -1);

        hardware.oobe_completed_at = Some(
            SystemTime::UNIX_EPOCH + Duration::from_secs(OMAHA_EPOCH_SECS + 15 * 86400),
        );
        assert_eq!(get_install_date(&mut prefs, &hardware), 14);
        assert_eq!(prefs.get_int64(keys::INSTALL_DATE_DAYS), Some(14));

        // The persisted value wins from now on.
        hardware.oobe_completed_at = None;
        assert_eq!(get_install_date(&mut prefs, &hardware), 14);
    }

    #[test]
    fn test_get_install_date_drops_negative_value() {
        let mut prefs = MemPrefs::new();
        prefs.set_int64(keys::INSTALL_DATE_DAYS, -7);
        assert_eq!(get_install_date(&mut prefs, &FakeHardware::default()), -1);
        assert!(!prefs.exists(keys::INSTALL_DATE_DAYS));
    }

    #[test]
    fn test_parse_leading_int() {
        assert_eq!(parse_leading_int("123"), 123);
        assert_eq!(parse_leading_int("  -42abc"), -42);
        assert_eq!(parse_leading_int("abc"), 0);
        assert_eq!(parse_leading_int(""), 0);
    }
}
