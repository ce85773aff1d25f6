// Copyright 2019 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::configuration::{Config, MAX_COHORT_LENGTH};
use std::time::Duration;

/// Channels from least to most stable.
const CHANNELS_BY_STABILITY: &[&str] =
    &["canary-channel", "dev-channel", "beta-channel", "stable-channel"];

fn channel_index(channel: &str) -> Option<usize> {
    CHANNELS_BY_STABILITY.iter().position(|c| *c == channel)
}

/// Everything the update check needs to know about the device and the updater, assembled by the
/// caller before each check.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestParams {
    pub updater_name: String,
    pub updater_version: String,

    pub os_platform: String,
    pub os_version: String,
    pub os_sp: String,
    pub os_board: String,

    /// The app id of the product.
    pub product_app_id: String,
    /// The app id used while on the canary channel.
    pub canary_app_id: String,
    pub app_version: String,
    pub app_lang: String,
    pub hwid: String,
    pub fw_version: String,
    pub ec_version: String,

    pub current_channel: String,
    pub target_channel: String,
    /// The channel the payload will be downloaded from.  Taken once per attempt, so it doesn't
    /// follow later changes to `target_channel`.
    pub download_channel: String,

    pub delta_okay: bool,
    /// Whether the user asked for this check.
    pub interactive: bool,
    pub update_url: String,
    /// The production update URL, used to tell official checks from test ones.
    pub production_update_url: String,
    pub target_version_prefix: String,
    pub is_powerwash_allowed: bool,

    pub wall_clock_based_wait_enabled: bool,
    pub waiting_period: Duration,
    pub update_check_count_wait_enabled: bool,
    pub min_update_checks_needed: i64,
    pub max_update_checks_allowed: i64,

    pub max_cohort_length: usize,
}

impl Default for RequestParams {
    fn default() -> Self {
        RequestParams {
            updater_name: "ChromeOSUpdateEngine".to_string(),
            updater_version: "0.1.0.0".to_string(),
            os_platform: String::new(),
            os_version: String::new(),
            os_sp: String::new(),
            os_board: String::new(),
            product_app_id: String::new(),
            canary_app_id: String::new(),
            app_version: String::new(),
            app_lang: "en-US".to_string(),
            hwid: String::new(),
            fw_version: String::new(),
            ec_version: String::new(),
            current_channel: String::new(),
            target_channel: String::new(),
            download_channel: String::new(),
            delta_okay: true,
            interactive: false,
            update_url: String::new(),
            production_update_url: String::new(),
            target_version_prefix: String::new(),
            is_powerwash_allowed: false,
            wall_clock_based_wait_enabled: false,
            waiting_period: Duration::from_secs(0),
            update_check_count_wait_enabled: false,
            min_update_checks_needed: 0,
            max_update_checks_allowed: 0,
            max_cohort_length: MAX_COHORT_LENGTH,
        }
    }
}

impl RequestParams {
    /// Seed the parameters that come from the static configuration.
    pub fn from_config(config: &Config) -> Self {
        RequestParams {
            updater_name: config.updater.name.clone(),
            updater_version: config.updater.version.clone(),
            os_platform: config.os.platform.clone(),
            os_version: config.os.version.clone(),
            os_sp: config.os.service_pack.clone(),
            update_url: config.service_url.clone(),
            production_update_url: config.service_url.clone(),
            wall_clock_based_wait_enabled: config.scattering.wall_clock_based_wait_enabled,
            waiting_period: config.scattering.waiting_period(),
            update_check_count_wait_enabled: config.scattering.update_check_count_wait_enabled,
            min_update_checks_needed: config.scattering.min_update_checks_needed,
            max_update_checks_allowed: config.scattering.max_update_checks_allowed,
            max_cohort_length: config.max_cohort_length,
            ..RequestParams::default()
        }
    }

    /// The `updaterversion` the request identifies itself with.
    pub fn updater(&self) -> String {
        format!("{}-{}", self.updater_name, self.updater_version)
    }

    pub fn app_id(&self) -> &str {
        if self.download_channel == "canary-channel" && !self.canary_app_id.is_empty() {
            &self.canary_app_id
        } else {
            &self.product_app_id
        }
    }

    /// Whether the download channel is more stable than the one currently installed.  Channels
    /// this crate doesn't know about are never more stable.
    pub fn to_more_stable_channel(&self) -> bool {
        match (channel_index(&self.download_channel), channel_index(&self.current_channel)) {
            (Some(download), Some(current)) => download > current,
            _ => false,
        }
    }

    pub fn is_update_url_official(&self) -> bool {
        self.update_url == self.production_update_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(current: &str, download: &str) -> RequestParams {
        RequestParams {
            current_channel: current.to_string(),
            target_channel: download.to_string(),
            download_channel: download.to_string(),
            ..RequestParams::default()
        }
    }

    #[test]
    fn test_to_more_stable_channel() {
        assert!(params("canary-channel", "stable-channel").to_more_stable_channel());
        assert!(params("dev-channel", "beta-channel").to_more_stable_channel());
        assert!(!params("stable-channel", "canary-channel").to_more_stable_channel());
        assert!(!params("beta-channel", "beta-channel").to_more_stable_channel());
        assert!(!params("testimage-channel", "stable-channel").to_more_stable_channel());
        assert!(!params("canary-channel", "foo-channel").to_more_stable_channel());
    }

    #[test]
    fn test_download_channel_is_a_snapshot() {
        let mut params = params("dev-channel", "stable-channel");
        params.target_channel = "canary-channel".to_string();
        assert!(params.to_more_stable_channel());
    }

    #[test]
    fn test_app_id_on_canary() {
        let mut params = RequestParams {
            product_app_id: "{product}".to_string(),
            canary_app_id: "{canary}".to_string(),
            ..params("stable-channel", "canary-channel")
        };
        assert_eq!(params.app_id(), "{canary}");
        params.download_channel = "stable-channel".to_string();
        assert_eq!(params.app_id(), "{product}");
    }

    #[test]
    fn test_is_update_url_official() {
        let config = Config::from_json(
            r#"{ "os": { "platform": "p", "version": "v" }, "service_url": "https://prod" }"#,
        )
        .unwrap();
        let mut params = RequestParams::from_config(&config);
        assert!(params.is_update_url_official());
        assert_eq!(params.updater(), "ChromeOSUpdateEngine-0.1.0.0");
        params.update_url = "http://localhost:8080/update".to_string();
        assert!(!params.is_update_url_official());
    }
}
