// Copyright 2019 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Static configuration of the update client, loaded from JSON.

use anyhow::{Context as _, Error};
use serde::Deserialize;
use std::time::Duration;

/// The default cap on the length of a cohort value sent to the server.
pub const MAX_COHORT_LENGTH: usize = 1024;

/// The fixed "identity" of the update client.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Updater {
    /// The string identifying the updater itself (e.g. 'ChromeOSUpdateEngine').
    pub name: String,

    /// The version of the updater itself.
    pub version: String,
}

impl Default for Updater {
    fn default() -> Self {
        Updater { name: "ChromeOSUpdateEngine".to_string(), version: "0.1.0.0".to_string() }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct Os {
    pub platform: String,
    pub version: String,
    #[serde(default)]
    pub service_pack: String,
}

/// How update checks are scattered across the fleet.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct Scattering {
    pub wall_clock_based_wait_enabled: bool,
    pub waiting_period_seconds: u64,
    pub update_check_count_wait_enabled: bool,
    pub min_update_checks_needed: i64,
    pub max_update_checks_allowed: i64,
}

impl Default for Scattering {
    fn default() -> Self {
        Scattering {
            wall_clock_based_wait_enabled: false,
            waiting_period_seconds: 0,
            update_check_count_wait_enabled: false,
            min_update_checks_needed: 8,
            max_update_checks_allowed: 12,
        }
    }
}

impl Scattering {
    pub fn waiting_period(&self) -> Duration {
        Duration::from_secs(self.waiting_period_seconds)
    }
}

fn default_max_cohort_length() -> usize {
    MAX_COHORT_LENGTH
}

/// The update client configuration.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub updater: Updater,

    pub os: Os,

    /// The production update URL; any other URL makes the update check unofficial.
    pub service_url: String,

    #[serde(default)]
    pub scattering: Scattering,

    #[serde(default = "default_max_cohort_length")]
    pub max_cohort_length: usize,
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).context("parsing update client config")
    }
}
