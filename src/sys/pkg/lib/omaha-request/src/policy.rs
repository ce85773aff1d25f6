// Copyright 2019 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decisions about whether an offered update should be taken now, later, or not at all.
//!
//! Scattering spreads the downloads of an update across the fleet: a device first waits out a
//! wall-clock period from when it first saw an update, and then optionally a random number of
//! further update checks.  Every decision here fails open: if the state needed to make it can't
//! be read or written, the update is not held back.

use crate::{
    common::{format_secs, format_system_time},
    connection_manager::ConnectionManager,
    payload_state::PayloadState,
    prefs::{keys, Prefs},
    protocol::response::OmahaResponse,
    request_params::RequestParams,
    time::{micros_to_system_time, signed_micros_between, system_time_to_micros, TimeSource},
};
use rand::{Rng, RngCore};
use std::time::SystemTime;
use tracing::{error, info};

const MICROS_PER_SEC: i64 = 1_000_000;
const SECS_PER_DAY: i64 = 24 * 60 * 60;

/// Data about the local system that's needed to fulfill Policy questions
pub struct PolicyData {
    /// The current time at the start of the decision
    pub current_time: SystemTime,
}

impl PolicyData {
    /// Create and return a new builder for PolicyData.
    pub fn builder() -> PolicyDataBuilder {
        PolicyDataBuilder::default()
    }
}

impl std::fmt::Debug for PolicyData {
    /// Use the same readable time formatting as the rest of the logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyData")
            .field("current_time", &format_system_time(self.current_time))
            .finish()
    }
}

/// The PolicyDataBuilder uses the typestate pattern.  The builder cannot be built until the time
/// has been specified (which changes the type of the builder).
#[derive(Debug, Default)]
pub struct PolicyDataBuilder;

/// The PolicyDataBuilder, once it has time set.
pub struct PolicyDataBuilderWithTime {
    current_time: SystemTime,
}

impl PolicyDataBuilder {
    /// Set the |current_time| from a TimeSource.
    pub fn use_time_source(self, time_source: &dyn TimeSource) -> PolicyDataBuilderWithTime {
        PolicyDataBuilderWithTime { current_time: time_source.now() }
    }

    /// Set the |current_time| explicitly from a given SystemTime.
    pub fn time(self, current_time: SystemTime) -> PolicyDataBuilderWithTime {
        PolicyDataBuilderWithTime { current_time }
    }
}

impl PolicyDataBuilderWithTime {
    /// Construct the PolicyData
    pub fn build(self) -> PolicyData {
        PolicyData { current_time: self.current_time }
    }
}

/// The outcome of the wall-clock part of scattering.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WallClockWaitResult {
    NotSatisfied,
    SatisfiedButCountWaitRequired,
    SatisfiedAndCountWaitNotRequired,
}

/// Why an update is not taken at all.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IgnoreReason {
    /// The update is to the version the device rolled back from.
    RolledBackVersion,
    /// Updates are not allowed over the current connection.
    DisallowedConnection,
}

/// The scattering policy for one update check.
pub struct ScatteringPolicy<'a> {
    params: &'a RequestParams,
    policy_data: PolicyData,
}

impl<'a> ScatteringPolicy<'a> {
    pub fn new(params: &'a RequestParams, policy_data: PolicyData) -> Self {
        ScatteringPolicy { params, policy_data }
    }

    pub fn is_wall_clock_based_waiting_satisfied(
        &self,
        response: &OmahaResponse,
        prefs: &mut dyn Prefs,
    ) -> WallClockWaitResult {
        if !self.params.wall_clock_based_wait_enabled {
            info!("Wall-clock-based waiting period is not enabled, so no deferring needed");
            return WallClockWaitResult::SatisfiedAndCountWaitNotRequired;
        }

        let now = self.policy_data.current_time;
        // The first-seen time could be of any update seen in the past.  The clock starts ticking
        // the first time any update is seen.
        let update_first_seen_at = if prefs.exists(keys::UPDATE_FIRST_SEEN_AT) {
            match prefs.get_int64(keys::UPDATE_FIRST_SEEN_AT) {
                Some(micros) => match micros_to_system_time(micros) {
                    Some(time) => {
                        info!(
                            "Using persisted value of UpdateFirstSeenAt: {}",
                            format_system_time(time)
                        );
                        time
                    }
                    None => {
                        error!(
                            "Not scattering as UpdateFirstSeenAt value {} is out of range",
                            micros
                        );
                        return WallClockWaitResult::SatisfiedAndCountWaitNotRequired;
                    }
                },
                None => {
                    info!("Not scattering as UpdateFirstSeenAt value cannot be read");
                    return WallClockWaitResult::SatisfiedAndCountWaitNotRequired;
                }
            }
        } else {
            if !prefs.set_int64(keys::UPDATE_FIRST_SEEN_AT, system_time_to_micros(now)) {
                info!(
                    "Not scattering as UpdateFirstSeenAt value {} cannot be persisted",
                    format_system_time(now)
                );
                return WallClockWaitResult::SatisfiedAndCountWaitNotRequired;
            }
            info!("Persisted the new value for UpdateFirstSeenAt: {}", format_system_time(now));
            now
        };

        let elapsed_micros = match signed_micros_between(update_first_seen_at, now) {
            Some(elapsed_micros) => elapsed_micros,
            None => {
                error!(
                    "Not scattering as the time since UpdateFirstSeenAt {} is out of range",
                    format_system_time(update_first_seen_at)
                );
                return WallClockWaitResult::SatisfiedAndCountWaitNotRequired;
            }
        };
        let waiting_period_micros =
            i64::try_from(self.params.waiting_period.as_micros()).unwrap_or(i64::MAX);
        info!(
            "Waiting Period = {}, Time Elapsed = {}, MaxDaysToScatter = {}",
            format_secs(waiting_period_micros / MICROS_PER_SEC),
            format_secs(elapsed_micros / MICROS_PER_SEC),
            response.max_days_to_scatter
        );

        if !response.deadline.is_empty() {
            info!("Not scattering as deadline flag is set");
            return WallClockWaitResult::SatisfiedAndCountWaitNotRequired;
        }
        if response.max_days_to_scatter == 0 {
            info!("Not scattering as MaxDaysToScatter in rule is 0");
            return WallClockWaitResult::SatisfiedAndCountWaitNotRequired;
        }
        let max_scatter_micros =
            response.max_days_to_scatter.saturating_mul(SECS_PER_DAY * MICROS_PER_SEC);
        if elapsed_micros > max_scatter_micros {
            info!("Not scattering as we're past the MaxDaysToScatter limit");
            return WallClockWaitResult::SatisfiedAndCountWaitNotRequired;
        }

        let remaining_secs = waiting_period_micros.saturating_sub(elapsed_micros) / MICROS_PER_SEC;
        if remaining_secs <= 0 {
            info!("Successfully passed the wall-clock-based-wait");
            return if self.params.update_check_count_wait_enabled {
                WallClockWaitResult::SatisfiedButCountWaitRequired
            } else {
                WallClockWaitResult::SatisfiedAndCountWaitNotRequired
            };
        }
        info!("Update deferred for another {} per policy", format_secs(remaining_secs));
        WallClockWaitResult::NotSatisfied
    }

    pub fn is_update_check_count_based_waiting_satisfied(
        &self,
        prefs: &mut dyn Prefs,
        rng: &mut dyn RngCore,
    ) -> bool {
        let min = self.params.min_update_checks_needed;
        let max = self.params.max_update_checks_allowed;
        let count = if prefs.exists(keys::UPDATE_CHECK_COUNT) {
            match prefs.get_int64(keys::UPDATE_CHECK_COUNT) {
                Some(count) => count,
                None => {
                    error!("Unable to read update check count. Skipping update-check-count-based-wait");
                    return true;
                }
            }
        } else {
            // The count down starts now.
            let count = if min <= max { rng.gen_range(min..=max) } else { max };
            info!("Randomly picked update check count value = {}", count);
            if !prefs.set_int64(keys::UPDATE_CHECK_COUNT, count) {
                error!("Unable to write update check count. Skipping update-check-count-based-wait");
                return true;
            }
            count
        };

        if count == 0 {
            info!("Successfully passed the update-check-based-wait");
            return true;
        }
        if count < 0 || count > max {
            error!(
                "Invalid value for update check count detected: {}. Skipping \
                 update-check-count-based-wait",
                count
            );
            return true;
        }
        info!("Deferring Omaha updates for another {} update checks per policy", count);
        false
    }

    /// Whether downloading the offered update should wait for now.
    pub fn should_defer_download(
        &self,
        response: &OmahaResponse,
        prefs: &mut dyn Prefs,
        payload_state: &dyn PayloadState,
        rng: &mut dyn RngCore,
    ) -> bool {
        if self.params.interactive {
            info!("Not deferring download because update is interactive");
            return false;
        }
        // Peers on the LAN only hand out payloads in turn, so that's already scattered.
        if payload_state.using_p2p_for_downloading() && !payload_state.p2p_url().is_empty() {
            info!("Download not deferred because download will happen from a local peer (via p2p)");
            return false;
        }
        match self.is_wall_clock_based_waiting_satisfied(response, prefs) {
            WallClockWaitResult::NotSatisfied => {
                info!("wall-clock-based-wait not satisfied");
                true
            }
            WallClockWaitResult::SatisfiedButCountWaitRequired => {
                info!("wall-clock-based-wait satisfied and update-check-based-wait required");
                !self.is_update_check_count_based_waiting_satisfied(prefs, rng)
            }
            WallClockWaitResult::SatisfiedAndCountWaitNotRequired => {
                info!("wall-clock-based-wait satisfied and update-check-based-wait is not required");
                false
            }
        }
    }
}

fn is_update_allowed_over_current_connection(connection_manager: &dyn ConnectionManager) -> bool {
    let (connection_type, tethering) = match connection_manager.get_connection_properties() {
        Some(properties) => properties,
        None => {
            info!("We could not determine our connection type. Defaulting to allow updates");
            return true;
        }
    };
    let allowed = connection_manager.is_update_allowed_over(connection_type, tethering);
    info!(
        "We are connected via {}, Updates allowed: {}",
        connection_type,
        if allowed { "Yes" } else { "No" }
    );
    allowed
}

/// Whether the offered update should be ignored outright.
pub fn should_ignore_update(
    response: &OmahaResponse,
    payload_state: &dyn PayloadState,
    connection_manager: &dyn ConnectionManager,
) -> Option<IgnoreReason> {
    let rollback_version = payload_state.rollback_version();
    if !rollback_version.is_empty() {
        info!("Detected previous rollback from version {}", rollback_version);
        if rollback_version == response.version {
            info!("Received version that we rolled back from. Ignoring");
            return Some(IgnoreReason::RolledBackVersion);
        }
    }
    if !is_update_allowed_over_current_connection(connection_manager) {
        info!("Update is not allowed over current connection");
        return Some(IgnoreReason::DisallowedConnection);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        connection_manager::{ConnectionType, FakeConnectionManager, Tethering},
        payload_state::FakePayloadState,
        prefs::MemPrefs,
        time::MockTimeSource,
    };
    use rand::{rngs::SmallRng, SeedableRng};
    use std::time::Duration;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn scattering_params() -> RequestParams {
        RequestParams {
            wall_clock_based_wait_enabled: true,
            waiting_period: 2 * DAY,
            update_check_count_wait_enabled: false,
            min_update_checks_needed: 1,
            max_update_checks_allowed: 8,
            ..RequestParams::default()
        }
    }

    fn scattered_response() -> OmahaResponse {
        OmahaResponse {
            update_exists: true,
            version: "1.2.3.4".to_string(),
            max_days_to_scatter: 7,
            ..OmahaResponse::default()
        }
    }

    fn policy_at(params: &RequestParams, time: SystemTime) -> ScatteringPolicy<'_> {
        ScatteringPolicy::new(params, PolicyData::builder().time(time).build())
    }

    #[test]
    fn test_policy_data_builder_with_time_source() {
        let time_source = MockTimeSource::new_from_now();
        let policy_data = PolicyData::builder().use_time_source(&time_source).build();
        assert_eq!(policy_data.current_time, time_source.now());
    }

    #[test]
    fn test_wall_clock_wait_disabled() {
        let params = RequestParams::default();
        let mut prefs = MemPrefs::new();
        let result = policy_at(&params, SystemTime::now())
            .is_wall_clock_based_waiting_satisfied(&scattered_response(), &mut prefs);
        assert_eq!(result, WallClockWaitResult::SatisfiedAndCountWaitNotRequired);
        assert!(!prefs.exists(keys::UPDATE_FIRST_SEEN_AT));
    }

    #[test]
    fn test_wall_clock_wait_first_seen_now() {
        let params = scattering_params();
        let now = SystemTime::UNIX_EPOCH + 1000 * DAY;
        let mut prefs = MemPrefs::new();
        let result = policy_at(&params, now)
            .is_wall_clock_based_waiting_satisfied(&scattered_response(), &mut prefs);
        assert_eq!(result, WallClockWaitResult::NotSatisfied);
        assert_eq!(prefs.get_int64(keys::UPDATE_FIRST_SEEN_AT), Some(system_time_to_micros(now)));
    }

    #[test]
    fn test_wall_clock_wait_is_monotonic() {
        let params = scattering_params();
        let first_seen = SystemTime::UNIX_EPOCH + 1000 * DAY;
        let mut prefs = MemPrefs::new();
        prefs.set_int64(keys::UPDATE_FIRST_SEEN_AT, system_time_to_micros(first_seen));
        let response = scattered_response();

        let mut satisfied = false;
        for hours in 0..(7 * 24) {
            let now = first_seen + Duration::from_secs(hours * 3600);
            let result = policy_at(&params, now)
                .is_wall_clock_based_waiting_satisfied(&response, &mut prefs);
            let is_satisfied = result != WallClockWaitResult::NotSatisfied;
            assert!(!(satisfied && !is_satisfied), "wait became unsatisfied at {} hours", hours);
            satisfied = is_satisfied;
            assert_eq!(is_satisfied, hours >= 48, "at {} hours", hours);
        }
    }

    #[test]
    fn test_wall_clock_wait_overrides() {
        let params = scattering_params();
        let now = SystemTime::UNIX_EPOCH + 1000 * DAY;

        let mut prefs = MemPrefs::new();
        let response = OmahaResponse { deadline: "20101020".to_string(), ..scattered_response() };
        assert_eq!(
            policy_at(&params, now).is_wall_clock_based_waiting_satisfied(&response, &mut prefs),
            WallClockWaitResult::SatisfiedAndCountWaitNotRequired
        );

        let response = OmahaResponse { max_days_to_scatter: 0, ..scattered_response() };
        assert_eq!(
            policy_at(&params, now).is_wall_clock_based_waiting_satisfied(&response, &mut prefs),
            WallClockWaitResult::SatisfiedAndCountWaitNotRequired
        );

        // Seen more than MaxDaysToScatter ago, even though the waiting period is longer.
        let params = RequestParams { waiting_period: 30 * DAY, ..scattering_params() };
        let mut prefs = MemPrefs::new();
        prefs.set_int64(keys::UPDATE_FIRST_SEEN_AT, system_time_to_micros(now - 8 * DAY));
        assert_eq!(
            policy_at(&params, now)
                .is_wall_clock_based_waiting_satisfied(&scattered_response(), &mut prefs),
            WallClockWaitResult::SatisfiedAndCountWaitNotRequired
        );
    }

    #[test]
    fn test_wall_clock_wait_fails_open() {
        let params = scattering_params();
        let now = SystemTime::UNIX_EPOCH + 1000 * DAY;

        let mut prefs = MemPrefs::new();
        prefs.set_raw(keys::UPDATE_FIRST_SEEN_AT, "garbage");
        assert_eq!(
            policy_at(&params, now)
                .is_wall_clock_based_waiting_satisfied(&scattered_response(), &mut prefs),
            WallClockWaitResult::SatisfiedAndCountWaitNotRequired
        );

        let mut prefs = MemPrefs::new();
        prefs.set_read_only(true);
        assert_eq!(
            policy_at(&params, now)
                .is_wall_clock_based_waiting_satisfied(&scattered_response(), &mut prefs),
            WallClockWaitResult::SatisfiedAndCountWaitNotRequired
        );
    }

    #[test]
    fn test_wall_clock_wait_first_seen_out_of_range() {
        let params = scattering_params();
        let now = SystemTime::UNIX_EPOCH + 1000 * DAY;

        for first_seen in [i64::MIN, i64::MIN + 1] {
            let mut prefs = MemPrefs::new();
            prefs.set_int64(keys::UPDATE_FIRST_SEEN_AT, first_seen);
            assert_eq!(
                policy_at(&params, now)
                    .is_wall_clock_based_waiting_satisfied(&scattered_response(), &mut prefs),
                WallClockWaitResult::SatisfiedAndCountWaitNotRequired,
                "first seen at {}",
                first_seen
            );
        }
    }

    #[test]
    fn test_wall_clock_wait_requires_count_wait() {
        let params = RequestParams { update_check_count_wait_enabled: true, ..scattering_params() };
        let now = SystemTime::UNIX_EPOCH + 1000 * DAY;
        let mut prefs = MemPrefs::new();
        prefs.set_int64(keys::UPDATE_FIRST_SEEN_AT, system_time_to_micros(now - 3 * DAY));
        assert_eq!(
            policy_at(&params, now)
                .is_wall_clock_based_waiting_satisfied(&scattered_response(), &mut prefs),
            WallClockWaitResult::SatisfiedButCountWaitRequired
        );
    }

    #[test]
    fn test_update_check_count_picks_random_value() {
        let params = scattering_params();
        let mut rng = SmallRng::seed_from_u64(0);
        for _ in 0..20 {
            let mut prefs = MemPrefs::new();
            let satisfied = policy_at(&params, SystemTime::now())
                .is_update_check_count_based_waiting_satisfied(&mut prefs, &mut rng);
            assert!(!satisfied);
            let count = prefs.get_int64(keys::UPDATE_CHECK_COUNT).unwrap();
            assert!((1..=8).contains(&count), "count {}", count);
        }
    }

    #[test]
    fn test_update_check_count_existing_values() {
        let params = scattering_params();
        let policy = policy_at(&params, SystemTime::now());
        let mut rng = SmallRng::seed_from_u64(0);
        let cases =
            [("0", true), ("5", false), ("8", false), ("9", true), ("-1", true), ("x", true)];
        for (value, expected) in cases {
            let mut prefs = MemPrefs::new();
            prefs.set_raw(keys::UPDATE_CHECK_COUNT, value);
            assert_eq!(
                policy.is_update_check_count_based_waiting_satisfied(&mut prefs, &mut rng),
                expected,
                "count {}",
                value
            );
        }

        let mut prefs = MemPrefs::new();
        prefs.set_read_only(true);
        assert!(policy.is_update_check_count_based_waiting_satisfied(&mut prefs, &mut rng));
    }

    #[test]
    fn test_should_defer_download() {
        let params = scattering_params();
        let now = SystemTime::UNIX_EPOCH + 1000 * DAY;
        let mut rng = SmallRng::seed_from_u64(0);
        let response = scattered_response();

        let mut prefs = MemPrefs::new();
        let payload_state = FakePayloadState::default();
        assert!(policy_at(&params, now).should_defer_download(
            &response,
            &mut prefs,
            &payload_state,
            &mut rng
        ));

        let interactive = RequestParams { interactive: true, ..scattering_params() };
        assert!(!policy_at(&interactive, now).should_defer_download(
            &response,
            &mut prefs,
            &payload_state,
            &mut rng
        ));

        let p2p = FakePayloadState {
            using_p2p_for_downloading: true,
            p2p_url: "http://peer/payload".to_string(),
            ..FakePayloadState::default()
        };
        assert!(!policy_at(&params, now).should_defer_download(
            &response,
            &mut prefs,
            &p2p,
            &mut rng
        ));
    }

    #[test]
    fn test_should_defer_download_for_update_check_count() {
        let params = RequestParams { update_check_count_wait_enabled: true, ..scattering_params() };
        let now = SystemTime::UNIX_EPOCH + 1000 * DAY;
        let mut rng = SmallRng::seed_from_u64(0);
        let mut prefs = MemPrefs::new();
        prefs.set_int64(keys::UPDATE_FIRST_SEEN_AT, system_time_to_micros(now - 3 * DAY));
        prefs.set_int64(keys::UPDATE_CHECK_COUNT, 3);
        let payload_state = FakePayloadState::default();
        let policy = policy_at(&params, now);
        assert!(policy.should_defer_download(
            &scattered_response(),
            &mut prefs,
            &payload_state,
            &mut rng
        ));
        prefs.set_int64(keys::UPDATE_CHECK_COUNT, 0);
        assert!(!policy.should_defer_download(
            &scattered_response(),
            &mut prefs,
            &payload_state,
            &mut rng
        ));
    }

    #[test]
    fn test_should_ignore_rolled_back_version() {
        let payload_state =
            FakePayloadState { rollback_version: "1.2.3.4".to_string(), ..Default::default() };
        let connection_manager = FakeConnectionManager::default();
        assert_eq!(
            should_ignore_update(&scattered_response(), &payload_state, &connection_manager),
            Some(IgnoreReason::RolledBackVersion)
        );

        let response = OmahaResponse { version: "1.2.3.5".to_string(), ..scattered_response() };
        assert_eq!(should_ignore_update(&response, &payload_state, &connection_manager), None);
    }

    #[test]
    fn test_should_ignore_disallowed_connection() {
        let payload_state = FakePayloadState::default();
        let connection_manager = FakeConnectionManager {
            properties: Some((ConnectionType::Cellular, Tethering::Unknown)),
            disallowed: vec![ConnectionType::Cellular],
        };
        assert_eq!(
            should_ignore_update(&scattered_response(), &payload_state, &connection_manager),
            Some(IgnoreReason::DisallowedConnection)
        );

        // An unknown connection allows updates.
        let connection_manager = FakeConnectionManager { properties: None, ..connection_manager };
        assert_eq!(
            should_ignore_update(&scattered_response(), &payload_state, &connection_manager),
            None
        );
    }
}
