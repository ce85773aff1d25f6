// Copyright 2019 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Which network the device is on, and whether updates may be downloaded over it.

use crate::prefs::{keys, Prefs};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use tracing::info;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ConnectionType {
    Ethernet,
    Wifi,
    Wimax,
    Bluetooth,
    Cellular,
    Unknown,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionType::Ethernet => "ethernet",
            ConnectionType::Wifi => "wifi",
            ConnectionType::Wimax => "wimax",
            ConnectionType::Bluetooth => "bluetooth",
            ConnectionType::Cellular => "cellular",
            ConnectionType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Whether the connection is shared from another device, e.g. a phone hotspot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Tethering {
    NotDetected,
    Suspected,
    Confirmed,
    Unknown,
}

pub trait ConnectionManager {
    /// The type and tethering state of the current default connection, or None if it can't be
    /// determined.
    fn get_connection_properties(&self) -> Option<(ConnectionType, Tethering)>;

    fn is_update_allowed_over(&self, connection_type: ConnectionType, tethering: Tethering)
        -> bool;
}

impl<T: ConnectionManager> ConnectionManager for Rc<RefCell<T>> {
    fn get_connection_properties(&self) -> Option<(ConnectionType, Tethering)> {
        self.borrow().get_connection_properties()
    }
    fn is_update_allowed_over(
        &self,
        connection_type: ConnectionType,
        tethering: Tethering,
    ) -> bool {
        self.borrow().is_update_allowed_over(connection_type, tethering)
    }
}

/// Device policy, as far as update connection gating goes.
pub trait DevicePolicy {
    /// The connection types the enterprise policy allows updates over, or None if the policy
    /// doesn't say.
    fn allowed_connection_types_for_update(&self) -> Option<Vec<ConnectionType>>;
}

/// The device policy of an unmanaged device.
#[derive(Clone, Debug, Default)]
pub struct NoDevicePolicy;

impl DevicePolicy for NoDevicePolicy {
    fn allowed_connection_types_for_update(&self) -> Option<Vec<ConnectionType>> {
        None
    }
}

impl DevicePolicy for Option<Vec<ConnectionType>> {
    fn allowed_connection_types_for_update(&self) -> Option<Vec<ConnectionType>> {
        self.clone()
    }
}

/// Detection of the current connection, the part of a ConnectionManager that talks to the
/// network stack.
pub trait ConnectionProbe {
    fn probe(&self) -> Option<(ConnectionType, Tethering)>;
}

impl ConnectionProbe for Option<(ConnectionType, Tethering)> {
    fn probe(&self) -> Option<(ConnectionType, Tethering)> {
        *self
    }
}

/// A ConnectionManager that gates expensive connections on device policy, falling back to the
/// user's own cellular permission when the device isn't managed.
pub struct PolicyConnectionManager<C, D, P> {
    probe: C,
    device_policy: D,
    prefs: P,
}

impl<C, D, P> PolicyConnectionManager<C, D, P>
where
    C: ConnectionProbe,
    D: DevicePolicy,
    P: Prefs,
{
    pub fn new(probe: C, device_policy: D, prefs: P) -> Self {
        PolicyConnectionManager { probe, device_policy, prefs }
    }

    fn is_cellular_allowed(&self) -> bool {
        if let Some(allowed) = self.device_policy.allowed_connection_types_for_update() {
            let allowed = allowed.contains(&ConnectionType::Cellular);
            if !allowed {
                info!("Disabling updates over cellular as device policy doesn't allow it");
            }
            return allowed;
        }
        match self.prefs.get_boolean(keys::UPDATE_OVER_CELLULAR_PERMISSION) {
            Some(true) => true,
            Some(false) => {
                info!("Disabling updates over cellular per user setting");
                false
            }
            None => {
                info!("Disabling updates over cellular as there's no device policy or user setting");
                false
            }
        }
    }
}

impl<C, D, P> ConnectionManager for PolicyConnectionManager<C, D, P>
where
    C: ConnectionProbe,
    D: DevicePolicy,
    P: Prefs,
{
    fn get_connection_properties(&self) -> Option<(ConnectionType, Tethering)> {
        self.probe.probe()
    }

    fn is_update_allowed_over(
        &self,
        connection_type: ConnectionType,
        tethering: Tethering,
    ) -> bool {
        match connection_type {
            ConnectionType::Bluetooth => false,
            ConnectionType::Cellular => self.is_cellular_allowed(),
            // A confirmed tethered connection is as expensive as cellular.
            _ if tethering == Tethering::Confirmed => self.is_cellular_allowed(),
            _ => true,
        }
    }
}

/// A ConnectionManager with a fixed connection and an explicit set of forbidden types.
#[derive(Clone, Debug)]
pub struct FakeConnectionManager {
    pub properties: Option<(ConnectionType, Tethering)>,
    pub disallowed: Vec<ConnectionType>,
}

impl Default for FakeConnectionManager {
    fn default() -> Self {
        FakeConnectionManager {
            properties: Some((ConnectionType::Ethernet, Tethering::NotDetected)),
            disallowed: vec![],
        }
    }
}

impl ConnectionManager for FakeConnectionManager {
    fn get_connection_properties(&self) -> Option<(ConnectionType, Tethering)> {
        self.properties
    }

    fn is_update_allowed_over(&self, connection_type: ConnectionType, _: Tethering) -> bool {
        !self.disallowed.contains(&connection_type)
    }
}
