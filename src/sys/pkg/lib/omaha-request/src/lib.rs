// Copyright 2019 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The omaha_request crate implements the device side of a single Omaha update check: building
//! the request, parsing and validating the response, and deciding (via scattering, backoff, p2p
//! and connection policy) whether the offered update should be acted upon.
//!
//! Everything the engine needs from the rest of the system is expressed as a narrow trait
//! (`Prefs`, `Hardware`, `ConnectionManager`, `PayloadState`, `P2pManager`, `HttpRequest`), so
//! that each one can be replaced by a fake in tests.

pub mod common;
pub mod configuration;
pub mod connection_manager;
pub mod hardware;
pub mod http_request;
pub mod install_plan;
pub mod p2p;
pub mod payload_state;
pub mod policy;
pub mod prefs;
pub mod protocol;
pub mod request_params;
pub mod state_machine;
pub mod time;
pub mod xml;
