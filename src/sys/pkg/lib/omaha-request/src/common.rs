// Copyright 2019 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The omaha_request::common module contains those types that are common to many parts of the
//! library.  Many of these don't belong to a specific sub-module.

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::SystemTime;

/// The numeric result codes reported by one update check, as understood by the service layer
/// that sits above this crate.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorCode {
    Success,
    OmahaRequestEmptyResponseError,
    OmahaRequestXMLParseError,
    OmahaResponseInvalid,
    OmahaUpdateIgnoredPerPolicy,
    OmahaUpdateDeferredPerPolicy,
    OmahaUpdateDeferredForBackoff,
    OmahaRequestXMLHasEntityDecl,
    /// A failed transfer, carrying the (already clamped) HTTP status code.
    OmahaRequestHTTPResponse(u32),
}

/// Transfer failures are reported as this base plus the HTTP status code.
pub const HTTP_RESPONSE_BASE: i32 = 2000;

impl ErrorCode {
    pub fn value(&self) -> i32 {
        match self {
            ErrorCode::Success => 0,
            ErrorCode::OmahaRequestEmptyResponseError => 30,
            ErrorCode::OmahaRequestXMLParseError => 31,
            ErrorCode::OmahaResponseInvalid => 34,
            ErrorCode::OmahaUpdateIgnoredPerPolicy => 35,
            ErrorCode::OmahaUpdateDeferredPerPolicy => 36,
            ErrorCode::OmahaUpdateDeferredForBackoff => 40,
            ErrorCode::OmahaRequestXMLHasEntityDecl => 46,
            ErrorCode::OmahaRequestHTTPResponse(status) => HTTP_RESPONSE_BASE + *status as i32,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.value())
    }
}

/// Readable wall-clock formatting for logs, the Debug impl of SystemTime only prints seconds
/// since the unix epoch.
pub fn format_system_time(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339()
}

/// Format a number of seconds the way humans read waiting periods, e.g. "2d3h0m5s".
pub fn format_secs(secs: i64) -> String {
    let sign = if secs < 0 { "-" } else { "" };
    let secs = secs.unsigned_abs();
    let (days, rem) = (secs / 86400, secs % 86400);
    let (hours, rem) = (rem / 3600, rem % 3600);
    let (mins, secs) = (rem / 60, rem % 60);
    if days > 0 {
        format!("{}{}d{}h{}m{}s", sign, days, hours, mins, secs)
    } else if hours > 0 {
        format!("{}{}h{}m{}s", sign, hours, mins, secs)
    } else if mins > 0 {
        format!("{}{}m{}s", sign, mins, secs)
    } else {
        format!("{}{}s", sign, secs)
    }
}
