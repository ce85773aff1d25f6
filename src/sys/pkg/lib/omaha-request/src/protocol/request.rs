// Copyright 2019 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Construction of the request document sent to the update server.

use crate::{
    prefs::{keys, Prefs},
    protocol::{Cohort, PROTOCOL_V3},
    request_params::RequestParams,
    xml::{xml_encode, xml_encode_with_default},
};
use http::header::CONTENT_TYPE;
use hyper::{Body, Request};
use std::fmt::Write as _;
use tracing::{info, warn};

/// The ping day count sent when the device has never pinged before.
pub const NEVER_PINGED: i32 = -1;

/// The ping day count used when the clock went backwards since the last ping.
pub const PING_TIME_JUMP: i32 = -2;

/// Where the update check came from, as reported in `installsource`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InstallSource {
    ScheduledTask,
    OnDemand,
}

impl InstallSource {
    fn as_str(&self) -> &'static str {
        match self {
            InstallSource::ScheduledTask => "scheduler",
            InstallSource::OnDemand => "ondemandupdate",
        }
    }
}

/// The type of event being reported.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventType {
    Unknown = 0,
    DownloadComplete = 1,
    InstallComplete = 2,
    UpdateComplete = 3,
    UpdateDownloadStarted = 13,
    UpdateDownloadFinished = 14,
    RebootedAfterUpdate = 54,
}

/// The outcome of the event being reported.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventResult {
    Error = 0,
    Success = 1,
    SuccessReboot = 2,
    UpdateDeferred = 9,
}

/// An event to report to the server in place of an update check.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OmahaEvent {
    pub event_type: EventType,
    pub event_result: EventResult,
    /// The numeric error code of a failed event; only sent when the result isn't success.
    pub error_code: i32,
}

impl OmahaEvent {
    pub fn new(event_type: EventType) -> Self {
        OmahaEvent { event_type, event_result: EventResult::Success, error_code: 0 }
    }

    pub fn error(event_type: EventType, error_code: i32) -> Self {
        OmahaEvent { event_type, event_result: EventResult::Error, error_code }
    }
}

/// What a request is for.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RequestKind {
    UpdateCheck,
    /// Report activity, without checking for an update.
    PingOnly,
    Event(OmahaEvent),
}

/// Builds the XML request body.
///
/// Building an update check is not idempotent: the previous-version event is sent exactly once,
/// so the previous version is cleared from prefs as the request is built.
#[derive(Debug)]
pub struct RequestBuilder<'a> {
    params: &'a RequestParams,
    kind: &'a RequestKind,
    ping: Option<(i32, i32)>,
    install_date_days: i64,
    max_cohort_length: usize,
}

impl<'a> RequestBuilder<'a> {
    pub fn new(params: &'a RequestParams, kind: &'a RequestKind) -> Self {
        RequestBuilder {
            params,
            kind,
            ping: None,
            install_date_days: -1,
            max_cohort_length: params.max_cohort_length,
        }
    }

    /// Include a ping, with the days since the last active and roll call pings.
    pub fn with_ping(mut self, active_days: i32, roll_call_days: i32) -> Self {
        self.ping = Some((active_days, roll_call_days));
        self
    }

    /// The install date in days, negative if unknown.
    pub fn with_install_date(mut self, install_date_days: i64) -> Self {
        self.install_date_days = install_date_days;
        self
    }

    pub fn with_max_cohort_length(mut self, max_cohort_length: usize) -> Self {
        self.max_cohort_length = max_cohort_length;
        self
    }

    fn install_source(&self) -> InstallSource {
        if self.params.interactive {
            InstallSource::OnDemand
        } else {
            InstallSource::ScheduledTask
        }
    }

    pub fn build(&self, prefs: &mut dyn Prefs) -> String {
        let updater = xml_encode_with_default(&self.params.updater(), "");
        let mut xml = String::new();
        xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        let _ = writeln!(
            xml,
            "<request protocol=\"{}\" version=\"{}\" updaterversion=\"{}\" installsource=\"{}\" \
             ismachine=\"1\">",
            PROTOCOL_V3,
            updater,
            updater,
            self.install_source().as_str(),
        );
        xml.push_str(&self.os_xml());
        xml.push_str(&self.app_xml(prefs));
        xml.push_str("</request>\n");
        xml
    }

    fn os_xml(&self) -> String {
        format!(
            "    <os version=\"{}\" platform=\"{}\" sp=\"{}\"></os>\n",
            xml_encode_with_default(&self.params.os_version, ""),
            xml_encode_with_default(&self.params.os_platform, ""),
            xml_encode_with_default(&self.params.os_sp, ""),
        )
    }

    fn cohort_attributes(&self, prefs: &dyn Prefs) -> String {
        let cohort = Cohort::load(prefs);
        let mut attributes = String::new();
        for (name, value) in
            [("cohort", &cohort.id), ("cohorthint", &cohort.hint), ("cohortname", &cohort.name)]
        {
            let value = match value.as_deref() {
                None | Some("") => continue,
                Some(value) => value,
            };
            if value.len() > self.max_cohort_length {
                warn!(
                    "The omaha cohort setting {} has a too big value, which must be an error or \
                     an attacker trying to inhibit updates",
                    name
                );
                continue;
            }
            match xml_encode(value) {
                Ok(value) => {
                    let _ = write!(attributes, "{}=\"{}\" ", name, value);
                }
                Err(_) => warn!("The omaha cohort setting {} is ASCII-7 invalid, ignoring it", name),
            }
        }
        attributes
    }

    fn app_xml(&self, prefs: &mut dyn Prefs) -> String {
        let params = self.params;
        let app_version = xml_encode_with_default(&params.app_version, "0.0.0.0");
        let versions = if params.to_more_stable_channel() && params.is_powerwash_allowed {
            info!(
                "Passing OS version as 0.0.0.0 as we are set to powerwash on downgrading to the \
                 version in the more stable channel"
            );
            format!("version=\"0.0.0.0\" from_version=\"{}\" ", app_version)
        } else {
            format!("version=\"{}\" ", app_version)
        };

        let mut channels =
            format!("track=\"{}\" ", xml_encode_with_default(&params.download_channel, ""));
        if params.current_channel != params.download_channel {
            let _ = write!(
                channels,
                "from_track=\"{}\" ",
                xml_encode_with_default(&params.current_channel, "")
            );
        }

        let install_date = if self.install_date_days >= 0 {
            format!("installdate=\"{}\" ", self.install_date_days)
        } else {
            String::new()
        };

        let cohort = self.cohort_attributes(prefs);
        let body = self.app_body(prefs);
        format!(
            "    <app appid=\"{}\" {}{}{}lang=\"{}\" board=\"{}\" hardware_class=\"{}\" \
             delta_okay=\"{}\" fw_version=\"{}\" ec_version=\"{}\" {}>\n{}    </app>\n",
            xml_encode_with_default(params.app_id(), ""),
            cohort,
            versions,
            channels,
            xml_encode_with_default(&params.app_lang, "en-US"),
            xml_encode_with_default(&params.os_board, ""),
            xml_encode_with_default(&params.hwid, ""),
            params.delta_okay,
            xml_encode_with_default(&params.fw_version, ""),
            xml_encode_with_default(&params.ec_version, ""),
            install_date,
            body,
        )
    }

    fn app_body(&self, prefs: &mut dyn Prefs) -> String {
        let mut body = String::new();
        match self.kind {
            RequestKind::Event(event) => {
                let error_code = if event.event_result != EventResult::Success {
                    format!(" errorcode=\"{}\"", event.error_code)
                } else {
                    String::new()
                };
                let _ = writeln!(
                    body,
                    "        <event eventtype=\"{}\" eventresult=\"{}\"{}></event>",
                    event.event_type as i32, event.event_result as i32, error_code
                );
            }
            RequestKind::PingOnly | RequestKind::UpdateCheck => {
                if let Some((active_days, roll_call_days)) = self.ping {
                    body.push_str(&ping_xml(active_days, roll_call_days));
                }
                if *self.kind == RequestKind::UpdateCheck {
                    body.push_str(&self.update_check_xml(prefs));
                }
            }
        }
        body
    }

    fn update_check_xml(&self, prefs: &mut dyn Prefs) -> String {
        let mut xml = format!(
            "        <updatecheck targetversionprefix=\"{}\"></updatecheck>\n",
            xml_encode_with_default(&self.params.target_version_prefix, "")
        );

        // A missing previous version means an old client or a new install, both of which still
        // report "0.0.0.0".  An empty one means it was already reported.
        let previous_version =
            prefs.get_string(keys::PREVIOUS_VERSION).unwrap_or_else(|| "0.0.0.0".to_string());
        if !previous_version.is_empty() {
            let _ = writeln!(
                xml,
                "        <event eventtype=\"{}\" eventresult=\"{}\" previousversion=\"{}\"></event>",
                EventType::RebootedAfterUpdate as i32,
                EventResult::Success as i32,
                xml_encode_with_default(&previous_version, "0.0.0.0")
            );
            if !prefs.set_string(keys::PREVIOUS_VERSION, "") {
                warn!("Unable to reset the previous version");
            }
        }
        xml
    }
}

fn ping_attribute(name: &str, days: i32) -> String {
    if days > 0 || days == NEVER_PINGED {
        format!(" {}=\"{}\"", name, days)
    } else {
        String::new()
    }
}

/// The `<ping>` element, or nothing if neither day count needs to be sent.
fn ping_xml(active_days: i32, roll_call_days: i32) -> String {
    let active = ping_attribute("a", active_days);
    let roll_call = ping_attribute("r", roll_call_days);
    if active.is_empty() && roll_call.is_empty() {
        return String::new();
    }
    format!("        <ping active=\"1\"{}{}></ping>\n", active, roll_call)
}

/// Wrap a request body into the POST sent to the update server.
pub fn build_http_request(url: &str, body: String) -> Result<Request<Body>, http::Error> {
    Request::post(url).header(CONTENT_TYPE, "text/xml").body(Body::from(body))
}
