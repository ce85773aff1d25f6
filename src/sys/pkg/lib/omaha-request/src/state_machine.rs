// Copyright 2019 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The protocol action: one request to the update server, and everything that's decided from its
//! response.
//!
//! The action is an explicit state machine.  `OmahaRequestAction::advance` is a synchronous
//! transition function from one `ActionState` to the next `Step`, and `perform` drives it,
//! suspending only to wait for the HTTP transfer and for the p2p peer lookup.

use crate::{
    common::ErrorCode,
    connection_manager::{ConnectionManager, FakeConnectionManager},
    hardware::{FakeHardware, Hardware},
    http_request::{self, HttpRequest, StubHttpRequest},
    p2p::{self, P2pManager, StubP2pManager, MAX_P2P_NETWORK_WAIT},
    payload_state::{FakePayloadState, PayloadState},
    policy::{should_ignore_update, IgnoreReason, PolicyData, ScatteringPolicy},
    prefs::{keys, MemPrefs, Prefs},
    protocol::{
        request::{build_http_request, RequestBuilder, RequestKind, NEVER_PINGED, PING_TIME_JUMP},
        response::{get_install_date, parse_response, OmahaResponse, ResponseError},
    },
    request_params::RequestParams,
    time::{system_time_to_micros, StandardTimeSource, TimeSource, MICROS_PER_DAY},
    xml::{parse_document, ParseError, ParsedBag},
};
use futures::future::{AbortHandle, AbortRegistration, Abortable};
use hyper::{Body, Request, Response};
use itertools::Itertools as _;
use rand::{rngs::SmallRng, RngCore, SeedableRng};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument as _, Span};

/// Why an offered update is held back for now.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeferReason {
    /// The scattering policy spreads this update over a later check.
    Scattering,
    /// The downloader is backing off after earlier failures.
    Backoff,
}

/// Everything that can end an update check short of success.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum OmahaRequestError {
    #[error("network transfer failed with http status {http_status}")]
    Transport { http_status: u32 },

    #[error("response is not a valid document")]
    Parse(#[source] ParseError),

    #[error("response is invalid")]
    ResponseInvalid(#[source] ResponseError),

    #[error("update deferred: {0:?}")]
    Deferred(DeferReason),

    #[error("update ignored: {0:?}")]
    Ignored(IgnoreReason),
}

impl OmahaRequestError {
    pub fn code(&self) -> ErrorCode {
        match self {
            OmahaRequestError::Transport { http_status } => {
                ErrorCode::OmahaRequestHTTPResponse(*http_status)
            }
            OmahaRequestError::Parse(ParseError::Empty) => {
                ErrorCode::OmahaRequestEmptyResponseError
            }
            OmahaRequestError::Parse(ParseError::EntityDeclaration) => {
                ErrorCode::OmahaRequestXMLHasEntityDecl
            }
            OmahaRequestError::Parse(ParseError::Malformed(_)) => {
                ErrorCode::OmahaRequestXMLParseError
            }
            OmahaRequestError::ResponseInvalid(_) => ErrorCode::OmahaResponseInvalid,
            OmahaRequestError::Deferred(DeferReason::Scattering) => {
                ErrorCode::OmahaUpdateDeferredPerPolicy
            }
            OmahaRequestError::Deferred(DeferReason::Backoff) => {
                ErrorCode::OmahaUpdateDeferredForBackoff
            }
            OmahaRequestError::Ignored(_) => ErrorCode::OmahaUpdateIgnoredPerPolicy,
        }
    }
}

/// The action was terminated before it completed.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("omaha request was terminated")]
pub struct Terminated;

/// What one update check produced.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ActionResult {
    pub outcome: Result<(), OmahaRequestError>,
    /// The structured response, if one was produced.  After an ignore or deferral it's still
    /// here, with `update_exists` cleared.
    pub response: Option<OmahaResponse>,
}

impl ActionResult {
    fn success(response: Option<OmahaResponse>) -> Self {
        ActionResult { outcome: Ok(()), response }
    }

    fn failure(error: OmahaRequestError, response: Option<OmahaResponse>) -> Self {
        ActionResult { outcome: Err(error), response }
    }

    pub fn code(&self) -> ErrorCode {
        match &self.outcome {
            Ok(()) => ErrorCode::Success,
            Err(e) => e.code(),
        }
    }
}

/// Where an update check is.
#[derive(Debug)]
pub enum ActionState {
    Idle,
    /// The request is built and ready to be sent.
    RequestSent(Request<Body>),
    /// No usable response arrived.  `http_status` is the status of a non-success response, None
    /// if there was no response at all.
    TransferFailed { http_status: Option<u16> },
    ResponseReceived(Vec<u8>),
    ParseFailed(ParseError),
    Parsed(ParsedBag),
    StatusRejected(ResponseError),
    PolicyIgnored { reason: IgnoreReason, response: OmahaResponse },
    /// Waiting for a peer to offer the payload.
    P2PPending(OmahaResponse),
    /// The update is valid and wanted; whether to take it now is still to be decided.
    Accepted(OmahaResponse),
    PolicyDeferred { reason: DeferReason, response: OmahaResponse },
    Completed(ActionResult),
}

/// What the driver has to do to get to the next state.
#[derive(Debug)]
pub enum Step {
    /// Move on to this state right away.
    Next(ActionState),
    /// Send the request, and continue with the outcome of the transfer.
    Transfer(Request<Body>),
    /// Look for a peer that has the payload, and continue with the outcome of the lookup.
    LookupPeer { file_id: String, minimum_size: u64, response: OmahaResponse },
    Done(ActionResult),
}

/// Transfer failures are reported with a status below 1000, 999 standing in for anything else.
fn clamp_http_status(status: Option<u16>) -> u32 {
    match status {
        Some(status) if status < 1000 => status.into(),
        _ => 999,
    }
}

pub struct OmahaRequestActionBuilder {
    params: RequestParams,
    kind: RequestKind,
    prefs: Box<dyn Prefs>,
    hardware: Box<dyn Hardware>,
    http: Box<dyn HttpRequest>,
    connection_manager: Box<dyn ConnectionManager>,
    payload_state: Box<dyn PayloadState>,
    p2p_manager: Box<dyn P2pManager>,
    time_source: Box<dyn TimeSource>,
    rng: Box<dyn RngCore>,
    span: Option<Span>,
}

impl OmahaRequestActionBuilder {
    /// A builder where every collaborator is an inert stand-in until set.
    pub fn new(params: RequestParams, kind: RequestKind) -> Self {
        OmahaRequestActionBuilder {
            params,
            kind,
            prefs: Box::new(MemPrefs::new()),
            hardware: Box::new(FakeHardware::default()),
            http: Box::new(StubHttpRequest),
            connection_manager: Box::new(FakeConnectionManager::default()),
            payload_state: Box::new(FakePayloadState::default()),
            p2p_manager: Box::new(StubP2pManager),
            time_source: Box::new(StandardTimeSource),
            rng: Box::new(SmallRng::from_entropy()),
            span: None,
        }
    }

    pub fn prefs(mut self, prefs: impl Prefs + 'static) -> Self {
        self.prefs = Box::new(prefs);
        self
    }

    pub fn hardware(mut self, hardware: impl Hardware + 'static) -> Self {
        self.hardware = Box::new(hardware);
        self
    }

    pub fn http(mut self, http: impl HttpRequest + 'static) -> Self {
        self.http = Box::new(http);
        self
    }

    pub fn connection_manager(
        mut self,
        connection_manager: impl ConnectionManager + 'static,
    ) -> Self {
        self.connection_manager = Box::new(connection_manager);
        self
    }

    pub fn payload_state(mut self, payload_state: impl PayloadState + 'static) -> Self {
        self.payload_state = Box::new(payload_state);
        self
    }

    pub fn p2p_manager(mut self, p2p_manager: impl P2pManager + 'static) -> Self {
        self.p2p_manager = Box::new(p2p_manager);
        self
    }

    pub fn time_source(mut self, time_source: impl TimeSource + 'static) -> Self {
        self.time_source = Box::new(time_source);
        self
    }

    pub fn rng(mut self, rng: impl RngCore + 'static) -> Self {
        self.rng = Box::new(rng);
        self
    }

    /// The logging context of the action, `omaha_request` if not set.
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn build(self) -> OmahaRequestAction {
        let (abort_handle, abort_registration) = AbortHandle::new_pair();
        OmahaRequestAction {
            params: self.params,
            kind: self.kind,
            prefs: self.prefs,
            hardware: self.hardware,
            http: self.http,
            connection_manager: self.connection_manager,
            payload_state: self.payload_state,
            p2p_manager: self.p2p_manager,
            time_source: self.time_source,
            rng: self.rng,
            span: self.span.unwrap_or_else(|| info_span!("omaha_request")),
            ping_active_days: 0,
            ping_roll_call_days: 0,
            abort_handle,
            abort_registration: Some(abort_registration),
        }
    }
}

pub struct OmahaRequestAction {
    params: RequestParams,
    kind: RequestKind,
    prefs: Box<dyn Prefs>,
    hardware: Box<dyn Hardware>,
    http: Box<dyn HttpRequest>,
    connection_manager: Box<dyn ConnectionManager>,
    payload_state: Box<dyn PayloadState>,
    p2p_manager: Box<dyn P2pManager>,
    time_source: Box<dyn TimeSource>,
    rng: Box<dyn RngCore>,
    span: Span,

    // Days since the last pings, set when the action starts.  Events never carry a ping, so for
    // them these stay 0.
    ping_active_days: i32,
    ping_roll_call_days: i32,

    abort_handle: AbortHandle,
    abort_registration: Option<AbortRegistration>,
}

impl OmahaRequestAction {
    pub fn builder(params: RequestParams, kind: RequestKind) -> OmahaRequestActionBuilder {
        OmahaRequestActionBuilder::new(params, kind)
    }

    /// A handle to terminate the action from outside.  Once aborted, `perform` resolves to
    /// `Err(Terminated)` and whatever was in flight is dropped.
    pub fn terminate_handle(&self) -> AbortHandle {
        self.abort_handle.clone()
    }

    /// Run the action to completion.
    pub async fn perform(mut self) -> Result<ActionResult, Terminated> {
        let registration = self.abort_registration.take().ok_or(Terminated)?;
        let span = self.span.clone();
        Abortable::new(self.run(), registration).instrument(span).await.map_err(|_| Terminated)
    }

    async fn run(&mut self) -> ActionResult {
        let mut state = ActionState::Idle;
        loop {
            state = match self.advance(state) {
                Step::Next(next) => next,
                Step::Transfer(request) => {
                    let result = self.http.request(request).await;
                    self.transfer_completed(result)
                }
                Step::LookupPeer { file_id, minimum_size, response } => {
                    let url = self
                        .p2p_manager
                        .lookup_url_for_file(&file_id, minimum_size, MAX_P2P_NETWORK_WAIT)
                        .await;
                    self.peer_lookup_completed(url, response)
                }
                Step::Done(result) => return result,
            };
        }
    }

    /// The transition function.
    pub fn advance(&mut self, state: ActionState) -> Step {
        let span = self.span.clone();
        let _enter = span.enter();
        match state {
            ActionState::Idle => self.start(),
            ActionState::RequestSent(request) => Step::Transfer(request),
            ActionState::TransferFailed { http_status } => {
                if self.is_event() {
                    return Step::Next(ActionState::Completed(ActionResult::success(None)));
                }
                let http_status = clamp_http_status(http_status);
                Step::Next(ActionState::Completed(ActionResult::failure(
                    OmahaRequestError::Transport { http_status },
                    None,
                )))
            }
            ActionState::ResponseReceived(body) => {
                // Events are fire and forget.
                if self.is_event() {
                    return Step::Next(ActionState::Completed(ActionResult::success(None)));
                }
                info!("Omaha request response: {}", String::from_utf8_lossy(&body));
                match parse_document(&body) {
                    Ok(bag) => Step::Next(ActionState::Parsed(bag)),
                    Err(e) => {
                        error!("Omaha response not valid XML: {}", e);
                        Step::Next(ActionState::ParseFailed(e))
                    }
                }
            }
            ActionState::ParseFailed(e) => Step::Next(ActionState::Completed(
                ActionResult::failure(OmahaRequestError::Parse(e), None),
            )),
            ActionState::Parsed(bag) => self.parsed(bag),
            ActionState::StatusRejected(e) => Step::Next(ActionState::Completed(
                ActionResult::failure(OmahaRequestError::ResponseInvalid(e), None),
            )),
            ActionState::PolicyIgnored { reason, mut response } => {
                response.update_exists = false;
                Step::Next(ActionState::Completed(ActionResult::failure(
                    OmahaRequestError::Ignored(reason),
                    Some(response),
                )))
            }
            ActionState::P2PPending(response) => {
                let file_id = p2p::p2p_file_id(&response.hash, response.size);
                let minimum_size = p2p::minimum_peer_size(&*self.prefs);
                info!(
                    "Checking if payload is available via p2p, file_id={} minimum_size={}",
                    file_id, minimum_size
                );
                Step::LookupPeer { file_id, minimum_size, response }
            }
            ActionState::Accepted(response) => self.complete_processing(response),
            ActionState::PolicyDeferred { reason, mut response } => {
                response.update_exists = false;
                Step::Next(ActionState::Completed(ActionResult::failure(
                    OmahaRequestError::Deferred(reason),
                    Some(response),
                )))
            }
            ActionState::Completed(result) => {
                info!("Omaha request completed: {}", result.code());
                Step::Done(result)
            }
        }
    }

    fn is_event(&self) -> bool {
        matches!(self.kind, RequestKind::Event(_))
    }

    /// Days since the ping recorded under `key`, `NEVER_PINGED` if there is none, or
    /// `PING_TIME_JUMP` if the clock went backwards since.
    pub fn calculate_ping_days(&self, key: &str) -> i32 {
        let last_ping = match self.prefs.get_int64(key) {
            Some(last_ping) if last_ping >= 0 => last_ping,
            _ => return NEVER_PINGED,
        };
        let days = (system_time_to_micros(self.time_source.now()) - last_ping) / MICROS_PER_DAY;
        if days < 0 {
            // The ping isn't sent, but the daystart in the response still resets the counters.
            warn!("System clock jumped back in time. Resetting ping daystarts.");
            return PING_TIME_JUMP;
        }
        i32::try_from(days).unwrap_or(i32::MAX)
    }

    pub fn should_ping(&self) -> bool {
        if self.ping_active_days == NEVER_PINGED && self.ping_roll_call_days == NEVER_PINGED {
            let powerwash_count = self.hardware.get_powerwash_count();
            if powerwash_count > 0 {
                info!(
                    "Not sending ping with a=-1 r=-1 to omaha because powerwash_count is {}",
                    powerwash_count
                );
                return false;
            }
            return true;
        }
        self.ping_active_days > 0 || self.ping_roll_call_days > 0
    }

    fn start(&mut self) -> Step {
        if !self.is_event() {
            self.ping_active_days = self.calculate_ping_days(keys::LAST_ACTIVE_PING_DAY);
            self.ping_roll_call_days = self.calculate_ping_days(keys::LAST_ROLL_CALL_PING_DAY);
        }
        let should_ping = self.should_ping();
        if self.kind == RequestKind::PingOnly && !should_ping {
            info!("No ping is due, not contacting the server");
            return Step::Next(ActionState::Completed(ActionResult::success(None)));
        }

        let install_date_days = get_install_date(&mut *self.prefs, &*self.hardware);
        let mut builder =
            RequestBuilder::new(&self.params, &self.kind).with_install_date(install_date_days);
        if should_ping {
            builder = builder.with_ping(self.ping_active_days, self.ping_roll_call_days);
        }
        let body = builder.build(&mut *self.prefs);

        info!("Posting an Omaha request to {}", self.params.update_url);
        info!("Request: {}", body);
        match build_http_request(&self.params.update_url, body) {
            Ok(request) => Step::Next(ActionState::RequestSent(request)),
            Err(e) => {
                error!("Unable to create a request for {}: {}", self.params.update_url, e);
                Step::Next(ActionState::TransferFailed { http_status: None })
            }
        }
    }

    fn transfer_completed(
        &mut self,
        result: Result<Response<Vec<u8>>, http_request::Error>,
    ) -> ActionState {
        match result {
            Ok(response) if response.status().is_success() => {
                ActionState::ResponseReceived(response.into_body())
            }
            Ok(response) => {
                error!("Omaha request network transfer failed: status {}", response.status());
                ActionState::TransferFailed { http_status: Some(response.status().as_u16()) }
            }
            Err(e) => {
                error!("Omaha request network transfer failed: {}", e);
                ActionState::TransferFailed { http_status: None }
            }
        }
    }

    /// Remember the local time of the server's last midnight, whether or not a ping was sent.
    fn update_last_ping_days(&mut self, bag: &ParsedBag) -> bool {
        let elapsed_seconds = match bag
            .daystart_elapsed_seconds
            .as_deref()
            .and_then(|s| s.parse::<u64>().ok())
        {
            Some(elapsed_seconds) => elapsed_seconds,
            None => return false,
        };
        let daystart =
            match self.time_source.now().checked_sub(Duration::from_secs(elapsed_seconds)) {
                Some(daystart) => daystart,
                None => return false,
            };
        let micros = system_time_to_micros(daystart);
        self.prefs.set_int64(keys::LAST_ACTIVE_PING_DAY, micros)
            && self.prefs.set_int64(keys::LAST_ROLL_CALL_PING_DAY, micros)
    }

    fn parsed(&mut self, bag: ParsedBag) -> Step {
        if !self.update_last_ping_days(&bag) {
            error!("Failed to update the last ping day preferences!");
        }
        if self.kind == RequestKind::PingOnly {
            return Step::Next(ActionState::Completed(ActionResult::success(None)));
        }

        let response = match parse_response(&bag, &mut *self.prefs) {
            Ok(response) => response,
            Err(e) => {
                error!("Omaha response is invalid: {}", e);
                return Step::Next(ActionState::StatusRejected(e));
            }
        };
        if !response.update_exists {
            return Step::Next(ActionState::Completed(ActionResult::success(Some(response))));
        }
        info!("Payload urls: {}", response.payload_urls.iter().join(", "));

        if let Some(reason) =
            should_ignore_update(&response, &*self.payload_state, &*self.connection_manager)
        {
            return Step::Next(ActionState::PolicyIgnored { reason, response });
        }

        p2p::apply_omaha_overrides(&response, &mut *self.payload_state);
        // Updated as late as possible: a pulled release shouldn't reset the download progress
        // of the previous one.
        self.payload_state.set_response(&response);
        p2p::start_attempt(&mut *self.payload_state);

        // Scattering doesn't apply if a peer has the payload, so find out before deciding.
        if self.payload_state.using_p2p_for_downloading() {
            Step::Next(ActionState::P2PPending(response))
        } else {
            Step::Next(ActionState::Accepted(response))
        }
    }

    fn peer_lookup_completed(
        &mut self,
        url: Option<String>,
        response: OmahaResponse,
    ) -> ActionState {
        p2p::lookup_completed(url, &mut *self.payload_state);
        ActionState::Accepted(response)
    }

    fn complete_processing(&mut self, response: OmahaResponse) -> Step {
        let policy = ScatteringPolicy::new(
            &self.params,
            PolicyData::builder().use_time_source(&*self.time_source).build(),
        );
        if policy.should_defer_download(
            &response,
            &mut *self.prefs,
            &*self.payload_state,
            &mut *self.rng,
        ) {
            info!("Ignoring Omaha updates as updates are deferred by policy.");
            return Step::Next(ActionState::PolicyDeferred {
                reason: DeferReason::Scattering,
                response,
            });
        }
        if self.payload_state.should_backoff_download() {
            info!("Ignoring Omaha updates in order to backoff our retry attempts");
            return Step::Next(ActionState::PolicyDeferred {
                reason: DeferReason::Backoff,
                response,
            });
        }
        Step::Next(ActionState::Completed(ActionResult::success(Some(response))))
    }
}
