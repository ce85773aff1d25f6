// Copyright 2019 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use {
    futures::future::LocalBoxFuture,
    futures::prelude::*,
    hyper::{Body, Request, Response},
    std::{cell::RefCell, rc::Rc},
};

pub mod mock;

/// A trait for providing HTTP capabilities to the update check.
///
/// This trait is a wrapper around Hyper, to provide a simple request->response style of API for
/// the update check to use.
///
/// In particular, it's meant to be easy to mock for tests.
pub trait HttpRequest {
    /// Make a request, and return an Response, as the header Parts and collect the entire collected
    /// Body as a Vec of bytes.
    ///
    /// A response with a non-success status is still a response; only failures to get any
    /// response at all are errors.
    fn request(
        &mut self,
        req: Request<Body>,
    ) -> LocalBoxFuture<'_, Result<Response<Vec<u8>>, Error>>;
}

/// Lets a caller keep a handle on the same `HttpRequest` the update check uses.
///
/// The inner value stays mutably borrowed from the first poll of the returned future until it
/// resolves or is dropped.  Borrowing it through another handle while a request is pending
/// panics, so only inspect it once the update check is done.
impl<T: HttpRequest> HttpRequest for Rc<RefCell<T>> {
    fn request(
        &mut self,
        req: Request<Body>,
    ) -> LocalBoxFuture<'_, Result<Response<Vec<u8>>, Error>> {
        let inner = Rc::clone(self);
        async move {
            let response = inner.borrow_mut().request(req).await;
            response
        }
        .boxed_local()
    }
}

#[derive(Debug, thiserror::Error)]
// Parentheses are needed for .source, but will trigger unused_parens, so a tuple is used.
#[error("Http request failed: {}", match (.source, ()).0 {
    Some(source) => format!("{}", source),
    None => format!("kind: {:?}", .kind),
})]
pub struct Error {
    kind: ErrorKind,
    #[source]
    source: Option<hyper::Error>,
}

#[derive(Debug, Eq, PartialEq)]
enum ErrorKind {
    User,
    Transport,
    Timeout,
}

impl Error {
    /// Create a timeout error
    ///
    /// This is valid for use in tests as well as production implementations of the trait, if
    /// application-layer timeouts are being implemented.
    pub fn new_timeout() -> Self {
        Self { kind: ErrorKind::Timeout, source: None }
    }

    /// Returns true if this error the result of the Hyper API being incorrectly used (a "user"
    /// error in Hyper)
    pub fn is_user(&self) -> bool {
        self.kind == ErrorKind::User
    }

    /// Returns true if this error is the result of a timeout when trying to full-fill the request
    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Timeout
    }
}

impl From<hyper::Error> for Error {
    fn from(error: hyper::Error) -> Self {
        let kind = if error.is_user() { ErrorKind::User } else { ErrorKind::Transport };
        Error { kind, source: error.into() }
    }
}

pub mod mock_errors {
    use super::*;

    pub fn make_user_error() -> Error {
        Error { kind: ErrorKind::User, source: None }
    }

    pub fn make_transport_error() -> Error {
        Error { kind: ErrorKind::Transport, source: None }
    }
}

/// A stub HttpRequest that does nothing and returns an empty response immediately.
pub struct StubHttpRequest;

impl HttpRequest for StubHttpRequest {
    fn request(
        &mut self,
        _req: Request<Body>,
    ) -> LocalBoxFuture<'_, Result<Response<Vec<u8>>, Error>> {
        future::ok(Response::default()).boxed_local()
    }
}
