// Copyright 2019 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::http_request::{Error, HttpRequest};
use futures::future::LocalBoxFuture;
use futures::prelude::*;
use hyper::{Body, Request, Response, StatusCode};
use std::collections::VecDeque;

/// What the mock does with the next request.
#[derive(Debug)]
enum MockResponse {
    Respond(Result<Response<Vec<u8>>, Error>),
    /// Never resolve, like a server that doesn't answer.
    Hang,
}

/// An HttpRequest that records every request made with it, and answers them from a queue.
#[derive(Debug, Default)]
pub struct MockHttpRequest {
    // The requests made using this mock, with their bodies collected.
    requests: Vec<Request<Vec<u8>>>,
    // The queue of fake responses for the upcoming requests.
    responses: VecDeque<MockResponse>,
}

impl HttpRequest for MockHttpRequest {
    fn request(
        &mut self,
        req: Request<Body>,
    ) -> LocalBoxFuture<'_, Result<Response<Vec<u8>>, Error>> {
        async move {
            let (parts, body) = req.into_parts();
            let body = hyper::body::to_bytes(body).await?;
            self.requests.push(Request::from_parts(parts, body.to_vec()));

            match self.responses.pop_front() {
                Some(MockResponse::Respond(response)) => response,
                Some(MockResponse::Hang) => future::pending().await,
                // No response to return, generate a 500 internal server error
                None => {
                    let mut response = Response::new(vec![]);
                    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                    Ok(response)
                }
            }
        }
        .boxed_local()
    }
}

impl MockHttpRequest {
    pub fn new(res: Response<Vec<u8>>) -> MockHttpRequest {
        let mut mock = MockHttpRequest::empty();
        mock.add_response(res);
        mock
    }

    pub fn empty() -> MockHttpRequest {
        MockHttpRequest::default()
    }

    pub fn add_response(&mut self, res: Response<Vec<u8>>) {
        self.responses.push_back(MockResponse::Respond(Ok(res)));
    }

    /// Queue a 200 response with the given body.
    pub fn add_body(&mut self, body: impl Into<Vec<u8>>) {
        self.add_response(Response::new(body.into()));
    }

    pub fn add_error(&mut self, error: Error) {
        self.responses.push_back(MockResponse::Respond(Err(error)));
    }

    /// The next request never gets a response.
    pub fn add_hang(&mut self) {
        self.responses.push_back(MockResponse::Hang);
    }

    pub fn requests(&self) -> &[Request<Vec<u8>>] {
        &self.requests
    }

    /// The bodies of all requests so far, as strings.
    pub fn request_bodies(&self) -> Vec<String> {
        self.requests.iter().map(|req| String::from_utf8_lossy(req.body()).into_owned()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_request::mock_errors;
    use assert_matches::assert_matches;
    use futures::executor::block_on;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_mock() {
        let res_body = vec![1, 2, 3];
        let mut mock = MockHttpRequest::new(Response::new(res_body.clone()));

        let uri = "https://mock.uri/";
        let req = Request::post(uri).header("X-Custom-Foo", "Bar").body("body".into()).unwrap();
        block_on(async {
            let response = mock.request(req).await.unwrap();
            assert_eq!(res_body, *response.body());
        });

        let request = &mock.requests()[0];
        assert_eq!(request.method(), hyper::Method::POST);
        assert_eq!(request.uri().to_string(), uri);
        assert_eq!(request.headers()["X-Custom-Foo"], "Bar");
        assert_eq!(mock.request_bodies(), vec!["body".to_string()]);
    }

    #[test]
    fn test_missing_response() {
        let mut mock = MockHttpRequest::new(Response::new(vec![1]));
        block_on(async {
            mock.request(Request::default()).await.unwrap();
            let response2 = mock.request(Request::default()).await.unwrap();
            assert_eq!(response2.status(), hyper::StatusCode::INTERNAL_SERVER_ERROR);
        });
    }

    #[test]
    fn test_multiple_responses() {
        let mut mock = MockHttpRequest::empty();
        mock.add_body("first");
        mock.add_error(mock_errors::make_transport_error());
        block_on(async {
            let response = mock.request(Request::default()).await.unwrap();
            assert_eq!(response.body().as_slice(), b"first");
            assert_matches!(mock.request(Request::default()).await, Err(_));
        });
        assert_eq!(mock.requests().len(), 2);
    }

    #[test]
    fn test_hang() {
        let mut mock = MockHttpRequest::empty();
        mock.add_hang();
        assert!(mock.request(Request::default()).now_or_never().is_none());
    }
}
