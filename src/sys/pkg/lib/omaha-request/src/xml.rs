// Copyright 2019 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Encoding of values into the request document, and extraction of the handful of attributes
//! that matter from the response document.
//!
//! The response is consumed as an `xml-rs` event stream by a small push-down recognizer, which
//! keeps a stack of the elements it has entered and only extracts attributes from elements whose
//! position in the document it recognizes.

use std::collections::HashMap;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, Eq, PartialEq)]
#[error("value is not ASCII-7: {value:?}")]
pub struct NonAscii7Error {
    pub value: String,
}

/// Escape `input` for use as attribute text in the request document.
///
/// Only 7-bit ASCII is accepted, anything else is rejected rather than transcoded.
pub fn xml_encode(input: &str) -> Result<String, NonAscii7Error> {
    let mut output = String::with_capacity(input.len());
    for c in input.chars() {
        if !c.is_ascii() {
            warn!("Invalid ASCII-7 string passed to the XML encoder: {:?}", input);
            return Err(NonAscii7Error { value: input.to_string() });
        }
        match c {
            '"' => output.push_str("&quot;"),
            '\'' => output.push_str("&apos;"),
            '&' => output.push_str("&amp;"),
            '<' => output.push_str("&lt;"),
            '>' => output.push_str("&gt;"),
            c => output.push(c),
        }
    }
    Ok(output)
}

/// Like `xml_encode`, but falls back to `default` for values that can't be encoded.
pub fn xml_encode_with_default(input: &str, default: &str) -> String {
    xml_encode(input).unwrap_or_else(|_| default.to_string())
}

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ParseError {
    #[error("empty response")]
    Empty,

    #[error("response contains an XML entity declaration")]
    EntityDeclaration,

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// The attributes of a response document that the update check cares about.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ParsedBag {
    /// Cohort attributes of `<app>`.  `Some("")` means the attribute was sent with an empty value,
    /// which is different from not being sent at all.
    pub app_cohort: Option<String>,
    pub app_cohorthint: Option<String>,
    pub app_cohortname: Option<String>,

    pub updatecheck_status: Option<String>,
    pub updatecheck_poll_interval: Option<String>,

    pub daystart_elapsed_days: Option<String>,
    pub daystart_elapsed_seconds: Option<String>,

    /// Every `<url codebase>`, in document order.
    pub url_codebases: Vec<String>,

    pub package_name: Option<String>,
    pub package_size: Option<String>,

    pub manifest_version: Option<String>,

    /// All attributes of the postinstall `<action>`.
    pub postinstall: HashMap<String, String>,
}

/// The elements the recognizer knows about.  Anything else, or a known element in an unexpected
/// place, is `Other`, and nothing below it is extracted.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Node {
    Response,
    App,
    UpdateCheck,
    Urls,
    Url,
    Manifest,
    Packages,
    Package,
    Actions,
    Action,
    DayStart,
    Other,
}

impl Node {
    fn child(parent: Option<Node>, name: &str) -> Node {
        match (parent, name) {
            (None, "response") => Node::Response,
            (Some(Node::Response), "app") => Node::App,
            (Some(Node::Response), "daystart") => Node::DayStart,
            (Some(Node::App), "updatecheck") => Node::UpdateCheck,
            (Some(Node::UpdateCheck), "urls") => Node::Urls,
            (Some(Node::Urls), "url") => Node::Url,
            (Some(Node::UpdateCheck), "manifest") => Node::Manifest,
            (Some(Node::Manifest), "packages") => Node::Packages,
            (Some(Node::Packages), "package") => Node::Package,
            (Some(Node::Manifest), "actions") => Node::Actions,
            (Some(Node::Actions), "action") => Node::Action,
            _ => Node::Other,
        }
    }
}

/// The recognizer's state: the stack of open elements, their names, and the bag being filled.
#[derive(Default)]
struct Recognizer {
    stack: Vec<(Node, String)>,
    saw_root: bool,
    bag: ParsedBag,
}

impl Recognizer {
    fn start_element(&mut self, name: &str, mut attributes: HashMap<String, String>) {
        let node = Node::child(self.stack.last().map(|(node, _)| *node), name);
        let bag = &mut self.bag;
        match node {
            Node::App => {
                bag.app_cohort = attributes.remove("cohort");
                bag.app_cohorthint = attributes.remove("cohorthint");
                bag.app_cohortname = attributes.remove("cohortname");
            }
            Node::UpdateCheck => {
                bag.updatecheck_status = attributes.remove("status");
                bag.updatecheck_poll_interval = attributes.remove("PollInterval");
            }
            Node::DayStart => {
                bag.daystart_elapsed_days = attributes.remove("elapsed_days");
                bag.daystart_elapsed_seconds = attributes.remove("elapsed_seconds");
            }
            Node::Url => {
                if let Some(codebase) = attributes.remove("codebase") {
                    bag.url_codebases.push(codebase);
                }
            }
            Node::Manifest => {
                bag.manifest_version = attributes.remove("version");
            }
            // Only the first package is used.
            Node::Package if bag.package_name.is_none() => {
                bag.package_name = attributes.remove("name");
                bag.package_size = attributes.remove("size");
            }
            Node::Action if attributes.get("event").map(String::as_str) == Some("postinstall") => {
                bag.postinstall = attributes;
            }
            _ => {}
        }
        self.stack.push((node, name.to_string()));
        self.saw_root = true;
    }

    fn end_element(&mut self, name: &str) -> Result<(), ParseError> {
        match self.stack.pop() {
            Some((_, open)) if open == name => Ok(()),
            Some((_, open)) => {
                Err(ParseError::Malformed(format!("</{}> closes unclosed <{}>", name, open)))
            }
            None => Err(ParseError::Malformed(format!("</{}> without a matching start", name))),
        }
    }
}

const ENTITY_DECLARATION: &str = "<!ENTITY";

/// The document as UTF-8 text.  Any other encoding is rejected before the reader gets a chance
/// to transcode it, so that the checks below see the same characters the reader does.
fn utf8_text(bytes: &[u8]) -> Result<&str, ParseError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| ParseError::Malformed(format!("response is not UTF-8: {}", e)))?;
    // UTF-16 without a byte order mark is valid UTF-8, but never without NULs.
    if text.contains('\0') {
        return Err(ParseError::Malformed("response contains NUL characters".to_string()));
    }
    Ok(text)
}

fn is_utf8_compatible(encoding: &str) -> bool {
    ["utf-8", "utf8", "us-ascii", "ascii"].iter().any(|name| encoding.eq_ignore_ascii_case(name))
}

/// Parse a complete response document.  Only UTF-8 documents are accepted, and any entity
/// declaration makes the whole document invalid.
pub fn parse_document(bytes: &[u8]) -> Result<ParsedBag, ParseError> {
    use ::xml::reader::{ParserConfig, XmlEvent};

    if bytes.is_empty() {
        return Err(ParseError::Empty);
    }
    let text = utf8_text(bytes)?;
    if text.contains(ENTITY_DECLARATION) {
        warn!("Response contains an XML entity declaration, rejecting it");
        return Err(ParseError::EntityDeclaration);
    }

    let reader = ParserConfig::new()
        .ignore_comments(true)
        .trim_whitespace(true)
        .create_reader(text.as_bytes());
    let mut recognizer = Recognizer::default();
    for event in reader {
        match event.map_err(|e| ParseError::Malformed(e.to_string()))? {
            XmlEvent::StartDocument { encoding, .. } if !is_utf8_compatible(&encoding) => {
                return Err(ParseError::Malformed(format!("unsupported encoding {}", encoding)));
            }
            XmlEvent::Doctype { syntax } if syntax.contains(ENTITY_DECLARATION) => {
                warn!("Response doctype declares an XML entity, rejecting it");
                return Err(ParseError::EntityDeclaration);
            }
            XmlEvent::StartElement { name, attributes, .. } => {
                let attributes = attributes
                    .into_iter()
                    .map(|attribute| (attribute.name.local_name, attribute.value))
                    .collect();
                recognizer.start_element(&name.local_name, attributes);
            }
            XmlEvent::EndElement { name } => recognizer.end_element(&name.local_name)?,
            XmlEvent::EndDocument => break,
            _ => {}
        }
    }
    if let Some((_, open)) = recognizer.stack.last() {
        return Err(ParseError::Malformed(format!("<{}> is never closed", open)));
    }
    if !recognizer.saw_root {
        return Err(ParseError::Malformed("no root element".to_string()));
    }
    Ok(recognizer.bag)
}
