// Copyright 2024 The vev developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Incremental HTTP/1.x request parser.
//!
//! Four states: request line, headers, body, finish. The parser consumes
//! CRLF-terminated lines out of the connection's read buffer and keeps its
//! state across calls, so a request split over several TCP segments resumes
//! where the previous feed stopped. Bodies are read only for `POST`, up to
//! `Content-Length` bytes, and decoded as `application/x-www-form-urlencoded`.

use std::collections::HashMap;
use std::str::{self, FromStr};

use crate::buffer::Buffer;
use crate::http::{Method, ParseError, Version};

/// Parser position within one request.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    /// Expecting `METHOD SP PATH SP HTTP/VERSION`.
    #[default]
    RequestLine,
    /// Expecting `Name: value` lines until an empty line.
    Headers,
    /// Expecting `Content-Length` bytes of body.
    Body,
    /// A full request has been consumed.
    Finish,
}

/// One parsed request, filled in incrementally.
#[derive(Debug, Default)]
pub struct Request {
    state: ParseState,
    /// Request method.
    pub method: Method,
    /// Request target as sent by the client.
    pub path: String,
    /// Protocol version.
    pub version: Version,
    headers: HashMap<String, String>,
    form: HashMap<String, String>,
}

impl Request {
    /// Current parser state.
    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// A field from the POST form body.
    pub fn form_value(&self, name: &str) -> Option<&str> {
        self.form.get(name).map(String::as_str)
    }

    /// Whether the client asked to reuse the connection: HTTP/1.1 unless
    /// `Connection: close`, HTTP/1.0 only with `Connection: keep-alive`.
    pub fn is_keep_alive(&self) -> bool {
        match self.version {
            Version::H1_1 => !self
                .header("Connection")
                .is_some_and(|v| v.eq_ignore_ascii_case("close")),
            Version::H1_0 => self
                .header("Connection")
                .is_some_and(|v| v.eq_ignore_ascii_case("keep-alive")),
        }
    }

    /// Resets to a fresh request for the next keep-alive turn.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Consumes as much of `buf` as a full request needs. Returns `Ok(true)`
    /// once a request is complete, `Ok(false)` when more bytes are needed
    /// (state is retained), and an error for malformed input.
    pub fn parse(&mut self, buf: &mut Buffer) -> Result<bool, ParseError> {
        loop {
            match self.state {
                ParseState::RequestLine | ParseState::Headers => {
                    let Some(line_len) = find_crlf(buf.peek()) else {
                        return Ok(false);
                    };
                    let line = &buf.peek()[..line_len];
                    if self.state == ParseState::RequestLine {
                        self.parse_request_line(line)?;
                        self.state = ParseState::Headers;
                    } else if line.is_empty() {
                        self.state = if self.method == Method::Post {
                            ParseState::Body
                        } else {
                            ParseState::Finish
                        };
                    } else {
                        self.parse_header(line)?;
                    }
                    buf.retrieve_until(line_len + 2);
                }
                ParseState::Body => {
                    let need = self.content_length();
                    if buf.readable_bytes() < need {
                        return Ok(false);
                    }
                    self.parse_body(&buf.peek()[..need])?;
                    buf.retrieve(need);
                    self.state = ParseState::Finish;
                }
                ParseState::Finish => return Ok(true),
            }
        }
    }

    fn parse_request_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let line = str::from_utf8(line).map_err(|_| ParseError::Target)?;
        let mut parts = line.split(' ');
        let method = parts.next().ok_or(ParseError::Method)?;
        let target = parts.next().ok_or(ParseError::Target)?;
        let version = parts.next().ok_or(ParseError::Version)?;
        if parts.next().is_some() || target.is_empty() {
            return Err(ParseError::Target);
        }
        self.method = Method::from_str(method)?;
        self.path = target.to_string();
        self.version = Version::from_str(version)?;
        Ok(())
    }

    fn parse_header(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let line = str::from_utf8(line).map_err(|_| ParseError::Header)?;
        let (name, value) = line.split_once(':').ok_or(ParseError::Header)?;
        if name.is_empty() {
            return Err(ParseError::Header);
        }
        let value = value.strip_prefix(' ').unwrap_or(value);
        self.headers.insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn parse_body(&mut self, body: &[u8]) -> Result<(), ParseError> {
        let is_form = self
            .header("Content-Type")
            .is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"));
        if is_form && !body.is_empty() {
            let pairs: Vec<(String, String)> =
                serde_urlencoded::from_bytes(body).map_err(|_| ParseError::Body)?;
            self.form.extend(pairs);
        }
        Ok(())
    }

    fn content_length(&self) -> usize {
        self.header("Content-Length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }
}

/// Offset of the first CRLF in `buf`, or `None` if no full line is present.
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod test {
    use super::{ParseState, Request};
    use crate::buffer::Buffer;
    use crate::http::{Method, ParseError, Version};

    fn buf(bytes: &[u8]) -> Buffer {
        let mut b = Buffer::default();
        b.append(bytes);
        b
    }

    #[test]
    fn parses_a_get_request() {
        let mut req = Request::default();
        let mut b = buf(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n");
        assert_eq!(Ok(true), req.parse(&mut b));
        assert_eq!(Method::Get, req.method);
        assert_eq!("/index.html", req.path);
        assert_eq!(Version::H1_1, req.version);
        assert_eq!(Some("localhost"), req.header("host"));
        assert_eq!(0, b.readable_bytes());
    }

    #[test]
    fn parse_then_reconstruct_matches_input() {
        let raw = b"GET /a/b?q=1 HTTP/1.1\r\nHost: example.org\r\nAccept: */*\r\n\r\n";
        let mut req = Request::default();
        assert_eq!(Ok(true), req.parse(&mut buf(raw)));
        let line = format!("{} {} {}", req.method, req.path, req.version);
        assert_eq!("GET /a/b?q=1 HTTP/1.1", line);
        assert_eq!(Some("example.org"), req.header("Host"));
        assert_eq!(Some("*/*"), req.header("Accept"));
    }

    #[test]
    fn partial_feeds_retain_state() {
        let mut req = Request::default();
        let mut b = Buffer::default();
        b.append(b"POST /login HT");
        assert_eq!(Ok(false), req.parse(&mut b));
        assert_eq!(ParseState::RequestLine, req.state());

        b.append(b"TP/1.1\r\nContent-Length: 29\r\n");
        b.append(b"Content-Type: application/x-www-form-urlencoded\r\n\r\n");
        assert_eq!(Ok(false), req.parse(&mut b));
        assert_eq!(ParseState::Body, req.state());

        b.append(b"username=alice&password=hun");
        assert_eq!(Ok(false), req.parse(&mut b));

        b.append(b"t2");
        assert_eq!(Ok(true), req.parse(&mut b));
        assert_eq!(Some("alice"), req.form_value("username"));
        assert_eq!(Some("hunt2"), req.form_value("password"));
    }

    #[test]
    fn form_body_decodes_percent_escapes() {
        let body = b"username=a%40b&password=p+w%21";
        let mut b = buf(
            format!(
                "POST /register HTTP/1.1\r\nContent-Type: \
                 application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n",
                body.len()
            )
            .as_bytes(),
        );
        b.append(body);
        let mut req = Request::default();
        assert_eq!(Ok(true), req.parse(&mut b));
        assert_eq!(Some("a@b"), req.form_value("username"));
        assert_eq!(Some("p w!"), req.form_value("password"));
    }

    #[test]
    fn get_has_no_body_state() {
        let mut req = Request::default();
        let mut b = buf(b"GET / HTTP/1.0\r\nContent-Length: 5\r\n\r\n");
        assert_eq!(Ok(true), req.parse(&mut b));
        assert_eq!(ParseState::Finish, req.state());
    }

    #[test]
    fn rejects_bad_method_and_version() {
        let mut req = Request::default();
        assert_eq!(
            Err(ParseError::Method),
            req.parse(&mut buf(b"FROB / HTTP/1.1\r\n\r\n"))
        );
        let mut req = Request::default();
        assert_eq!(
            Err(ParseError::Version),
            req.parse(&mut buf(b"GET / HTTP/9.9\r\n\r\n"))
        );
    }

    #[test]
    fn rejects_malformed_header() {
        let mut req = Request::default();
        let mut b = buf(b"GET / HTTP/1.1\r\nno-colon-here\r\n\r\n");
        assert_eq!(Err(ParseError::Header), req.parse(&mut b));
    }

    #[test]
    fn keep_alive_follows_version_and_connection_header() {
        let mut req = Request::default();
        assert_eq!(Ok(true), req.parse(&mut buf(b"GET / HTTP/1.1\r\n\r\n")));
        assert!(req.is_keep_alive());

        let mut req = Request::default();
        assert_eq!(
            Ok(true),
            req.parse(&mut buf(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n"))
        );
        assert!(!req.is_keep_alive());

        let mut req = Request::default();
        assert_eq!(Ok(true), req.parse(&mut buf(b"GET / HTTP/1.0\r\n\r\n")));
        assert!(!req.is_keep_alive());

        let mut req = Request::default();
        assert_eq!(
            Ok(true),
            req.parse(&mut buf(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n"))
        );
        assert!(req.is_keep_alive());
    }
}
