// Copyright 2026 the vakt authors
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

//! HTTP/1.1 Request
//! IETF RFC 9112

use super::cursor::ByteCursor;
use super::{HttpMethod, HttpVersion, ParseError, ParseResult, Status, MAX_HEADERS, MAX_HEAD_SIZE};

/// A single request header. Name comparison is case-insensitive; the
/// original casing is preserved.
#[derive(Debug, Clone)]
pub struct Header {
    /// Header name as received.
    pub name: String,
    /// Header value with surrounding whitespace trimmed.
    pub value: String,
}

/// A fully parsed request: head plus the complete body.
///
/// Owned so it can be staged on a connection and handed to a worker thread
/// while the receive buffer keeps accumulating.
#[derive(Debug)]
pub struct Request {
    /// Request method.
    pub method: HttpMethod,
    /// Path component of the target, percent-encoded as received.
    pub path: String,
    /// Raw query string, without the leading `?`. Decoded on demand.
    pub query: Option<String>,
    /// Protocol version.
    pub version: HttpVersion,
    /// Headers in arrival order.
    pub headers: Vec<Header>,
    /// Exactly Content-Length bytes (empty when the header is absent).
    pub body: Vec<u8>,
}

impl Request {
    /// Attempts to parse one complete request from the front of `buf`.
    ///
    /// Returns `Status::Partial` while the head or the declared body is
    /// still incomplete, or `Status::Complete((request, consumed))` with the
    /// total number of buffer bytes the request occupied. A declared
    /// Content-Length above `body_ceiling` fails with
    /// [`ParseError::BodyTooLarge`] before any body byte is read.
    pub fn parse(buf: &[u8], body_ceiling: usize) -> ParseResult<Status<(Request, usize)>> {
        let head_len = match find_head_end(buf) {
            Some(n) => n,
            None => {
                if buf.len() > MAX_HEAD_SIZE {
                    return Err(ParseError::HeadTooLarge);
                }
                return Ok(Status::Partial);
            }
        };

        if head_len > MAX_HEAD_SIZE {
            return Err(ParseError::HeadTooLarge);
        }

        let mut cur = ByteCursor::new(&buf[..head_len]);
        let method = parse_method(&mut cur)?;
        let (path, query) = parse_target(&mut cur)?;
        let version = parse_version(&mut cur)?;
        let headers = parse_headers(&mut cur)?;

        let content_length = match header_value(&headers, "content-length") {
            Some(v) => v
                .parse::<usize>()
                .map_err(|_| ParseError::ContentLength)?,
            None => 0,
        };
        if content_length > body_ceiling {
            return Err(ParseError::BodyTooLarge);
        }

        let total = head_len + content_length;
        if buf.len() < total {
            return Ok(Status::Partial);
        }

        let body = buf[head_len..total].to_vec();
        Ok(Status::Complete((
            Request {
                method,
                path,
                query,
                version,
                headers,
                body,
            },
            total,
        )))
    }

    /// Case-insensitive header lookup; returns the first match.
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    /// Token from an `Authorization: Bearer <t>` header.
    pub fn bearer_token(&self) -> Option<&str> {
        let auth = self.header("authorization")?;
        let (scheme, token) = auth.split_once(' ')?;
        if scheme.eq_ignore_ascii_case("bearer") {
            Some(token.trim())
        } else {
            None
        }
    }

    /// True when this request asks for a WebSocket upgrade on the current
    /// connection: `Upgrade: websocket` plus a `Sec-WebSocket-Key`.
    pub fn wants_websocket(&self) -> bool {
        self.method == HttpMethod::Get
            && self
                .header("upgrade")
                .map(|u| u.eq_ignore_ascii_case("websocket"))
                .unwrap_or(false)
            && self.header("sec-websocket-key").is_some()
    }

    /// The client's `Sec-WebSocket-Key`, when present.
    pub fn ws_key(&self) -> Option<&str> {
        self.header("sec-websocket-key")
    }

    /// Body interpreted as a JSON value. Empty bodies read as `null`.
    pub fn body_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        if self.body.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_slice(&self.body)
    }
}

fn header_value<'h>(headers: &'h [Header], name: &str) -> Option<&'h str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + 4)
}

fn parse_method(cur: &mut ByteCursor<'_>) -> ParseResult<HttpMethod> {
    while let Some(b) = cur.next() {
        if b == b' ' {
            return match cur.slice_skip(1) {
                b"GET" => Ok(HttpMethod::Get),
                b"HEAD" => Ok(HttpMethod::Head),
                b"POST" => Ok(HttpMethod::Post),
                b"PUT" => Ok(HttpMethod::Put),
                b"DELETE" => Ok(HttpMethod::Delete),
                b"CONNECT" => Ok(HttpMethod::Connect),
                b"OPTIONS" => Ok(HttpMethod::Options),
                b"TRACE" => Ok(HttpMethod::Trace),
                _ => Err(ParseError::Method),
            };
        } else if !b.is_ascii_uppercase() {
            break;
        }
    }

    Err(ParseError::Method)
}

fn parse_target(cur: &mut ByteCursor<'_>) -> ParseResult<(String, Option<String>)> {
    while let Some(b) = cur.next() {
        if b == b' ' {
            let slice = cur.slice_skip(1);
            if slice.is_empty() {
                break;
            }
            // validated as visible ASCII above, so this is valid utf8
            let target = String::from_utf8_lossy(slice).into_owned();
            return match target.split_once('?') {
                Some((path, query)) => Ok((path.to_owned(), Some(query.to_owned()))),
                None => Ok((target, None)),
            };
        } else if !is_target_token(b) {
            break;
        }
    }

    Err(ParseError::Target)
}

fn parse_version(cur: &mut ByteCursor<'_>) -> ParseResult<HttpVersion> {
    if !cur.by_ref().take(5).eq(b"HTTP/".iter().copied()) {
        return Err(ParseError::Version);
    }

    let version = match (cur.next(), cur.next(), cur.next()) {
        (Some(b'1'), Some(b'.'), Some(b'0')) => HttpVersion::H1_0,
        (Some(b'1'), Some(b'.'), Some(b'1')) => HttpVersion::H1_1,
        _ => return Err(ParseError::Version),
    };

    expect_newline(cur)?;
    cur.slice();
    Ok(version)
}

fn parse_headers(cur: &mut ByteCursor<'_>) -> ParseResult<Vec<Header>> {
    let mut headers = Vec::new();

    loop {
        if cur.peek() == Some(b'\r') {
            cur.advance(1);
            if cur.next() != Some(b'\n') {
                return Err(ParseError::NewLine);
            }
            return Ok(headers);
        }

        if headers.len() == MAX_HEADERS {
            return Err(ParseError::HeadTooLarge);
        }

        let name = parse_header_name(cur)?;
        let value = parse_header_value(cur)?;
        headers.push(Header { name, value });
    }
}

fn parse_header_name(cur: &mut ByteCursor<'_>) -> ParseResult<String> {
    while let Some(b) = cur.next() {
        if b == b':' {
            let slice = cur.slice_skip(1);
            if slice.is_empty() {
                break;
            }
            return Ok(String::from_utf8_lossy(slice).into_owned());
        } else if !is_tchar(b) {
            break;
        }
    }

    Err(ParseError::HeaderName)
}

fn parse_header_value(cur: &mut ByteCursor<'_>) -> ParseResult<String> {
    // optional whitespace before the value
    while matches!(cur.peek(), Some(b' ') | Some(b'\t')) {
        cur.advance(1);
    }
    cur.slice();

    while let Some(b) = cur.next() {
        if b == b'\r' {
            let slice = cur.slice_skip(1);
            if cur.next() != Some(b'\n') {
                return Err(ParseError::NewLine);
            }
            cur.slice();
            let value = String::from_utf8_lossy(slice).into_owned();
            return Ok(value.trim_end().to_owned());
        } else if b != b'\t' && !(0x20..=0xff).contains(&b) {
            break;
        }
    }

    Err(ParseError::HeaderValue)
}

fn expect_newline(cur: &mut ByteCursor<'_>) -> ParseResult<()> {
    match (cur.next(), cur.next()) {
        (Some(b'\r'), Some(b'\n')) => Ok(()),
        _ => Err(ParseError::NewLine),
    }
}

/// request-target characters: visible ASCII, minus the space delimiter.
#[inline]
fn is_target_token(b: u8) -> bool {
    (0x21..=0x7e).contains(&b)
}

/// tchar per RFC 9110 5.6.2.
#[inline]
fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'.'
                | b'^'
                | b'_'
                | b'`'
                | b'|'
                | b'~'
        )
}

#[cfg(test)]
mod test {
    use super::super::{HttpMethod, HttpVersion, ParseError, Status};
    use super::Request;

    const CEILING: usize = 1024 * 1024;

    fn complete(buf: &[u8]) -> (Request, usize) {
        match Request::parse(buf, CEILING) {
            Ok(Status::Complete(r)) => r,
            other => panic!("expected complete parse, got {other:?}"),
        }
    }

    #[test]
    fn parses_request_line_and_headers() {
        let (req, consumed) =
            complete(b"GET /health HTTP/1.1\r\nHost: localhost\r\nAccept: */*\r\n\r\n");
        assert_eq!(HttpMethod::Get, req.method);
        assert_eq!("/health", req.path);
        assert_eq!(None, req.query);
        assert_eq!(HttpVersion::H1_1, req.version);
        assert_eq!(Some("localhost"), req.header("host"));
        assert_eq!(Some("*/*"), req.header("ACCEPT"));
        assert_eq!(54, consumed);
    }

    #[test]
    fn splits_query_from_path() {
        let (req, _) = complete(b"GET /video/stream/ctx_1?fps=10&q=80 HTTP/1.1\r\n\r\n");
        assert_eq!("/video/stream/ctx_1", req.path);
        assert_eq!(Some("fps=10&q=80".to_owned()), req.query);
    }

    #[test]
    fn reads_exactly_content_length_body_bytes() {
        let buf = b"POST /execute/browser_navigate HTTP/1.1\r\nContent-Length: 4\r\n\r\nabcdEXTRA";
        let (req, consumed) = complete(buf);
        assert_eq!(b"abcd", req.body.as_slice());
        assert_eq!(buf.len() - 5, consumed);
    }

    #[test]
    fn partial_until_body_arrives() {
        let buf = b"POST /execute/x HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc";
        assert_eq!(Ok(Status::Partial), matches(buf));
    }

    fn matches(buf: &[u8]) -> Result<Status<()>, ParseError> {
        Request::parse(buf, CEILING).map(|s| match s {
            Status::Partial => Status::Partial,
            Status::Complete(_) => Status::Complete(()),
        })
    }

    #[test]
    fn partial_while_head_incomplete() {
        assert_eq!(Ok(Status::Partial), matches(b"GET /health HTTP/1.1\r\nHos"));
    }

    #[test]
    fn rejects_body_over_ceiling_before_body_arrives() {
        let buf = b"POST /x HTTP/1.1\r\nContent-Length: 99999999\r\n\r\n";
        assert_eq!(
            Err(ParseError::BodyTooLarge),
            Request::parse(buf, 1024).map(|_| ())
        );
    }

    #[test]
    fn rejects_malformed_method_and_version() {
        assert!(matches(b"ge t / HTTP/1.1\r\n\r\n").is_err());
        assert!(matches(b"GET / HTTP/9.9\r\n\r\n").is_err());
        assert!(matches(b"GET / FTP/1.1\r\n\r\n").is_err());
    }

    #[test]
    fn rejects_bad_content_length() {
        let buf = b"POST /x HTTP/1.1\r\nContent-Length: ten\r\n\r\n";
        assert_eq!(Err(ParseError::ContentLength), matches(buf));
    }

    #[test]
    fn bearer_token_is_extracted() {
        let (req, _) =
            complete(b"GET /tools HTTP/1.1\r\nAuthorization: Bearer secret-token\r\n\r\n");
        assert_eq!(Some("secret-token"), req.bearer_token());
    }

    #[test]
    fn detects_websocket_upgrade() {
        let (req, _) = complete(
            b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        );
        assert!(req.wants_websocket());
        assert_eq!(Some("dGhlIHNhbXBsZSBub25jZQ=="), req.ws_key());
    }
}
