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

//! Response model

use std::fmt::Write as _;

/// An HTTP/1.1 response staged for serialization into a connection's send
/// buffer.
#[derive(Debug)]
pub struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    upgrade: bool,
}

impl Response {
    /// An empty response with the given status.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
            upgrade: false,
        }
    }

    /// A JSON response.
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self::new(status)
            .with_header("Content-Type", "application/json")
            .with_body(value.to_string().into_bytes())
    }

    /// An HTML response.
    pub fn html(status: u16, body: &str) -> Self {
        Self::new(status)
            .with_header("Content-Type", "text/html; charset=utf-8")
            .with_body(body.as_bytes().to_vec())
    }

    /// An SVG response.
    pub fn svg(status: u16, body: &str) -> Self {
        Self::new(status)
            .with_header("Content-Type", "image/svg+xml")
            .with_body(body.as_bytes().to_vec())
    }

    /// A JPEG response.
    pub fn jpeg(status: u16, body: Vec<u8>) -> Self {
        Self::new(status)
            .with_header("Content-Type", "image/jpeg")
            .with_body(body)
    }

    /// The `101 Switching Protocols` handshake completion for a WebSocket
    /// upgrade. `accept` is the derived Sec-WebSocket-Accept value.
    pub fn switching_protocols(accept: &str) -> Self {
        let mut resp = Self::new(101)
            .with_header("Upgrade", "websocket")
            .with_header("Connection", "Upgrade")
            .with_header("Sec-WebSocket-Accept", accept);
        resp.upgrade = true;
        resp
    }

    /// Builder-style header append.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    /// Builder-style body replacement.
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Appends a header in place.
    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_owned(), value.to_owned()));
    }

    /// Status code.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Body length in bytes.
    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Serializes status line, headers, and body into `out`.
    ///
    /// Every non-upgrade response carries `Connection: keep-alive` and an
    /// explicit `Content-Length`; the reactor relies on both to keep the
    /// socket open and to know when the response has drained.
    pub fn serialize_into(&self, out: &mut Vec<u8>) {
        let mut head = String::with_capacity(128);
        let _ = write!(
            head,
            "HTTP/1.1 {} {}\r\n",
            self.status,
            reason_phrase(self.status)
        );

        for (name, value) in &self.headers {
            let _ = write!(head, "{name}: {value}\r\n");
        }
        if !self.upgrade {
            let _ = write!(head, "Content-Length: {}\r\n", self.body.len());
            head.push_str("Connection: keep-alive\r\n");
        }
        head.push_str("\r\n");

        out.extend_from_slice(head.as_bytes());
        out.extend_from_slice(&self.body);
    }

    /// Convenience for tests and the inline fallback path.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.body.len());
        self.serialize_into(&mut out);
        out
    }
}

/// Reason phrase for the status codes this surface produces.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod test {
    use super::Response;

    #[test]
    fn serializes_status_line_headers_and_body() {
        let resp = Response::json(200, &serde_json::json!({"success": true}));
        let bytes = resp.to_bytes();
        let text = String::from_utf8(bytes).unwrap();

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: application/json\r\n"));
        assert!(text.contains("Content-Length: 16\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.ends_with("\r\n\r\n{\"success\":true}"));
    }

    #[test]
    fn upgrade_response_omits_length_and_keep_alive() {
        let resp = Response::switching_protocols("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        let text = String::from_utf8(resp.to_bytes()).unwrap();

        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(!text.contains("Content-Length"));
        assert!(!text.contains("keep-alive"));
    }

    #[test]
    fn empty_response_still_declares_zero_length() {
        let text = String::from_utf8(Response::new(204).to_bytes()).unwrap();
        assert!(text.contains("Content-Length: 0\r\n"));
    }
}
