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

//! Wire codec for the engine channel.
//!
//! Frames are single-line JSON terminated by `\n`. Requests carry
//! `{id, method, params}`; replies carry `{id, success, result|error}`.
//! An id of 0 (or none) marks an unsolicited event: the startup ready
//! sentinel, license failures, and anything else the engine volunteers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A request frame, gateway → engine.
#[derive(Debug, Serialize)]
pub struct EngineRequest<'a> {
    /// Correlation id; unique among in-flight calls.
    pub id: u64,
    /// Engine method name.
    pub method: &'a str,
    /// Method parameters, `null` when the method takes none.
    pub params: &'a Value,
}

/// A reply or event frame, engine → gateway.
#[derive(Debug, Deserialize)]
pub struct EngineReply {
    /// Correlation id; 0 or absent for unsolicited frames.
    #[serde(default)]
    pub id: u64,
    /// Whether the call succeeded. Absent on events.
    #[serde(default)]
    pub success: bool,
    /// Result payload on success.
    #[serde(default)]
    pub result: Option<Value>,
    /// Error string on failure.
    #[serde(default)]
    pub error: Option<String>,
    /// Lifecycle marker on unsolicited frames (`"ready"` at startup).
    #[serde(default)]
    pub status: Option<String>,
    /// License state on unsolicited license-failure frames.
    #[serde(default)]
    pub license_status: Option<String>,
    /// Human-readable license failure message.
    #[serde(default)]
    pub message: Option<String>,
    /// Hardware fingerprint accompanying license failures.
    #[serde(default)]
    pub hardware_fingerprint: Option<String>,
}

/// Encodes one request frame, newline included.
pub fn encode_request(id: u64, method: &str, params: &Value) -> String {
    let frame = EngineRequest { id, method, params };
    let mut line = serde_json::to_string(&frame).unwrap_or_else(|_| {
        // params came out of serde_json, so this cannot fail in practice
        format!("{{\"id\":{id},\"method\":\"{}\",\"params\":null}}", escape(method))
    });
    line.push('\n');
    line
}

/// Decodes one reply/event line.
pub fn decode_reply(line: &str) -> Result<EngineReply, serde_json::Error> {
    serde_json::from_str(line.trim_end())
}

/// Escapes `input` for embedding inside a hand-built JSON string literal.
/// Used where responses are synthesized without going through a serializer
/// (reactor-level 400/413 bodies, MJPEG part headers).
pub fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::{decode_reply, encode_request, escape};
    use serde_json::json;

    #[test]
    fn request_frame_is_single_line_json() {
        let line = encode_request(7, "navigate", &json!({"url": "https://example.com"}));
        assert!(line.ends_with('\n'));
        assert_eq!(1, line.matches('\n').count());

        let parsed: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(7, parsed["id"]);
        assert_eq!("navigate", parsed["method"]);
        assert_eq!("https://example.com", parsed["params"]["url"]);
    }

    #[test]
    fn reply_decodes_success_and_error_shapes() {
        let ok = decode_reply(r#"{"id":3,"success":true,"result":{"title":"t"}}"#).unwrap();
        assert_eq!(3, ok.id);
        assert!(ok.success);
        assert_eq!("t", ok.result.unwrap()["title"]);

        let err = decode_reply(r#"{"id":4,"success":false,"error":"no such context"}"#).unwrap();
        assert!(!err.success);
        assert_eq!("no such context", err.error.unwrap());
    }

    #[test]
    fn unsolicited_frames_default_to_id_zero() {
        let ready = decode_reply(r#"{"status":"ready"}"#).unwrap();
        assert_eq!(0, ready.id);
        assert_eq!("ready", ready.status.unwrap());

        let lic = decode_reply(
            r#"{"id":0,"license_status":"expired","message":"license expired","hardware_fingerprint":"ab:cd"}"#,
        )
        .unwrap();
        assert_eq!("expired", lic.license_status.unwrap());
        assert_eq!("ab:cd", lic.hardware_fingerprint.unwrap());
    }

    #[test]
    fn escape_covers_quotes_and_control_bytes() {
        assert_eq!("a\\\"b\\\\c", escape("a\"b\\c"));
        assert_eq!("line\\nbreak", escape("line\nbreak"));
        assert_eq!("\\u0001", escape("\u{1}"));
    }
}
