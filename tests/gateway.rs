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

//! End-to-end tests against a real listener and a mock engine.
//!
//! The mock engine is a shell script speaking the line-delimited JSON
//! protocol: it announces readiness, echoes each request's params as the
//! result, delays `wait` calls in the background (so replies arrive out of
//! order), and implements the one-shot `--license` mode with a marker
//! file.

#![cfg(unix)]

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use vakt::config::Config;
use vakt::reactor::Reactor;
use vakt::services::Services;

const TOKEN: &str = "it-test-token";

struct Gateway {
    services: Arc<Services>,
    port: u16,
    thread: Option<std::thread::JoinHandle<()>>,
    _dir: tempfile::TempDir,
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.services.trigger_shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.services.engine.shutdown();
    }
}

fn write_mock_engine(dir: &std::path::Path, licensed: bool) -> std::path::PathBuf {
    let marker = dir.join("licensed.marker");
    if licensed {
        std::fs::write(&marker, b"ok").unwrap();
    }
    let script = format!(
        r#"#!/bin/sh
MARKER="{marker}"
if [ "$1" = "--license" ]; then
  case "$2" in
    add) : > "$MARKER"; printf '{{"licensed":true}}\n'; exit 0 ;;
    remove) rm -f "$MARKER"; printf '{{"licensed":false}}\n'; exit 0 ;;
    status) [ -f "$MARKER" ] && printf '{{"licensed":true}}\n' || printf '{{"licensed":false}}\n'; exit 0 ;;
    fingerprint) printf '{{"fingerprint":"ab:cd:ef"}}\n'; exit 0 ;;
  esac
  exit 1
fi
if [ ! -f "$MARKER" ]; then
  printf '{{"id":0,"license_status":"missing","message":"no license installed","hardware_fingerprint":"ab:cd:ef"}}\n'
  while :; do sleep 1; done
fi
printf '{{"id":0,"status":"ready"}}\n'
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/^{{"id":\([0-9]*\).*/\1/p')
  params=$(printf '%s' "$line" | sed 's/.*"params"://; s/}}$//')
  case "$line" in
    *'"method":"wait"'*)
      ( sleep 0.12; printf '{{"id":%s,"success":true,"result":%s}}\n' "$id" "$params" ) & ;;
    *)
      printf '{{"id":%s,"success":true,"result":%s}}\n' "$id" "$params" ;;
  esac
done
"#,
        marker = marker.display()
    );

    let path = dir.join("mock-engine.sh");
    std::fs::write(&path, script).unwrap();
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn start_gateway(licensed: bool, mutate: impl FnOnce(&mut Config)) -> Gateway {
    let dir = tempfile::tempdir().unwrap();
    let engine_path = write_mock_engine(dir.path(), licensed);
    let port = free_port();

    let mut config = Config::default();
    config.port = port;
    config.auth_token = Some(TOKEN.to_owned());
    config.browser_path = Some(engine_path.display().to_string());
    config.shutdown_timeout_sec = 2;
    mutate(&mut config);
    config.validate().unwrap();

    let services = Services::build(config).unwrap();
    services.engine.start().unwrap();
    services.engine.wait_ready(Duration::from_secs(5));

    let mut reactor = Reactor::new(Arc::clone(&services)).unwrap();
    let thread = std::thread::spawn(move || reactor.run());

    // the listener is bound before Reactor::new returns
    Gateway {
        services,
        port,
        thread: Some(thread),
        _dir: dir,
    }
}

/// Minimal HTTP/1.1 client on a fresh connection.
fn request(port: u16, raw: &str) -> (u16, Value) {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    request_on(&mut stream, raw)
}

/// Same, reusing an existing keep-alive connection.
fn request_on(stream: &mut TcpStream, raw: &str) -> (u16, Value) {
    stream.write_all(raw.as_bytes()).unwrap();
    stream.flush().unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let (head_end, content_length, status) = loop {
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "server closed before response completed");
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..pos]).into_owned();
            let status: u16 = head
                .split_whitespace()
                .nth(1)
                .expect("status code")
                .parse()
                .unwrap();
            let content_length = head
                .lines()
                .find_map(|l| {
                    let (name, value) = l.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())?
                })
                .unwrap_or(0);
            break (pos + 4, content_length, status);
        }
    };

    while buf.len() < head_end + content_length {
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "server closed mid-body");
        buf.extend_from_slice(&chunk[..n]);
    }

    let body = &buf[head_end..head_end + content_length];
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(body).unwrap_or(Value::Null)
    };
    (status, value)
}

fn post_execute(port: u16, tool: &str, params: &Value, token: Option<&str>) -> (u16, Value) {
    let body = params.to_string();
    let auth = token
        .map(|t| format!("Authorization: Bearer {t}\r\n"))
        .unwrap_or_default();
    let raw = format!(
        "POST /execute/{tool} HTTP/1.1\r\nHost: localhost\r\n{auth}Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    request(port, &raw)
}

#[test]
fn happy_path_echoes_params() {
    let gw = start_gateway(true, |_| {});
    let params = json!({"context_id": "ctx_1", "url": "https://example.com"});
    let (status, body) = post_execute(gw.port, "browser_navigate", &params, Some(TOKEN));

    assert_eq!(200, status);
    assert_eq!(true, body["success"]);
    assert_eq!(params, body["result"]);
}

#[test]
fn validation_failure_lists_missing_fields() {
    let gw = start_gateway(true, |_| {});
    let (status, body) = post_execute(
        gw.port,
        "browser_type",
        &json!({"context_id": "ctx_1"}),
        Some(TOKEN),
    );

    assert_eq!(422, status);
    assert_eq!(false, body["success"]);
    let missing: Vec<&str> = body["missing_fields"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert!(missing.contains(&"selector"));
    assert!(missing.contains(&"text"));
    let supported = body["supported_fields"].as_str().unwrap();
    assert!(supported.contains("selector"));
    assert!(supported.contains("text"));
}

#[test]
fn missing_token_is_401() {
    let gw = start_gateway(true, |_| {});
    let params = json!({"context_id": "ctx_1", "url": "https://example.com"});
    let (status, body) = post_execute(gw.port, "browser_navigate", &params, None);

    assert_eq!(401, status);
    assert_eq!(
        "Invalid or missing authorization token",
        body["error"].as_str().unwrap()
    );
}

#[test]
fn rate_limit_denies_third_request_with_metadata() {
    let gw = start_gateway(true, |config| {
        config.rate_limit.enabled = true;
        config.rate_limit.requests_per_window = 2;
        config.rate_limit.window_seconds = 1;
        config.rate_limit.burst_size = 0;
    });

    let get_tools = format!(
        "GET /tools HTTP/1.1\r\nHost: localhost\r\nAuthorization: Bearer {TOKEN}\r\n\r\n"
    );
    let (s1, _) = request(gw.port, &get_tools);
    let (s2, _) = request(gw.port, &get_tools);
    let (s3, body) = request(gw.port, &get_tools);

    assert_eq!(200, s1);
    assert_eq!(200, s2);
    assert_eq!(429, s3);
    assert!(body["retry_after"].as_u64().unwrap() >= 1);
    assert_eq!(2, body["limit"]);
    assert_eq!(0, body["remaining"]);
}

#[test]
fn fifty_concurrent_calls_multiplex_over_one_channel() {
    let gw = start_gateway(true, |config| {
        config.worker_threads = 16;
    });
    let port = gw.port;

    let started = Instant::now();
    let handles: Vec<_> = (0..50)
        .map(|i| {
            std::thread::spawn(move || {
                let params = json!({"context_id": format!("ctx_{i}"), "ms": 100});
                post_execute(port, "browser_wait", &params, Some(TOKEN))
            })
        })
        .collect();

    for handle in handles {
        let (status, body) = handle.join().unwrap();
        assert_eq!(200, status);
        assert_eq!(true, body["success"]);
    }
    // serialized execution would need 50 * 120ms = 6s
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "calls did not overlap on the IPC channel: {:?}",
        started.elapsed()
    );
}

#[test]
fn license_add_restarts_engine_to_ready() {
    let gw = start_gateway(false, |_| {});

    let (status, health) = request(gw.port, "GET /health HTTP/1.1\r\nHost: l\r\n\r\n");
    assert_eq!(200, status);
    assert_eq!("license_error", health["browser_state"]);

    let license_file = gw._dir.path().join("fake.lic");
    std::fs::write(&license_file, b"fake").unwrap();
    let (status, body) = post_execute(
        gw.port,
        "browser_add_license",
        &json!({"license_path": license_file.display().to_string()}),
        Some(TOKEN),
    );
    assert_eq!(200, status);
    assert_eq!(true, body["success"]);
    assert!(body["message"].as_str().unwrap().contains("Browser restarted."));

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let (_, health) = request(gw.port, "GET /health HTTP/1.1\r\nHost: l\r\n\r\n");
        if health["browser_state"] == "ready" {
            break;
        }
        assert!(Instant::now() < deadline, "engine never became ready");
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn keep_alive_serves_sequential_requests_on_one_socket() {
    let gw = start_gateway(true, |_| {});
    let mut stream = TcpStream::connect(("127.0.0.1", gw.port)).unwrap();

    for _ in 0..3 {
        let (status, body) =
            request_on(&mut stream, "GET /health HTTP/1.1\r\nHost: l\r\n\r\n");
        assert_eq!(200, status);
        assert_eq!("ready", body["browser_state"]);
    }
}

#[test]
fn exempt_paths_skip_auth_but_tools_do_not() {
    let gw = start_gateway(true, |_| {});

    let (status, _) = request(gw.port, "GET /health HTTP/1.1\r\nHost: l\r\n\r\n");
    assert_eq!(200, status);
    let (status, schema) = request(gw.port, "GET /api/schema HTTP/1.1\r\nHost: l\r\n\r\n");
    assert_eq!(200, status);
    assert!(schema["tools"].as_array().unwrap().len() > 20);

    let (status, _) = request(gw.port, "GET /tools HTTP/1.1\r\nHost: l\r\n\r\n");
    assert_eq!(401, status);
}

#[test]
fn ip_filter_denies_unlisted_client() {
    let gw = start_gateway(true, |config| {
        config.ip_whitelist.enabled = true;
        config.ip_whitelist.entries = vec!["10.255.255.1".to_owned()];
    });

    let params = json!({"context_id": "c", "url": "https://example.com"});
    let (status, _) = post_execute(gw.port, "browser_navigate", &params, Some(TOKEN));
    assert_eq!(403, status);

    // exempt paths still answer
    let (status, _) = request(gw.port, "GET /health HTTP/1.1\r\nHost: l\r\n\r\n");
    assert_eq!(200, status);
}

#[test]
fn oversize_body_is_rejected_with_413() {
    let gw = start_gateway(true, |_| {});
    let raw = format!(
        "POST /execute/browser_navigate HTTP/1.1\r\nHost: l\r\nAuthorization: Bearer {TOKEN}\r\nContent-Length: 99999999999\r\n\r\n"
    );
    let (status, body) = request(gw.port, &raw);
    assert_eq!(413, status);
    assert_eq!(false, body["success"]);
}

#[test]
fn raw_command_is_correlated_and_answered() {
    let gw = start_gateway(true, |_| {});
    let payload = json!({"method": "navigate", "params": {"context_id": "c", "url": "u"}});
    let body_text = payload.to_string();
    let raw = format!(
        "POST /command HTTP/1.1\r\nHost: l\r\nAuthorization: Bearer {TOKEN}\r\nContent-Length: {}\r\n\r\n{}",
        body_text.len(),
        body_text
    );
    let (status, body) = request(gw.port, &raw);
    assert_eq!(200, status);
    assert_eq!(true, body["success"]);
    assert_eq!("c", body["result"]["context_id"]);
}

#[test]
fn graceful_shutdown_stops_accepting() {
    let gw = start_gateway(true, |_| {});
    let port = gw.port;

    let (status, _) = request(port, "GET /health HTTP/1.1\r\nHost: l\r\n\r\n");
    assert_eq!(200, status);

    gw.services.trigger_shutdown();
    // the reactor notices within one tick and closes the listener
    std::thread::sleep(Duration::from_millis(200));

    let refused = TcpStream::connect_timeout(
        &format!("127.0.0.1:{port}").parse().unwrap(),
        Duration::from_millis(300),
    );
    assert!(
        refused.is_err(),
        "listener still accepting after shutdown signal"
    );
}

// ─── WebSocket ──────────────────────────────────────────────────────────────

fn ws_handshake(port: u16) -> TcpStream {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let raw = format!(
        "GET /ws HTTP/1.1\r\nHost: l\r\nAuthorization: Bearer {TOKEN}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n"
    );
    stream.write_all(raw.as_bytes()).unwrap();

    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    loop {
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "closed during handshake");
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let head = String::from_utf8_lossy(&buf);
    assert!(head.starts_with("HTTP/1.1 101"), "handshake failed: {head}");
    assert!(head.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    stream
}

fn ws_send_text(stream: &mut TcpStream, text: &str) {
    let payload = text.as_bytes();
    let mask = [0x01u8, 0x02, 0x03, 0x04];
    let mut frame = vec![0x81u8];
    assert!(payload.len() < 126, "test helper handles short frames only");
    frame.push(0x80 | payload.len() as u8);
    frame.extend_from_slice(&mask);
    frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    stream.write_all(&frame).unwrap();
}

/// Reads server frames until a text frame arrives (answering pings on the
/// way), and returns its payload.
fn ws_read_text(stream: &mut TcpStream) -> String {
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        // try to decode one unmasked server frame from the front of buf
        if buf.len() >= 2 {
            let opcode = buf[0] & 0x0f;
            let (len, mut offset) = match buf[1] & 0x7f {
                126 if buf.len() >= 4 => {
                    (u16::from_be_bytes([buf[2], buf[3]]) as usize, 4usize)
                }
                n if n < 126 => (n as usize, 2usize),
                _ => (usize::MAX, 0),
            };
            if offset > 0 && buf.len() >= offset + len {
                let payload = buf[offset..offset + len].to_vec();
                offset += len;
                buf.drain(..offset);
                match opcode {
                    0x1 => return String::from_utf8(payload).unwrap(),
                    0x9 => {
                        // pong it back, masked
                        let mask = [9u8, 9, 9, 9];
                        let mut pong = vec![0x8a, 0x80 | payload.len() as u8];
                        pong.extend_from_slice(&mask);
                        pong.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
                        stream.write_all(&pong).unwrap();
                        continue;
                    }
                    _ => continue,
                }
            }
        }
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "server closed websocket");
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[test]
fn websocket_round_trip_echoes_request() {
    let gw = start_gateway(true, |_| {});
    let mut stream = ws_handshake(gw.port);

    ws_send_text(
        &mut stream,
        r#"{"id":7,"method":"browser_get_url","params":{"context_id":"ctx_1"}}"#,
    );
    let reply: Value = serde_json::from_str(&ws_read_text(&mut stream)).unwrap();
    assert_eq!(7, reply["id"]);
    assert_eq!(true, reply["success"]);
    assert_eq!("ctx_1", reply["result"]["context_id"]);
}

#[test]
fn websocket_malformed_json_echoes_id_minus_one() {
    let gw = start_gateway(true, |_| {});
    let mut stream = ws_handshake(gw.port);

    ws_send_text(&mut stream, "this is not json");
    let reply: Value = serde_json::from_str(&ws_read_text(&mut stream)).unwrap();
    assert_eq!(-1, reply["id"]);
    assert_eq!(false, reply["success"]);
}
