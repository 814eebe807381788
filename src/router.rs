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

//! Request routing and the tool-execution flow.
//!
//! Workers run [`handle_dispatched`] on connections the reactor handed
//! over. Tool calls follow the canonical envelope: HTTP 200 with an outer
//! `success` flag for anything that reached the engine (including
//! engine-reported failures); non-200 statuses are reserved for
//! gateway-level failures. The license subsurface never touches the IPC
//! channel and stays available while the engine is down.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::CorsConfig;
use crate::conn::{Conn, ConnState};
use crate::engine::{EngineError, EngineState};
use crate::error::GatewayError;
use crate::parser::request::Request;
use crate::parser::response::Response;
use crate::parser::HttpMethod;
use crate::playground;
use crate::services::Services;
use crate::tools::{ToolError, ToolRegistry, LICENSE_TOOLS, LICENSE_TOOLS_WHEN_DOWN};
use crate::worker::WorkerCtx;

/// Runs the staged request of a dispatched connection and flips it to
/// `Writing`.
pub fn handle_dispatched(ctx: &WorkerCtx, conn: &Arc<Conn>) {
    let (request, arrived) = {
        let mut io = conn.io.lock().unwrap_or_else(|p| p.into_inner());
        (io.staged.take(), io.arrived.take())
    };
    let Some(request) = request else {
        warn!(token = conn.token, "dispatched connection without staged request");
        conn.transition(ConnState::Dispatched, ConnState::Idle);
        ctx.notify_reactor(conn.token);
        return;
    };

    let response = route(&ctx.services, &request);
    deliver(ctx, conn, &request, response, arrived);
}

/// Fails the current request with a 500; used after a handler panic.
pub fn fail_dispatched(ctx: &WorkerCtx, conn: &Arc<Conn>) {
    let mut response =
        GatewayError::Internal("request handler panicked".to_owned()).to_response();
    apply_cors(&ctx.services.config.cors, &mut response);

    {
        let mut io = conn.io.lock().unwrap_or_else(|p| p.into_inner());
        let mut bytes = Vec::new();
        response.serialize_into(&mut bytes);
        io.send.extend(&bytes);
    }
    ctx.services.stats.record_request(false, 0);
    conn.transition(ConnState::Dispatched, ConnState::Writing);
    ctx.notify_reactor(conn.token);
}

/// Serializes `response` into the connection and notifies the reactor.
fn deliver(
    ctx: &WorkerCtx,
    conn: &Arc<Conn>,
    request: &Request,
    mut response: Response,
    arrived: Option<Instant>,
) {
    apply_cors(&ctx.services.config.cors, &mut response);

    let status = response.status();
    let latency_us = arrived
        .map(|t| t.elapsed().as_micros() as u64)
        .unwrap_or(0);

    {
        let mut io = conn.io.lock().unwrap_or_else(|p| p.into_inner());
        let mut bytes = Vec::with_capacity(256 + response.body_len());
        response.serialize_into(&mut bytes);
        ctx.services.stats.add_bytes_out(bytes.len() as u64);
        io.send.extend(&bytes);
    }

    ctx.services.stats.record_request(status < 400, latency_us);
    if ctx.services.config.log_requests {
        info!(
            method = %request.method,
            path = %request.path,
            status,
            latency_ms = latency_us / 1000,
            "request"
        );
    }

    if !conn.transition(ConnState::Dispatched, ConnState::Writing) {
        // client hung up while we were working; the response is discarded
        debug!(token = conn.token, "connection closed during dispatch");
    }
    ctx.notify_reactor(conn.token);
}

/// Dispatches a parsed request to its handler. Gates have already run.
pub fn route(services: &Arc<Services>, request: &Request) -> Response {
    use HttpMethod::{Get, Options, Post};

    if request.method == Options {
        return preflight(&services.config.cors);
    }

    let path = request.path.as_str();
    let result: Result<Response, GatewayError> = match (request.method, path) {
        (Get, "/health") => Ok(Response::json(
            200,
            &json!({
                "status": "ok",
                "browser_state": services.engine.state().as_str(),
            }),
        )),
        (Get, "/stats") => Ok(Response::json(200, &services.stats.snapshot())),
        (Get, "/") => Ok(Response::html(200, playground::INDEX_HTML)),
        (Get, "/logo.svg") => Ok(Response::svg(200, playground::LOGO_SVG)),
        (Get, "/api/schema") => Ok(Response::json(200, &ToolRegistry::schema())),
        (Post, "/auth") => panel_login(services, request),
        (Get, "/auth/verify") => Ok(Response::json(200, &json!({"valid": true}))),
        (Get, "/tools") => Ok(Response::json(200, &ToolRegistry::listing())),
        (Get, p) if p.starts_with("/tools/") => tool_doc(&p["/tools/".len()..]),
        (Post, p) if p.starts_with("/execute/") => {
            execute(services, &p["/execute/".len()..], request)
        }
        (Post, "/command") => raw_command(services, request),
        (Get, "/video/list") => Ok(Response::json(200, &services.video.list())),
        (Get, "/video/stats") => Ok(Response::json(200, &services.video.stats())),
        (Post, "/ipc-tests/start") => ipc_tests(services, "start"),
        (Get, "/ipc-tests/status") => ipc_tests(services, "status"),
        (Post, "/ipc-tests/stop") => ipc_tests(services, "stop"),
        (_, "/health" | "/stats" | "/" | "/logo.svg" | "/api/schema" | "/auth"
        | "/auth/verify" | "/tools" | "/command" | "/video/list" | "/video/stats") => {
            Err(GatewayError::MethodNotAllowed)
        }
        (_, p) if p.starts_with("/execute/") || p.starts_with("/tools/") => {
            Err(GatewayError::MethodNotAllowed)
        }
        _ => Err(GatewayError::NotFound(request.path.clone())),
    };

    result.unwrap_or_else(|e| e.to_response())
}

fn panel_login(services: &Arc<Services>, request: &Request) -> Result<Response, GatewayError> {
    let body = request
        .body_json()
        .map_err(|e| GatewayError::BadRequest(format!("invalid JSON body: {e}")))?;
    let password = body
        .get("password")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::BadRequest("password is required".to_owned()))?;

    let token = services.gates.authenticator().panel_login(password)?;
    Ok(Response::json(
        200,
        &json!({"success": true, "token": token}),
    ))
}

fn tool_doc(name: &str) -> Result<Response, GatewayError> {
    match ToolRegistry::lookup(name) {
        Some(spec) => Ok(Response::json(200, &ToolRegistry::doc(spec))),
        None => Err(GatewayError::NotFound(format!("tool {name}"))),
    }
}

fn execute(
    services: &Arc<Services>,
    name: &str,
    request: &Request,
) -> Result<Response, GatewayError> {
    let params = request
        .body_json()
        .map_err(|e| GatewayError::BadRequest(format!("invalid JSON body: {e}")))?;
    let body = execute_tool(services, name, &params)?;
    Ok(Response::json(200, &body))
}

/// Validates and executes one tool, shared by the HTTP and WebSocket
/// surfaces. `Ok` carries the full 200 response body (outer `success` flag
/// included); `Err` carries gateway-level failures.
pub fn execute_tool(
    services: &Arc<Services>,
    name: &str,
    params: &Value,
) -> Result<Value, GatewayError> {
    let spec = match ToolRegistry::validate(name, params) {
        Ok(spec) => spec,
        Err(ToolError::Unknown(hint)) => return Err(GatewayError::NotFound(hint)),
        Err(ToolError::Invalid(failure)) => return Err(GatewayError::Validation(failure)),
    };

    let engine_ready = services.engine.state() == EngineState::Ready;
    if LICENSE_TOOLS.contains(&spec.name)
        || (!engine_ready && LICENSE_TOOLS_WHEN_DOWN.contains(&spec.name))
    {
        return execute_license(services, spec.name, params);
    }

    match services.engine.call(spec.method, params, None) {
        Ok(result) => {
            arm_streamer(services, spec.name, params);
            Ok(json!({"success": true, "result": normalize_result(result)}))
        }
        Err(EngineError::Reported(message)) => {
            Ok(json!({"success": false, "error": message}))
        }
        Err(e) => Err(e.into()),
    }
}

/// Forwards a bare engine method (no catalog entry, no validation) and
/// wraps the outcome in the canonical body. The WebSocket surface uses
/// this for methods sent by engine name rather than tool name.
pub fn call_engine(
    services: &Arc<Services>,
    method: &str,
    params: &Value,
) -> Result<Value, GatewayError> {
    match services.engine.call(method, params, None) {
        Ok(result) => Ok(json!({"success": true, "result": normalize_result(result)})),
        Err(EngineError::Reported(message)) => {
            Ok(json!({"success": false, "error": message}))
        }
        Err(e) => Err(e.into()),
    }
}

/// Keeps the MJPEG registry in step with live-stream control tools.
fn arm_streamer(services: &Arc<Services>, tool: &str, params: &Value) {
    let Some(context_id) = params.get("context_id").and_then(Value::as_str) else {
        return;
    };
    match tool {
        "start_live_stream" => {
            let fps = params.get("fps").and_then(Value::as_u64).unwrap_or(10) as u32;
            let quality = params.get("quality").and_then(Value::as_u64).unwrap_or(80) as u32;
            services.video.arm(context_id, fps, quality);
        }
        "stop_live_stream" => services.video.disarm(context_id),
        _ => {}
    }
}

fn execute_license(
    services: &Arc<Services>,
    tool: &str,
    params: &Value,
) -> Result<Value, GatewayError> {
    let outcome = match tool {
        "get_license_status" | "get_license_info" => services.license.status(),
        "get_hardware_fingerprint" => services.license.fingerprint(),
        "add_license" => {
            let path = params
                .get("license_path")
                .and_then(Value::as_str)
                .unwrap_or_default();
            services.license.add(path)
        }
        "remove_license" => services.license.remove(),
        other => {
            return Err(GatewayError::Internal(format!(
                "unroutable license tool {other}"
            )))
        }
    };

    match outcome {
        Ok(result) => {
            let mut body = json!({"success": true, "result": result});
            // mutations restart the engine so the new license takes effect
            if tool == "add_license" || tool == "remove_license" {
                let state = services.engine.restart();
                info!(state = state.as_str(), "engine restarted after license change");
                let verb = if tool == "add_license" { "added" } else { "removed" };
                body["message"] = json!(format!("License {verb}. Browser restarted."));
            }
            Ok(body)
        }
        Err(EngineError::Reported(message)) => {
            Ok(json!({"success": false, "error": message}))
        }
        Err(e) => Err(e.into()),
    }
}

fn raw_command(
    services: &Arc<Services>,
    request: &Request,
) -> Result<Response, GatewayError> {
    let payload = request
        .body_json()
        .map_err(|e| GatewayError::BadRequest(format!("invalid JSON body: {e}")))?;
    if !payload.is_object() {
        return Err(GatewayError::BadRequest(
            "command payload must be a JSON object".to_owned(),
        ));
    }

    match services.engine.raw_call(payload, None) {
        Ok(frame) => Ok(Response::json(200, &frame)),
        Err(e) => Err(e.into()),
    }
}

fn ipc_tests(services: &Arc<Services>, action: &str) -> Result<Response, GatewayError> {
    if !services.config.ipc_tests.enabled {
        return Err(GatewayError::NotFound("/ipc-tests".to_owned()));
    }
    let body = match action {
        "start" => services.ipc_tests.start()?,
        "status" => services.ipc_tests.status(),
        "stop" => services.ipc_tests.stop()?,
        _ => return Err(GatewayError::NotFound("/ipc-tests".to_owned())),
    };
    Ok(Response::json(200, &body))
}

/// Uniform CORS headers on every response.
pub fn apply_cors(cors: &CorsConfig, response: &mut Response) {
    if !cors.enabled {
        return;
    }
    response.add_header("Access-Control-Allow-Origin", &cors.allowed_origins);
    response.add_header("Access-Control-Allow-Methods", &cors.allowed_methods);
    response.add_header("Access-Control-Allow-Headers", &cors.allowed_headers);
}

/// The 204 preflight answer.
pub fn preflight(cors: &CorsConfig) -> Response {
    let mut response = Response::new(204);
    if cors.enabled {
        response.add_header("Access-Control-Max-Age", &cors.max_age_seconds.to_string());
    }
    response
}

/// If the engine handed back a string that itself parses as JSON, unwrap
/// it so clients get structure instead of a quoted blob.
fn normalize_result(result: Value) -> Value {
    match result {
        Value::String(s) => match serde_json::from_str::<Value>(&s) {
            Ok(parsed) => parsed,
            Err(_) => Value::String(s),
        },
        other => other,
    }
}

#[cfg(test)]
mod test {
    use super::{normalize_result, route};
    use crate::config::Config;
    use crate::parser::request::Request;
    use crate::parser::Status;
    use crate::services::Services;
    use serde_json::json;
    use std::sync::Arc;

    fn test_services() -> Arc<Services> {
        let mut config = Config::default();
        config.browser_path = Some("/bin/true".to_owned());
        config.auth_token = Some("test-token".to_owned());
        Services::build(config).unwrap()
    }

    fn req(raw: &[u8]) -> Request {
        match Request::parse(raw, 1024 * 1024).unwrap() {
            Status::Complete((request, _)) => request,
            Status::Partial => panic!("test request incomplete"),
        }
    }

    #[test]
    fn health_reports_engine_state() {
        let services = test_services();
        let resp = route(&services, &req(b"GET /health HTTP/1.1\r\n\r\n"));
        let text = String::from_utf8(resp.to_bytes()).unwrap();
        assert!(text.contains("\"browser_state\":\"stopped\""));
        assert_eq!(200, resp.status());
    }

    #[test]
    fn unknown_route_is_404_and_wrong_method_is_405() {
        let services = test_services();
        assert_eq!(
            404,
            route(&services, &req(b"GET /nope HTTP/1.1\r\n\r\n")).status()
        );
        assert_eq!(
            405,
            route(&services, &req(b"POST /health HTTP/1.1\r\n\r\n")).status()
        );
    }

    #[test]
    fn options_preflight_is_204() {
        let services = test_services();
        assert_eq!(
            204,
            route(&services, &req(b"OPTIONS /anything HTTP/1.1\r\n\r\n")).status()
        );
    }

    #[test]
    fn panel_login_round_trip() {
        let services = test_services();
        let body = b"{\"password\":\"test-token\"}";
        let raw = format!(
            "POST /auth HTTP/1.1\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            std::str::from_utf8(body).unwrap()
        );
        let resp = route(&services, &req(raw.as_bytes()));
        assert_eq!(200, resp.status());
        let text = String::from_utf8(resp.to_bytes()).unwrap();
        assert!(text.contains("\"token\":\"test-token\""));

        let raw = "POST /auth HTTP/1.1\r\nContent-Length: 22\r\n\r\n{\"password\":\"wrong!!\"}";
        assert_eq!(401, route(&services, &req(raw.as_bytes())).status());
    }

    #[test]
    fn execute_unready_engine_is_503() {
        let services = test_services();
        let raw = "POST /execute/browser_navigate HTTP/1.1\r\nContent-Length: 40\r\n\r\n{\"context_id\":\"c\",\"url\":\"http://x.test\"}";
        let resp = route(&services, &req(raw.as_bytes()));
        assert_eq!(503, resp.status());
    }

    #[test]
    fn execute_validation_failure_is_422_with_fields() {
        let services = test_services();
        let body = "{\"context_id\":\"ctx\"}";
        let resp = route(
            &services,
            &req(format!(
                "POST /execute/browser_type HTTP/1.1\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            )
            .as_bytes()),
        );
        assert_eq!(422, resp.status());
        let text = String::from_utf8(resp.to_bytes()).unwrap();
        assert!(text.contains("\"missing_fields\":[\"selector\",\"text\"]"));
        assert!(text.contains("supported_fields"));
    }

    #[test]
    fn unknown_tool_includes_supported_hint() {
        let services = test_services();
        let resp = route(
            &services,
            &req(b"POST /execute/browser_frobnicate HTTP/1.1\r\nContent-Length: 2\r\n\r\n{}"),
        );
        assert_eq!(404, resp.status());
        let text = String::from_utf8(resp.to_bytes()).unwrap();
        assert!(text.contains("browser_navigate"));
    }

    #[test]
    fn normalize_unwraps_json_strings_only() {
        assert_eq!(
            json!({"a": 1}),
            normalize_result(json!("{\"a\": 1}"))
        );
        assert_eq!(json!("plain text"), normalize_result(json!("plain text")));
        assert_eq!(json!([1, 2]), normalize_result(json!([1, 2])));
    }
}
