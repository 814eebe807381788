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

//! The engine subprocess and its IPC correlator.
//!
//! Exactly one engine process runs at a time. All tool traffic multiplexes
//! over its stdin/stdout as newline-delimited JSON frames; replies are
//! matched to callers strictly by id, never by arrival order. A dedicated
//! reader thread owns stdout; writers serialize on the stdin mutex, which
//! is never held across a wait.
//!
//! Ownership rules:
//! - the pending map's mutex is held only for insert/remove,
//! - a submitting worker blocks on its call's private condvar, bounded by
//!   the call deadline,
//! - the reader thread moves the pending entry out of the map and signals
//!   it; unmatched replies are logged and dropped.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod codec;
pub mod license;

/// How long a restart waits for in-flight calls to drain before failing
/// them.
const RESTART_DRAIN: Duration = Duration::from_secs(1);

/// Grace between SIGTERM and SIGKILL when tearing the engine down.
const TERM_GRACE: Duration = Duration::from_millis(500);

/// How long startup waits for the ready sentinel before giving up and
/// leaving the state as the engine reported it.
pub const STARTUP_WINDOW: Duration = Duration::from_secs(15);

/// Lifecycle state of the engine subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No process running.
    Stopped,
    /// Spawned, ready sentinel not yet seen.
    Starting,
    /// Accepting tool calls.
    Ready,
    /// Process died or the channel broke.
    Error,
    /// The engine refused to start for license reasons; the license
    /// subsurface stays available.
    LicenseError,
}

impl EngineState {
    /// Surface string used by `/health`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::LicenseError => "license_error",
        }
    }
}

/// Captured detail of the last license failure.
#[derive(Debug, Clone, Serialize)]
pub struct LicenseRecord {
    /// Engine-reported license status (e.g. "missing", "expired").
    pub status: String,
    /// Human-readable message.
    pub message: String,
    /// Hardware fingerprint for license issuance.
    pub hardware_fingerprint: Option<String>,
}

/// Failures produced by the channel.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine is not in the Ready state.
    #[error("engine not ready")]
    NotReady,
    /// The per-call deadline elapsed.
    #[error("engine call timed out")]
    Timeout,
    /// The engine closed its side of the channel.
    #[error("engine disconnected")]
    Disconnected,
    /// The engine is in license-error state.
    #[error("engine license error: {}", .0.message)]
    License(LicenseRecord),
    /// The engine answered `success:false`.
    #[error("{0}")]
    Reported(String),
    /// Channel-level I/O failure.
    #[error("engine io error: {0}")]
    Io(String),
}

type CallResult = Result<Value, EngineError>;

/// One in-flight call: a single-shot result slot plus its signal.
#[derive(Debug)]
struct PendingCall {
    slot: Mutex<Option<CallResult>>,
    cv: Condvar,
    /// Raw calls receive the whole reply frame instead of the unwrapped
    /// result.
    raw: bool,
}

impl PendingCall {
    fn new(raw: bool) -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(None),
            cv: Condvar::new(),
            raw,
        })
    }

    fn complete(&self, result: CallResult) {
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        *slot = Some(result);
        self.cv.notify_one();
    }
}

#[derive(Debug)]
struct EngineProc {
    child: Child,
    stdin: ChildStdin,
}

#[derive(Debug)]
struct StateInner {
    state: EngineState,
    license: Option<LicenseRecord>,
}

/// Owns the engine subprocess and correlates replies to callers.
#[derive(Debug)]
pub struct EngineChannel {
    binary: PathBuf,
    default_deadline: Duration,

    /// The stdin writer. Held only while encoding + writing one frame.
    proc: Mutex<Option<EngineProc>>,
    pending: Mutex<HashMap<u64, Arc<PendingCall>>>,
    next_id: AtomicU64,
    /// Bumped on every teardown so stale reader threads cannot touch state
    /// or deliver replies into a new incarnation.
    generation: AtomicU64,

    state: Mutex<StateInner>,
    state_cv: Condvar,
    /// Serializes restart/shutdown so two license mutations cannot
    /// interleave teardown and respawn.
    lifecycle: Mutex<()>,
    /// Handle to ourselves for spawning the reader threads.
    self_ref: Weak<EngineChannel>,
}

impl EngineChannel {
    /// Creates a channel for `binary`; nothing is spawned yet.
    pub fn new(binary: PathBuf, default_deadline: Duration) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            binary,
            default_deadline,
            proc: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            generation: AtomicU64::new(0),
            state: Mutex::new(StateInner {
                state: EngineState::Stopped,
                license: None,
            }),
            state_cv: Condvar::new(),
            lifecycle: Mutex::new(()),
            self_ref: self_ref.clone(),
        })
    }

    /// Engine binary path (shared with the one-shot license manager).
    pub fn binary(&self) -> &PathBuf {
        &self.binary
    }

    /// Default per-call deadline.
    pub fn default_deadline(&self) -> Duration {
        self.default_deadline
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).state
    }

    /// Last captured license failure, if any.
    pub fn license_record(&self) -> Option<LicenseRecord> {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .license
            .clone()
    }

    fn set_state(&self, state: EngineState) {
        let mut inner = self.state.lock().unwrap_or_else(|p| p.into_inner());
        inner.state = state;
        self.state_cv.notify_all();
    }

    fn set_license_error(&self, record: LicenseRecord) {
        let mut inner = self.state.lock().unwrap_or_else(|p| p.into_inner());
        inner.state = EngineState::LicenseError;
        inner.license = Some(record);
        self.state_cv.notify_all();
    }

    /// Spawns the engine and its reader threads; Stopped → Starting.
    pub fn start(&self) -> std::io::Result<()> {
        let mut child = Command::new(&self.binary)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        let pid = child.id();

        *self.proc.lock().unwrap_or_else(|p| p.into_inner()) =
            Some(EngineProc { child, stdin });
        self.set_state(EngineState::Starting);
        info!(binary = %self.binary.display(), pid, "engine spawned");

        let gen = self.generation.load(Ordering::SeqCst);
        let reader = self
            .self_ref
            .upgrade()
            .ok_or_else(|| std::io::Error::other("engine channel dropped"))?;
        std::thread::Builder::new()
            .name("engine-reader".to_owned())
            .spawn(move || reader.reader_loop(stdout, gen))?;

        std::thread::Builder::new()
            .name("engine-stderr".to_owned())
            .spawn(move || {
                for line in BufReader::new(stderr).lines() {
                    match line {
                        Ok(l) if !l.trim().is_empty() => warn!(engine = %l, "engine stderr"),
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
            })?;

        Ok(())
    }

    /// Blocks until the engine leaves Starting or `timeout` elapses, and
    /// returns the state it settled in.
    pub fn wait_ready(&self, timeout: Duration) -> EngineState {
        let deadline = Instant::now() + timeout;
        let mut inner = self.state.lock().unwrap_or_else(|p| p.into_inner());
        while inner.state == EngineState::Starting {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .state_cv
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(|p| p.into_inner());
            inner = guard;
        }
        inner.state
    }

    /// Submits a correlated call and waits for the reply, bounded by
    /// `deadline` (or the default). Cancellation on timeout is best-effort:
    /// the pending entry is removed and any late reply is discarded; the
    /// engine is not told to abort.
    pub fn call(
        &self,
        method: &str,
        params: &Value,
        deadline: Option<Duration>,
    ) -> CallResult {
        {
            let inner = self.state.lock().unwrap_or_else(|p| p.into_inner());
            match inner.state {
                EngineState::Ready => {}
                EngineState::LicenseError => {
                    return Err(EngineError::License(inner.license.clone().unwrap_or(
                        LicenseRecord {
                            status: "unknown".to_owned(),
                            message: "engine license error".to_owned(),
                            hardware_fingerprint: None,
                        },
                    )))
                }
                _ => return Err(EngineError::NotReady),
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = codec::encode_request(id, method, params);
        self.submit(id, line, false, deadline)
    }

    /// Raw passthrough: `payload` must be a JSON object; any client id is
    /// overwritten with a correlator id so the reply can be matched like
    /// any framed call. Returns the whole reply frame.
    pub fn raw_call(&self, mut payload: Value, deadline: Option<Duration>) -> CallResult {
        if self.state() != EngineState::Ready {
            return Err(EngineError::NotReady);
        }
        let object = payload
            .as_object_mut()
            .ok_or_else(|| EngineError::Io("raw payload must be a JSON object".to_owned()))?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        object.insert("id".to_owned(), Value::from(id));
        let mut line = payload.to_string();
        line.push('\n');
        self.submit(id, line, true, deadline)
    }

    fn submit(
        &self,
        id: u64,
        line: String,
        raw: bool,
        deadline: Option<Duration>,
    ) -> CallResult {
        let call = PendingCall::new(raw);
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, Arc::clone(&call));

        // Write under the stdin mutex; released before waiting.
        {
            let mut proc = self.proc.lock().unwrap_or_else(|p| p.into_inner());
            let result = match proc.as_mut() {
                Some(p) => p
                    .stdin
                    .write_all(line.as_bytes())
                    .and_then(|_| p.stdin.flush()),
                None => Err(std::io::ErrorKind::BrokenPipe.into()),
            };
            if let Err(e) = result {
                drop(proc);
                self.pending
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(&id);
                warn!(id, err = %e, "engine stdin write failed");
                return Err(EngineError::Disconnected);
            }
        }

        let timeout = deadline.unwrap_or(self.default_deadline);
        let wait_deadline = Instant::now() + timeout;

        let mut slot = call.slot.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            let now = Instant::now();
            if now >= wait_deadline {
                break;
            }
            let (guard, _) = call
                .cv
                .wait_timeout(slot, wait_deadline - now)
                .unwrap_or_else(|p| p.into_inner());
            slot = guard;
        }
        drop(slot);

        // Deadline elapsed. If the entry is still pending we own the
        // timeout; otherwise the reply raced us and the slot is filled.
        let removed = self
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&id);
        if removed.is_some() {
            debug!(id, "engine call timed out; late reply will be dropped");
            return Err(EngineError::Timeout);
        }

        let mut slot = call.slot.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            let (guard, _) = call
                .cv
                .wait_timeout(slot, Duration::from_millis(100))
                .unwrap_or_else(|p| p.into_inner());
            slot = guard;
        }
    }

    /// Number of in-flight calls (observability and tests).
    pub fn pending_calls(&self) -> usize {
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn reader_loop(self: Arc<Self>, stdout: std::process::ChildStdout, gen: u64) {
        let reader = BufReader::new(stdout);
        for line in reader.lines() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    debug!(err = %e, "engine stdout read error");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            if self.generation.load(Ordering::SeqCst) != gen {
                // a restart superseded this incarnation
                return;
            }

            let reply = match codec::decode_reply(&line) {
                Ok(r) => r,
                Err(e) => {
                    warn!(err = %e, "undecodable engine frame dropped");
                    continue;
                }
            };

            if reply.id > 0 {
                self.dispatch(reply);
            } else {
                self.handle_event(reply);
            }
        }

        // EOF or read error: only the current incarnation may fail the
        // channel.
        if self.generation.load(Ordering::SeqCst) == gen {
            warn!("engine stdout closed; failing in-flight calls");
            self.set_state(EngineState::Error);
            self.fail_all_pending();
        }
    }

    fn dispatch(&self, reply: codec::EngineReply) {
        let entry = self
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&reply.id);

        match entry {
            Some(call) => {
                let result = if call.raw {
                    Ok(raw_frame(&reply))
                } else if reply.success {
                    Ok(reply.result.unwrap_or(Value::Null))
                } else {
                    Err(EngineError::Reported(
                        reply
                            .error
                            .unwrap_or_else(|| "engine reported failure".to_owned()),
                    ))
                };
                call.complete(result);
            }
            None => debug!(id = reply.id, "late or unknown reply id dropped"),
        }
    }

    fn handle_event(&self, reply: codec::EngineReply) {
        if let Some(status) = reply.license_status {
            let record = LicenseRecord {
                status,
                message: reply
                    .message
                    .unwrap_or_else(|| "engine license validation failed".to_owned()),
                hardware_fingerprint: reply.hardware_fingerprint,
            };
            warn!(status = %record.status, "engine entered license-error state");
            self.set_license_error(record);
            return;
        }

        match reply.status.as_deref() {
            Some("ready") => {
                info!("engine ready");
                self.set_state(EngineState::Ready);
            }
            Some(other) => debug!(status = other, "engine lifecycle event"),
            None => debug!("unsolicited engine frame ignored"),
        }
    }

    fn fail_all_pending(&self) {
        let drained: Vec<Arc<PendingCall>> = {
            let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
            pending.drain().map(|(_, call)| call).collect()
        };
        for call in drained {
            call.complete(Err(EngineError::Disconnected));
        }
    }

    fn terminate(&self) {
        // Invalidate the running reader before the pipe breaks.
        self.generation.fetch_add(1, Ordering::SeqCst);

        let proc = self
            .proc
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        let Some(mut proc) = proc else { return };

        #[cfg(unix)]
        {
            // polite first: SIGTERM, then SIGKILL after the grace period
            unsafe {
                libc::kill(proc.child.id() as libc::pid_t, libc::SIGTERM);
            }
        }

        let deadline = Instant::now() + TERM_GRACE;
        loop {
            match proc.child.try_wait() {
                Ok(Some(status)) => {
                    info!(code = ?status.code(), "engine exited");
                    return;
                }
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(25));
                }
                _ => break,
            }
        }

        let _ = proc.child.kill();
        let _ = proc.child.wait();
        info!("engine killed after grace period");
    }

    /// Tears the engine down and spawns a fresh incarnation. New submits
    /// are refused the moment the state leaves Ready; in-flight calls get
    /// [`RESTART_DRAIN`] to finish and are then failed. Ids restart at 1.
    pub fn restart(&self) -> EngineState {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(|p| p.into_inner());
        info!("engine restart requested");
        self.set_state(EngineState::Stopped);

        let drain_deadline = Instant::now() + RESTART_DRAIN;
        while self.pending_calls() > 0 && Instant::now() < drain_deadline {
            std::thread::sleep(Duration::from_millis(25));
        }
        let leftover = self.pending_calls();
        if leftover > 0 {
            warn!(leftover, "failing in-flight calls for restart");
            self.fail_all_pending();
        }

        self.terminate();
        self.next_id.store(1, Ordering::SeqCst);

        match self.start() {
            Ok(()) => self.wait_ready(STARTUP_WINDOW),
            Err(e) => {
                warn!(err = %e, "engine respawn failed");
                self.set_state(EngineState::Error);
                EngineState::Error
            }
        }
    }

    /// Final teardown on gateway shutdown.
    pub fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(|p| p.into_inner());
        self.set_state(EngineState::Stopped);
        self.fail_all_pending();
        self.terminate();
    }
}

fn raw_frame(reply: &codec::EngineReply) -> Value {
    let mut frame = serde_json::Map::new();
    frame.insert("id".to_owned(), Value::from(reply.id));
    frame.insert("success".to_owned(), Value::from(reply.success));
    if let Some(result) = &reply.result {
        frame.insert("result".to_owned(), result.clone());
    }
    if let Some(error) = &reply.error {
        frame.insert("error".to_owned(), Value::from(error.clone()));
    }
    Value::Object(frame)
}

#[cfg(test)]
mod test {
    use super::{EngineChannel, EngineError, EngineState};
    use serde_json::json;
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;

    /// Mock engine: announces ready, then echoes each request's params,
    /// except requests mentioning "no_reply" which it swallows.
    const MOCK_ENGINE: &str = r#"#!/bin/sh
printf '{"id":0,"status":"ready"}\n'
while IFS= read -r line; do
  case "$line" in
    *no_reply*) continue ;;
  esac
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  printf '{"id":%s,"success":true,"result":{"echoed":true}}\n' "${id:-0}"
done
"#;

    fn mock_engine(script: &str) -> (tempfile::TempDir, Arc<EngineChannel>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.sh");
        {
            let mut f = std::fs::File::create(&path).unwrap();
            f.write_all(script.as_bytes()).unwrap();
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let channel = EngineChannel::new(path, Duration::from_secs(5));
        (dir, channel)
    }

    #[test]
    fn starts_and_reaches_ready() {
        let (_dir, channel) = mock_engine(MOCK_ENGINE);
        channel.start().unwrap();
        assert_eq!(
            EngineState::Ready,
            channel.wait_ready(Duration::from_secs(5))
        );
        channel.shutdown();
    }

    #[test]
    fn correlates_replies_and_cleans_pending() {
        let (_dir, channel) = mock_engine(MOCK_ENGINE);
        channel.start().unwrap();
        channel.wait_ready(Duration::from_secs(5));

        let result = channel
            .call("navigate", &json!({"url": "https://example.com"}), None)
            .unwrap();
        assert_eq!(true, result["echoed"]);
        assert_eq!(0, channel.pending_calls());
        channel.shutdown();
    }

    #[test]
    fn refuses_calls_before_ready() {
        let (_dir, channel) = mock_engine(MOCK_ENGINE);
        // never started
        assert!(matches!(
            channel.call("navigate", &json!({}), None),
            Err(EngineError::NotReady)
        ));
    }

    #[test]
    fn times_out_and_removes_the_pending_entry() {
        let (_dir, channel) = mock_engine(MOCK_ENGINE);
        channel.start().unwrap();
        channel.wait_ready(Duration::from_secs(5));

        let result = channel.call(
            "no_reply",
            &json!({}),
            Some(Duration::from_millis(200)),
        );
        assert!(matches!(result, Err(EngineError::Timeout)));
        assert_eq!(0, channel.pending_calls());
        channel.shutdown();
    }

    #[test]
    fn restart_recovers_to_ready() {
        let (_dir, channel) = mock_engine(MOCK_ENGINE);
        channel.start().unwrap();
        channel.wait_ready(Duration::from_secs(5));

        assert_eq!(EngineState::Ready, channel.restart());
        let result = channel.call("navigate", &json!({}), None).unwrap();
        assert_eq!(true, result["echoed"]);
        channel.shutdown();
    }

    #[test]
    fn eof_fails_pending_and_flags_error() {
        const DYING_ENGINE: &str = r#"#!/bin/sh
printf '{"id":0,"status":"ready"}\n'
read -r line
exit 0
"#;
        let (_dir, channel) = mock_engine(DYING_ENGINE);
        channel.start().unwrap();
        channel.wait_ready(Duration::from_secs(5));

        // the mock reads one line and exits without answering
        let result = channel.call("navigate", &json!({}), Some(Duration::from_secs(5)));
        assert!(matches!(result, Err(EngineError::Disconnected)));
        // reader observed EOF
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(EngineState::Error, channel.state());
    }

    #[test]
    fn license_event_captures_record() {
        const UNLICENSED_ENGINE: &str = r#"#!/bin/sh
printf '{"id":0,"license_status":"expired","message":"trial over","hardware_fingerprint":"ab:cd:ef"}\n'
sleep 60
"#;
        let (_dir, channel) = mock_engine(UNLICENSED_ENGINE);
        channel.start().unwrap();
        assert_eq!(
            EngineState::LicenseError,
            channel.wait_ready(Duration::from_secs(5))
        );
        let record = channel.license_record().unwrap();
        assert_eq!("expired", record.status);
        assert_eq!("trial over", record.message);
        assert_eq!(Some("ab:cd:ef".to_owned()), record.hardware_fingerprint);

        assert!(matches!(
            channel.call("navigate", &json!({}), None),
            Err(EngineError::License(_))
        ));
        channel.shutdown();
    }

    #[test]
    fn raw_call_overwrites_id_and_returns_frame() {
        let (_dir, channel) = mock_engine(MOCK_ENGINE);
        channel.start().unwrap();
        channel.wait_ready(Duration::from_secs(5));

        let frame = channel
            .raw_call(json!({"id": 999999, "method": "navigate", "params": {}}), None)
            .unwrap();
        assert_eq!(true, frame["success"]);
        assert!(frame["id"].as_u64().unwrap() < 1000);
        channel.shutdown();
    }
}
