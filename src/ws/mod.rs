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

//! The WebSocket hub.
//!
//! Upgraded sockets leave the reactor's poll set and join the hub's own;
//! the reactor calls [`Hub::tick`] once per loop iteration. Complete
//! messages fan in to the engine channel through the worker pool, so the
//! reactor thread never blocks on an engine reply. Workers push encoded
//! reply frames into the connection's outbox; the hub drains outboxes on
//! its next pass.

use std::io::Write as _;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token};
use serde_json::{json, Value};
use slab::Slab;
use tracing::{debug, warn};

use crate::buffer::Buffer;
use crate::config::WebSocketConfig;
use crate::conn::Stream;
use crate::parser::response::Response;
use crate::worker::{Task, WorkerCtx, WorkerPool};

pub mod frame;

use frame::{FrameError, OpCode};

/// Close code sent when the peer misses its pong deadline.
const CLOSE_INTERNAL: u16 = 1011;
const CLOSE_PROTOCOL: u16 = 1002;
const CLOSE_TOO_BIG: u16 = 1009;
const CLOSE_NORMAL: u16 = 1000;

/// Mutable half of a hub connection.
#[derive(Debug)]
pub struct WsIo {
    /// The socket; `None` once torn down.
    pub stream: Option<Stream>,
    /// Raw bytes read off the wire, decoded frame by frame.
    pub recv: Buffer,
    /// Encoded frames (and the 101 response) queued for the wire.
    pub outbox: Buffer,
    /// Reassembly buffer for fragmented messages.
    fragments: Option<Vec<u8>>,
    /// Outstanding ping, if any.
    ping_sent: Option<Instant>,
    /// A close frame has been queued; drop after the outbox drains.
    closing: bool,
}

/// One upgraded connection, shared between the hub and workers.
#[derive(Debug)]
pub struct WsConn {
    /// Hub slab key.
    pub token: usize,
    /// Client address.
    pub peer: IpAddr,
    /// Buffers and socket under one mutex.
    pub io: Mutex<WsIo>,
}

impl WsConn {
    /// Queues an encoded frame for the next hub pass.
    pub fn push_frame(&self, bytes: &[u8]) {
        let mut io = self.io.lock().unwrap_or_else(|p| p.into_inner());
        io.outbox.extend(bytes);
    }
}

/// Owns all upgraded sockets and their liveness.
#[derive(Debug)]
pub struct Hub {
    poll: Poll,
    events: Events,
    conns: Slab<Arc<WsConn>>,
    config: WebSocketConfig,
    last_ping_pass: Instant,
}

impl Hub {
    /// Creates an empty hub with its own poll instance.
    pub fn new(config: WebSocketConfig) -> std::io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(256),
            conns: Slab::new(),
            config,
            last_ping_pass: Instant::now(),
        })
    }

    /// Number of adopted connections.
    pub fn active(&self) -> usize {
        self.conns.len()
    }

    /// Whether another upgrade may be accepted.
    pub fn has_capacity(&self) -> bool {
        self.config.enabled && self.conns.len() < self.config.max_connections
    }

    /// Takes ownership of an upgraded socket. The 101 response is queued
    /// as the first bytes of the outbox.
    pub fn adopt(&mut self, mut stream: Stream, peer: IpAddr, ws_key: &str) -> std::io::Result<()> {
        let entry = self.conns.vacant_entry();
        let token = entry.key();
        stream.register(self.poll.registry(), Token(token), Interest::READABLE)?;

        let accept = frame::accept_key(ws_key);
        let response = Response::switching_protocols(&accept);

        let mut outbox = Buffer::new();
        outbox.extend(&response.to_bytes());

        entry.insert(Arc::new(WsConn {
            token,
            peer,
            io: Mutex::new(WsIo {
                stream: Some(stream),
                recv: Buffer::with_capacity(4 * 1024),
                outbox,
                fragments: None,
                ping_sent: None,
                closing: false,
            }),
        }));
        debug!(%peer, token, active = self.conns.len(), "websocket adopted");
        Ok(())
    }

    /// One readiness pass: reads, message dispatch, outbox drain, liveness,
    /// reaping. Called from the reactor once per tick.
    pub fn tick(&mut self, pool: &WorkerPool, ctx: &Arc<WorkerCtx>) {
        if self.conns.is_empty() {
            return;
        }

        if self
            .poll
            .poll(&mut self.events, Some(Duration::ZERO))
            .is_ok()
        {
            let tokens: Vec<usize> = self
                .events
                .iter()
                .filter(|e| e.is_readable() || e.is_read_closed())
                .map(|e| e.token().0)
                .collect();
            for token in tokens {
                if let Some(conn) = self.conns.get(token) {
                    let conn = Arc::clone(conn);
                    read_conn(&conn, self.config.message_max_size, pool, ctx);
                }
            }
        }

        self.flush_all();
        self.liveness_pass();
        self.reap(ctx);
    }

    fn flush_all(&mut self) {
        for (_, conn) in self.conns.iter() {
            let mut guard = conn.io.lock().unwrap_or_else(|p| p.into_inner());
            let io = &mut *guard;
            let Some(stream) = io.stream.as_mut() else {
                continue;
            };
            if io.outbox.is_empty() && !stream.wants_write() {
                continue;
            }
            match io.outbox.drain_into(stream) {
                Ok(_) => {
                    let _ = stream.flush();
                }
                Err(_) => io.stream = None,
            }
        }
    }

    fn liveness_pass(&mut self) {
        let interval = Duration::from_secs(self.config.ping_interval_sec);
        let pong_deadline = Duration::from_secs(self.config.pong_timeout_sec);

        // expire pongs continuously, ping on the configured cadence
        let ping_due = self.last_ping_pass.elapsed() >= interval;
        if ping_due {
            self.last_ping_pass = Instant::now();
        }

        for (_, conn) in self.conns.iter() {
            let mut io = conn.io.lock().unwrap_or_else(|p| p.into_inner());
            if io.stream.is_none() || io.closing {
                continue;
            }

            if let Some(sent) = io.ping_sent {
                if sent.elapsed() > pong_deadline {
                    debug!(peer = %conn.peer, "pong timeout; disconnecting");
                    io.outbox
                        .extend(&frame::encode_close(CLOSE_INTERNAL, "pong timeout"));
                    io.closing = true;
                    continue;
                }
            }

            if ping_due && io.ping_sent.is_none() {
                io.outbox.extend(&frame::encode(OpCode::Ping, b""));
                io.ping_sent = Some(Instant::now());
            }
        }
    }

    fn reap(&mut self, ctx: &Arc<WorkerCtx>) {
        let dead: Vec<usize> = self
            .conns
            .iter()
            .filter(|(_, conn)| {
                let io = conn.io.lock().unwrap_or_else(|p| p.into_inner());
                io.stream.is_none() || (io.closing && io.outbox.is_empty())
            })
            .map(|(key, _)| key)
            .collect();

        for key in dead {
            let conn = self.conns.remove(key);
            let mut io = conn.io.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(mut stream) = io.stream.take() {
                let _ = stream.deregister(self.poll.registry());
            }
            ctx.services.stats.conn_closed();
            debug!(peer = %conn.peer, "websocket closed");
        }
    }

    /// Queues a close frame on every connection (graceful shutdown).
    pub fn close_all(&mut self) {
        for (_, conn) in self.conns.iter() {
            let mut io = conn.io.lock().unwrap_or_else(|p| p.into_inner());
            io.outbox
                .extend(&frame::encode_close(CLOSE_NORMAL, "shutting down"));
            io.closing = true;
        }
    }
}

/// Reads whatever the socket has, decodes frames, and submits complete
/// messages to the worker pool.
fn read_conn(conn: &Arc<WsConn>, max: usize, pool: &WorkerPool, ctx: &Arc<WorkerCtx>) {
    let mut completed: Vec<String> = Vec::new();

    {
        let mut guard = conn.io.lock().unwrap_or_else(|p| p.into_inner());
        let io = &mut *guard;
        let Some(stream) = io.stream.as_mut() else {
            return;
        };

        // frame headers add a small margin over the payload cap
        match io.recv.fill_from(stream, max + 1024) {
            Ok(0) => {
                io.stream = None;
                return;
            }
            Ok(n) => ctx.services.stats.add_bytes_in(n as u64),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(_) => {
                io.stream = None;
                return;
            }
        }

        loop {
            match frame::decode(io.recv.unread(), max) {
                Ok(None) => break,
                Ok(Some((frame, consumed))) => {
                    io.recv.mark_read(consumed);
                    if let Some(message) = handle_frame(io, frame, max) {
                        completed.push(message);
                    }
                    if io.closing || io.stream.is_none() {
                        break;
                    }
                }
                Err(e) => {
                    let code = match e {
                        FrameError::TooLarge => CLOSE_TOO_BIG,
                        FrameError::Protocol | FrameError::Unmasked => CLOSE_PROTOCOL,
                    };
                    io.outbox.extend(&frame::encode_close(code, "protocol error"));
                    io.closing = true;
                    break;
                }
            }
        }
    }

    for text in completed {
        let task = Task::Ws {
            conn: Arc::clone(conn),
            text,
        };
        if let Err(task) = pool.submit(task) {
            // queue full: degrade by executing on the reactor thread
            warn!("worker queue full; running ws message inline");
            crate::worker::run_task(ctx, task);
        }
    }
}

/// Applies one decoded frame to a connection. Returns a complete text
/// message when reassembly finishes.
fn handle_frame(io: &mut WsIo, frame: frame::Frame, max: usize) -> Option<String> {
    match frame.opcode {
        OpCode::Text | OpCode::Binary => {
            if io.fragments.is_some() {
                // a new data frame may not interleave with reassembly
                io.outbox
                    .extend(&frame::encode_close(CLOSE_PROTOCOL, "interleaved message"));
                io.closing = true;
                return None;
            }
            if frame.fin {
                // binary is answered as text, per the surface contract
                return Some(String::from_utf8_lossy(&frame.payload).into_owned());
            }
            io.fragments = Some(frame.payload);
            None
        }
        OpCode::Continuation => {
            let Some(mut acc) = io.fragments.take() else {
                io.outbox
                    .extend(&frame::encode_close(CLOSE_PROTOCOL, "orphan continuation"));
                io.closing = true;
                return None;
            };
            if acc.len() + frame.payload.len() > max {
                io.outbox
                    .extend(&frame::encode_close(CLOSE_TOO_BIG, "message too large"));
                io.closing = true;
                return None;
            }
            acc.extend_from_slice(&frame.payload);
            if frame.fin {
                return Some(String::from_utf8_lossy(&acc).into_owned());
            }
            io.fragments = Some(acc);
            None
        }
        OpCode::Ping => {
            io.outbox
                .extend(&frame::encode(OpCode::Pong, &frame.payload));
            None
        }
        OpCode::Pong => {
            io.ping_sent = None;
            None
        }
        OpCode::Close => {
            let code = frame::close_code(&frame.payload).unwrap_or(CLOSE_NORMAL);
            io.outbox.extend(&frame::encode_close(code, ""));
            io.closing = true;
            None
        }
    }
}

/// Executes one JSON-RPC message on a worker thread and queues the reply.
pub fn handle_message(ctx: &WorkerCtx, conn: &Arc<WsConn>, text: &str) {
    let reply = build_reply(ctx, text);
    let encoded = frame::encode(OpCode::Text, reply.to_string().as_bytes());
    conn.push_frame(&encoded);
    ctx.services.stats.add_bytes_out(encoded.len() as u64);
}

fn build_reply(ctx: &WorkerCtx, text: &str) -> Value {
    let parsed: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            return json!({
                "id": -1,
                "success": false,
                "error": format!("invalid JSON: {e}"),
            })
        }
    };

    let id = parsed.get("id").cloned().unwrap_or(json!(-1));
    let Some(method) = parsed.get("method").and_then(Value::as_str) else {
        return json!({
            "id": id,
            "success": false,
            "error": "missing method",
        });
    };
    let params = parsed.get("params").cloned().unwrap_or(Value::Null);

    // catalog names go through validation; anything else is treated as a
    // raw engine method, mirroring the Router's name→method mapping
    let outcome = if crate::tools::ToolRegistry::lookup(method).is_some() {
        crate::router::execute_tool(&ctx.services, method, &params)
    } else {
        crate::router::call_engine(&ctx.services, method, &params)
    };

    let mut body = match outcome {
        Ok(body) => body,
        Err(e) => json!({
            "success": false,
            "error": e.to_string(),
        }),
    };
    body["id"] = id;
    body
}
