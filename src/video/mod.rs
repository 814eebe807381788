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

//! MJPEG streaming.
//!
//! Stream sockets are detached from the reactor and served by one thread
//! each, which is acceptable at the configured connection cap. Frames come
//! from the engine's shared-memory region; the 5 ms poll matches the
//! region's publish cadence. `start_live_stream`/`stop_live_stream` arm
//! and disarm contexts here in addition to being forwarded to the engine.

use std::collections::HashMap;
use std::io::{ErrorKind, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::conn::Stream;
use crate::engine::codec::escape;
use crate::services::Services;

pub mod shm;

/// How long a stream request waits for the region / first frame.
const FIRST_FRAME_WAIT: Duration = Duration::from_secs(2);

/// Poll cadence against the shared-memory region.
const FRAME_POLL: Duration = Duration::from_millis(5);

/// Per-context streaming state shared with streamer threads.
#[derive(Debug)]
pub struct StreamHandle {
    /// Context the frames belong to.
    pub context_id: String,
    /// Armed frame rate (engine-side; informational here).
    pub fps: AtomicU32,
    /// Armed JPEG quality (engine-side; informational here).
    pub quality: AtomicU32,
    /// Cleared by `stop_live_stream`; streamers exit when it drops.
    pub active: AtomicBool,
    /// Currently attached clients.
    pub clients: AtomicU32,
    /// Frames written across all clients.
    pub frames_sent: AtomicU64,
}

/// Registry of armed/known stream contexts.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    streams: Mutex<HashMap<String, Arc<StreamHandle>>>,
}

impl StreamRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms `context_id` (idempotent), recording fps/quality.
    pub fn arm(&self, context_id: &str, fps: u32, quality: u32) {
        let handle = self.attach(context_id);
        handle.fps.store(fps, Ordering::Relaxed);
        handle.quality.store(quality, Ordering::Relaxed);
        handle.active.store(true, Ordering::Release);
    }

    /// Clears the active flag; attached streamers exit on their next poll.
    pub fn disarm(&self, context_id: &str) {
        let streams = self.streams.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(handle) = streams.get(context_id) {
            handle.active.store(false, Ordering::Release);
        }
    }

    /// Handle for `context_id`, created on first use.
    pub fn attach(&self, context_id: &str) -> Arc<StreamHandle> {
        let mut streams = self.streams.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(streams.entry(context_id.to_owned()).or_insert_with(|| {
            Arc::new(StreamHandle {
                context_id: context_id.to_owned(),
                fps: AtomicU32::new(10),
                quality: AtomicU32::new(80),
                active: AtomicBool::new(true),
                clients: AtomicU32::new(0),
                frames_sent: AtomicU64::new(0),
            })
        }))
    }

    /// `/video/list` document.
    pub fn list(&self) -> Value {
        let streams = self.streams.lock().unwrap_or_else(|p| p.into_inner());
        json!({
            "success": true,
            "streams": streams
                .values()
                .map(|h| {
                    json!({
                        "context_id": h.context_id,
                        "fps": h.fps.load(Ordering::Relaxed),
                        "quality": h.quality.load(Ordering::Relaxed),
                        "active": h.active.load(Ordering::Acquire),
                        "clients": h.clients.load(Ordering::Relaxed),
                        "frames_sent": h.frames_sent.load(Ordering::Relaxed),
                    })
                })
                .collect::<Vec<_>>(),
        })
    }

    /// `/video/stats` document.
    pub fn stats(&self) -> Value {
        let streams = self.streams.lock().unwrap_or_else(|p| p.into_inner());
        let active = streams
            .values()
            .filter(|h| h.active.load(Ordering::Acquire))
            .count();
        let clients: u32 = streams
            .values()
            .map(|h| h.clients.load(Ordering::Relaxed))
            .sum();
        let frames: u64 = streams
            .values()
            .map(|h| h.frames_sent.load(Ordering::Relaxed))
            .sum();
        json!({
            "success": true,
            "streams_known": streams.len(),
            "streams_active": active,
            "clients": clients,
            "frames_sent": frames,
        })
    }
}

/// Detached-socket entry point: serves either a single frame or a
/// multipart stream on its own thread, then closes the socket.
pub fn spawn_stream(
    services: Arc<Services>,
    stream: Stream,
    context_id: String,
    single_frame: bool,
) {
    let name = format!("mjpeg-{context_id}");
    let spawned = std::thread::Builder::new().name(name).spawn(move || {
        if single_frame {
            serve_single_frame(&services, stream, &context_id);
        } else {
            serve_stream(&services, stream, &context_id);
        }
        services.stats.conn_closed();
    });
    if let Err(e) = spawned {
        warn!(err = %e, "could not spawn streamer thread");
    }
}

fn serve_single_frame(services: &Arc<Services>, mut stream: Stream, context_id: &str) {
    match wait_first_frame(context_id) {
        Some(frame) => {
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                frame.jpeg.len()
            );
            let _ = write_all_polling(&mut stream, head.as_bytes());
            let _ = write_all_polling(&mut stream, &frame.jpeg);
            services.stats.add_bytes_out((head.len() + frame.jpeg.len()) as u64);
        }
        None => {
            let _ = write_all_polling(&mut stream, not_found_body(context_id).as_bytes());
        }
    }
}

fn serve_stream(services: &Arc<Services>, mut stream: Stream, context_id: &str) {
    let handle = services.video.attach(context_id);
    handle.clients.fetch_add(1, Ordering::Relaxed);

    let head = "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary=frame\r\nConnection: close\r\n\r\n";

    let result = (|| -> std::io::Result<()> {
        let reader = match wait_region(context_id) {
            Some(r) => r,
            None => {
                write_all_polling(&mut stream, not_found_body(context_id).as_bytes())?;
                return Ok(());
            }
        };
        write_all_polling(&mut stream, head.as_bytes())?;

        let mut last_seq = 0u64;
        loop {
            if services.is_shutting_down() || !handle.active.load(Ordering::Acquire) {
                debug!(context_id, "stream disarmed");
                return Ok(());
            }
            if !reader.is_active() {
                debug!(region = reader.name(), "frame region inactive");
                return Ok(());
            }

            if reader.has_new(last_seq) {
                if let Some(frame) = reader.read() {
                    last_seq = frame.sequence;
                    let part = format!(
                        "--frame\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                        frame.jpeg.len()
                    );
                    write_all_polling(&mut stream, part.as_bytes())?;
                    write_all_polling(&mut stream, &frame.jpeg)?;
                    write_all_polling(&mut stream, b"\r\n")?;
                    handle.frames_sent.fetch_add(1, Ordering::Relaxed);
                    services
                        .stats
                        .add_bytes_out((part.len() + frame.jpeg.len() + 2) as u64);
                    continue;
                }
            }
            std::thread::sleep(FRAME_POLL);
        }
    })();

    if let Err(e) = result {
        // client hangup is the normal way out
        debug!(context_id, err = %e, "stream ended");
    }
    handle.clients.fetch_sub(1, Ordering::Relaxed);
}

fn wait_region(context_id: &str) -> Option<shm::FrameReader> {
    let deadline = Instant::now() + FIRST_FRAME_WAIT;
    loop {
        match shm::FrameReader::open(context_id) {
            Ok(reader) => return Some(reader),
            Err(_) if Instant::now() < deadline => std::thread::sleep(FRAME_POLL),
            Err(e) => {
                debug!(context_id, err = %e, "frame region unavailable");
                return None;
            }
        }
    }
}

fn wait_first_frame(context_id: &str) -> Option<shm::Frame> {
    let reader = wait_region(context_id)?;
    let deadline = Instant::now() + FIRST_FRAME_WAIT;
    loop {
        if reader.has_new(0) {
            if let Some(frame) = reader.read() {
                return Some(frame);
            }
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(FRAME_POLL);
    }
}

fn not_found_body(context_id: &str) -> String {
    let body = format!(
        "{{\"success\":false,\"error\":\"no frames for context {}\"}}",
        escape(context_id)
    );
    format!(
        "HTTP/1.1 404 Not Found\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
}

/// Writes everything, sleeping through `WouldBlock` since the detached
/// socket stays nonblocking. Gives up when the client makes no progress
/// for several seconds.
fn write_all_polling(stream: &mut Stream, mut bytes: &[u8]) -> std::io::Result<()> {
    let mut stalled = Instant::now();
    while !bytes.is_empty() {
        match stream.write(bytes) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(n) => {
                bytes = &bytes[n..];
                stalled = Instant::now();
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if stalled.elapsed() > Duration::from_secs(10) {
                    return Err(ErrorKind::TimedOut.into());
                }
                std::thread::sleep(Duration::from_millis(2));
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    stream.flush()
}

#[cfg(test)]
mod test {
    use super::StreamRegistry;

    #[test]
    fn arm_disarm_round_trip() {
        let registry = StreamRegistry::new();
        registry.arm("ctx_1", 15, 70);

        let handle = registry.attach("ctx_1");
        assert!(handle.active.load(std::sync::atomic::Ordering::Acquire));
        assert_eq!(15, handle.fps.load(std::sync::atomic::Ordering::Relaxed));

        registry.disarm("ctx_1");
        assert!(!handle.active.load(std::sync::atomic::Ordering::Acquire));
    }

    #[test]
    fn list_and_stats_reflect_registry() {
        let registry = StreamRegistry::new();
        registry.arm("a", 10, 80);
        registry.arm("b", 20, 60);
        registry.disarm("b");

        let list = registry.list();
        assert_eq!(2, list["streams"].as_array().unwrap().len());

        let stats = registry.stats();
        assert_eq!(2, stats["streams_known"]);
        assert_eq!(1, stats["streams_active"]);
    }

    #[test]
    fn disarm_unknown_context_is_a_no_op() {
        let registry = StreamRegistry::new();
        registry.disarm("ghost");
        assert_eq!(0, registry.stats()["streams_known"]);
    }
}
