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

#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! vakt is a standalone HTTP/1.1 + WebSocket gateway in front of a
//! browser-automation engine running as a subprocess.
//!
//! Clients POST named tool invocations over REST or send JSON-RPC frames
//! over a WebSocket; the gateway validates them, forwards them over the
//! engine's line-delimited JSON stdin/stdout channel with id correlation,
//! and returns structured JSON responses. MJPEG video sourced from a
//! shared-memory region published by the engine is streamed per context.
//!
//! The front end is a single-threaded readiness-driven reactor; request
//! handlers run on a fixed worker pool. See the module docs of [`reactor`]
//! and [`engine`] for the ownership rules that tie the two together.

pub mod buffer;
pub mod config;
pub mod conn;
pub mod engine;
pub mod error;
pub mod gate;
pub mod parser;
pub mod playground;
pub mod reactor;
pub mod router;
pub mod services;
pub mod stats;
pub mod tls;
pub mod tools;
pub mod video;
pub mod worker;
pub mod ws;
