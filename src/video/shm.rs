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

//! Reader for the engine's per-context shared-memory frame region.
//!
//! Layout: a fixed header (magic, sequence, dimensions, timestamp, payload
//! length, active flag) followed by the JPEG payload. The engine bumps the
//! sequence counter after each publish; readers detect torn frames by
//! re-checking the sequence after copying.

use std::io;

/// Region name prefix; the engine publishes `/vakt_frame_{context_id}`.
pub const SHM_PREFIX: &str = "/vakt_frame_";

/// `"MJPG"` little-endian.
pub const FRAME_MAGIC: u32 = 0x4750_4a4d;

/// Header size in bytes; the payload starts immediately after.
pub const HEADER_SIZE: usize = 40;

/// One copied-out frame.
#[derive(Debug)]
pub struct Frame {
    /// Publish sequence number.
    pub sequence: u64,
    /// Pixel width.
    pub width: u32,
    /// Pixel height.
    pub height: u32,
    /// Engine-side capture timestamp, microseconds.
    pub timestamp_us: u64,
    /// JPEG bytes.
    pub jpeg: Vec<u8>,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct RawHeader {
    magic: u32,
    active: u32,
    sequence: u64,
    width: u32,
    height: u32,
    timestamp_us: u64,
    payload_len: u32,
    _reserved: u32,
}

/// Memory-mapped view of one context's frame region.
#[derive(Debug)]
pub struct FrameReader {
    #[cfg(unix)]
    ptr: *const u8,
    #[cfg(unix)]
    len: usize,
    name: String,
}

// The mapping is read-only and the pointer never leaves the struct.
#[cfg(unix)]
unsafe impl Send for FrameReader {}

impl FrameReader {
    /// Opens and maps the region for `context_id`.
    #[cfg(unix)]
    pub fn open(context_id: &str) -> io::Result<Self> {
        let name = format!("{SHM_PREFIX}{context_id}");
        let c_name = std::ffi::CString::new(name.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad context id"))?;

        // SAFETY: c_name is a valid NUL-terminated string.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        // SAFETY: fd is open, stat is a valid out-pointer.
        if unsafe { libc::fstat(fd, &mut stat) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        let len = stat.st_size as usize;
        if len < HEADER_SIZE {
            unsafe { libc::close(fd) };
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame region smaller than header",
            ));
        }

        // SAFETY: fd is a valid shm object of size len.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            ptr: ptr as *const u8,
            len,
            name,
        })
    }

    /// Stub for non-unix builds; the video surface is unavailable there.
    #[cfg(not(unix))]
    pub fn open(_context_id: &str) -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "shared-memory frames require a unix host",
        ))
    }

    /// Region name, for logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    #[cfg(unix)]
    fn header(&self) -> RawHeader {
        // SAFETY: the mapping is at least HEADER_SIZE bytes and the header
        // is plain old data; volatile because the engine writes
        // concurrently.
        unsafe { std::ptr::read_volatile(self.ptr as *const RawHeader) }
    }

    /// True when the engine still marks this region as publishing.
    pub fn is_active(&self) -> bool {
        #[cfg(unix)]
        {
            let h = self.header();
            h.magic == FRAME_MAGIC && h.active != 0
        }
        #[cfg(not(unix))]
        false
    }

    /// True when a frame newer than `last_seq` has been published.
    pub fn has_new(&self, last_seq: u64) -> bool {
        #[cfg(unix)]
        {
            let h = self.header();
            h.magic == FRAME_MAGIC && h.sequence > last_seq
        }
        #[cfg(not(unix))]
        {
            let _ = last_seq;
            false
        }
    }

    /// Copies the current frame out. Returns `None` on a torn read (the
    /// engine republished mid-copy) or an inconsistent header.
    pub fn read(&self) -> Option<Frame> {
        #[cfg(unix)]
        {
            let before = self.header();
            if before.magic != FRAME_MAGIC {
                return None;
            }
            let payload_len = before.payload_len as usize;
            if payload_len == 0 || HEADER_SIZE + payload_len > self.len {
                return None;
            }

            // SAFETY: bounds checked against the mapping length above.
            let payload = unsafe {
                std::slice::from_raw_parts(self.ptr.add(HEADER_SIZE), payload_len)
            }
            .to_vec();

            let after = self.header();
            if after.sequence != before.sequence {
                return None; // torn; caller retries on the next poll
            }

            Some(Frame {
                sequence: before.sequence,
                width: before.width,
                height: before.height,
                timestamp_us: before.timestamp_us,
                jpeg: payload,
            })
        }
        #[cfg(not(unix))]
        None
    }
}

#[cfg(unix)]
impl Drop for FrameReader {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}
