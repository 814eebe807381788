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

//! The local license manager.
//!
//! License tools never travel over the IPC channel: the engine binary is
//! invoked one-shot in `--license` mode, which works even while the
//! long-running engine sits in license-error state. Successful mutations
//! are followed by an engine restart, driven by the router.

use std::path::PathBuf;
use std::process::Command;

use serde_json::Value;
use tracing::{info, warn};

use super::EngineError;

/// One-shot `--license` invocations of the engine binary.
#[derive(Debug)]
pub struct LicenseManager {
    binary: PathBuf,
}

impl LicenseManager {
    /// Creates a manager for the same binary the channel runs.
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    /// `--license status`
    pub fn status(&self) -> Result<Value, EngineError> {
        self.run(&["--license", "status"])
    }

    /// `--license fingerprint`
    pub fn fingerprint(&self) -> Result<Value, EngineError> {
        self.run(&["--license", "fingerprint"])
    }

    /// `--license add <path>`
    pub fn add(&self, license_path: &str) -> Result<Value, EngineError> {
        info!(path = license_path, "installing license");
        self.run(&["--license", "add", license_path])
    }

    /// `--license remove`
    pub fn remove(&self) -> Result<Value, EngineError> {
        info!("removing license");
        self.run(&["--license", "remove"])
    }

    fn run(&self, args: &[&str]) -> Result<Value, EngineError> {
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .map_err(|e| EngineError::Io(format!("license invocation failed: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = if stderr.trim().is_empty() {
                stdout.trim()
            } else {
                stderr.trim()
            };
            warn!(args = ?args, code = ?output.status.code(), "license invocation failed");
            return Err(EngineError::Reported(if detail.is_empty() {
                "license operation failed".to_owned()
            } else {
                detail.to_owned()
            }));
        }

        // The binary prints JSON on success; fall back to the raw text.
        let trimmed = stdout.trim();
        Ok(serde_json::from_str(trimmed)
            .unwrap_or_else(|_| Value::String(trimmed.to_owned())))
    }
}

#[cfg(test)]
mod test {
    use super::LicenseManager;
    use crate::engine::EngineError;
    use std::io::Write;

    fn fake_binary(script: &str) -> (tempfile::TempDir, LicenseManager) {
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
        (dir, LicenseManager::new(path))
    }

    #[test]
    fn parses_json_status_output() {
        let (_dir, mgr) = fake_binary(
            "#!/bin/sh\nprintf '{\"licensed\":true,\"expires\":\"2027-01-01\"}\\n'\n",
        );
        let status = mgr.status().unwrap();
        assert_eq!(true, status["licensed"]);
    }

    #[test]
    fn plain_text_output_becomes_a_string() {
        let (_dir, mgr) = fake_binary("#!/bin/sh\nprintf 'ok\\n'\n");
        assert_eq!("ok", mgr.fingerprint().unwrap());
    }

    #[test]
    fn nonzero_exit_surfaces_stderr() {
        let (_dir, mgr) = fake_binary("#!/bin/sh\necho 'invalid license file' >&2\nexit 3\n");
        match mgr.add("/tmp/nope.lic") {
            Err(EngineError::Reported(msg)) => assert_eq!("invalid license file", msg),
            other => panic!("expected reported failure, got {other:?}"),
        }
    }
}
