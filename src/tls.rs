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

//! TLS termination.
//!
//! Wraps an accepted socket in a rustls server session and exposes it as a
//! plain `Read`/`Write` byte stream, so the reactor and every detached
//! consumer stay transport-agnostic.

use std::io::{self, ErrorKind, Read, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rustls::{ServerConfig, ServerConnection};

use crate::config::SslConfig;

/// A TLS server-side session over a nonblocking TCP stream.
pub struct TlsStream {
    sock: mio::net::TcpStream,
    tls: ServerConnection,
}

impl std::fmt::Debug for TlsStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsStream").finish_non_exhaustive()
    }
}

impl TlsStream {
    /// Starts a server session on an accepted socket.
    pub fn new(sock: mio::net::TcpStream, config: Arc<ServerConfig>) -> Result<Self> {
        let tls = ServerConnection::new(config).context("creating TLS session")?;
        Ok(Self { sock, tls })
    }

    /// The raw socket, for poll registration.
    pub fn socket_mut(&mut self) -> &mut mio::net::TcpStream {
        &mut self.sock
    }

    /// True when handshake or application bytes are queued for the wire.
    pub fn wants_write(&self) -> bool {
        self.tls.wants_write()
    }

    fn pump_reads(&mut self) -> io::Result<()> {
        // move ciphertext from the socket into the session
        loop {
            match self.tls.read_tls(&mut self.sock) {
                Ok(0) => return Ok(()), // EOF surfaces on the next plaintext read
                Ok(_) => {
                    self.tls
                        .process_new_packets()
                        .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn pump_writes(&mut self) -> io::Result<()> {
        while self.tls.wants_write() {
            match self.tls.write_tls(&mut self.sock) {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Read for TlsStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.pump_reads()?;
        // the handshake may have produced response bytes
        self.pump_writes()?;
        match self.tls.reader().read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Err(e),
            Err(e) => Err(e),
        }
    }
}

impl Write for TlsStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.tls.writer().write(buf)?;
        self.pump_writes()?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.pump_writes()
    }
}

/// Builds the rustls server config from the `ssl.*` options.
pub fn server_config(ssl: &SslConfig) -> Result<Arc<ServerConfig>> {
    let cert_path = ssl
        .cert_path
        .as_deref()
        .context("ssl.cert_path is required")?;
    let key_path = ssl.key_path.as_deref().context("ssl.key_path is required")?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut io::BufReader::new(
        std::fs::File::open(cert_path).with_context(|| format!("opening {cert_path}"))?,
    ))
    .collect::<std::result::Result<_, _>>()
    .with_context(|| format!("parsing certificates in {cert_path}"))?;
    if certs.is_empty() {
        bail!("{cert_path} contains no certificates");
    }

    let key = rustls_pemfile::private_key(&mut io::BufReader::new(
        std::fs::File::open(key_path).with_context(|| format!("opening {key_path}"))?,
    ))
    .with_context(|| format!("parsing private key in {key_path}"))?
    .with_context(|| format!("{key_path} contains no private key"))?;

    let builder = ServerConfig::builder();
    let config = if ssl.verify_client {
        let ca_path = ssl
            .ca_path
            .as_deref()
            .context("ssl.verify_client requires ssl.ca_path")?;
        let mut roots = rustls::RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut io::BufReader::new(
            std::fs::File::open(ca_path).with_context(|| format!("opening {ca_path}"))?,
        )) {
            roots
                .add(cert.with_context(|| format!("parsing {ca_path}"))?)
                .context("adding client CA certificate")?;
        }
        let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .context("building client verifier")?;
        builder
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .context("assembling TLS server config")?
    } else {
        builder
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("assembling TLS server config")?
    };

    Ok(Arc::new(config))
}
