//! NTRIP caster client: sourcetable resolution and correction streaming.
//!
//! Two separate short-lived/long-lived connections are used. Resolution
//! opens a connection, fetches the caster's plain-text sourcetable, picks
//! the mountpoint nearest the current fix by great-circle distance, and
//! closes. Streaming then opens its own connection, authenticates against
//! the chosen mountpoint, and forwards correction bytes to the receiver
//! until stopped or the peer goes away. There is no retry or backoff; a
//! failed session simply closes.
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;

use crate::{Error, Result};

const USER_AGENT: &str = concat!("NTRIP ublox-stream/", env!("CARGO_PKG_VERSION"));
/// Status marker a caster answers a sourcetable request with.
const SOURCETABLE_OK: &[u8] = b"SOURCETABLE 200 OK";
/// Status marker a caster answers a successful mountpoint request with.
const ICY_OK: &[u8] = b"ICY 200 OK";
/// Mean Earth radius, kilometers.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Caster account details. Always supplied by the caller; nothing in this
/// crate constructs or persists credentials.
#[derive(Clone)]
pub struct Credentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl Credentials {
    fn basic_auth(&self) -> String {
        BASE64.encode(format!("{}:{}", self.username, self.password))
    }

    fn connect(&self, timeout: Duration) -> Result<TcpStream> {
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    ErrorKind::NotFound,
                    format!("no address for {}:{}", self.host, self.port),
                ))
            })?;
        Ok(TcpStream::connect_timeout(&addr, timeout)?)
    }
}

// Keep passwords out of logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Great-circle distance in kilometers between two points given in decimal
/// degrees, by the haversine formula.
#[must_use]
pub fn haversine(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}

/// One mountpoint entry from a caster sourcetable `STR;` line.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SourceEntry {
    pub mountpoint: String,
    pub identifier: String,
    /// Correction format, e.g. "RTCM 3.2".
    pub format: String,
    pub lat: f64,
    pub lon: f64,
}

impl SourceEntry {
    /// Fields required to reach the lat/lon columns (indexes 9 and 10).
    const MIN_FIELDS: usize = 12;

    /// Parse a semicolon-delimited `STR;` line, `None` for anything else.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split(';').collect();
        if fields.first() != Some(&"STR") || fields.len() < Self::MIN_FIELDS {
            return None;
        }
        Some(SourceEntry {
            mountpoint: fields[1].to_owned(),
            identifier: fields[2].to_owned(),
            format: fields[3].to_owned(),
            lat: fields[9].parse().ok()?,
            lon: fields[10].parse().ok()?,
        })
    }
}

/// A caster's catalog of mountpoints.
#[derive(Debug, Clone, Default)]
pub struct SourceTable {
    pub entries: Vec<SourceEntry>,
}

impl SourceTable {
    /// Parse the CRLF-delimited sourcetable body, keeping `STR;` lines.
    #[must_use]
    pub fn parse(body: &str) -> Self {
        SourceTable {
            entries: body.split("\r\n").filter_map(SourceEntry::parse).collect(),
        }
    }

    /// The entry nearest to the given fix. Ties keep the first encountered.
    #[must_use]
    pub fn nearest(&self, lat: f64, lon: f64) -> Option<&SourceEntry> {
        let mut min_distance = f64::INFINITY;
        let mut closest = None;
        for entry in &self.entries {
            let distance = haversine(lat, lon, entry.lat, entry.lon);
            if distance < min_distance {
                min_distance = distance;
                closest = Some(entry);
            }
        }
        closest
    }
}

/// Fetch and parse the caster's sourcetable over a short-lived connection.
///
/// # Errors
/// I/O failure, or [Error::CasterStatus] when the response carries no
/// `SOURCETABLE 200 OK` marker or ends before `ENDSOURCETABLE`.
pub fn fetch_sourcetable(credentials: &Credentials, timeout: Duration) -> Result<SourceTable> {
    let mut stream = credentials.connect(timeout)?;
    stream.set_read_timeout(Some(timeout))?;

    let request = format!(
        "GET / HTTP/1.1\r\nUser-Agent: {USER_AGENT}\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(request.as_bytes())?;

    let mut response = Vec::new();
    let mut chunk = [0u8; 4096];
    let mut complete = false;
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                response.extend_from_slice(&chunk[..n]);
                if find(&response, b"ENDSOURCETABLE").is_some() {
                    complete = true;
                    break;
                }
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => break,
            Err(err) => return Err(Error::Io(err)),
        }
    }

    if find(&response, SOURCETABLE_OK).is_none() {
        return Err(Error::CasterStatus(status_line(&response)));
    }
    // A body without the end marker means the read timed out or the peer
    // went away mid-table; a partial table must not drive mountpoint
    // selection.
    if !complete {
        warn!(len = response.len(), "sourcetable ended without ENDSOURCETABLE");
        return Err(Error::CasterStatus(
            "sourcetable truncated before ENDSOURCETABLE".into(),
        ));
    }
    let table = SourceTable::parse(&String::from_utf8_lossy(&response));
    debug!(entries = table.entries.len(), "fetched sourcetable");
    Ok(table)
}

/// Resolve the mountpoint nearest to the current fix.
///
/// # Errors
/// Everything [fetch_sourcetable] raises, plus [Error::NoMountpoint] when
/// the table has no usable entries.
pub fn resolve_nearest(
    credentials: &Credentials,
    lat: f64,
    lon: f64,
    timeout: Duration,
) -> Result<SourceEntry> {
    let table = fetch_sourcetable(credentials, timeout)?;
    let entry = table.nearest(lat, lon).ok_or(Error::NoMountpoint)?;
    info!(
        mountpoint = %entry.mountpoint,
        distance_km = haversine(lat, lon, entry.lat, entry.lon),
        "resolved nearest mountpoint"
    );
    Ok(entry.clone())
}

/// Streaming session lifecycle. Any I/O failure moves straight to `Closed`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Authenticating,
    Streaming,
    Closed,
}

/// Streaming connection settings.
#[derive(Debug, Clone, TypedBuilder)]
pub struct NtripConfig {
    /// Mountpoint to request corrections from.
    #[builder(setter(into))]
    pub mountpoint: String,
    #[builder(default = Duration::from_secs(5))]
    pub connect_timeout: Duration,
    /// Bound on each receive so a stop request is observed promptly.
    #[builder(default = Duration::from_millis(500))]
    pub read_timeout: Duration,
    #[builder(default = 4096)]
    pub chunk_size: usize,
}

/// Callback observing each forwarded correction chunk.
pub type Observer = Box<dyn FnMut(&[u8]) + Send>;

/// A correction-streaming session against one caster mountpoint.
///
/// [NtripSession::start] connects and authenticates synchronously, then
/// forwards correction bytes to the sink from a background thread until
/// [NtripSession::stop] or a read failure.
#[derive(Debug)]
pub struct NtripSession {
    state: Arc<Mutex<SessionState>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl NtripSession {
    /// Connect, authenticate, and start streaming corrections into `sink`.
    ///
    /// Bytes already buffered behind the caster's status line are forwarded
    /// before the read loop starts, so no correction data is lost.
    ///
    /// # Errors
    /// Connect/authentication failure; [Error::CasterStatus] when the
    /// caster answers without `ICY 200 OK`.
    pub fn start<W>(
        credentials: &Credentials,
        config: NtripConfig,
        mut sink: W,
        mut observer: Option<Observer>,
    ) -> Result<Self>
    where
        W: Write + Send + 'static,
    {
        let state = Arc::new(Mutex::new(SessionState::Idle));
        let running = Arc::new(AtomicBool::new(true));

        set_state(&state, SessionState::Connecting);
        let mut stream = match credentials.connect(config.connect_timeout) {
            Ok(stream) => stream,
            Err(err) => {
                set_state(&state, SessionState::Closed);
                return Err(err);
            }
        };

        set_state(&state, SessionState::Authenticating);
        let first = match authenticate(&mut stream, credentials, &config) {
            Ok(first) => first,
            Err(err) => {
                set_state(&state, SessionState::Closed);
                return Err(err);
            }
        };
        if let Err(err) = stream.set_read_timeout(Some(config.read_timeout)) {
            set_state(&state, SessionState::Closed);
            return Err(Error::Io(err));
        }

        set_state(&state, SessionState::Streaming);
        info!(mountpoint = %config.mountpoint, "ntrip session streaming");

        let thread_state = state.clone();
        let thread_running = running.clone();
        let handle = thread::Builder::new()
            .name("ntrip_stream".into())
            .spawn(move || {
                let mut chunk = vec![0u8; config.chunk_size];
                if !first.is_empty() {
                    forward(&mut sink, &mut observer, &first, &thread_running);
                }
                while thread_running.load(Ordering::Relaxed) {
                    match stream.read(&mut chunk) {
                        Ok(0) => {
                            info!("caster closed the correction stream");
                            break;
                        }
                        Ok(n) => forward(&mut sink, &mut observer, &chunk[..n], &thread_running),
                        Err(err)
                            if matches!(
                                err.kind(),
                                ErrorKind::WouldBlock | ErrorKind::TimedOut
                            ) =>
                        {
                            // read timeout, check the stop flag and go again
                        }
                        Err(err) => {
                            warn!(error = %err, "correction stream read failed");
                            break;
                        }
                    }
                }
                set_state(&thread_state, SessionState::Closed);
            })?;

        Ok(NtripSession {
            state,
            running,
            handle: Some(handle),
        })
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("session state lock poisoned")
    }

    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.state() == SessionState::Streaming
    }

    /// Signal the streaming thread to stop and wait for it to exit.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("ntrip streaming thread panicked");
            }
        }
        set_state(&self.state, SessionState::Closed);
    }
}

impl Drop for NtripSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn set_state(state: &Arc<Mutex<SessionState>>, next: SessionState) {
    *state.lock().expect("session state lock poisoned") = next;
}

/// Send the mountpoint request and consume the caster's response header.
/// Returns any stream bytes that arrived behind the header.
fn authenticate(
    stream: &mut TcpStream,
    credentials: &Credentials,
    config: &NtripConfig,
) -> Result<Vec<u8>> {
    let request = format!(
        "GET /{} HTTP/1.1\r\n\
         User-Agent: {USER_AGENT}\r\n\
         Accept: */*\r\n\
         Ntrip-GGA: \r\n\
         Authorization: Basic {}\r\n\r\n",
        config.mountpoint,
        credentials.basic_auth(),
    );
    stream.write_all(request.as_bytes())?;
    stream.set_read_timeout(Some(config.connect_timeout))?;

    let mut response = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(Error::CasterStatus(
                "connection closed during handshake".into(),
            ));
        }
        response.extend_from_slice(&chunk[..n]);
        if let Some(end) = find(&response, b"\r\n\r\n") {
            let header = &response[..end];
            if find(header, ICY_OK).is_none() {
                return Err(Error::CasterStatus(status_line(header)));
            }
            return Ok(response[end + 4..].to_vec());
        }
        if response.len() > 8192 {
            return Err(Error::CasterStatus(status_line(&response)));
        }
    }
}

fn forward<W: Write>(
    sink: &mut W,
    observer: &mut Option<Observer>,
    data: &[u8],
    running: &AtomicBool,
) {
    if let Err(err) = sink.write_all(data) {
        warn!(error = %err, "failed to forward corrections to receiver");
        running.store(false, Ordering::Relaxed);
        return;
    }
    if let Some(cb) = observer {
        cb(data);
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn status_line(response: &[u8]) -> String {
    let text = String::from_utf8_lossy(response);
    text.lines().next().unwrap_or_default().to_owned()
}
