//! Frame routing, the shared fix snapshot, and the RTK-enable glue.
//!
//! Ingestion and dispatch are decoupled by a bounded channel: one background
//! thread blocks on the transport and emits tagged frames, the consumer
//! drains them strictly in arrival order. The latest GGA fix is published
//! into a mutex-guarded snapshot so the NTRIP setup path can read it from
//! another thread without racing the decoder.
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver};
use tracing::{debug, info, warn};

use crate::nmea::{GgaFix, NmeaDecoder, Sentence};
use crate::ntrip::{self, Credentials, NtripConfig, NtripSession};
use crate::synchronizer::{FrameSynchronizer, Protocol, RawFrame};
use crate::ubx::UbxDecoder;
use crate::{Error, Result};

/// Bound on in-flight frames between the ingestion thread and the dispatcher.
const CHANNEL_CAPACITY: usize = 1024;
/// How long the RTK setup path waits for a first valid fix.
pub const FIX_WAIT_BUDGET: Duration = Duration::from_secs(10);

/// Cloneable, mutex-guarded snapshot of the most recent GGA fix.
#[derive(Debug, Clone, Default)]
pub struct SharedFix(Arc<Mutex<GgaFix>>);

impl SharedFix {
    #[must_use]
    pub fn snapshot(&self) -> GgaFix {
        self.0.lock().expect("fix lock poisoned").clone()
    }

    /// Latest latitude/longitude, once both are known.
    #[must_use]
    pub fn position(&self) -> Option<(f64, f64)> {
        let fix = self.0.lock().expect("fix lock poisoned");
        Some((fix.lat?, fix.lon?))
    }

    fn publish(&self, fix: GgaFix) {
        *self.0.lock().expect("fix lock poisoned") = fix;
    }
}

/// Routes synchronized frames to the protocol decoders.
pub struct Dispatcher {
    pub nmea: NmeaDecoder,
    pub ubx: UbxDecoder,
    shared: SharedFix,
}

impl Dispatcher {
    #[must_use]
    pub fn new(shared: SharedFix) -> Self {
        Dispatcher {
            nmea: NmeaDecoder::new(),
            ubx: UbxDecoder::new(),
            shared,
        }
    }

    /// Route one frame to the matching decoder. Empty and unknown-protocol
    /// frames are dropped here; decode failures are handled (and logged)
    /// inside the decoders and never stop the stream.
    pub fn dispatch(&mut self, frame: &RawFrame) {
        if frame.is_empty() {
            debug!(protocol = ?frame.protocol, "dropping empty frame");
            return;
        }
        match frame.protocol {
            Protocol::Nmea => {
                if self.nmea.decode(&frame.data) == Some(Sentence::Gga) {
                    self.shared.publish(self.nmea.gga.clone());
                }
            }
            Protocol::Ubx => {
                self.ubx.decode(&frame.data);
            }
            Protocol::Unknown => {
                debug!(len = frame.data.len(), "dropping unsynchronized bytes");
            }
        }
    }

    /// Drain frames until the ingestion side hangs up.
    pub fn run(&mut self, frames: &Receiver<RawFrame>) {
        for frame in frames {
            self.dispatch(&frame);
        }
        debug!("frame channel closed, dispatch done");
    }
}

/// Start the ingestion thread for a receiver byte stream.
///
/// Frames are handed off through a bounded channel; the thread exits when
/// the stream ends, the transport fails, or every receiver is dropped.
///
/// # Errors
/// If the thread cannot be spawned.
pub fn spawn_ingest<R>(reader: R) -> Result<(Receiver<RawFrame>, JoinHandle<()>)>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = bounded(CHANNEL_CAPACITY);
    let handle = thread::Builder::new()
        .name("frame_ingest".into())
        .spawn(move || {
            for frame in FrameSynchronizer::new(reader) {
                match frame {
                    Ok(frame) => {
                        if tx.send(frame).is_err() {
                            debug!("frame receiver dropped, stopping ingest");
                            return;
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "transport read failed, stopping ingest");
                        return;
                    }
                }
            }
            debug!("byte stream ended");
        })?;
    Ok((rx, handle))
}

/// Block until the shared fix has coordinates, logging progress once per
/// second.
///
/// # Errors
/// [Error::FixTimeout] when no fix arrives within `budget`.
pub fn wait_for_fix(shared: &SharedFix, budget: Duration) -> Result<(f64, f64)> {
    let start = Instant::now();
    let mut elapsed_s = 0u64;
    loop {
        if let Some(position) = shared.position() {
            return Ok(position);
        }
        if start.elapsed() >= budget {
            warn!("timed out waiting for position fix");
            return Err(Error::FixTimeout);
        }
        info!(elapsed_s, "waiting for a valid position fix");
        thread::sleep(Duration::from_secs(1));
        elapsed_s += 1;
    }
}

/// Bring up RTK corrections: wait for a fix, resolve the nearest mountpoint
/// (unless one is given), and start streaming into the receiver's write
/// side.
///
/// # Errors
/// [Error::MissingCredentials] without credentials, [Error::FixTimeout] when
/// no fix arrives in time, plus everything mountpoint resolution and session
/// start can raise.
pub fn enable_rtk<W>(
    credentials: Option<&Credentials>,
    shared: &SharedFix,
    sink: W,
    mountpoint: Option<String>,
) -> Result<NtripSession>
where
    W: Write + Send + 'static,
{
    let credentials = credentials.ok_or(Error::MissingCredentials)?;
    let mountpoint = match mountpoint {
        Some(mountpoint) => mountpoint,
        None => {
            let (lat, lon) = wait_for_fix(shared, FIX_WAIT_BUDGET)?;
            ntrip::resolve_nearest(credentials, lat, lon, Duration::from_secs(5))?.mountpoint
        }
    };
    let config = NtripConfig::builder().mountpoint(mountpoint).build();
    NtripSession::start(credentials, config, sink, None)
}
