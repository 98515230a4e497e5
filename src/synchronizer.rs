//! Byte-stream synchronization for the mixed NMEA/UBX serial stream.
use std::io::{ErrorKind, Read};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bytes::Bytes;
use crate::{Error, Result};

/// UBX binary sync marker.
pub const UBX_SYNC: [u8; 2] = [0xb5, 0x62];
/// NMEA sentence sentinel; every GNSS talker id starts with 'G'.
pub const NMEA_SYNC: [u8; 2] = [b'$', b'G'];

/// Upper bound on a single frame. NMEA sentences are at most 82 characters
/// and the ESF frames in scope are far smaller; anything bigger means we
/// lost synchronization and must drop and resync.
pub const MAX_FRAME_LEN: usize = 1024;

/// Protocol a synchronized frame was tagged with, per its start marker.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Nmea,
    Ubx,
    /// Bytes that arrived before any recognized marker.
    Unknown,
}

/// A single frame cut from the raw byte stream.
///
/// `data` includes the marker bytes the frame started with, so decoders can
/// index fields from the start of the wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub protocol: Protocol,
    pub data: Vec<u8>,
}

impl RawFrame {
    /// True when the frame holds nothing beyond its start marker (adjacent
    /// markers on the wire), or nothing at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self.protocol {
            Protocol::Unknown => self.data.is_empty(),
            _ => self.data.len() <= 2,
        }
    }
}

/// FrameSynchronizer scans a byte stream for the UBX and NMEA sync markers
/// and emits the bytes between consecutive markers as tagged [RawFrame]s.
///
/// On detecting a marker the accumulated bytes *preceding* it are emitted as
/// one frame and accumulation restarts with the marker retained as the start
/// of the next frame. A partial frame at end of stream is dropped.
pub struct FrameSynchronizer<R>
where
    R: Read + Send,
{
    bytes: Bytes<R>,
    acc: Vec<u8>,
    tag: Protocol,
}

impl<R> FrameSynchronizer<R>
where
    R: Read + Send,
{
    pub fn new(reader: R) -> Self {
        FrameSynchronizer {
            bytes: Bytes::new(reader),
            acc: Vec::new(),
            tag: Protocol::Unknown,
        }
    }

    /// Scan the stream until the next complete frame is available.
    ///
    /// Returns `Ok(None)` once the stream is exhausted; a trailing partial
    /// frame is dropped.
    ///
    /// # Errors
    /// Any I/O error other than EOF.
    pub fn scan(&mut self) -> Result<Option<RawFrame>> {
        loop {
            let b = match self.bytes.next() {
                Err(err) => {
                    if err.kind() == ErrorKind::UnexpectedEof {
                        if !self.acc.is_empty() {
                            debug!(len = self.acc.len(), "dropping partial frame at EOF");
                        }
                        return Ok(None);
                    }
                    return Err(Error::Io(err));
                }
                Ok(b) => b,
            };

            if let Some(tag) = self.marker_at(b)? {
                let frame = RawFrame {
                    protocol: std::mem::replace(&mut self.tag, tag),
                    data: std::mem::take(&mut self.acc),
                };
                self.acc.extend_from_slice(match tag {
                    Protocol::Ubx => &UBX_SYNC,
                    _ => &NMEA_SYNC,
                });
                if frame.data.is_empty() {
                    continue;
                }
                return Ok(Some(frame));
            }

            self.acc.push(b);
            if self.acc.len() >= MAX_FRAME_LEN {
                warn!(
                    len = self.acc.len(),
                    "frame buffer overflow, dropping and resynchronizing"
                );
                self.acc.clear();
                self.tag = Protocol::Unknown;
            }
        }
    }

    /// Check whether a marker begins at byte `b`, consuming the second
    /// marker byte on a match and pushing it back otherwise.
    fn marker_at(&mut self, b: u8) -> Result<Option<Protocol>> {
        let tag = match b {
            _ if b == UBX_SYNC[0] => Protocol::Ubx,
            _ if b == NMEA_SYNC[0] => Protocol::Nmea,
            _ => return Ok(None),
        };
        let want = match tag {
            Protocol::Ubx => UBX_SYNC[1],
            _ => NMEA_SYNC[1],
        };
        match self.bytes.next() {
            Ok(next) if next == want => Ok(Some(tag)),
            Ok(next) => {
                self.bytes.push(next);
                Ok(None)
            }
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(err) => Err(Error::Io(err)),
        }
    }
}

impl<R> IntoIterator for FrameSynchronizer<R>
where
    R: Read + Send,
{
    type Item = Result<RawFrame>;
    type IntoIter = FrameIter<R>;

    fn into_iter(self) -> Self::IntoIter {
        FrameIter { scanner: self }
    }
}

/// Iterates frames produced by the source [FrameSynchronizer]. Ends at EOF;
/// any other error is passed on to the consumer.
pub struct FrameIter<R>
where
    R: Read + Send,
{
    scanner: FrameSynchronizer<R>,
}

impl<R> Iterator for FrameIter<R>
where
    R: Read + Send,
{
    type Item = Result<RawFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.scanner.scan() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

/// Creates an iterator producing tagged frames from the raw byte stream.
///
/// `reader` may deliver data in chunks as small as one byte, as a serial
/// port typically does.
pub fn read_frames<'a, R>(reader: R) -> impl Iterator<Item = Result<RawFrame>> + 'a
where
    R: Read + Send + 'a,
{
    FrameSynchronizer::new(reader).into_iter()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(stream: &[u8]) -> Vec<RawFrame> {
        read_frames(stream).map(|f| f.unwrap()).collect()
    }

    #[test]
    fn payload_between_two_ubx_markers_yields_one_frame() {
        let mut stream = UBX_SYNC.to_vec();
        stream.extend_from_slice(&[0x10, 0x02, 0x01, 0x00, 0xaa]);
        stream.extend_from_slice(&UBX_SYNC);

        let got = frames(&stream);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].protocol, Protocol::Ubx);
        assert_eq!(got[0].data[..2], UBX_SYNC);
        assert_eq!(&got[0].data[2..], &[0x10, 0x02, 0x01, 0x00, 0xaa]);
    }

    #[test]
    fn nmea_sentence_followed_by_ubx_marker() {
        let mut stream = b"$GNGGA,092725.00,4717.11399,N,00833.91590,E,1,8,1.0,499.6,M,48.0,M,,*7C\r\n".to_vec();
        stream.extend_from_slice(&UBX_SYNC);

        let got = frames(&stream);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].protocol, Protocol::Nmea);
        assert!(got[0].data.starts_with(b"$GNGGA,"));
        assert!(got[0].data.ends_with(b"\r\n"));
    }

    #[test]
    fn garbage_before_first_marker_is_tagged_unknown() {
        let mut stream = vec![0x00, 0xff, 0x42];
        stream.extend_from_slice(&UBX_SYNC);
        stream.extend_from_slice(&[0x01, 0x02]);
        stream.extend_from_slice(&NMEA_SYNC);
        stream.extend_from_slice(b"NVTG,");
        stream.extend_from_slice(&UBX_SYNC);

        let got = frames(&stream);
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].protocol, Protocol::Unknown);
        assert_eq!(got[0].data, vec![0x00, 0xff, 0x42]);
        assert_eq!(got[1].protocol, Protocol::Ubx);
        assert_eq!(got[2].protocol, Protocol::Nmea);
        assert_eq!(&got[2].data, b"$GNVTG,");
    }

    #[test]
    fn adjacent_markers_produce_marker_only_frame() {
        let mut stream = UBX_SYNC.to_vec();
        stream.extend_from_slice(&UBX_SYNC);
        stream.extend_from_slice(&UBX_SYNC);

        let got = frames(&stream);
        assert_eq!(got.len(), 2);
        for f in got {
            assert_eq!(f.data, UBX_SYNC.to_vec());
            assert!(f.is_empty());
        }
    }

    #[test]
    fn lone_sync_byte_is_not_a_marker() {
        let mut stream = UBX_SYNC.to_vec();
        // 0xb5 followed by something other than 0x62 stays in the frame
        stream.extend_from_slice(&[0xb5, 0x00, b'$', b'P']);
        stream.extend_from_slice(&UBX_SYNC);

        let got = frames(&stream);
        assert_eq!(got.len(), 1);
        assert_eq!(&got[0].data[2..], &[0xb5, 0x00, b'$', b'P']);
    }

    #[test]
    fn trailing_partial_frame_is_dropped() {
        let mut stream = UBX_SYNC.to_vec();
        stream.extend_from_slice(&[0x01, 0x02, 0x03]);

        assert!(frames(&stream).is_empty());
    }

    #[test]
    fn oversized_accumulation_drops_and_resyncs() {
        let mut stream = vec![0xee; MAX_FRAME_LEN + 16];
        stream.extend_from_slice(&UBX_SYNC);
        stream.extend_from_slice(&[0x09]);
        stream.extend_from_slice(&UBX_SYNC);

        let got = frames(&stream);
        // The first MAX_FRAME_LEN noise bytes are dropped wholesale; only
        // the residue after the reset reaches the marker as an Unknown frame.
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].protocol, Protocol::Unknown);
        assert_eq!(got[0].data.len(), 16);
        assert_eq!(got[1].protocol, Protocol::Ubx);
        assert_eq!(&got[1].data[2..], &[0x09]);
    }
}
