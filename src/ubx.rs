//! UBX binary message decoding for the ESF inertial class.
//!
//! Only ESF-MEAS (raw sensor measurements) and ESF-ALG (computed attitude)
//! are decoded; every other class/id combination is ignored. No field is
//! extracted from a frame until its checksum verifies.
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::SCALE_DENOM;

/// UBX message class for the external sensor fusion messages.
pub const CLASS_ESF: u8 = 0x10;
/// ESF-MEAS message id.
pub const ID_MEAS: u8 = 0x02;
/// ESF-ALG message id.
pub const ID_ALG: u8 = 0x14;

/// Smallest decodable frame: sync, class, id, length, empty payload, checksum.
const MIN_FRAME_LEN: usize = 8;
/// Offset of the first ESF payload data record (frame header + 8 payload
/// header bytes).
const DATA_OFFSET: usize = 14;

/// The UBX running-sum checksum over `data`.
///
/// Both accumulators are 8-bit sums mod 256; CK_B additionally accumulates
/// CK_A after every byte. On the wire the checksum covers class, id, length,
/// and payload, i.e. frame bytes `2..len-2`.
#[must_use]
pub fn checksum(data: &[u8]) -> (u8, u8) {
    let mut ck_a: u8 = 0;
    let mut ck_b: u8 = 0;
    for &b in data {
        ck_a = ck_a.wrapping_add(b);
        ck_b = ck_b.wrapping_add(ck_a);
    }
    (ck_a, ck_b)
}

/// Validate frame length consistency and the trailing checksum, returning
/// the declared payload length.
fn verify_frame(data: &[u8]) -> Option<usize> {
    if data.len() < MIN_FRAME_LEN {
        debug!(len = data.len(), "dropping short ubx frame");
        return None;
    }
    let declared = u16::from_le_bytes([data[4], data[5]]) as usize;
    let end = 6 + declared;
    if data.len() < end + 2 {
        debug!(
            len = data.len(),
            declared, "dropping ubx frame shorter than its declared length"
        );
        return None;
    }
    let (ck_a, ck_b) = checksum(&data[2..end]);
    if [ck_a, ck_b] != data[end..end + 2] {
        debug!(
            expected = %format!("{ck_a:02x}{ck_b:02x}"),
            "dropping ubx frame with checksum mismatch"
        );
        return None;
    }
    Some(declared)
}

/// Sign-extend a 3-byte little-endian field to i32.
fn signed24(bytes: &[u8]) -> i32 {
    let raw = u32::from(bytes[0]) | u32::from(bytes[1]) << 8 | u32::from(bytes[2]) << 16;
    ((raw << 8) as i32) >> 8
}

/// Raw inertial measurements from ESF-MEAS, scaled by 1/1024.
///
/// A frame only carries the channels the sensor sampled; channels not
/// present in a frame retain their previous value, so a reader sampling this
/// record can observe stale axes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct EsfMeas {
    pub accel_x: Option<f64>,
    pub accel_y: Option<f64>,
    pub accel_z: Option<f64>,
    pub gyro_x: Option<f64>,
    pub gyro_y: Option<f64>,
    pub gyro_z: Option<f64>,
}

impl EsfMeas {
    fn decode(&mut self, data: &[u8], declared: usize) -> bool {
        if declared < 8 {
            debug!(declared, "dropping esf-meas with short payload");
            return false;
        }
        // Measurement count is the top 5 bits of the second flags byte.
        let num_meas = usize::from(data[11] >> 3);
        if declared < 8 + 4 * num_meas {
            debug!(num_meas, declared, "dropping esf-meas with truncated samples");
            return false;
        }
        for i in 0..num_meas {
            let rec = &data[DATA_OFFSET + 4 * i..DATA_OFFSET + 4 * i + 4];
            let value = f64::from(signed24(&rec[..3])) / SCALE_DENOM;
            match rec[3] & 0x3f {
                14 => self.gyro_x = Some(value),
                13 => self.gyro_y = Some(value),
                5 => self.gyro_z = Some(value),
                16 => self.accel_x = Some(value),
                17 => self.accel_y = Some(value),
                18 => self.accel_z = Some(value),
                0 => debug!("esf-meas sample carries no data"),
                other => debug!(data_type = other, "ignoring unknown esf-meas data type"),
            }
        }
        true
    }
}

/// IMU alignment angles from ESF-ALG, scaled by 1/1024.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct EsfAlg {
    pub yaw: Option<f64>,
    pub pitch: Option<f64>,
    pub roll: Option<f64>,
}

impl EsfAlg {
    /// Payload bytes the fixed yaw/pitch/roll segment requires.
    const MIN_PAYLOAD: usize = 16;

    fn decode(&mut self, data: &[u8], declared: usize) -> bool {
        if declared < Self::MIN_PAYLOAD {
            debug!(declared, "dropping esf-alg with short payload");
            return false;
        }
        let seg = &data[DATA_OFFSET..DATA_OFFSET + 8];
        let yaw = i32::from_le_bytes([seg[0], seg[1], seg[2], seg[3]]);
        let pitch = i16::from_le_bytes([seg[4], seg[5]]);
        let roll = i16::from_le_bytes([seg[6], seg[7]]);
        self.yaw = Some(f64::from(yaw) / SCALE_DENOM);
        self.pitch = Some(f64::from(pitch) / SCALE_DENOM);
        self.roll = Some(f64::from(roll) / SCALE_DENOM);
        true
    }
}

/// Which record a frame updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    Meas,
    Alg,
}

/// Decodes ESF-MEAS and ESF-ALG frames into in-place records.
#[derive(Debug, Default)]
pub struct UbxDecoder {
    pub meas: EsfMeas,
    pub alg: EsfAlg,
}

impl UbxDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one binary frame, `data` starting at the sync marker.
    ///
    /// Returns which record was updated, or `None` for ignored and dropped
    /// frames. Frames failing length or checksum validation mutate nothing.
    pub fn decode(&mut self, data: &[u8]) -> Option<Message> {
        let declared = verify_frame(data)?;
        let (class, id) = (data[2], data[3]);
        if class != CLASS_ESF {
            debug!(class, id, "ignoring ubx frame outside the esf class");
            return None;
        }
        match id {
            ID_MEAS => self.meas.decode(data, declared).then_some(Message::Meas),
            ID_ALG => self.alg.decode(data, declared).then_some(Message::Alg),
            _ => {
                debug!(id, "ignoring unsupported esf message id");
                None
            }
        }
    }
}
