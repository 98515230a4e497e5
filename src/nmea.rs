//! NMEA sentence decoding for the GGA and VTG formatters.
//!
//! A live receiver interleaves good and bad sentences, so nothing in here
//! surfaces an error to the caller: sentences that are short, malformed, or
//! fail the checksum are dropped with a log record and decoding continues
//! with the next frame.
use std::fmt;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Quality indicator from GGA field 6.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixQuality {
    NoFix,
    Fix2d3d,
    RtkFixed,
    RtkFloat,
    DrFixed,
    Unknown,
}

impl FixQuality {
    #[must_use]
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => FixQuality::NoFix,
            1 | 2 => FixQuality::Fix2d3d,
            4 => FixQuality::RtkFixed,
            5 => FixQuality::RtkFloat,
            6 => FixQuality::DrFixed,
            _ => FixQuality::Unknown,
        }
    }
}

impl fmt::Display for FixQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FixQuality::NoFix => "No fix",
            FixQuality::Fix2d3d => "2D/3D fix",
            FixQuality::RtkFixed => "RTK fixed",
            FixQuality::RtkFloat => "RTK float",
            FixQuality::DrFixed => "DR fixed",
            FixQuality::Unknown => "Unknown quality",
        })
    }
}

/// Mode indicator from VTG field 9 (NMEA 2.3 and later).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionMode {
    NoFix,
    DrFixed,
    Fix2d3d,
    RtkFloat,
    RtkFixed,
    Unknown,
}

impl PositionMode {
    #[must_use]
    pub fn from_char(c: char) -> Self {
        match c {
            'N' => PositionMode::NoFix,
            'E' => PositionMode::DrFixed,
            'A' | 'D' => PositionMode::Fix2d3d,
            'F' => PositionMode::RtkFloat,
            'R' => PositionMode::RtkFixed,
            _ => PositionMode::Unknown,
        }
    }
}

impl fmt::Display for PositionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PositionMode::NoFix => "No fix",
            PositionMode::DrFixed => "DR fixed",
            PositionMode::Fix2d3d => "2D/3D fix",
            PositionMode::RtkFloat => "RTK float",
            PositionMode::RtkFixed => "RTK fixed",
            PositionMode::Unknown => "Unknown mode",
        })
    }
}

/// Convert a ddmm.mmmm / dddmm.mmmm coordinate with its hemisphere into
/// signed decimal degrees.
///
/// Latitude carries a 2-digit degree prefix, longitude a 3-digit one; the
/// hemisphere letter tells which applies. Southern and western coordinates
/// come out negative.
#[must_use]
pub fn to_decimal_degrees(degrees_minutes: &str, hemisphere: &str) -> Option<f64> {
    let digits = match hemisphere {
        "N" | "S" => 2,
        "E" | "W" => 3,
        _ => return None,
    };
    if degrees_minutes.len() <= digits || !degrees_minutes.is_char_boundary(digits) {
        return None;
    }
    let degrees: f64 = degrees_minutes[..digits].parse().ok()?;
    let minutes: f64 = degrees_minutes[digits..].parse().ok()?;
    let decimal = degrees + minutes / 60.0;
    match hemisphere {
        "S" | "W" => Some(-decimal),
        _ => Some(decimal),
    }
}

/// Convert an `HHMMSS[.sss]` UTC field into a time of day, with the
/// fractional part padded to millisecond resolution.
#[must_use]
pub fn to_utc_time(time_str: &str) -> Option<NaiveTime> {
    if time_str.len() < 6 || !time_str.is_ascii() {
        return None;
    }
    let hours: u32 = time_str[0..2].parse().ok()?;
    let minutes: u32 = time_str[2..4].parse().ok()?;
    let seconds: u32 = time_str[4..6].parse().ok()?;
    let millis: u32 = match time_str.split_once('.') {
        Some((_, frac)) if !frac.is_empty() => {
            let padded = format!("{frac:0<3}");
            padded[..3].parse().ok()?
        }
        _ => 0,
    };
    NaiveTime::from_hms_milli_opt(hours, minutes, seconds, millis)
}

/// XOR checksum over the sentence body (the bytes between `$` and `*`).
#[must_use]
pub fn sentence_checksum(body: &[u8]) -> u8 {
    body.iter().fold(0, |acc, b| acc ^ b)
}

/// Verify the `*HH` checksum trailer when one is present. Sentences without
/// a trailer pass, matching receivers that omit it.
fn checksum_ok(sentence: &str) -> bool {
    let Some((body, trailer)) = sentence[1..].split_once('*') else {
        return true;
    };
    let Ok(want) = u8::from_str_radix(trailer.get(..2).unwrap_or(""), 16) else {
        return false;
    };
    sentence_checksum(body.as_bytes()) == want
}

/// Global positioning fix data decoded from a GGA sentence.
///
/// Every field is optional: absent until the first successful decode and
/// empty wire fields stay `None`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct GgaFix {
    /// UTC time of day of the fix.
    pub time: Option<NaiveTime>,
    /// Latitude in signed decimal degrees.
    pub lat: Option<f64>,
    /// Longitude in signed decimal degrees.
    pub lon: Option<f64>,
    pub quality: Option<FixQuality>,
    pub num_satellites: Option<u8>,
    /// Horizontal dilution of precision.
    pub hdop: Option<f64>,
    /// Altitude above mean sea level, meters.
    pub altitude: Option<f64>,
    /// Geoid separation, meters.
    pub geoid_sep: Option<f64>,
    /// Age of differential corrections, seconds.
    pub diff_age: Option<f64>,
    /// Id of the station providing differential corrections.
    pub diff_station: Option<String>,
}

impl GgaFix {
    /// Address element plus the 14 data fields the decode reads.
    pub const MIN_FIELDS: usize = 15;

    fn from_fields(fields: &[&str]) -> Option<Self> {
        if fields.len() < Self::MIN_FIELDS {
            return None;
        }
        Some(GgaFix {
            time: to_utc_time(fields[1]),
            lat: to_decimal_degrees(fields[2], fields[3]),
            lon: to_decimal_degrees(fields[4], fields[5]),
            quality: fields[6].parse::<u8>().ok().map(FixQuality::from_code),
            num_satellites: fields[7].parse().ok(),
            hdop: fields[8].parse().ok(),
            altitude: fields[9].parse().ok(),
            geoid_sep: fields[11].parse().ok(),
            diff_age: fields[13].parse().ok(),
            diff_station: (!fields[14].is_empty()).then(|| fields[14].to_owned()),
        })
    }
}

/// Course and speed over ground decoded from a VTG sentence.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct VtgVector {
    /// Course over ground, true, degrees.
    pub cog_true: Option<f64>,
    /// Course over ground, magnetic, degrees.
    pub cog_magnetic: Option<f64>,
    pub sog_knots: Option<f64>,
    pub sog_kmh: Option<f64>,
    pub pos_mode: Option<PositionMode>,
}

impl VtgVector {
    pub const MIN_FIELDS: usize = 9;

    fn from_fields(fields: &[&str]) -> Option<Self> {
        if fields.len() < Self::MIN_FIELDS {
            return None;
        }
        Some(VtgVector {
            cog_true: fields[1].parse().ok(),
            cog_magnetic: fields[3].parse().ok(),
            sog_knots: fields[5].parse().ok(),
            sog_kmh: fields[7].parse().ok(),
            // Mode is only present from NMEA 2.3 on
            pos_mode: fields
                .get(9)
                .and_then(|f| f.chars().next())
                .map(PositionMode::from_char),
        })
    }
}

/// Which record a sentence updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentence {
    Gga,
    Vtg,
}

/// Decodes GGA and VTG sentences into in-place records.
///
/// Any other sentence formatter is ignored.
#[derive(Debug, Default)]
pub struct NmeaDecoder {
    pub gga: GgaFix,
    pub vtg: VtgVector,
}

impl NmeaDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one sentence frame, updating the matching record wholesale.
    ///
    /// Returns which record was updated, or `None` when the frame was
    /// ignored or dropped. A dropped sentence never partially mutates a
    /// record.
    pub fn decode(&mut self, data: &[u8]) -> Option<Sentence> {
        let Ok(sentence) = std::str::from_utf8(data) else {
            debug!("dropping non-ascii nmea frame");
            return None;
        };
        let sentence = sentence.trim_end_matches(['\r', '\n']);
        if !sentence.starts_with('$') || sentence.len() < 6 {
            debug!(len = sentence.len(), "dropping short nmea frame");
            return None;
        }
        if !checksum_ok(sentence) {
            debug!(sentence, "dropping nmea sentence with bad checksum");
            return None;
        }

        // Fields are split with the checksum trailer stripped; the address
        // element ("$GNGGA") stays at index 0 so wire field numbering holds.
        let body = sentence.split('*').next().unwrap_or(sentence);
        let fields: Vec<&str> = body.split(',').collect();

        match sentence.get(3..6)? {
            "GGA" => match GgaFix::from_fields(&fields) {
                Some(gga) => {
                    self.gga = gga;
                    Some(Sentence::Gga)
                }
                None => {
                    debug!(fields = fields.len(), "dropping truncated gga sentence");
                    None
                }
            },
            "VTG" => match VtgVector::from_fields(&fields) {
                Some(vtg) => {
                    self.vtg = vtg;
                    Some(Sentence::Vtg)
                }
                None => {
                    debug!(fields = fields.len(), "dropping truncated vtg sentence");
                    None
                }
            },
            formatter => {
                debug!(formatter, "ignoring unsupported sentence formatter");
                None
            }
        }
    }
}
