#![doc = include_str!("../README.md")]

mod bytes;
mod error;

pub mod dispatch;
pub mod nmea;
pub mod ntrip;
pub mod synchronizer;
pub mod ubx;

pub use error::{Error, Result};

/// Fixed-point denominator for UBX ESF sensor values.
pub const SCALE_DENOM: f64 = 1024.0;
