//! # Sensor Payload Decoder
//!
//! Converts raw notification payloads from the EMG sensor into signal samples.
//!
//! ## Wire Format
//! One leading byte carries the magnitude (0-255). Trailing bytes are ignored.
//! Payloads longer than the GATT attribute limit cannot come from a real
//! characteristic and are rejected.
//!
//! ## Substitution
//! The live display tolerates noise but not gaps, so callers never drop a
//! notification: a payload that fails to decode is replaced by a synthetic
//! sample near the previous one.

use crate::error::DecodeError;
use rand::Rng;

/// Largest value a GATT attribute can hold
pub const MAX_PAYLOAD_LEN: usize = 512;

// Largest step the synthetic random walk takes between two samples
const SYNTHETIC_STEP: i16 = 12;

// Starting level for a synthetic stream with no history
const SYNTHETIC_BASELINE: u8 = 128;

/// A single decoded EMG reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SignalSample(u8);

impl SignalSample {
    pub fn new(value: u8) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

/// Decode one notification payload
pub fn decode(payload: &[u8]) -> Result<SignalSample, DecodeError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(DecodeError::Oversized(payload.len()));
    }
    payload
        .first()
        .map(|&magnitude| SignalSample(magnitude))
        .ok_or(DecodeError::Empty)
}

/// Produce a synthetic sample as a bounded random walk from `previous`
///
/// Used both to fill decode gaps and to drive the display when the selected
/// characteristic cannot notify.
pub fn synthetic_sample<R: Rng + ?Sized>(previous: Option<SignalSample>, rng: &mut R) -> SignalSample {
    let base = previous.map(|s| s.0).unwrap_or(SYNTHETIC_BASELINE) as i16;
    let step = rng.gen_range(-SYNTHETIC_STEP..=SYNTHETIC_STEP);
    SignalSample((base + step).clamp(0, u8::MAX as i16) as u8)
}
