//! Fahrenheit×10 ⇄ Celsius conversion.
//!
//! The cloud reports every temperature as an integer in tenths of a degree
//! Fahrenheit. Canonical values are Celsius with one decimal:
//! `round((raw / 10 - 32) * 5 / 9, 1)`.
//!
//! Both directions are computed in integer tenths so the result never depends
//! on float representation. Neither direction can produce an exact .5 tie
//! (9 and 5 are odd), so round-half-up and round-half-even agree.

use crate::models::cloud::{Celsius, Temperature};

/// Offset of the Fahrenheit scale, in tenths of a degree.
const FREEZING_F10: i64 = 320;

fn round_div(numerator: i64, denominator: i64) -> i64 {
    let q = numerator.div_euclid(denominator);
    let r = numerator.rem_euclid(denominator);
    if 2 * r >= denominator { q + 1 } else { q }
}

/// Decode a raw cloud value (°F × 10) into canonical Celsius. `None` when
/// the result does not fit a [`Celsius`].
pub fn decode(raw: i64) -> Option<Celsius> {
    let scaled = raw.checked_sub(FREEZING_F10)?.checked_mul(5)?;
    let tenths = i32::try_from(round_div(scaled, 9)).ok()?;
    Some(Celsius::from_tenths(tenths))
}

/// Encode canonical Celsius into the cloud representation (°F × 10).
pub fn encode(celsius: Celsius) -> i64 {
    // i32 tenths widened to i64 cannot overflow here.
    round_div(celsius.tenths() as i64 * 9, 5) + FREEZING_F10
}

/// Decode and keep the raw value alongside, for diagnostics.
pub fn reading(raw: i64) -> Option<Temperature> {
    Some(Temperature {
        celsius: decode(raw)?,
        raw,
    })
}

/// Plain Fahrenheit for a canonical value.
pub fn to_fahrenheit(celsius: Celsius) -> f64 {
    celsius.as_f64() * 9.0 / 5.0 + 32.0
}
