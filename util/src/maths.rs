//! Utility maths functions

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use num_traits::Float;

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Limit a value to the range `[min, max]`.
///
/// Unlike `f64::clamp` a `NaN` input does not propagate, it is mapped onto `min`. For an
/// acceleration demand this means that an undefined demand becomes the strongest allowed braking.
pub fn saturate<T>(value: T, min: T, max: T) -> T
where
    T: Float
{
    if value.is_nan() {
        return min
    }

    if value > max {
        max
    }
    else if value < min {
        min
    }
    else {
        value
    }
}

/// Sign of a value with a dead band, returns -1, 0 or 1.
///
/// Values whose magnitude is below `dead_band` are considered to be zero.
pub fn sign<T>(value: T, dead_band: T) -> i8
where
    T: Float
{
    if value.abs() <= dead_band {
        0
    }
    else if value > T::zero() {
        1
    }
    else {
        -1
    }
}
