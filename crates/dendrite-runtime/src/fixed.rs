//! Fixed-point arithmetic helpers.
//!
//! Stored values are `i32` with a per-variable exponent: the power-of-two
//! position of the most significant bit of the represented magnitude. A
//! value `v` with exponent `e` represents `v * 2^(e - MSB)`.
//!
//! Multiplication of operands with exponents `a` and `b` yields a raw
//! result of exponent `a + b - MSB`; generated code shifts by
//! `raw - target` to land on the declared exponent. Division reverses the
//! relation. Addition and subtraction require matched exponents and are
//! plain integer ops.

/// Bit position of the most significant magnitude bit in an `i32`.
pub const MSB: i32 = 30;

/// Arithmetic shift that accepts either direction.
#[inline]
pub fn shift(value: i64, amount: i32) -> i64 {
    if amount >= 0 {
        value << amount
    } else {
        value >> -amount
    }
}

/// `a * b`, with the result shifted from raw exponent `a_exp + b_exp - MSB`
/// onto `result_exp`.
#[inline]
pub fn multiply(a: i32, b: i32, raw_minus_result: i32) -> i32 {
    shift(a as i64 * b as i64, raw_minus_result) as i32
}

/// `a / b`, with the result shifted onto the target exponent.
/// The numerator is pre-shifted to preserve precision. Division by zero
/// saturates rather than trapping.
#[inline]
pub fn divide(a: i32, b: i32, shift_amount: i32) -> i32 {
    if b == 0 {
        return if a >= 0 { i32::MAX } else { i32::MIN };
    }
    let numerator = shift(a as i64, shift_amount.max(0));
    let q = numerator / b as i64;
    shift(q, shift_amount.min(0)) as i32
}

/// Convert a real constant to its fixed representation under `exponent`.
#[inline]
pub fn from_f64(value: f64, exponent: i32) -> i32 {
    (value * 2f64.powi(MSB - exponent)).round() as i32
}

/// Convert a stored fixed value back to a real number.
#[inline]
pub fn to_f64(value: i32, exponent: i32) -> f64 {
    value as f64 * 2f64.powi(exponent - MSB)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let x = from_f64(0.75, 0);
        assert!((to_f64(x, 0) - 0.75).abs() < 1e-8);
    }

    #[test]
    fn multiply_aligns_exponents() {
        // 0.5 (exp 0) * 0.5 (exp 0) = 0.25, stored at exp 0.
        let a = from_f64(0.5, 0);
        let b = from_f64(0.5, 0);
        // raw exponent = 0 + 0 - MSB; align to target exponent 0.
        let raw = 0 + 0 - MSB;
        let product = multiply(a, b, raw - 0);
        assert!((to_f64(product, 0) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn divide_by_zero_saturates() {
        assert_eq!(divide(5, 0, 10), i32::MAX);
        assert_eq!(divide(-5, 0, 10), i32::MIN);
    }

    #[test]
    fn signed_shift() {
        assert_eq!(shift(8, 2), 32);
        assert_eq!(shift(8, -2), 2);
    }
}
