// Licensed under the Apache License, Version 2.0
// Copyright 2025 Anton Khrustalev, creapunk.com

//! Clarke / Park reference-frame transforms on Q24 per-unit values.

use crate::math_integer::iq::{iq, mpy, Iq};

/// Precalculated 1/sqrt(3) in Q24.
const INV_SQRT3: Iq = iq(0.5773502691896258);
/// Precalculated 1/3 in Q24.
const ONE_THIRD: Iq = iq(0.3333333333333333);
/// Precalculated sqrt(3)/2 in Q24.
const SQRT3_DIV2: Iq = iq(0.8660254037844386);

/// Clarke transform from three measured phases.
///
/// Amplitude-invariant form: alpha = (2a - b - c)/3, beta = (b - c)/sqrt(3).
#[inline]
pub fn clarke3(a: Iq, b: Iq, c: Iq) -> (Iq, Iq) {
    let alpha = mpy(ONE_THIRD, 2 * a - b - c);
    let beta = mpy(INV_SQRT3, b - c);
    (alpha, beta)
}

/// Clarke transform from two measured phases, relying on a + b + c == 0.
/// Used when the board populates only two current sensors.
#[inline]
pub fn clarke2(a: Iq, b: Iq) -> (Iq, Iq) {
    let alpha = a;
    let beta = mpy(INV_SQRT3, a + 2 * b);
    (alpha, beta)
}

/// Park transform: stationary alpha/beta into the rotating d/q frame.
#[inline]
pub fn park(sin: Iq, cos: Iq, alpha: Iq, beta: Iq) -> (Iq, Iq) {
    let d = mpy(cos, alpha) + mpy(sin, beta);
    let q = mpy(cos, beta) - mpy(sin, alpha);
    (d, q)
}

/// Inverse Park transform: rotating d/q back to stationary alpha/beta.
#[inline]
pub fn inverse_park(sin: Iq, cos: Iq, d: Iq, q: Iq) -> (Iq, Iq) {
    let alpha = mpy(cos, d) - mpy(sin, q);
    let beta = mpy(sin, d) + mpy(cos, q);
    (alpha, beta)
}

/// Inverse Clarke transform: alpha/beta to three phase values.
#[inline]
pub fn inverse_clarke(alpha: Iq, beta: Iq) -> (Iq, Iq, Iq) {
    let beta_sqrt3_div2 = mpy(SQRT3_DIV2, beta);
    let a = alpha;
    let b = -(alpha >> 1) + beta_sqrt3_div2;
    let c = -(alpha >> 1) - beta_sqrt3_div2;
    (a, b, c)
}
