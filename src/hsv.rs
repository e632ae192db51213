//! BGR to HSV conversion and shadow/highlight suppression.
//!
//! Hue is scaled to the full 0..=255 byte range rather than the usual
//! 0..180, so circular hue distances stay in byte arithmetic.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::model::PipelineState;
use crate::{FOREGROUND_LABEL, SHADOW_LABEL};

const BYTE_TO_FLOAT: f32 = 1.0 / 255.0;
const HUE_GREEN: f32 = 2.0 / 6.0;
const HUE_BLUE: f32 = 4.0 / 6.0;

fn clip_byte(v: f32) -> u8 {
    let v = (0.5 + v * 255.0) as i32;
    v.clamp(0, 255) as u8
}

/// Convert one BGR triple to HSV with all three channels in 0..=255.
pub(crate) fn bgr_to_hsv(bgr: [u8; 3]) -> [u8; 3] {
    let [b, g, r] = bgr;
    let fb = f32::from(b) * BYTE_TO_FLOAT;
    let fg = f32::from(g) * BYTE_TO_FLOAT;
    let fr = f32::from(r) * BYTE_TO_FLOAT;

    let max = b.max(g).max(r);
    let min = b.min(g).min(r);
    let fmax = f32::from(max) * BYTE_TO_FLOAT;
    let fmin = f32::from(min) * BYTE_TO_FLOAT;
    let delta = fmax - fmin;

    let value = fmax;
    let (hue, saturation) = if max == 0 {
        // pure black, hue undefined
        (0.0, 0.0)
    } else {
        let saturation = delta / fmax;
        let hue = if delta == 0.0 {
            0.0
        } else {
            let angle_to_unit = 1.0 / (6.0 * delta);
            let mut h = if max == r {
                (fg - fb) * angle_to_unit
            } else if max == g {
                HUE_GREEN + (fb - fr) * angle_to_unit
            } else {
                HUE_BLUE + (fr - fg) * angle_to_unit
            };
            // wrap outlier hues around the circle
            if h < 0.0 {
                h += 1.0;
            }
            if h >= 1.0 {
                h -= 1.0;
            }
            h
        };
        (hue, saturation)
    };

    [clip_byte(hue), clip_byte(saturation), clip_byte(value)]
}

/// Fill `out` with the HSV conversion of a packed BGR pixel run.
pub(crate) fn convert_tile(pixels: &[u8], out: &mut [[u8; 3]]) {
    for (hsv, bgr) in out.iter_mut().zip(pixels.chunks_exact(3)) {
        *hsv = bgr_to_hsv([bgr[0], bgr[1], bgr[2]]);
    }
}

/// Circular distance between two byte-scaled hues.
fn hue_distance(a: u8, b: u8) -> i32 {
    let d = (i32::from(a) - i32::from(b)).abs();
    d.min(255 - d)
}

/// Relabel foreground pixels as shadow when they match a mode in HSV
/// space.
///
/// A candidate pixel is compared against each committed mode that is not
/// foreground-origin; it becomes shadow when the hue and saturation
/// differences stay within `tau_h`/`tau_s` and the brightness ratio lies
/// in `[alpha, beta)`. A candidate with no comparable mode keeps its
/// foreground label.
pub(crate) fn suppress(
    mask: &mut [u8],
    hsv: &[[u8; 3]],
    pipeline: &PipelineState,
    tau_h: u8,
    tau_s: u8,
    alpha: f32,
    beta: f32,
) {
    for (p, label) in mask.iter_mut().enumerate() {
        if *label != FOREGROUND_LABEL {
            continue;
        }
        let [h_i, s_i, v_i] = hsv[p];
        let end = pipeline.committed(p);
        let modes = pipeline.modes(p);
        for mode in &modes[..end] {
            if !mode.valid {
                break;
            }
            if mode.is_fg {
                continue;
            }
            let [h_b, s_b, v_b] = bgr_to_hsv(mode.value);
            let h_diff = hue_distance(h_i, h_b);
            let s_diff = (i32::from(s_i) - i32::from(s_b)).abs();
            let v_ratio = f32::from(v_i) / f32::from(v_b);
            if h_diff <= i32::from(tau_h)
                && s_diff <= i32::from(tau_s)
                && v_ratio >= alpha
                && v_ratio < beta
            {
                *label = SHADOW_LABEL;
                break;
            }
        }
    }
}
