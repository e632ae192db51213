//! Per-pixel model storage and the sample binner.
//!
//! Every pixel owns a fixed-capacity run of bins (one sampling window
//! worth) and a fixed-capacity run of committed modes, kept in flat
//! arrays indexed row-major. Bins are transient: they accumulate the
//! samples of the current window and are consumed by [`PipelineState::commit`].

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::{Result, TryVec};

/// A provisional color cluster accumulated during one sampling window.
///
/// `value` is the integer running mean of the associated samples and
/// `height` their count; a bin with `height == 0` is free. Bins are used
/// left to right, so the first free bin marks the end of the occupied
/// prefix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Bin {
    pub value: [u8; 3],
    pub height: u32,
    pub is_fg: bool,
}

/// A committed per-pixel background color hypothesis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Mode {
    pub value: [u8; 3],
    pub valid: bool,
    /// Set when any sample of the source bin was classified foreground;
    /// cleared by persistence absorption.
    pub is_fg: bool,
    /// Bin height at commit time.
    pub counter: u32,
}

/// Bins, modes and committed counts for one pipeline over one tile.
///
/// All storage is allocated once; nothing grows afterwards. The
/// `committed` counts are rewritten only at commit time, so a mid-window
/// resample can never change what the classifier iterates over.
pub(crate) struct PipelineState {
    window: usize,
    max_modes: usize,
    bins: TryVec<Bin>,
    modes: TryVec<Mode>,
    committed: TryVec<u32>,
}

pub(crate) fn try_filled<T: Copy>(value: T, len: usize) -> Result<TryVec<T>> {
    let mut v = TryVec::with_capacity(len)?;
    for _ in 0..len {
        v.push(value)?;
    }
    Ok(v)
}

fn associates(bin: [u8; 3], sample: [u8; 3], threshold: u32) -> bool {
    bin.iter()
        .zip(sample.iter())
        .all(|(&a, &b)| (i32::from(a) - i32::from(b)).unsigned_abs() <= threshold)
}

impl PipelineState {
    pub(crate) fn new(num_pixels: usize, window: usize, max_modes: usize) -> Result<PipelineState> {
        Ok(PipelineState {
            window,
            max_modes,
            bins: try_filled(Bin::default(), num_pixels * window)?,
            modes: try_filled(Mode::default(), num_pixels * max_modes)?,
            committed: try_filled(0, num_pixels)?,
        })
    }

    /// Committed mode count of `p`, frozen at the last commit.
    pub(crate) fn committed(&self, p: usize) -> usize {
        self.committed[p] as usize
    }

    /// All mode slots of `p`, valid prefix first.
    pub(crate) fn modes(&self, p: usize) -> &[Mode] {
        &self.modes[p * self.max_modes..(p + 1) * self.max_modes]
    }

    /// Mode-0 color of `p`, if any mode is committed.
    pub(crate) fn mode0(&self, p: usize) -> Option<[u8; 3]> {
        if self.committed[p] > 0 {
            Some(self.modes[p * self.max_modes].value)
        } else {
            None
        }
    }

    #[cfg(test)]
    pub(crate) fn bins(&self, p: usize) -> &[Bin] {
        &self.bins[p * self.window..(p + 1) * self.window]
    }

    /// Feed one sample into the bins of `p`.
    ///
    /// The first sample of a window resets the pixel's bins. Later
    /// samples join the first bin within `association_threshold` on every
    /// channel, updating its running mean, or occupy the first free bin.
    pub(crate) fn observe(
        &mut self,
        p: usize,
        sample: [u8; 3],
        sample_idx: u32,
        fg: bool,
        association_threshold: u32,
    ) {
        let base = p * self.window;
        let bins = &mut self.bins[base..base + self.window];
        if sample_idx == 0 {
            bins.fill(Bin::default());
            bins[0] = Bin { value: sample, height: 1, is_fg: fg };
            return;
        }
        for bin in bins.iter_mut() {
            if bin.height == 0 {
                *bin = Bin { value: sample, height: 1, is_fg: fg };
                return;
            }
            if associates(bin.value, sample, association_threshold) {
                let den = bin.height + 1;
                for k in 0..3 {
                    bin.value[k] =
                        ((u32::from(bin.value[k]) * bin.height + u32::from(sample[k])) / den) as u8;
                }
                bin.height = den;
                bin.is_fg |= fg;
                return;
            }
        }
        // A window of w samples occupies at most w bins, so an occupied
        // run covering the whole array cannot happen mid-window.
        debug_assert!(false, "no free bin for sample");
    }

    /// Turn the occupied bins of `p` into committed modes.
    ///
    /// Bins shorter than `min_bin_height` are skipped without consuming
    /// an output slot. The tallest qualifying bin ends up in slot 0
    /// (first seen wins on ties). With `preserve_displaced` the record
    /// displaced from slot 0 is copied into the slot being written, as
    /// the reference implementation does; otherwise qualifying bins are
    /// collected in order and the tallest swapped to the front. If more
    /// bins qualify than there are slots, the first `max_modes` are kept
    /// and the committed count drops by one.
    pub(crate) fn commit(&mut self, p: usize, min_bin_height: u32, preserve_displaced: bool) {
        let bin_base = p * self.window;
        let mode_base = p * self.max_modes;
        let mut index = 0;
        let mut tallest: i64 = -1;
        let mut tallest_at = 0;
        let mut overflow = false;
        for s in 0..self.window {
            let bin = self.bins[bin_base + s];
            if bin.height == 0 {
                break;
            }
            if index == self.max_modes {
                overflow = true;
                break;
            }
            if bin.height < min_bin_height {
                continue;
            }
            let fresh = Mode { value: bin.value, valid: true, is_fg: bin.is_fg, counter: bin.height };
            if i64::from(bin.height) > tallest {
                tallest = bin.height.into();
                if preserve_displaced {
                    let displaced = Mode { valid: true, ..self.modes[mode_base] };
                    self.modes[mode_base + index] = displaced;
                    self.modes[mode_base] = fresh;
                } else {
                    tallest_at = index;
                    self.modes[mode_base + index] = fresh;
                }
            } else {
                self.modes[mode_base + index] = fresh;
            }
            index += 1;
        }
        if !preserve_displaced && index > 0 {
            self.modes.swap(mode_base, mode_base + tallest_at);
        }
        let count = if overflow { index - 1 } else { index };
        for slot in count..self.max_modes {
            self.modes[mode_base + slot].valid = false;
        }
        self.committed[p] = count as u32;
    }

    /// Clear the foreground-origin flag on every committed mode of `p`.
    pub(crate) fn absorb(&mut self, p: usize) {
        let base = p * self.max_modes;
        let end = self.committed[p] as usize;
        for mode in self.modes[base..base + end].iter_mut() {
            if !mode.valid {
                break;
            }
            mode.is_fg = false;
        }
    }

    /// Install externally loaded modes for `p`: valid, unflagged,
    /// weighted with `counter`.
    pub(crate) fn preload(&mut self, p: usize, values: &[[u8; 3]], counter: u32) {
        let base = p * self.max_modes;
        for (slot, value) in values.iter().take(self.max_modes).enumerate() {
            self.modes[base + slot] = Mode { value: *value, valid: true, is_fg: false, counter };
        }
        self.committed[p] = values.len().min(self.max_modes) as u32;
    }
}
