//! Per-tile subtraction engine.
//!
//! One engine owns all state for one tile: two pipeline models (stable
//! and incremental), the persistence dwell map and the sampling
//! schedules. The engine is confined to a single worker thread; nothing
//! in here is shared.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::hsv;
use crate::model::PipelineState;
use crate::{Config, Error, Result, TryVec, FOREGROUND_LABEL, PERSISTENCE_LABEL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Driver {
    Stable,
    Incremental,
}

enum Outcome {
    /// No committed modes for this pixel.
    NoModel,
    /// Matched a plain background mode.
    Background,
    /// Matched a foreground-origin mode.
    Persistence,
    /// Matched nothing.
    Foreground,
}

fn chebyshev(a: [u8; 3], b: [u8; 3]) -> i32 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| (i32::from(x) - i32::from(y)).abs())
        .max()
        .unwrap_or(0)
}

/// Background subtraction state for one tile.
pub(crate) struct TileEngine {
    num_pixels: usize,

    fg_threshold: i32,
    association_threshold: u32,
    sampling_period_ms: f64,
    inc_sampling_period_ms: f64,
    min_bin_height: u32,
    num_samples: u32,
    persistence_period_ms: f64,
    alpha: f32,
    beta: f32,
    tau_s: u8,
    tau_h: u8,
    preserve_displaced: bool,

    stable: PipelineState,
    incremental: PipelineState,
    dwell: TryVec<f64>,
    hsv: TryVec<[u8; 3]>,
    bg_tile: TryVec<u8>,

    timestamp_ms: f64,
    prev_timestamp_ms: f64,
    prev_stable_sample_ms: f64,
    prev_inc_sample_ms: f64,
    stable_counter: u32,
    inc_counter: u32,
    inc_window: u32,
    incremental_active: bool,
    stable_ready: bool,
    incremental_ready: bool,
    loaded: bool,
}

impl TileEngine {
    pub(crate) fn new(cfg: &Config, num_pixels: usize) -> Result<TileEngine> {
        let window = cfg.num_samples as usize;
        let max_modes = cfg.max_modes() as usize;
        Ok(TileEngine {
            num_pixels,
            fg_threshold: cfg.fg_threshold as i32,
            association_threshold: cfg.association_threshold,
            sampling_period_ms: cfg.sampling_period_ms,
            inc_sampling_period_ms: cfg.incremental_sampling_period_ms(),
            min_bin_height: cfg.min_bin_height,
            num_samples: cfg.num_samples,
            persistence_period_ms: cfg.persistence_period_ms,
            alpha: cfg.alpha,
            beta: cfg.beta,
            tau_s: cfg.tau_s,
            tau_h: cfg.tau_h,
            preserve_displaced: cfg.preserve_displaced_mode,
            stable: PipelineState::new(num_pixels, window, max_modes)?,
            incremental: PipelineState::new(num_pixels, window, max_modes)?,
            dwell: crate::model::try_filled(0.0, num_pixels)?,
            hsv: crate::model::try_filled([0; 3], num_pixels)?,
            bg_tile: crate::model::try_filled(0, num_pixels * 3)?,
            timestamp_ms: 0.0,
            prev_timestamp_ms: 0.0,
            prev_stable_sample_ms: 0.0,
            prev_inc_sample_ms: 0.0,
            stable_counter: 0,
            inc_counter: 0,
            inc_window: cfg.incremental_num_samples().min(cfg.num_samples),
            incremental_active: true,
            stable_ready: false,
            incremental_ready: false,
            loaded: false,
        })
    }

    /// Install an externally loaded stable model. `rows` yields the mode
    /// colors of every tile pixel in row-major order. Disables the
    /// incremental pipeline for the lifetime of the engine.
    pub(crate) fn preload<'a, I>(&mut self, rows: I)
    where
        I: IntoIterator<Item = &'a [[u8; 3]]>,
    {
        for (p, values) in rows.into_iter().enumerate() {
            self.stable.preload(p, values, self.min_bin_height);
            if let Some(value) = values.first() {
                self.bg_tile[p * 3..p * 3 + 3].copy_from_slice(value);
            }
        }
        self.stable_ready = true;
        self.incremental_active = false;
        self.loaded = true;
    }

    #[cfg(test)]
    pub(crate) fn stable(&self) -> &PipelineState {
        &self.stable
    }

    #[cfg(test)]
    pub(crate) fn incremental(&self) -> &PipelineState {
        &self.incremental
    }

    /// Committed stable modes per pixel, for the model writer.
    pub(crate) fn export(&self) -> Vec<Vec<[u8; 3]>> {
        (0..self.num_pixels)
            .map(|p| {
                let end = self.stable.committed(p);
                self.stable.modes(p)[..end]
                    .iter()
                    .take_while(|m| m.valid)
                    .map(|m| m.value)
                    .collect()
            })
            .collect()
    }

    /// Run one frame through the tile: classify, suppress shadows, update
    /// persistence, then feed the samplers. `pixels` is the packed BGR
    /// tile, `mask` and `bg_out` are tile-sized outputs.
    pub(crate) fn process(
        &mut self,
        pixels: &[u8],
        timestamp_ms: f64,
        mask: &mut [u8],
        bg_out: &mut [u8],
    ) -> Result<()> {
        debug_assert_eq!(pixels.len(), self.num_pixels * 3);
        debug_assert_eq!(mask.len(), self.num_pixels);
        mask.fill(0);
        self.prev_timestamp_ms = self.timestamp_ms;
        self.timestamp_ms = timestamp_ms;

        let driver = if self.incremental_active && self.incremental_ready {
            Some(Driver::Incremental)
        } else if self.stable_ready {
            Some(Driver::Stable)
        } else {
            None
        };

        if let Some(driver) = driver {
            hsv::convert_tile(pixels, &mut self.hsv);
            self.classify(driver, pixels, mask);
            let pipeline = match driver {
                Driver::Stable => &self.stable,
                Driver::Incremental => &self.incremental,
            };
            hsv::suppress(mask, &self.hsv, pipeline, self.tau_h, self.tau_s, self.alpha, self.beta);

            let hard_fg = mask.iter().filter(|&&l| l == FOREGROUND_LABEL).count();
            if hard_fg * 2 > self.num_pixels && !self.incremental_active && !self.loaded {
                debug!("tile mostly foreground, re-activating the incremental model");
                self.incremental_active = true;
            }
        }

        self.update_models(pixels, mask)?;
        bg_out.copy_from_slice(&self.bg_tile);
        Ok(())
    }

    fn classify(&mut self, driver: Driver, pixels: &[u8], mask: &mut [u8]) {
        let track_persistence = driver == Driver::Stable;
        let dt = self.timestamp_ms - self.prev_timestamp_ms;
        for p in 0..self.num_pixels {
            let px = [pixels[p * 3], pixels[p * 3 + 1], pixels[p * 3 + 2]];
            let outcome = {
                let pipeline = match driver {
                    Driver::Stable => &self.stable,
                    Driver::Incremental => &self.incremental,
                };
                let end = pipeline.committed(p);
                if end == 0 {
                    Outcome::NoModel
                } else {
                    let modes = pipeline.modes(p);
                    match modes[..end]
                        .iter()
                        .find(|m| chebyshev(px, m.value) < self.fg_threshold)
                    {
                        Some(mode) if mode.is_fg => Outcome::Persistence,
                        Some(_) => Outcome::Background,
                        None => Outcome::Foreground,
                    }
                }
            };
            match outcome {
                Outcome::Foreground => {
                    mask[p] = FOREGROUND_LABEL;
                    if track_persistence {
                        self.dwell[p] = 0.0;
                    }
                }
                Outcome::Persistence => {
                    mask[p] = PERSISTENCE_LABEL;
                    if track_persistence {
                        self.dwell[p] += dt;
                        if self.dwell[p] > self.persistence_period_ms {
                            self.stable.absorb(p);
                        }
                    }
                }
                Outcome::Background | Outcome::NoModel => {
                    if track_persistence {
                        self.dwell[p] = 0.0;
                    }
                }
            }
        }
    }

    /// Drive both sampling schedules. A window commits on the frame after
    /// its last sample, regardless of the sampling period.
    fn update_models(&mut self, pixels: &[u8], mask: &[u8]) -> Result<()> {
        if self.prev_stable_sample_ms > self.timestamp_ms {
            self.prev_stable_sample_ms = self.timestamp_ms;
        }
        if self.stable_counter == self.num_samples - 1 {
            self.commit_stable()?;
            self.stable_counter = 0;
        } else if self.timestamp_ms - self.prev_stable_sample_ms >= self.sampling_period_ms {
            self.prev_stable_sample_ms = self.timestamp_ms;
            let s = self.stable_counter;
            for p in 0..self.num_pixels {
                let px = [pixels[p * 3], pixels[p * 3 + 1], pixels[p * 3 + 2]];
                // Only hard foreground marks a stable bin as
                // foreground-origin; shadow and persistence do not.
                let fg = mask[p] == FOREGROUND_LABEL;
                self.stable.observe(p, px, s, fg, self.association_threshold);
            }
            self.stable_counter += 1;
        }

        if self.incremental_active && !self.loaded {
            if self.prev_inc_sample_ms > self.timestamp_ms {
                self.prev_inc_sample_ms = self.timestamp_ms;
            }
            if self.inc_counter == self.inc_window - 1 {
                self.commit_incremental()?;
                self.inc_counter = 0;
            } else if self.timestamp_ms - self.prev_inc_sample_ms >= self.inc_sampling_period_ms {
                self.prev_inc_sample_ms = self.timestamp_ms;
                let s = self.inc_counter;
                for p in 0..self.num_pixels {
                    let px = [pixels[p * 3], pixels[p * 3 + 1], pixels[p * 3 + 2]];
                    // Any non-background label counts for the coarse model.
                    let fg = mask[p] != 0;
                    self.incremental.observe(p, px, s, fg, self.association_threshold);
                }
                self.inc_counter += 1;
            }
        }
        Ok(())
    }

    fn commit_stable(&mut self) -> Result<()> {
        if self.stable_counter == 0 {
            return Err(Error::SampleStarvation);
        }
        for p in 0..self.num_pixels {
            self.stable.commit(p, self.min_bin_height, self.preserve_displaced);
        }
        self.dwell.fill(0.0);
        if self.incremental_active {
            self.bg_tile.fill(0);
        }
        self.refresh_bg_tile(Driver::Stable);
        self.stable_ready = true;
        self.incremental_active = false;
        debug!("new stable background model");
        Ok(())
    }

    fn commit_incremental(&mut self) -> Result<()> {
        if self.inc_counter == 0 {
            return Err(Error::SampleStarvation);
        }
        for p in 0..self.num_pixels {
            self.incremental.commit(p, self.min_bin_height, self.preserve_displaced);
        }
        self.inc_window = (self.inc_window * 2).min(self.num_samples);
        self.refresh_bg_tile(Driver::Incremental);
        self.incremental_ready = true;
        debug!("new incremental background model, next window {}", self.inc_window);
        Ok(())
    }

    fn refresh_bg_tile(&mut self, driver: Driver) {
        let pipeline = match driver {
            Driver::Stable => &self.stable,
            Driver::Incremental => &self.incremental,
        };
        for p in 0..self.num_pixels {
            if let Some(value) = pipeline.mode0(p) {
                self.bg_tile[p * 3..p * 3 + 3].copy_from_slice(&value);
            }
        }
    }
}
