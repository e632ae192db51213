//! Module for independent multi-modal background subtraction (IMBS) on
//! fixed-size BGR video streams.
//!
//! Each pixel is modeled as a small set of color modes discovered by
//! binning time-spaced samples of the input, the approach described in
//! Bloisi, Pennisi and Iocchi, "Parallel Multi-modal Background Modeling"
//! (Pattern Recognition Letters). Two models run side by side: a slow,
//! high-quality *stable* model and a coarse *incremental* model that
//! covers the warm-up phase and sudden scene-wide changes. Classification
//! against the committed modes yields a per-pixel mask with four labels:
//! background, shadow/highlight, persistent (stationary) foreground and
//! hard foreground. Frames are split into a grid of tiles, each processed
//! by a dedicated worker thread with fully independent per-pixel state.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#[macro_use]
extern crate log;

use std::io::{BufRead, Write};
use std::time::Instant;

mod engine;
mod hsv;
mod model;
mod pool;
mod snapshot;


use crate::pool::TilePool;

pub(crate) type TryVec<T> = fallible_collections::TryVec<T>;

/// Mask value for pixels that pass the HSV shadow/highlight test.
pub const SHADOW_LABEL: u8 = 80;
/// Mask value for pixels matching a foreground-origin background mode.
pub const PERSISTENCE_LABEL: u8 = 180;
/// Mask value for hard foreground pixels.
pub const FOREGROUND_LABEL: u8 = 255;

/// Describes engine failures.
///
/// This enum wraps the standard `io::Error` type, unified with
/// our own failure states and those of crates we use.
#[derive(Debug)]
pub enum Error {
    /// A frame's dimensions or buffer length differ from the first `apply`.
    ShapeMismatch(&'static str),
    /// A sample was scheduled while the window held no samples.
    /// Indicates an implementation bug, never bad input.
    SampleStarvation,
    /// A persisted model file is malformed.
    ModelFormat(&'static str),
    /// Propagate underlying errors from `std::io`.
    Io(std::io::Error),
    /// Out of memory
    OutOfMemory,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::Io(err)
    }
}

impl From<fallible_collections::TryReserveError> for Error {
    fn from(_: fallible_collections::TryReserveError) -> Error {
        Error::OutOfMemory
    }
}

/// Result shorthand using our Error enum.
pub(crate) type Result<T> = std::result::Result<T, Error>;

/// Tuning parameters for the subtractor.
///
/// `Config::default()` matches the reference parameterization; construct
/// with struct update syntax to override individual values.
#[derive(Debug, Clone)]
pub struct Config {
    /// Frames per second of the input. Positive values advance the
    /// internal clock by `1000/fps` ms per frame; `0.0` reads a monotonic
    /// wall clock instead.
    pub fps: f64,
    /// Chebyshev distance below which a pixel matches a mode.
    pub fg_threshold: u32,
    /// Per-channel distance below which a sample joins an existing bin.
    pub association_threshold: u32,
    /// Milliseconds between consecutive stable-model samples.
    pub sampling_period_ms: f64,
    /// Minimum bin height for a bin to commit as a mode. Clamped to ≥ 1.
    pub min_bin_height: u32,
    /// Samples per stable sampling window. Clamped to ≥ 2.
    pub num_samples: u32,
    /// Lower bound (inclusive) of the shadow brightness ratio.
    pub alpha: f32,
    /// Upper bound (exclusive) of the shadow brightness ratio.
    pub beta: f32,
    /// Maximum saturation difference for the shadow test.
    pub tau_s: u8,
    /// Maximum circular hue difference for the shadow test.
    pub tau_h: u8,
    /// Minimum blob area for the optional post-filter. Not consumed by the
    /// core; carried for area-thresholding collaborators.
    pub min_area: f64,
    /// Dwell time in ms after which a persistent pixel is absorbed into
    /// the background.
    pub persistence_period_ms: f64,
    /// Whether a morphological open/close post-pass is requested. Not
    /// consumed by the core; carried for filtering collaborators.
    pub morphological_filtering: bool,
    /// Number of tile workers. `0` selects the hardware parallelism.
    pub num_workers: usize,
    /// Keep the reference commit behavior of copying the displaced mode-0
    /// record into the next output slot when a taller bin takes slot 0.
    /// `false` selects a clean collect-then-swap instead.
    pub preserve_displaced_mode: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            fps: 25.0,
            fg_threshold: 20,
            association_threshold: 5,
            sampling_period_ms: 500.0,
            min_bin_height: 2,
            num_samples: 20,
            alpha: 0.65,
            beta: 1.15,
            tau_s: 60,
            tau_h: 40,
            min_area: 50.0,
            persistence_period_ms: 10_000.0,
            morphological_filtering: false,
            num_workers: 0,
            preserve_displaced_mode: true,
        }
    }
}

impl Config {
    /// Clamp degenerate values the same way the engine consumes them.
    pub(crate) fn normalized(&self) -> Config {
        let mut cfg = self.clone();
        if cfg.min_bin_height < 1 {
            cfg.min_bin_height = 1;
        }
        if cfg.num_samples < 2 {
            cfg.num_samples = 2;
        }
        if cfg.num_workers == 0 {
            cfg.num_workers = num_cpus::get();
        }
        cfg
    }

    /// Milliseconds between incremental-model samples.
    pub(crate) fn incremental_sampling_period_ms(&self) -> f64 {
        self.sampling_period_ms.min(100.0)
    }

    /// Initial incremental window length.
    pub(crate) fn incremental_num_samples(&self) -> u32 {
        (self.num_samples / 10).max(6)
    }

    /// Modes per pixel.
    pub(crate) fn max_modes(&self) -> u32 {
        (self.num_samples / self.min_bin_height).max(1)
    }
}

/// An 8-bit, 3-channel frame with pixels stored row-major in B, G, R
/// channel order.
#[derive(Debug, Clone)]
pub struct BgrFrame {
    pub width: u32,
    pub height: u32,
    /// `width * height * 3` bytes.
    pub data: Vec<u8>,
}

impl BgrFrame {
    /// An all-black frame.
    pub fn new(width: u32, height: u32) -> BgrFrame {
        let len = width as usize * height as usize * 3;
        BgrFrame { width, height, data: vec![0; len] }
    }

    /// Wrap an existing BGR buffer, checking its length.
    pub fn from_data(width: u32, height: u32, data: Vec<u8>) -> Result<BgrFrame> {
        if data.len() != width as usize * height as usize * 3 {
            return Err(Error::ShapeMismatch("buffer length does not match dimensions"));
        }
        Ok(BgrFrame { width, height, data })
    }

    /// BGR triple of the pixel at `(x, y)`.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let i = (y as usize * self.width as usize + x as usize) * 3;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    fn check(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::ShapeMismatch("empty frame"));
        }
        if self.data.len() != self.width as usize * self.height as usize * 3 {
            return Err(Error::ShapeMismatch("buffer length does not match dimensions"));
        }
        Ok(())
    }
}

/// An 8-bit single-channel foreground mask. Values are drawn from
/// `{0, SHADOW_LABEL, PERSISTENCE_LABEL, FOREGROUND_LABEL}`.
#[derive(Debug, Clone, Default)]
pub struct FgMask {
    pub width: u32,
    pub height: u32,
    /// `width * height` bytes.
    pub data: Vec<u8>,
}

impl FgMask {
    pub fn new(width: u32, height: u32) -> FgMask {
        FgMask { width, height, data: vec![0; width as usize * height as usize] }
    }

    /// Label of the pixel at `(x, y)`.
    pub fn label(&self, x: u32, y: u32) -> u8 {
        self.data[y as usize * self.width as usize + x as usize]
    }

    fn reset(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.data.clear();
        self.data.resize(width as usize * height as usize, 0);
    }
}

/// Multi-threaded IMBS background subtractor.
///
/// The first [`apply`](Self::apply) fixes the frame geometry, allocates
/// all per-pixel state and spawns the tile workers; every later frame
/// must have the same shape. The instance is self-contained: dropping it
/// shuts the workers down.
pub struct BackgroundSubtractor {
    config: Config,
    pool: Option<TilePool>,
    bg_image: BgrFrame,
    timestamp_ms: f64,
    started: Option<Instant>,
    frame_type: i64,
}

impl BackgroundSubtractor {
    /// Create a subtractor with the given parameters. No allocation
    /// happens until the first frame (or a model load) reveals the frame
    /// geometry.
    pub fn new(config: Config) -> Result<BackgroundSubtractor> {
        let config = config.normalized();
        Ok(BackgroundSubtractor {
            config,
            pool: None,
            bg_image: BgrFrame::new(0, 0),
            timestamp_ms: 0.0,
            started: None,
            frame_type: 0,
        })
    }

    /// Classify `frame` into `mask`, then update the background models.
    ///
    /// The timestamp advances by `1000/fps` ms per call when the
    /// configured fps is positive and follows a monotonic wall clock
    /// otherwise. Returns only after every tile worker has finished; the
    /// mask is never partially written.
    pub fn apply(&mut self, frame: &BgrFrame, mask: &mut FgMask) -> Result<()> {
        let ts = if self.config.fps > 0.0 {
            self.timestamp_ms + 1000.0 / self.config.fps
        } else {
            let started = *self.started.get_or_insert_with(Instant::now);
            started.elapsed().as_secs_f64() * 1000.0
        };
        self.apply_at(frame, mask, ts)
    }

    /// Like [`apply`](Self::apply), with a caller-supplied timestamp in
    /// milliseconds. Timestamps must not decrease between calls.
    pub fn apply_at(&mut self, frame: &BgrFrame, mask: &mut FgMask, timestamp_ms: f64) -> Result<()> {
        frame.check()?;
        if self.pool.is_none() {
            self.init(frame.width, frame.height, None)?;
        }
        let pool = self.pool.as_mut().expect("pool initialized above");
        if frame.width != pool.frame_width() || frame.height != pool.frame_height() {
            return Err(Error::ShapeMismatch("frame size differs from the first apply"));
        }
        mask.reset(frame.width, frame.height);
        pool.process(frame, timestamp_ms, &mut mask.data, &mut self.bg_image.data)?;
        self.timestamp_ms = timestamp_ms;
        Ok(())
    }

    /// Diagnostic image holding the mode-0 color of every pixel.
    ///
    /// All black until the first commit. Pixels outside the tiled
    /// sub-grid stay black.
    pub fn background_image(&self) -> &BgrFrame {
        &self.bg_image
    }

    /// Write the committed stable model in the text interchange format.
    ///
    /// Fails with [`Error::ModelFormat`] before the frame geometry is
    /// known.
    pub fn save_model<W: Write>(&mut self, writer: W) -> Result<()> {
        let pool = match self.pool.as_mut() {
            Some(pool) => pool,
            None => return Err(Error::ModelFormat("no model to save")),
        };
        let width = pool.frame_width();
        let height = pool.frame_height();
        let rows = pool.export()?;
        snapshot::write_model(writer, width, height, self.frame_type, &rows)
    }

    /// Build a subtractor whose stable model is preloaded from the text
    /// interchange format.
    ///
    /// Loaded modes are valid, unflagged and carry the minimum bin height
    /// as weight; the incremental pipeline is permanently disabled.
    pub fn load_model<R: BufRead>(config: Config, reader: R) -> Result<BackgroundSubtractor> {
        let mut sub = BackgroundSubtractor::new(config)?;
        let file = snapshot::read_model(reader)?;
        let max_modes = sub.config.max_modes() as usize;
        if file.rows.iter().any(|modes| modes.len() > max_modes) {
            return Err(Error::ModelFormat("more modes than the configuration allows"));
        }
        info!("loaded background model: {}x{}", file.width, file.height);
        sub.frame_type = file.frame_type;
        sub.init(file.width, file.height, Some(&file))?;
        Ok(sub)
    }

    fn init(&mut self, width: u32, height: u32, preload: Option<&snapshot::ModelFile>) -> Result<()> {
        info!(
            "input: width {} height {} fps {} workers {}",
            width, height, self.config.fps, self.config.num_workers
        );
        self.pool = Some(TilePool::new(&self.config, width, height, preload)?);
        self.bg_image = BgrFrame::new(width, height);
        if let Some(file) = preload {
            for (p, modes) in file.rows.iter().enumerate() {
                if let Some(value) = modes.first() {
                    self.bg_image.data[p * 3..p * 3 + 3].copy_from_slice(value);
                }
            }
        }
        Ok(())
    }
}
