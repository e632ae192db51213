//! Tile scheduling: grid computation and the persistent worker pool.
//!
//! The frame is cut into a grid of equal tiles, one engine per tile,
//! each engine owned by a dedicated worker thread. Workers receive tile
//! jobs through their own mailbox and answer on their own reply channel,
//! so a dead worker is detected as a disconnect rather than a hang.
//! Tile pixel, mask and background buffers ping-pong between the pool
//! and the workers, so the steady state allocates nothing.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::thread::JoinHandle;

use crate::engine::TileEngine;
use crate::snapshot::ModelFile;
use crate::{BgrFrame, Config, Result};

/// One tile of the frame grid, in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TileRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl TileRect {
    fn num_pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Cut a `width × height` frame into a grid for `workers` threads:
/// `ceil(workers/2)` horizontal splits and `workers / h_splits` vertical
/// ones. Division remainders are dropped; pixels to the right of and
/// below the grid belong to no tile. Degenerate frames shrink the worker
/// count until every tile holds at least one pixel.
pub(crate) fn tile_grid(width: u32, height: u32, workers: usize) -> Vec<TileRect> {
    let mut workers = workers.max(1) as u32;
    loop {
        let h_splits = (workers + 1) / 2;
        let v_splits = (workers / h_splits).max(1);
        let tile_w = width / h_splits;
        let tile_h = height / v_splits;
        if (tile_w == 0 || tile_h == 0) && workers > 1 {
            workers -= 1;
            continue;
        }
        let mut tiles = Vec::with_capacity((h_splits * v_splits) as usize);
        for i in 0..v_splits {
            for j in 0..h_splits {
                tiles.push(TileRect {
                    x: j * tile_w,
                    y: i * tile_h,
                    width: tile_w,
                    height: tile_h,
                });
            }
        }
        return tiles;
    }
}

enum Job {
    Frame { pixels: Vec<u8>, timestamp_ms: f64, mask: Vec<u8>, bg: Vec<u8> },
    Export,
}

enum Reply {
    Frame { pixels: Vec<u8>, mask: Vec<u8>, bg: Vec<u8>, result: Result<()> },
    Export(Vec<Vec<[u8; 3]>>),
}

struct Buffers {
    pixels: Vec<u8>,
    mask: Vec<u8>,
    bg: Vec<u8>,
}

struct Worker {
    mailbox: Sender<Job>,
    replies: Receiver<Reply>,
    handle: JoinHandle<()>,
}

/// The worker pool plus the grid it serves.
pub(crate) struct TilePool {
    frame_width: u32,
    frame_height: u32,
    tiles: Vec<TileRect>,
    workers: Vec<Worker>,
    spare: Vec<Option<Buffers>>,
}

fn run_worker(mut engine: TileEngine, jobs: Receiver<Job>, replies: Sender<Reply>) {
    for job in jobs.iter() {
        let reply = match job {
            Job::Frame { pixels, timestamp_ms, mut mask, mut bg } => {
                let result = engine.process(&pixels, timestamp_ms, &mut mask, &mut bg);
                Reply::Frame { pixels, mask, bg, result }
            }
            Job::Export => Reply::Export(engine.export()),
        };
        if replies.send(reply).is_err() {
            // pool is gone
            break;
        }
    }
}

fn copy_tile(frame: &BgrFrame, rect: &TileRect, out: &mut Vec<u8>) {
    out.clear();
    out.reserve(rect.num_pixels() * 3);
    let stride = frame.width as usize * 3;
    for row in 0..rect.height as usize {
        let start = (rect.y as usize + row) * stride + rect.x as usize * 3;
        out.extend_from_slice(&frame.data[start..start + rect.width as usize * 3]);
    }
}

impl TilePool {
    pub(crate) fn new(
        cfg: &Config,
        width: u32,
        height: u32,
        preload: Option<&ModelFile>,
    ) -> Result<TilePool> {
        let tiles = tile_grid(width, height, cfg.num_workers);
        debug!("tile grid: {} tiles for {}x{}", tiles.len(), width, height);

        let mut workers = Vec::with_capacity(tiles.len());
        let mut spare = Vec::with_capacity(tiles.len());
        for (i, rect) in tiles.iter().enumerate() {
            let mut engine = TileEngine::new(cfg, rect.num_pixels())?;
            if let Some(file) = preload {
                engine.preload(tile_rows(file, rect, width));
            }
            let (job_tx, job_rx) = unbounded();
            let (reply_tx, reply_rx) = unbounded();
            let handle = std::thread::Builder::new()
                .name(format!("imbs-tile-{i}"))
                .spawn(move || run_worker(engine, job_rx, reply_tx))?;
            workers.push(Worker { mailbox: job_tx, replies: reply_rx, handle });
            spare.push(Some(Buffers {
                pixels: Vec::new(),
                mask: vec![0; rect.num_pixels()],
                bg: vec![0; rect.num_pixels() * 3],
            }));
        }

        Ok(TilePool {
            frame_width: width,
            frame_height: height,
            tiles,
            workers,
            spare,
        })
    }

    pub(crate) fn frame_width(&self) -> u32 {
        self.frame_width
    }

    pub(crate) fn frame_height(&self) -> u32 {
        self.frame_height
    }

    /// Dispatch one frame to every worker and stitch the tile results
    /// into `mask_out` and `bg_out`. Nothing is written unless every tile
    /// succeeded. A dead worker aborts the frame.
    pub(crate) fn process(
        &mut self,
        frame: &BgrFrame,
        timestamp_ms: f64,
        mask_out: &mut [u8],
        bg_out: &mut [u8],
    ) -> Result<()> {
        for (i, rect) in self.tiles.iter().enumerate() {
            let mut bufs = self.spare[i].take().expect("tile buffers in flight");
            copy_tile(frame, rect, &mut bufs.pixels);
            let job = Job::Frame {
                pixels: bufs.pixels,
                timestamp_ms,
                mask: bufs.mask,
                bg: bufs.bg,
            };
            if self.workers[i].mailbox.send(job).is_err() {
                panic!("tile worker terminated");
            }
        }

        let mut done = Vec::with_capacity(self.tiles.len());
        let mut failure = None;
        for (i, worker) in self.workers.iter().enumerate() {
            match worker.replies.recv() {
                Ok(Reply::Frame { pixels, mask, bg, result }) => {
                    if let Err(err) = result {
                        failure = Some(err);
                    }
                    done.push((i, Buffers { pixels, mask, bg }));
                }
                Ok(Reply::Export(_)) => unreachable!("export reply without request"),
                Err(_) => panic!("tile worker terminated"),
            }
        }

        if let Some(err) = failure {
            for (tile, bufs) in done {
                self.spare[tile] = Some(bufs);
            }
            return Err(err);
        }

        let stride = self.frame_width as usize;
        for (tile, bufs) in done {
            let rect = &self.tiles[tile];
            for row in 0..rect.height as usize {
                let src = row * rect.width as usize;
                let dst = (rect.y as usize + row) * stride + rect.x as usize;
                mask_out[dst..dst + rect.width as usize]
                    .copy_from_slice(&bufs.mask[src..src + rect.width as usize]);
                bg_out[dst * 3..(dst + rect.width as usize) * 3]
                    .copy_from_slice(&bufs.bg[src * 3..(src + rect.width as usize) * 3]);
            }
            self.spare[tile] = Some(bufs);
        }
        Ok(())
    }

    /// Collect the committed stable modes of every pixel, full-frame
    /// row-major. Pixels outside the grid yield empty mode lists.
    pub(crate) fn export(&mut self) -> Result<Vec<Vec<[u8; 3]>>> {
        for worker in &self.workers {
            if worker.mailbox.send(Job::Export).is_err() {
                panic!("tile worker terminated");
            }
        }
        let mut rows =
            vec![Vec::new(); self.frame_width as usize * self.frame_height as usize];
        for (i, worker) in self.workers.iter().enumerate() {
            match worker.replies.recv() {
                Ok(Reply::Export(tile_rows)) => {
                    let rect = &self.tiles[i];
                    for (local, modes) in tile_rows.into_iter().enumerate() {
                        let x = rect.x as usize + local % rect.width as usize;
                        let y = rect.y as usize + local / rect.width as usize;
                        rows[y * self.frame_width as usize + x] = modes;
                    }
                }
                Ok(Reply::Frame { .. }) => unreachable!("frame reply without request"),
                Err(_) => panic!("tile worker terminated"),
            }
        }
        Ok(rows)
    }
}

impl Drop for TilePool {
    fn drop(&mut self) {
        let workers = std::mem::take(&mut self.workers);
        let mut handles = Vec::with_capacity(workers.len());
        for worker in workers {
            // closing the mailbox drains the worker
            drop(worker.mailbox);
            handles.push(worker.handle);
        }
        for handle in handles {
            let _ = handle.join();
        }
    }
}

/// Per-pixel mode rows of `file` restricted to `rect`, tile row-major.
fn tile_rows<'a>(
    file: &'a ModelFile,
    rect: &TileRect,
    frame_width: u32,
) -> impl Iterator<Item = &'a [[u8; 3]]> {
    let rect = *rect;
    (0..rect.num_pixels()).map(move |local| {
        let x = rect.x as usize + local % rect.width as usize;
        let y = rect.y as usize + local / rect.width as usize;
        file.rows[y * frame_width as usize + x].as_slice()
    })
}
