// SPDX-License-Identifier: AGPL-3.0-only

//! Frame loop: capture, convert, filter on the card, export
//!
//! Frames come from a raw file or a generated pattern. Console lines on
//! stdin drive the loop while it runs:
//!
//! ```text
//! p            save the next filtered frame
//! click X Y    forward a pointer click to the card
//! q            stop
//! ```

use anyhow::{Context, Result};
use filter_driver::{
    run_colored, CardDriver, Communicator, Converter, Frame, ImageSize, PointerRelay, ProtocolTiming,
    TriggerProtocol,
};
use std::fs::File;
use std::io::{BufRead, Read};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Where captured frames come from
pub enum Source {
    /// Back-to-back raw interleaved frames
    Raw {
        /// Byte stream
        reader: Box<dyn Read>,
        /// Geometry of every frame
        size: ImageSize,
        /// Channels per pixel
        channels: usize,
    },
    /// Generated moving gradient
    Pattern {
        /// Geometry of every frame
        size: ImageSize,
        /// Channels per pixel
        channels: usize,
        /// Frames produced so far
        index: u64,
    },
}

impl Source {
    /// Raw file at `path`, or the generated pattern when there is none
    pub fn open(path: Option<&Path>, size: ImageSize, channels: usize) -> Result<Self> {
        match path {
            Some(path) => {
                let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
                info!("Reading {size} x{channels} frames from {}", path.display());
                Ok(Self::Raw {
                    reader: Box::new(std::io::BufReader::new(file)),
                    size,
                    channels,
                })
            }
            None => {
                info!("No input given, generating {size} x{channels} frames");
                Ok(Self::Pattern {
                    size,
                    channels,
                    index: 0,
                })
            }
        }
    }

    /// Next frame, `None` at end of input
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        match self {
            Self::Raw {
                reader,
                size,
                channels,
            } => Ok(Frame::read_raw(reader, *size, *channels)?),
            Self::Pattern {
                size,
                channels,
                index,
            } => {
                let frame = gradient(*size, *channels, *index);
                *index += 1;
                Ok(Some(frame))
            }
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn gradient(size: ImageSize, channels: usize, index: u64) -> Frame {
    let shift = (index as usize).wrapping_mul(4);
    let mut frame = Frame::zeroed(size, channels);
    for (i, pixel) in frame.data_mut().chunks_exact_mut(channels.max(1)).enumerate() {
        let (x, y) = (i % size.width, i / size.width);
        for (c, value) in pixel.iter_mut().enumerate() {
            *value = (x + y + shift + c * 64) as u8;
        }
    }
    frame
}

/// Console command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Save the next filtered frame
    Save,
    /// Stop the loop
    Quit,
    /// Pointer click at image coordinates
    Click {
        /// Column
        x: u32,
        /// Row
        y: u32,
    },
}

/// Parse one console line
pub fn parse_command(line: &str) -> Option<Command> {
    let mut words = line.split_whitespace();
    match words.next()? {
        "p" | "P" | "save" => Some(Command::Save),
        "q" | "Q" | "quit" => Some(Command::Quit),
        "click" => {
            let x = words.next()?.parse().ok()?;
            let y = words.next()?.parse().ok()?;
            Some(Command::Click { x, y })
        }
        _ => None,
    }
}

/// Read console lines on a background thread
///
/// Clicks go straight into `relay`; save and quit requests come back over
/// the returned channel.
pub fn spawn_console(relay: Arc<PointerRelay>) -> Receiver<Command> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            match parse_command(&line) {
                Some(Command::Click { x, y }) => relay.record_click(x, y),
                Some(command) => {
                    if tx.send(command).is_err() {
                        break;
                    }
                }
                None if line.trim().is_empty() => {}
                None => warn!("Unknown command '{}'", line.trim()),
            }
        }
    });
    rx
}

/// Frame-rate meter
#[derive(Debug)]
pub struct FrameRate {
    started: Instant,
    last: Instant,
    frames: u64,
}

impl FrameRate {
    /// Meter starting now
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last: now,
            frames: 0,
        }
    }

    /// Mark a finished frame, returning the instantaneous rate
    pub fn tick(&mut self) -> f64 {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.frames += 1;
        if elapsed > 0.0 {
            1.0 / elapsed
        } else {
            0.0
        }
    }

    /// Mean rate since the meter started
    #[allow(clippy::cast_precision_loss)]
    pub fn average(&self) -> f64 {
        let elapsed = self.last.duration_since(self.started).as_secs_f64();
        if elapsed > 0.0 {
            self.frames as f64 / elapsed
        } else {
            0.0
        }
    }
}

impl Default for FrameRate {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame loop settings
#[derive(Debug, Clone)]
pub struct LoopOptions {
    /// Capture conversion; its size is the plane size on the card
    pub converter: Converter,
    /// Protocol delays and poll bound
    pub timing: ProtocolTiming,
    /// Frame limit
    pub frames: Option<u64>,
    /// Save every frame, not only on request
    pub save_all: bool,
    /// Save the converted capture next to the result
    pub with_captured: bool,
    /// Directory for saved frames
    pub output_dir: PathBuf,
}

/// What the loop did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoopStats {
    /// Frames read from the source
    pub frames: u64,
    /// Frames skipped after a timed-out pass
    pub skipped: u64,
    /// Frames written to disk
    pub saved: u64,
}

/// Run frames through the card until the source, the limit or a quit ends it
///
/// A timed-out pass skips the frame; any other error ends the loop.
pub fn run_loop<D: CardDriver>(
    com: &mut Communicator<D>,
    source: &mut Source,
    options: &LoopOptions,
    relay: &PointerRelay,
    console: Option<&Receiver<Command>>,
) -> Result<LoopStats> {
    let size = options.converter.size();
    let mut protocol = TriggerProtocol::new(options.timing);
    protocol.set_image_size(&*com, size.area())?;

    let mut meter = FrameRate::new();
    let mut stats = LoopStats::default();

    while options.frames.map_or(true, |limit| stats.frames < limit) {
        let mut save = options.save_all;
        if let Some(console) = console {
            for command in console.try_iter() {
                match command {
                    Command::Save => save = true,
                    Command::Quit => {
                        info!("Stopped from console");
                        return Ok(finish(stats, &meter));
                    }
                    Command::Click { .. } => {}
                }
            }
        }

        let Some(captured) = source.next_frame()? else {
            debug!("End of input");
            break;
        };
        let src = options.converter.convert(&captured)?;
        stats.frames += 1;

        let result = {
            let mut scope = relay.scope(com);
            run_colored(&mut protocol, &mut *scope, &src)
        };
        let filtered = match result {
            Ok(frame) => frame,
            Err(e) if e.is_per_frame() => {
                warn!("Frame {} skipped: {e}", stats.frames);
                stats.skipped += 1;
                continue;
            }
            Err(e) => return Err(e).context(format!("frame {}", stats.frames)),
        };

        let fps = meter.tick();
        debug!("{fps:.1} fps");

        if save {
            let frame = if options.with_captured {
                Frame::side_by_side(&filtered, &src)?
            } else {
                filtered
            };
            let path = save_frame(&options.output_dir, stats.saved, &frame)?;
            info!("Saved {}", path.display());
            stats.saved += 1;
        }
    }

    Ok(finish(stats, &meter))
}

fn finish(stats: LoopStats, meter: &FrameRate) -> LoopStats {
    info!(
        frames = stats.frames,
        skipped = stats.skipped,
        saved = stats.saved,
        "Frame loop done, {:.1} fps average",
        meter.average()
    );
    stats
}

/// Write `frame` as `output{index}.png` under `dir`
pub fn save_frame(dir: &Path, index: u64, frame: &Frame) -> Result<PathBuf> {
    let path = dir.join(format!("output{index}.png"));
    frame
        .save(&path)
        .with_context(|| format!("saving {}", path.display()))?;
    Ok(path)
}
