// src/mixer/mod.rs

pub mod track;
pub mod waveform;

pub use track::Track;
pub use waveform::{MAX_RUN_GAP, SummaryMetric, WaveformLog, WaveformRun};

use anyhow::Result;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

use crate::audio;

/// Source of one mono chunk per call.
///
/// `read_chunk` fills `buf` (one chunk) and returns whether the device dropped
/// samples since the previous read. It may block, bounded by roughly one
/// chunk's playback duration.
pub trait InputStream: Send {
    fn read_chunk(&mut self, buf: &mut [i16]) -> bool;
}

/// Sink for the mixed monitor signal.
///
/// `write_chunk` blocks until the buffer is handed off, bounded by roughly one
/// chunk's playback duration, and returns whether the device ran dry since the
/// previous write. `write_available` reports how many samples can currently be
/// written without blocking.
pub trait OutputStream: Send {
    fn write_chunk(&mut self, buf: &[i16]) -> bool;
    fn write_available(&self) -> usize;
}

/// Engine construction parameters. `rate` and `chunk` fix both the I/O timing
/// and the waveform granularity for the engine's lifetime.
#[derive(Clone, Copy, Debug)]
pub struct MixerConfig {
    pub rate: u32,
    pub chunk: usize,
    /// Iterations an overflow/underflow warning is held back while the
    /// condition keeps repeating. Zero disables the warnings entirely.
    pub warn_cooldown: u32,
    pub metric: SummaryMetric,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            rate: 44100,
            chunk: 1024,
            warn_cooldown: 100,
            metric: SummaryMetric::Peak,
        }
    }
}

/// Coalesces a stream of per-iteration fault flags into one warning per
/// cooldown window: the first flag arms the counter, the warning fires when it
/// runs out, and further flags during the window are swallowed.
struct WarnCooldown {
    period: u32,
    remaining: u32,
}

impl WarnCooldown {
    fn new(period: u32) -> Self {
        Self {
            period,
            remaining: 0,
        }
    }

    /// Feed one iteration's flag; returns true when the warning should fire.
    fn observe(&mut self, flagged: bool) -> bool {
        if self.remaining > 0 {
            self.remaining -= 1;
            return self.remaining == 0;
        }
        if flagged {
            self.remaining = self.period;
        }
        false
    }
}

/// Sample-wise accumulation; wraps like the integer hardware mix it mirrors.
fn mix_into(mix: &mut [i16], chunk: &[i16]) {
    for (out, s) in mix.iter_mut().zip(chunk) {
        *out = out.wrapping_add(*s);
    }
}

/// The recording and mixing backend.
///
/// Owns the output stream and the track set, and runs the read-mix-write loop
/// on a dedicated thread until closed. Also computes the per-track waveforms.
pub struct AudioMixer {
    rate: u32,
    chunk: usize,
    metric: SummaryMetric,
    tracks: Arc<Mutex<Vec<Arc<Track>>>>,
    live: Arc<AtomicBool>,
    recording: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    pos: Arc<AtomicU64>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl AudioMixer {
    /// Engine on the default output device with default settings.
    pub fn new() -> Result<Self> {
        Self::with_config(MixerConfig::default())
    }

    /// Engine on the default output device.
    pub fn with_config(config: MixerConfig) -> Result<Self> {
        let output = audio::open_output_stream(config.rate, config.chunk)?;
        Ok(Self::with_output(config, Box::new(output)))
    }

    /// Engine on a caller-provided output stream. The loop thread starts
    /// immediately.
    pub fn with_output(config: MixerConfig, output: Box<dyn OutputStream>) -> Self {
        let tracks = Arc::new(Mutex::new(Vec::new()));
        let live = Arc::new(AtomicBool::new(true));
        let recording = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(AtomicBool::new(false));
        let pos = Arc::new(AtomicU64::new(0));

        let mix_loop = MixLoop {
            output,
            chunk: config.chunk,
            tracks: tracks.clone(),
            live: live.clone(),
            recording: recording.clone(),
            closed: closed.clone(),
            pos: pos.clone(),
            overflow_warn: WarnCooldown::new(config.warn_cooldown),
            underflow_warn: WarnCooldown::new(config.warn_cooldown),
        };
        let loop_handle = thread::spawn(move || mix_loop.run());

        Self {
            rate: config.rate,
            chunk: config.chunk,
            metric: config.metric,
            tracks,
            live,
            recording,
            closed,
            pos,
            loop_handle: Mutex::new(Some(loop_handle)),
        }
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn chunk(&self) -> usize {
        self.chunk
    }

    /// Open a new mono input stream on the default device and register it as
    /// a track.
    pub fn new_track(&self) -> Result<Arc<Track>> {
        let stream = audio::open_input_stream(self.rate, self.chunk)?;
        Ok(self.add_track(Box::new(stream)))
    }

    /// Register an already-started input stream as a track. The returned
    /// handle stays valid for querying after removal.
    pub fn add_track(&self, stream: Box<dyn InputStream>) -> Arc<Track> {
        let track = Arc::new(Track::new(stream, self.metric));
        self.tracks.lock().unwrap().push(track.clone());
        debug!("track added");
        track
    }

    /// Drop a track from the mix and close its stream. The track's waveform
    /// stays readable through any retained handle. Returns false if the track
    /// was not registered.
    pub fn remove_track(&self, track: &Arc<Track>) -> bool {
        let removed = {
            let mut tracks = self.tracks.lock().unwrap();
            let before = tracks.len();
            tracks.retain(|t| !Arc::ptr_eq(t, track));
            tracks.len() < before
        };
        if removed {
            // Waits for at most one in-flight read by the loop.
            track.close();
            debug!("track removed");
        }
        removed
    }

    /// Snapshot of the registered tracks.
    pub fn tracks(&self) -> Vec<Arc<Track>> {
        self.tracks.lock().unwrap().clone()
    }

    /// Takes effect within one loop iteration.
    pub fn set_recording(&self, recording: bool) {
        self.recording.store(recording, Ordering::Relaxed);
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Relaxed)
    }

    /// Global monitor enable; when false nothing is mixed to the output.
    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::Relaxed);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Relaxed)
    }

    /// Current chunk position; may lag the loop by one iteration.
    pub fn position(&self) -> u64 {
        self.pos.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Stop the loop and release every stream. Blocks for at most roughly one
    /// loop iteration; redundant calls are no-ops.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        if let Some(handle) = self.loop_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        for track in self.tracks.lock().unwrap().iter() {
            track.close();
        }
        debug!("mixer closed");
    }
}

impl Drop for AudioMixer {
    fn drop(&mut self) {
        self.close();
    }
}

/// State owned by the loop thread. The output stream lives (and dies) here.
struct MixLoop {
    output: Box<dyn OutputStream>,
    chunk: usize,
    tracks: Arc<Mutex<Vec<Arc<Track>>>>,
    live: Arc<AtomicBool>,
    recording: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    pos: Arc<AtomicU64>,
    overflow_warn: WarnCooldown,
    underflow_warn: WarnCooldown,
}

impl MixLoop {
    fn run(mut self) {
        debug!("mixer loop running");
        let mut mix = vec![0i16; self.chunk];
        let mut scratch = vec![0i16; self.chunk];
        let mut pending: Vec<(Arc<Track>, Vec<i16>)> = Vec::new();

        while !self.closed.load(Ordering::Relaxed) {
            mix.fill(0);
            pending.clear();

            // Snapshot so controllers can add/remove tracks while we block on
            // device I/O below.
            let tracks: Vec<Arc<Track>> = self.tracks.lock().unwrap().clone();

            for track in &tracks {
                let Some(overflowed) = track.read_chunk(&mut scratch) else {
                    // Closed under us (removal); drop it from this iteration.
                    continue;
                };
                if self.overflow_warn.observe(overflowed) {
                    warn!("input overflowed");
                }

                if self.live.load(Ordering::Relaxed) && !track.is_live_muted() {
                    mix_into(&mut mix, &scratch);
                }

                if self.recording.load(Ordering::Relaxed) {
                    // Appended only after the output write below, so the mix
                    // reaches the device before any bookkeeping.
                    pending.push((track.clone(), scratch.clone()));
                }
            }

            let underflowed = self.output.write_chunk(&mix);
            if self.underflow_warn.observe(underflowed) {
                warn!("output underflowed");
            }
            if underflowed {
                // Feed the device whatever silence it has room for so it can
                // catch up before the next real chunk.
                let fill = self.output.write_available();
                if fill > 0 {
                    let _ = self.output.write_chunk(&vec![0i16; fill]);
                }
            }

            if self.recording.load(Ordering::Relaxed) {
                let pos = self.pos.load(Ordering::Relaxed);
                for (track, chunk) in &pending {
                    track.append(chunk, pos);
                }
                // One step per iteration, however many tracks there are.
                self.pos.store(pos + 1, Ordering::Relaxed);
            }
        }
        debug!("mixer loop stopped");
    }
}
