// src/mixer/track.rs

use std::sync::{
    Mutex,
    atomic::{AtomicBool, Ordering},
};

use crate::mixer::InputStream;
use crate::mixer::waveform::{SummaryMetric, WaveformLog, WaveformRun};

/// One recorded source: an input stream, mute state, and its waveform log.
///
/// The mixer loop is the only reader of the stream and the only writer of the
/// waveform; controllers toggle the flags and query the log concurrently.
pub struct Track {
    stream: Mutex<Option<Box<dyn InputStream>>>,
    waveform: Mutex<WaveformLog>,
    live_muted: AtomicBool,
    play_muted: AtomicBool,
    connected: AtomicBool,
}

impl Track {
    pub(crate) fn new(stream: Box<dyn InputStream>, metric: SummaryMetric) -> Self {
        Self {
            stream: Mutex::new(Some(stream)),
            waveform: Mutex::new(WaveformLog::new(metric)),
            live_muted: AtomicBool::new(false),
            play_muted: AtomicBool::new(false),
            connected: AtomicBool::new(true),
        }
    }

    /// Pull one chunk from the stream. `None` once the track is closed.
    ///
    /// Holds the stream lock across the (bounded) blocking read, so `close`
    /// waits for an in-flight read instead of pulling the stream out from
    /// under it.
    pub(crate) fn read_chunk(&self, buf: &mut [i16]) -> Option<bool> {
        let mut guard = self.stream.lock().unwrap();
        guard.as_mut().map(|stream| stream.read_chunk(buf))
    }

    pub(crate) fn append(&self, chunk: &[i16], pos: u64) {
        self.waveform.lock().unwrap().append(chunk, pos);
    }

    /// The waveform run covering `pos`, cloned so no lock is held while rendering.
    pub fn run_at(&self, pos: u64) -> Option<WaveformRun> {
        self.waveform.lock().unwrap().run_at(pos).cloned()
    }

    /// Snapshot of all runs for rendering.
    pub fn waveform_runs(&self) -> Vec<WaveformRun> {
        self.waveform.lock().unwrap().runs().to_vec()
    }

    pub fn is_live_muted(&self) -> bool {
        self.live_muted.load(Ordering::Relaxed)
    }

    /// Exclude this track from the live mix; it still records.
    pub fn set_live_muted(&self, muted: bool) {
        self.live_muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_play_muted(&self) -> bool {
        self.play_muted.load(Ordering::Relaxed)
    }

    /// Reserved for playback; stored but not acted on by the mixer.
    pub fn set_play_muted(&self, muted: bool) {
        self.play_muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Controllers mark a track whose source application went away. The
    /// stream and waveform stay intact until the track is closed.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    /// Stop and release the input stream. Idempotent.
    pub fn close(&self) {
        drop(self.stream.lock().unwrap().take());
    }
}
