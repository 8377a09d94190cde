// tests/engine_loop.rs
//
// Drives the mixer loop through scripted in-memory streams: chunks are fed
// over a channel, mixed output is captured, and device faults are scripted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use mixdeck::{AudioMixer, InputStream, MixerConfig, OutputStream};

const CHUNK: usize = 1024;

fn test_config() -> MixerConfig {
    MixerConfig {
        rate: 44100,
        chunk: CHUNK,
        ..Default::default()
    }
}

/// Input fed chunk-by-chunk from the test. Blocks like a device would until a
/// chunk arrives; yields silence once the sender is gone or on a (generous)
/// timeout so shutdown never hangs.
struct ScriptedInput {
    chunks: Receiver<Vec<i16>>,
    reads: Arc<AtomicUsize>,
    released: Arc<AtomicBool>,
}

impl InputStream for ScriptedInput {
    fn read_chunk(&mut self, buf: &mut [i16]) -> bool {
        match self.chunks.recv_timeout(Duration::from_secs(5)) {
            Ok(chunk) => buf.copy_from_slice(&chunk),
            Err(_) => buf.fill(0),
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        false
    }
}

impl Drop for ScriptedInput {
    fn drop(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

fn scripted_input() -> (Sender<Vec<i16>>, Arc<AtomicUsize>, Arc<AtomicBool>, ScriptedInput) {
    let (tx, rx) = channel();
    let reads = Arc::new(AtomicUsize::new(0));
    let released = Arc::new(AtomicBool::new(false));
    let input = ScriptedInput {
        chunks: rx,
        reads: reads.clone(),
        released: released.clone(),
    };
    (tx, reads, released, input)
}

/// Output that records every write and plays back a scripted underflow
/// sequence. The short sleep paces the loop roughly like a real device.
struct CaptureOutput {
    writes: Arc<Mutex<Vec<Vec<i16>>>>,
    underflows: Mutex<VecDeque<bool>>,
    available: usize,
}

impl OutputStream for CaptureOutput {
    fn write_chunk(&mut self, buf: &[i16]) -> bool {
        self.writes.lock().unwrap().push(buf.to_vec());
        thread::sleep(Duration::from_millis(2));
        self.underflows.lock().unwrap().pop_front().unwrap_or(false)
    }

    fn write_available(&self) -> usize {
        self.available
    }
}

fn capture_output(available: usize, underflows: &[bool]) -> (Arc<Mutex<Vec<Vec<i16>>>>, CaptureOutput) {
    let writes = Arc::new(Mutex::new(Vec::new()));
    let output = CaptureOutput {
        writes: writes.clone(),
        underflows: Mutex::new(underflows.iter().copied().collect()),
        available,
    };
    (writes, output)
}

fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

#[test]
fn test_records_ten_alternating_chunks_into_one_run() {
    let (tx, _reads, _released, input) = scripted_input();
    let (_writes, output) = capture_output(0, &[]);
    let mixer = AudioMixer::with_output(test_config(), Box::new(output));
    let track = mixer.add_track(Box::new(input));

    mixer.set_recording(true);
    for i in 0..10 {
        let sample = if i % 2 == 0 { 0 } else { i16::MAX };
        tx.send(vec![sample; CHUNK]).unwrap();
    }
    assert!(wait_for(|| mixer.position() >= 10, Duration::from_secs(10)));
    mixer.set_recording(false);
    drop(tx);
    mixer.close();

    assert_eq!(mixer.position(), 10);
    let runs = track.waveform_runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].start, 0);
    let expected: Vec<u16> = (0..10).map(|i| if i % 2 == 0 { 0 } else { 32767 }).collect();
    assert_eq!(runs[0].values, expected);
}

#[test]
fn test_recording_gate_holds_position_and_resumes() {
    let (tx, reads, _released, input) = scripted_input();
    let (_writes, output) = capture_output(0, &[]);
    let mixer = AudioMixer::with_output(test_config(), Box::new(output));
    let track = mixer.add_track(Box::new(input));

    // Not recording: chunks flow through the mix but nothing is logged.
    for _ in 0..3 {
        tx.send(vec![123; CHUNK]).unwrap();
    }
    assert!(wait_for(|| reads.load(Ordering::SeqCst) >= 3, Duration::from_secs(10)));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(mixer.position(), 0);
    assert!(track.waveform_runs().is_empty());

    mixer.set_recording(true);
    tx.send(vec![500; CHUNK]).unwrap();
    tx.send(vec![700; CHUNK]).unwrap();
    assert!(wait_for(|| mixer.position() >= 2, Duration::from_secs(10)));
    mixer.set_recording(false);

    // Chunks consumed while recording is off advance nothing.
    tx.send(vec![900; CHUNK]).unwrap();
    assert!(wait_for(|| reads.load(Ordering::SeqCst) >= 6, Duration::from_secs(10)));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(mixer.position(), 2);

    // Resuming continues the same timeline rather than starting over.
    mixer.set_recording(true);
    tx.send(vec![800; CHUNK]).unwrap();
    assert!(wait_for(|| mixer.position() >= 3, Duration::from_secs(10)));
    mixer.set_recording(false);
    drop(tx);
    mixer.close();

    let runs = track.waveform_runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].start, 0);
    assert_eq!(runs[0].values, vec![500, 700, 800]);
}

#[test]
fn test_mixing_respects_track_mute_and_live_flag() {
    let (tx_a, reads_a, _rel_a, input_a) = scripted_input();
    let (tx_b, _reads_b, _rel_b, input_b) = scripted_input();
    let (writes, output) = capture_output(0, &[]);
    let mixer = AudioMixer::with_output(test_config(), Box::new(output));
    let _a = mixer.add_track(Box::new(input_a));
    let b = mixer.add_track(Box::new(input_b));

    // B is muted in the live mix, so one iteration's output is exactly A.
    b.set_live_muted(true);
    tx_a.send(vec![1000; CHUNK]).unwrap();
    tx_b.send(vec![2000; CHUNK]).unwrap();
    assert!(wait_for(
        || writes.lock().unwrap().iter().any(|w| w[0] == 1000),
        Duration::from_secs(10),
    ));
    let mixed_idx = {
        let writes = writes.lock().unwrap();
        let idx = writes.iter().position(|w| w[0] == 1000).unwrap();
        assert_eq!(writes[idx], vec![1000i16; CHUNK]);
        // B must never have leaked into the mix.
        assert!(writes.iter().all(|w| w[0] == 0 || w[0] == 1000));
        idx
    };

    // With the global live flag off nothing is mixed, mute flags regardless.
    mixer.set_live(false);
    tx_a.send(vec![1000; CHUNK]).unwrap();
    tx_b.send(vec![2000; CHUNK]).unwrap();
    assert!(wait_for(
        || reads_a.load(Ordering::SeqCst) >= 2,
        Duration::from_secs(10),
    ));
    assert!(wait_for(
        || writes.lock().unwrap().len() > mixed_idx + 1,
        Duration::from_secs(10),
    ));
    {
        let writes = writes.lock().unwrap();
        // Everything written after the live flag went down is silence.
        assert!(
            writes[mixed_idx + 1..]
                .iter()
                .all(|w| w.iter().all(|&s| s == 0))
        );
    }

    drop(tx_a);
    drop(tx_b);
    mixer.close();
}

#[test]
fn test_underflow_triggers_silence_catchup() {
    // First write reports an underflow and the device claims room for seven
    // samples; the loop should immediately top it up with that much silence.
    let (writes, output) = capture_output(7, &[true]);
    let mixer = AudioMixer::with_output(test_config(), Box::new(output));

    assert!(wait_for(
        || writes.lock().unwrap().len() >= 2,
        Duration::from_secs(10),
    ));
    mixer.close();

    let writes = writes.lock().unwrap();
    assert_eq!(writes[0].len(), CHUNK);
    assert_eq!(writes[1], vec![0i16; 7]);
}

#[test]
fn test_close_twice_releases_streams_once() {
    let (tx, _reads, released, input) = scripted_input();
    let (_writes, output) = capture_output(0, &[]);
    let mixer = AudioMixer::with_output(test_config(), Box::new(output));
    let track = mixer.add_track(Box::new(input));

    drop(tx);
    mixer.close();
    assert!(mixer.is_closed());
    assert!(released.load(Ordering::SeqCst));

    // Redundant closes are no-ops, not faults.
    mixer.close();
    track.close();
    assert!(mixer.is_closed());
}

#[test]
fn test_removed_track_keeps_queryable_waveform() {
    let (tx_a, _reads_a, released_a, input_a) = scripted_input();
    let (tx_b, _reads_b, _rel_b, input_b) = scripted_input();
    let (_writes, output) = capture_output(0, &[]);
    let mixer = AudioMixer::with_output(test_config(), Box::new(output));
    let a = mixer.add_track(Box::new(input_a));
    let b = mixer.add_track(Box::new(input_b));

    mixer.set_recording(true);
    for _ in 0..2 {
        tx_a.send(vec![600; CHUNK]).unwrap();
        tx_b.send(vec![400; CHUNK]).unwrap();
    }
    assert!(wait_for(|| mixer.position() >= 2, Duration::from_secs(10)));
    mixer.set_recording(false);

    drop(tx_a);
    assert!(mixer.remove_track(&a));
    assert!(!mixer.remove_track(&a));
    assert!(released_a.load(Ordering::SeqCst));
    assert_eq!(mixer.tracks().len(), 1);

    // The removed track's log is still valid, read-only.
    assert_eq!(a.run_at(0).unwrap().values, vec![600, 600]);
    assert_eq!(a.waveform_runs().len(), 1);

    // The engine keeps running for the remaining track.
    mixer.set_recording(true);
    tx_b.send(vec![400; CHUNK]).unwrap();
    assert!(wait_for(|| mixer.position() >= 3, Duration::from_secs(10)));
    mixer.set_recording(false);
    assert_eq!(b.run_at(2).unwrap().values.len(), 3);

    drop(tx_b);
    mixer.close();
}
