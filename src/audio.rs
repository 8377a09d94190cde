// src/audio.rs

use anyhow::{Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleFormat, SampleRate, Stream, StreamConfig};
use ringbuf::{
    HeapRb,
    traits::{Consumer, Observer, Producer, Split},
};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
    mpsc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::mixer::{InputStream, OutputStream};

/// Ring capacity between the device callback and the engine loop, in chunks.
const RING_CHUNKS: usize = 8;

/// Poll interval while a chunk read/write waits on the device callback.
const CHUNK_POLL: Duration = Duration::from_millis(1);

/// Poll interval of the thread that keeps a device stream alive.
const HOST_POLL: Duration = Duration::from_millis(50);

fn chunk_duration(rate: u32, chunk: usize) -> Duration {
    Duration::from_secs_f64(chunk as f64 / rate.max(1) as f64)
}

fn mono_config(rate: u32) -> StreamConfig {
    StreamConfig {
        channels: 1,
        sample_rate: SampleRate(rate),
        buffer_size: BufferSize::Default,
    }
}

/// Consumer end of the callback ring, erased so stream structs don't carry
/// the ring buffer's concrete types.
trait SamplePop: Send {
    fn pop_samples(&mut self, buf: &mut [i16]) -> usize;
}

impl<C: Consumer<Item = i16> + Send> SamplePop for C {
    fn pop_samples(&mut self, buf: &mut [i16]) -> usize {
        self.pop_slice(buf)
    }
}

/// Producer end of the callback ring.
trait SamplePush: Send {
    fn push_samples(&mut self, buf: &[i16]) -> usize;
    fn space(&self) -> usize;
}

impl<P: Producer<Item = i16> + Send> SamplePush for P {
    fn push_samples(&mut self, buf: &[i16]) -> usize {
        self.push_slice(buf)
    }

    fn space(&self) -> usize {
        self.vacant_len()
    }
}

/// Keeps a `cpal::Stream` alive on its own thread.
///
/// Streams are not `Send`, so the thread that builds one must own it until it
/// is released; dropping the host signals that thread and joins it.
struct StreamHost {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl StreamHost {
    fn spawn<F>(build: F) -> Result<Self>
    where
        F: FnOnce() -> Result<Stream> + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let (ready_tx, ready_rx) = mpsc::channel();

        let handle = thread::spawn(move || {
            let stream = match build() {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            while !thread_stop.load(Ordering::Relaxed) {
                thread::sleep(HOST_POLL);
            }
            drop(stream);
        });

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop,
                handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(anyhow!("audio host thread died while opening the stream"))
            }
        }
    }
}

impl Drop for StreamHost {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Chunked reader over a mono capture device.
pub struct ChunkInputStream {
    consumer: Box<dyn SamplePop>,
    overflow: Arc<AtomicBool>,
    read_deadline: Duration,
    _host: StreamHost,
}

impl InputStream for ChunkInputStream {
    fn read_chunk(&mut self, buf: &mut [i16]) -> bool {
        let deadline = Instant::now() + self.read_deadline;
        let mut filled = self.consumer.pop_samples(buf);
        while filled < buf.len() {
            if Instant::now() >= deadline {
                // Device stalled; pad with silence instead of holding the
                // mixer loop hostage.
                buf[filled..].fill(0);
                break;
            }
            thread::sleep(CHUNK_POLL);
            filled += self.consumer.pop_samples(&mut buf[filled..]);
        }
        self.overflow.swap(false, Ordering::Relaxed)
    }
}

/// Chunked writer over a mono playback device.
pub struct ChunkOutputStream {
    producer: Box<dyn SamplePush>,
    underflow: Arc<AtomicBool>,
    write_deadline: Duration,
    _host: StreamHost,
}

impl OutputStream for ChunkOutputStream {
    fn write_chunk(&mut self, buf: &[i16]) -> bool {
        let deadline = Instant::now() + self.write_deadline;
        let mut written = self.producer.push_samples(buf);
        while written < buf.len() {
            if Instant::now() >= deadline {
                // Device stalled; the rest of this chunk is lost.
                break;
            }
            thread::sleep(CHUNK_POLL);
            written += self.producer.push_samples(&buf[written..]);
        }
        self.underflow.swap(false, Ordering::Relaxed)
    }

    fn write_available(&self) -> usize {
        self.producer.space()
    }
}

/// Open and start a mono capture stream on the default input device.
pub fn open_input_stream(rate: u32, chunk: usize) -> Result<ChunkInputStream> {
    let ring = HeapRb::<i16>::new(chunk * RING_CHUNKS);
    let (producer, consumer) = ring.split();
    let overflow = Arc::new(AtomicBool::new(false));
    let callback_overflow = overflow.clone();

    let host = StreamHost::spawn(move || build_input_stream(rate, producer, callback_overflow))?;

    Ok(ChunkInputStream {
        consumer: Box::new(consumer),
        overflow,
        read_deadline: chunk_duration(rate, chunk) * 2,
        _host: host,
    })
}

/// Open and start a mono playback stream on the default output device.
pub fn open_output_stream(rate: u32, chunk: usize) -> Result<ChunkOutputStream> {
    let ring = HeapRb::<i16>::new(chunk * RING_CHUNKS);
    let (producer, consumer) = ring.split();
    let underflow = Arc::new(AtomicBool::new(false));
    let callback_underflow = underflow.clone();

    let host = StreamHost::spawn(move || build_output_stream(rate, consumer, callback_underflow))?;

    Ok(ChunkOutputStream {
        producer: Box::new(producer),
        underflow,
        write_deadline: chunk_duration(rate, chunk) * 2,
        _host: host,
    })
}

fn push_captured<P>(producer: &mut P, data: &[i16], overflow: &AtomicBool)
where
    P: Producer<Item = i16>,
{
    let pushed = producer.push_slice(data);
    if pushed < data.len() {
        // Ring full: the loop fell behind, the remainder is lost.
        overflow.store(true, Ordering::Relaxed);
    }
}

fn build_input_stream<P>(rate: u32, mut producer: P, overflow: Arc<AtomicBool>) -> Result<Stream>
where
    P: Producer<Item = i16> + Send + 'static,
{
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| anyhow!("no input device available"))?;
    let sample_format = device.default_input_config()?.sample_format();
    let config = mono_config(rate);
    let err_fn = |err| tracing::error!("input stream error: {err}");

    let stream = match sample_format {
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _| push_captured(&mut producer, data, &overflow),
            err_fn,
            None,
        )?,
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _| {
                let conv: Vec<i16> = data
                    .iter()
                    .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                    .collect();
                push_captured(&mut producer, &conv, &overflow);
            },
            err_fn,
            None,
        )?,
        other => anyhow::bail!("unsupported input sample format: {other:?}"),
    };

    stream.play()?;
    Ok(stream)
}

fn build_output_stream<C>(rate: u32, mut consumer: C, underflow: Arc<AtomicBool>) -> Result<Stream>
where
    C: Consumer<Item = i16> + Send + 'static,
{
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| anyhow!("no output device available"))?;
    let sample_format = device.default_output_config()?.sample_format();
    let config = mono_config(rate);
    let err_fn = |err| tracing::error!("output stream error: {err}");

    let stream = match sample_format {
        SampleFormat::I16 => device.build_output_stream(
            &config,
            move |data: &mut [i16], _| {
                let popped = consumer.pop_slice(data);
                if popped < data.len() {
                    data[popped..].fill(0);
                    underflow.store(true, Ordering::Relaxed);
                }
            },
            err_fn,
            None,
        )?,
        SampleFormat::F32 => device.build_output_stream(
            &config,
            move |data: &mut [f32], _| {
                for out in data.iter_mut() {
                    match consumer.try_pop() {
                        Some(s) => *out = f32::from(s) / 32768.0,
                        None => {
                            *out = 0.0;
                            underflow.store(true, Ordering::Relaxed);
                        }
                    }
                }
            },
            err_fn,
            None,
        )?,
        other => anyhow::bail!("unsupported output sample format: {other:?}"),
    };

    stream.play()?;
    Ok(stream)
}
