// src/lib.rs

pub mod audio;
pub mod mixer;

pub use audio::{ChunkInputStream, ChunkOutputStream, open_input_stream, open_output_stream};
pub use mixer::{
    AudioMixer, InputStream, MixerConfig, OutputStream, SummaryMetric, Track, WaveformLog,
    WaveformRun,
};
