// src/main.rs

use std::io::{Write, stdout};
use std::time::Duration;

use crossterm::{
    cursor::MoveTo,
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{Clear, ClearType, disable_raw_mode, enable_raw_mode},
};

use mixdeck::{AudioMixer, Track, WaveformRun};

const VIEW_WIDTH: usize = 72;
const VIEW_HEIGHT: usize = 8;

fn main() -> Result<(), anyhow::Error> {
    let _ = tracing_subscriber::fmt::try_init();

    let mixer = AudioMixer::new()?;
    let track = mixer.new_track()?;

    println!("mixdeck monitor:");
    println!("  R = Record on/off");
    println!("  M = Mute/unmute the input in the live mix");
    println!("  L = Live monitor on/off");
    println!("  Q = Quit");

    enable_raw_mode()?;
    let result = run_ui(&mixer, &track);
    disable_raw_mode()?;

    mixer.close();
    result
}

fn run_ui(mixer: &AudioMixer, track: &Track) -> Result<(), anyhow::Error> {
    let frame = Duration::from_millis(100);

    loop {
        if event::poll(frame)? {
            if let Event::Key(ev) = event::read()? {
                if ev.kind == KeyEventKind::Press {
                    match ev.code {
                        KeyCode::Char('q') | KeyCode::Char('Q') => break,
                        KeyCode::Char('c') if ev.modifiers.contains(KeyModifiers::CONTROL) => {
                            break;
                        }
                        KeyCode::Char('r') | KeyCode::Char('R') => {
                            mixer.set_recording(!mixer.is_recording());
                        }
                        KeyCode::Char('m') | KeyCode::Char('M') => {
                            track.set_live_muted(!track.is_live_muted());
                        }
                        KeyCode::Char('l') | KeyCode::Char('L') => {
                            mixer.set_live(!mixer.is_live());
                        }
                        _ => {}
                    }
                }
            }
        }

        draw(mixer, track)?;
    }

    Ok(())
}

fn draw(mixer: &AudioMixer, track: &Track) -> Result<(), anyhow::Error> {
    let pos = mixer.position();
    let values = window_values(&track.waveform_runs(), pos, VIEW_WIDTH);

    let mut out = stdout();
    execute!(out, MoveTo(0, 6), Clear(ClearType::FromCursorDown))?;

    write!(
        out,
        "pos {:>8}  rec {}  live {}  muted {}\r\n\r\n",
        pos,
        if mixer.is_recording() { "on " } else { "off" },
        if mixer.is_live() { "on " } else { "off" },
        if track.is_live_muted() { "yes" } else { "no" },
    )?;
    for line in render_ascii(&values, VIEW_HEIGHT) {
        write!(out, "{line}\r\n")?;
    }
    out.flush()?;
    Ok(())
}

/// Waveform values for the window of chunk positions ending at `end`,
/// zero-filled where no run covers a position.
fn window_values(runs: &[WaveformRun], end: u64, width: usize) -> Vec<u16> {
    let start = end.saturating_sub(width as u64);
    let mut values = vec![0u16; width];
    let pad = width - (end - start) as usize;
    for run in runs {
        let lo = run.start.max(start);
        let hi = run.end().min(end);
        for p in lo..hi {
            values[pad + (p - start) as usize] = run.values[(p - run.start) as usize];
        }
    }
    values
}

/// One text row per level band, loudest on top.
fn render_ascii(values: &[u16], height: usize) -> Vec<String> {
    let h = height.max(2);
    (0..h)
        .map(|row| {
            let level = (h - row) as f32 / h as f32;
            values
                .iter()
                .map(|&v| if v as f32 / 32768.0 >= level { '█' } else { ' ' })
                .collect()
        })
        .collect()
}
