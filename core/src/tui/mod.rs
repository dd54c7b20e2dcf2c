//! Live progress rendering for engine commands
//!
//! A reporter owns a model that is fed decoded events by a pump task over a
//! channel. The model is only ever touched by the render loop, which also
//! redraws the progress area on a fixed tick.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use console::{style, Alignment};
use futures::StreamExt;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::nix::{Event, LogDecoder};
use crate::util::{convert_bytes, convert_bytes_to_unit};

mod build;
mod copy;

pub use build::{BuildModel, BuildReporter};
pub use copy::{CopyModel, CopyReporter};

const SPINNER_FRAMES: &[&str] = &["⣾", "⣽", "⣻", "⢿", "⡿", "⣟", "⣯", "⣷"];
const SPINNER_INTERVAL: Duration = Duration::from_millis(100);
const EVENT_BUFFER: usize = 256;

/// What the render loop should do after an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    Continue,
    /// Print a line above the progress area
    Print(String),
    /// Stop rendering
    Quit,
}

/// Per-redraw parameters handed to a model
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    /// Current spinner glyph, styled and followed by a space
    pub spinner: &'a str,
    /// Terminal width in columns
    pub width: usize,
}

/// State machine driven by engine events
pub trait ProgressModel: Send {
    /// Apply one event
    fn handle(&mut self, event: Event) -> Update;

    /// Render the progress area, one entry per line
    fn view(&self, frame: Frame<'_>) -> Vec<String>;

    /// The fatal error seen, if any
    fn take_error(&mut self) -> Option<Error>;
}

/// Counters of one aggregate activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub done: i64,
    pub expected: i64,
    pub running: i64,
}

/// Aggregate counters keyed by activity id
#[derive(Debug, Clone, Default)]
pub struct Progresses(HashMap<i64, Progress>);

impl Progresses {
    /// Register an aggregate at zero
    pub fn start(&mut self, id: i64) {
        self.0.insert(id, Progress::default());
    }

    /// Update a known aggregate, returns false for unknown ids
    pub fn update(&mut self, id: i64, done: i64, expected: i64, running: i64) -> bool {
        match self.0.get_mut(&id) {
            Some(progress) => {
                *progress = Progress {
                    done,
                    expected,
                    running,
                };
                true
            }
            None => false,
        }
    }

    pub fn done(&self) -> i64 {
        self.0.values().map(|p| p.done).sum()
    }

    pub fn expected(&self) -> i64 {
        self.0.values().map(|p| p.expected).sum()
    }

    pub fn running(&self) -> i64 {
        self.0.values().map(|p| p.running).sum()
    }

    pub fn remaining(&self) -> i64 {
        self.expected() - self.done()
    }

    /// `<running> | ✓ <done> | ⧗ <remaining>` with a custom running glyph
    fn summary(&self, running_glyph: &str) -> String {
        format!(
            "{} | {} | {}",
            style(format!("{} {}", running_glyph, self.running()))
                .yellow()
                .bright()
                .for_stderr(),
            style(format!("✓ {}", self.done()))
                .green()
                .bright()
                .for_stderr(),
            style(format!("⧗ {}", self.remaining()))
                .blue()
                .bright()
                .for_stderr(),
        )
    }
}

/// A path being copied into or out of the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub name: String,
    pub done: i64,
    pub total: i64,
}

impl Transfer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            done: 0,
            total: 0,
        }
    }
}

impl fmt::Display for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.total > 0 {
            let (total, unit) = convert_bytes(self.total);
            let done = convert_bytes_to_unit(self.done, unit);
            write!(f, "{} [{:.2}/{:.2} {}]", self.name, done, total, unit)
        } else {
            f.write_str(&self.name)
        }
    }
}

/// Bold header padded to the visible width of the column below it
fn header(title: &str, column: &str) -> String {
    let title = style(title).bold().for_stderr().to_string();
    console::pad_str(&title, console::measure_text_width(column), Alignment::Left, None)
        .into_owned()
}

fn spinner_frame(started: Instant) -> String {
    let index = (started.elapsed().as_millis() / SPINNER_INTERVAL.as_millis()) as usize;
    let glyph = SPINNER_FRAMES[index % SPINNER_FRAMES.len()];
    format!("{} ", style(glyph).color256(205).for_stderr())
}

/// Draws view lines as a stack of message-only bars on stderr
struct Renderer {
    multi: MultiProgress,
    lines: Vec<ProgressBar>,
    style: ProgressStyle,
}

impl Renderer {
    fn new(fps: u32) -> Self {
        let fps = fps.clamp(1, 60) as u8;
        Self {
            multi: MultiProgress::with_draw_target(ProgressDrawTarget::stderr_with_hz(fps)),
            lines: Vec::new(),
            style: ProgressStyle::with_template("{msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        }
    }

    fn width(&self) -> usize {
        console::Term::stderr().size().1 as usize
    }

    fn draw(&mut self, view: Vec<String>) {
        let width = self.width();

        while self.lines.len() < view.len() {
            let bar = self.multi.add(ProgressBar::hidden());
            bar.set_style(self.style.clone());
            self.lines.push(bar);
        }
        while self.lines.len() > view.len() {
            if let Some(bar) = self.lines.pop() {
                bar.finish_and_clear();
                self.multi.remove(&bar);
            }
        }

        for (bar, line) in self.lines.iter().zip(view) {
            bar.set_message(console::truncate_str(&line, width, "...").into_owned());
        }
    }

    fn print(&self, line: &str) {
        self.multi.suspend(|| eprintln!("{}", line));
    }

    /// Leave the last drawn view on screen
    fn finish(self) {
        for bar in &self.lines {
            bar.finish();
        }
    }

    fn clear(self) {
        for bar in &self.lines {
            bar.finish_and_clear();
        }
        let _ = self.multi.clear();
    }
}

/// Drive a model from a decoder until the log ends, the token is cancelled or
/// the model quits
pub async fn run_model<M: ProgressModel>(
    token: CancellationToken,
    mut model: M,
    decoder: LogDecoder,
    fps: u32,
) -> Result<()> {
    let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);

    let pump_token = token.clone();
    tokio::spawn(async move {
        let mut decoder = decoder;
        {
            let mut events = std::pin::pin!(decoder.events());
            while let Some(event) = events.next().await {
                tokio::select! {
                    _ = pump_token.cancelled() => break,
                    sent = tx.send(event) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        drop(tx);

        // Keep reading so the engine never blocks on a full stderr pipe
        let mut rest = decoder.into_inner();
        if let Err(e) = tokio::io::copy(&mut rest, &mut tokio::io::sink()).await {
            debug!("Failed to drain engine output: {}", e);
        }
    });

    let mut renderer = Renderer::new(fps);
    let started = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_secs(1) / fps.max(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => match model.handle(event) {
                    Update::Continue => {}
                    Update::Print(line) => renderer.print(&line),
                    Update::Quit => break,
                },
                None => break,
            },
            _ = ticker.tick() => {
                let spinner = spinner_frame(started);
                let width = renderer.width();
                renderer.draw(model.view(Frame { spinner: &spinner, width }));
            }
            _ = token.cancelled() => {
                debug!("Progress rendering cancelled");
                break;
            }
        }
    }

    match model.take_error() {
        Some(err) => {
            renderer.clear();
            Err(err)
        }
        None => {
            let spinner = spinner_frame(started);
            let width = renderer.width();
            renderer.draw(model.view(Frame { spinner: &spinner, width }));
            renderer.finish();
            Ok(())
        }
    }
}
