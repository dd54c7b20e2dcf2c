//! Progress for `nix copy`

use std::collections::HashMap;

use async_trait::async_trait;
use console::style;
use tokio_util::sync::CancellationToken;

use super::{header, run_model, Frame, ProgressModel, Progresses, Transfer, Update};
use crate::error::{Error, Result};
use crate::nix::{Event, LogDecoder, ProgressReporter, LEVEL_ERROR};

/// Renders store path transfers between machines
pub struct CopyReporter {
    verbose: bool,
    fps: u32,
}

impl CopyReporter {
    pub fn new(verbose: bool, fps: u32) -> Self {
        Self { verbose, fps }
    }
}

#[async_trait]
impl ProgressReporter for CopyReporter {
    async fn run(&mut self, token: CancellationToken, decoder: LogDecoder) -> Result<()> {
        run_model(token, CopyModel::new(self.verbose), decoder, self.fps).await
    }
}

/// Copy progress state
#[derive(Debug)]
pub struct CopyModel {
    verbose: bool,
    initialized: bool,
    copy_paths: Progresses,
    copies: HashMap<i64, Transfer>,
    transfers: HashMap<i64, i64>,
    status: String,
    error: Option<String>,
}

impl CopyModel {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            initialized: false,
            copy_paths: Progresses::default(),
            copies: HashMap::new(),
            transfers: HashMap::new(),
            status: "Initializing...".to_string(),
            error: None,
        }
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    fn stop(&mut self, id: i64) -> Update {
        let mut update = Update::Continue;
        let mut removed = false;

        if let Some(copy) = self.copies.remove(&id) {
            self.transfers.retain(|_, parent| *parent != id);
            removed = true;

            if self.verbose {
                self.status.clear();
                let check = style("✓").green().bright().for_stderr();
                update = Update::Print(format!("{} {}", check, copy.name));
            }
        }

        removed |= self.transfers.remove(&id).is_some();

        if removed && self.initialized && self.copies.is_empty() {
            self.status.clear();
        }

        update
    }

    fn progress(&mut self, id: i64, done: i64, expected: i64, running: i64) {
        if self.copy_paths.update(id, done, expected, running) {
            return;
        }

        // Either the copy itself or one of its transfers
        let copy_id = match self.transfers.get(&id) {
            Some(parent) if !self.copies.contains_key(&id) => *parent,
            _ => id,
        };

        if let Some(copy) = self.copies.get_mut(&copy_id) {
            copy.done = done;
            copy.total = expected;
            self.status = copy.to_string();
        }
    }
}

/// Shorten a line from the left so it fits in `width` columns
fn truncate_left(line: &str, width: usize) -> String {
    const ELLIPSIS: &str = "...";

    if console::measure_text_width(line) <= width {
        return line.to_string();
    }

    let keep = width.saturating_sub(ELLIPSIS.len());
    let chars: Vec<char> = line.chars().collect();
    let tail: String = chars[chars.len().saturating_sub(keep)..].iter().collect();
    format!("{}{}", ELLIPSIS, tail)
}

impl ProgressModel for CopyModel {
    fn handle(&mut self, event: Event) -> Update {
        match event {
            Event::StartCopyPaths { id, .. } => {
                self.copy_paths.start(id);
                self.initialized = true;
            }
            Event::StartCopyPath { id, path, text, .. } => {
                self.copies.insert(id, Transfer::new(path));
                if self.verbose && !text.is_empty() {
                    return Update::Print(text);
                }
            }
            Event::StartFileTransfer { id, parent, .. } => {
                if self.copies.contains_key(&parent) {
                    self.transfers.insert(id, parent);
                }
            }
            Event::ResultProgress {
                id,
                done,
                expected,
                running,
                ..
            } => self.progress(id, done, expected, running),
            Event::Stop { id } => return self.stop(id),
            Event::Message { text, level } => {
                if level == LEVEL_ERROR {
                    self.error = Some(text);
                    return Update::Quit;
                }
                if self.verbose {
                    return Update::Print(text);
                }
                self.status = text;
            }
            Event::StartBuilds { .. }
            | Event::StartBuild { .. }
            | Event::ResultSetPhase { .. }
            | Event::ResultBuildLogLine { .. } => {}
        }

        Update::Continue
    }

    fn view(&self, frame: Frame<'_>) -> Vec<String> {
        if self.error.is_some() {
            return Vec::new();
        }

        if !self.initialized {
            return vec![format!("{}{}", frame.spinner, self.status)];
        }

        let mut lines = Vec::new();
        if self.status.is_empty() {
            lines.push(String::new());
        } else {
            let width = frame
                .width
                .saturating_sub(console::measure_text_width(frame.spinner));
            lines.push(format!(
                "{}{}",
                frame.spinner,
                truncate_left(&self.status, width)
            ));
        }

        let transfers = self.copy_paths.summary("↑");
        lines.push(header("Transfers:", &transfers));
        lines.push(transfers);

        lines
    }

    fn take_error(&mut self) -> Option<Error> {
        self.error.take().map(Error::BuildFailed)
    }
}
