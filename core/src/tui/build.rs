//! Progress for `nix build`

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use console::style;
use tokio_util::sync::CancellationToken;

use super::{header, run_model, Frame, ProgressModel, Progresses, Transfer, Update};
use crate::error::{Error, Result};
use crate::nix::{display_name, Event, LogDecoder, ProgressReporter, LEVEL_ERROR};

/// Renders builds and downloads while the engine builds
pub struct BuildReporter {
    verbose: bool,
    fps: u32,
}

impl BuildReporter {
    pub fn new(verbose: bool, fps: u32) -> Self {
        Self { verbose, fps }
    }
}

#[async_trait]
impl ProgressReporter for BuildReporter {
    async fn run(&mut self, token: CancellationToken, decoder: LogDecoder) -> Result<()> {
        run_model(token, BuildModel::new(self.verbose), decoder, self.fps).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Build {
    name: String,
    phase: Option<String>,
}

impl fmt::Display for Build {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.phase {
            Some(phase) => write!(f, "{} [{}]", self.name, phase),
            None => f.write_str(&self.name),
        }
    }
}

/// Build progress state
#[derive(Debug)]
pub struct BuildModel {
    verbose: bool,
    initialized: bool,
    copy_paths: Progresses,
    build_totals: Progresses,
    downloads: HashMap<i64, Transfer>,
    // transfer id -> download id
    transfers: HashMap<i64, i64>,
    builds: HashMap<i64, Build>,
    status: String,
    error: Option<String>,
}

impl BuildModel {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            initialized: false,
            copy_paths: Progresses::default(),
            build_totals: Progresses::default(),
            downloads: HashMap::new(),
            transfers: HashMap::new(),
            builds: HashMap::new(),
            status: "Initializing build...".to_string(),
            error: None,
        }
    }

    /// The rolling status line
    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn stop(&mut self, id: i64) {
        let mut removed = self.builds.remove(&id).is_some();

        if self.downloads.remove(&id).is_some() {
            self.transfers.retain(|_, parent| *parent != id);
            removed = true;
        }

        removed |= self.transfers.remove(&id).is_some();

        if removed && self.initialized && self.builds.is_empty() && self.downloads.is_empty() {
            self.status.clear();
        }
    }

    fn progress(&mut self, id: i64, done: i64, expected: i64, running: i64) {
        if self.copy_paths.update(id, done, expected, running)
            || self.build_totals.update(id, done, expected, running)
        {
            return;
        }

        let Some(parent) = self.transfers.get(&id) else {
            return;
        };
        if let Some(download) = self.downloads.get_mut(parent) {
            download.done = done;
            download.total = expected;
            self.status = download.to_string();
        }
    }

    fn live_items(&self) -> Vec<(i64, String)> {
        let mut items: Vec<(i64, String)> = self
            .downloads
            .iter()
            .map(|(id, d)| (*id, d.to_string()))
            .chain(self.builds.iter().map(|(id, b)| (*id, b.to_string())))
            .collect();
        items.sort_by_key(|(id, _)| *id);
        items
    }
}

impl ProgressModel for BuildModel {
    fn handle(&mut self, event: Event) -> Update {
        match event {
            Event::StartCopyPaths { id, .. } => {
                self.copy_paths.start(id);
                self.initialized = true;
            }
            Event::StartBuilds { id, .. } => {
                self.build_totals.start(id);
                self.initialized = true;
            }
            Event::StartCopyPath { id, path, text, .. } => {
                self.downloads.insert(id, Transfer::new(display_name(&path)));
                if self.verbose && !text.is_empty() {
                    return Update::Print(text);
                }
            }
            Event::StartFileTransfer { id, parent, .. } => {
                if self.downloads.contains_key(&parent) {
                    self.transfers.insert(id, parent);
                }
            }
            Event::StartBuild { id, path, .. } => {
                self.builds.insert(
                    id,
                    Build {
                        name: display_name(&path).to_string(),
                        phase: None,
                    },
                );
            }
            Event::ResultSetPhase { id, phase } => {
                if let Some(build) = self.builds.get_mut(&id) {
                    build.phase = Some(phase);
                    self.status = build.to_string();
                }
            }
            Event::ResultProgress {
                id,
                done,
                expected,
                running,
                ..
            } => self.progress(id, done, expected, running),
            Event::ResultBuildLogLine { id, text } => {
                if !self.verbose {
                    return Update::Continue;
                }
                if let Some(build) = self.builds.get(&id) {
                    let prefix = style(format!("{}>", build.name)).magenta().for_stderr();
                    return Update::Print(format!("{} {}", prefix, text));
                }
            }
            Event::Stop { id } => self.stop(id),
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
        if self.verbose {
            for (_, item) in self.live_items() {
                lines.push(format!("{}{}", frame.spinner, item));
            }
        } else if !self.status.is_empty() {
            lines.push(format!("{}{}", frame.spinner, self.status));
        }

        let builds = self.build_totals.summary("▶");
        let downloads = self.copy_paths.summary("↓");
        lines.push(format!(
            "{} | {}",
            header("Builds:", &builds),
            header("Downloads:", &downloads)
        ));
        lines.push(format!("{} | {}", builds, downloads));

        lines
    }

    fn take_error(&mut self) -> Option<Error> {
        self.error.take().map(Error::BuildFailed)
    }
}
