//! Decoder for the engine's `internal-json` log format
//!
//! Every relevant line on the engine's stderr looks like `@nix {json}`. The
//! first line without that marker ends the stream. Lines that are not valid
//! JSON, and events that are incomplete or unknown, are skipped.

use futures::Stream;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, trace};

use super::event::Event;

/// Marker in front of every structured log line
pub const PROTOCOL_PREFIX: &[u8] = b"@nix ";

const ACTION_START: &str = "start";
const ACTION_STOP: &str = "stop";
const ACTION_RESULT: &str = "result";
const ACTION_MESSAGE: &str = "msg";

const START_COPY_PATH: i64 = 100;
const START_FILE_TRANSFER: i64 = 101;
const START_COPY_PATHS: i64 = 103;
const START_BUILDS: i64 = 104;
const START_BUILD: i64 = 105;

const RESULT_BUILD_LOG_LINE: i64 = 101;
const RESULT_SET_PHASE: i64 = 104;
const RESULT_PROGRESS: i64 = 105;

/// Lazily turns a byte stream into [`Event`]s
pub struct ProgressDecoder<R> {
    reader: R,
    line: Vec<u8>,
    finished: bool,
}

impl<R: AsyncBufRead + Unpin> ProgressDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: Vec::new(),
            finished: false,
        }
    }

    /// Decode the next event, `None` once the protocol stream has ended
    pub async fn next_event(&mut self) -> Option<Event> {
        while !self.finished {
            self.line.clear();
            match self.reader.read_until(b'\n', &mut self.line).await {
                Ok(0) => self.finished = true,
                Ok(_) => {
                    let line = trim_newline(&self.line);
                    let Some(payload) = line.strip_prefix(PROTOCOL_PREFIX) else {
                        debug!("End of structured log output");
                        self.finished = true;
                        break;
                    };

                    match serde_json::from_slice::<Value>(payload) {
                        Ok(value) => {
                            if let Some(event) = decode_event(&value) {
                                return Some(event);
                            }
                        }
                        Err(e) => trace!("Skipping malformed event: {}", e),
                    }
                }
                Err(e) => {
                    debug!("Failed to read log stream: {}", e);
                    self.finished = true;
                }
            }
        }

        None
    }

    /// Stream the remaining events, the decoder stays usable afterwards
    pub fn events(&mut self) -> impl Stream<Item = Event> + '_ {
        futures::stream::unfold(self, |decoder| async move {
            decoder.next_event().await.map(|event| (event, decoder))
        })
    }

    /// Get the underlying reader back, positioned after the last consumed line
    pub fn into_inner(self) -> R {
        self.reader
    }
}

fn trim_newline(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Decode one parsed JSON object into an event
pub fn decode_event(value: &Value) -> Option<Event> {
    match value.get("action")?.as_str()? {
        ACTION_START => decode_start(value),
        ACTION_RESULT => decode_result(value),
        ACTION_STOP => Some(Event::Stop { id: id(value)? }),
        ACTION_MESSAGE => Some(Event::Message {
            text: value.get("msg")?.as_str()?.to_string(),
            level: value.get("level")?.as_i64()?,
        }),
        _ => None,
    }
}

fn decode_start(value: &Value) -> Option<Event> {
    let id = id(value)?;

    match value.get("type")?.as_i64()? {
        START_COPY_PATHS => Some(Event::StartCopyPaths {
            id,
            parent: int(value.get("parent")),
        }),
        START_BUILDS => Some(Event::StartBuilds {
            id,
            parent: int(value.get("parent")),
        }),
        START_COPY_PATH => {
            let fields = fields(value, 3)?;
            Some(Event::StartCopyPath {
                id,
                path: fields[0].as_str()?.to_string(),
                from: fields[1].as_str()?.to_string(),
                to: fields[2].as_str()?.to_string(),
                text: text(value),
            })
        }
        START_BUILD => {
            let fields = fields(value, 1)?;
            Some(Event::StartBuild {
                id,
                path: fields[0].as_str()?.to_string(),
                text: text(value),
            })
        }
        START_FILE_TRANSFER => {
            let fields = fields(value, 1)?;
            Some(Event::StartFileTransfer {
                id,
                parent: int(value.get("parent")),
                path: fields[0].as_str()?.to_string(),
                text: text(value),
            })
        }
        _ => None,
    }
}

fn decode_result(value: &Value) -> Option<Event> {
    let id = id(value)?;

    match value.get("type")?.as_i64()? {
        RESULT_PROGRESS => {
            let fields = fields(value, 4)?;
            Some(Event::ResultProgress {
                id,
                done: int(fields.first()),
                expected: int(fields.get(1)),
                running: int(fields.get(2)),
                failed: int(fields.get(3)),
            })
        }
        RESULT_SET_PHASE => {
            let fields = fields(value, 1)?;
            Some(Event::ResultSetPhase {
                id,
                phase: fields[0].as_str()?.to_string(),
            })
        }
        RESULT_BUILD_LOG_LINE => {
            let fields = fields(value, 1)?;
            Some(Event::ResultBuildLogLine {
                id,
                text: fields[0].as_str()?.to_string(),
            })
        }
        _ => None,
    }
}

/// Event id, only positive ids are valid
fn id(value: &Value) -> Option<i64> {
    value.get("id")?.as_i64().filter(|id| *id > 0)
}

/// The `fields` array, if it holds at least `min` entries
fn fields(value: &Value, min: usize) -> Option<&Vec<Value>> {
    value
        .get("fields")?
        .as_array()
        .filter(|fields| fields.len() >= min)
}

fn int(value: Option<&Value>) -> i64 {
    value.and_then(Value::as_i64).unwrap_or(0)
}

fn text(value: &Value) -> String {
    value
        .get("text")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
