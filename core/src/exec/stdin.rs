//! Standard input shared between remote commands
//!
//! One thread owns the process's stdin and queues what it reads. A command
//! borrows the queue while it runs; input it did not consume stays queued for
//! the next command.

use std::io::Read;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use once_cell::sync::OnceCell;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::debug;

const CHUNK_SIZE: usize = 4096;
const QUEUE_DEPTH: usize = 16;

type Chunks = Arc<Mutex<mpsc::Receiver<Vec<u8>>>>;

/// Queued standard input, read by a dedicated thread once first borrowed
#[derive(Default)]
pub(crate) struct SharedStdin {
    chunks: OnceCell<Chunks>,
}

impl SharedStdin {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Borrow the queue until the returned reader is dropped
    pub(crate) async fn reader(&self) -> std::io::Result<SharedStdinReader> {
        let chunks = self.chunks.get_or_try_init(spawn_stdin_thread)?.clone();

        Ok(SharedStdinReader {
            chunks: chunks.lock_owned().await,
            pending: Vec::new(),
            offset: 0,
        })
    }
}

fn spawn_stdin_thread() -> std::io::Result<Chunks> {
    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
    std::thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || forward(std::io::stdin(), tx))?;
    debug!("Started standard input reader");
    Ok(Arc::new(Mutex::new(rx)))
}

/// Queue chunks of `source` until end-of-file or the queue is gone
fn forward<R: Read>(mut source: R, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                debug!("Stopped reading standard input: {}", e);
                break;
            }
        }
    }
}

/// Exclusive view of the queued input
pub(crate) struct SharedStdinReader {
    chunks: OwnedMutexGuard<mpsc::Receiver<Vec<u8>>>,
    pending: Vec<u8>,
    offset: usize,
}

impl AsyncRead for SharedStdinReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        if this.offset >= this.pending.len() {
            match this.chunks.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    this.pending = chunk;
                    this.offset = 0;
                }
                // Writer thread is gone, end-of-file
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }

        let n = buf.remaining().min(this.pending.len() - this.offset);
        buf.put_slice(&this.pending[this.offset..this.offset + n]);
        this.offset += n;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
impl SharedStdin {
    /// Queue fed by a test instead of this process's stdin
    fn with_receiver(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            chunks: OnceCell::with_value(Arc::new(Mutex::new(rx))),
        }
    }
}
