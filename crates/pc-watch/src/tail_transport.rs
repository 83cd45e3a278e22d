//! Live events by tailing a job's `events.log`.
//!
//! Every subscription replays the log from the start and then polls for
//! appended lines. A log that shrinks, or whose file was replaced by a
//! rename, is treated as rewritten and read again from offset zero. A trailing line without its
//! newline is delivered once the log has been quiet for a few polls.

use crate::file_adapter::job_dir;
use pc_core::frames::{DecodeReport, LineFrameDecoder, DEFAULT_MAX_FRAME_BYTES};
use pc_core::{JobClass, TransportError};
use pc_state::transport::{SubscribeFuture, LIVE_CHANNEL_CAPACITY};
use pc_state::{JobTransport, LiveConnection, TransportEvent};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

pub const EVENTS_FILE: &str = "events.log";
pub const DEFAULT_POLL: Duration = Duration::from_millis(250);
const QUIET_POLLS_BEFORE_FLUSH: u32 = 4;

#[derive(Clone)]
pub struct TailTransport {
    root: Arc<PathBuf>,
    poll: Duration,
}

impl TailTransport {
    pub fn new(root: impl Into<PathBuf>, poll: Duration) -> Self {
        Self {
            root: Arc::new(root.into()),
            poll: poll.max(Duration::from_millis(1)),
        }
    }
}

impl JobTransport for TailTransport {
    fn subscribe(&self, class: JobClass, job_id: &str) -> SubscribeFuture {
        let root = self.root.clone();
        let poll = self.poll;
        let job_id = job_id.to_string();
        Box::pin(async move {
            let dir = job_dir(&root, class, &job_id).ok_or_else(|| {
                TransportError::Connection(format!("invalid {}: {job_id}", class.id_field()))
            })?;
            let meta = tokio::fs::metadata(&dir)
                .await
                .map_err(|err| TransportError::Connection(format!("{}: {err}", dir.display())))?;
            if !meta.is_dir() {
                return Err(TransportError::Connection(format!(
                    "{} is not a job directory",
                    dir.display()
                )));
            }

            let (tx, rx) = mpsc::channel(LIVE_CHANNEL_CAPACITY);
            let task = tokio::spawn(tail_events(dir.join(EVENTS_FILE), poll, tx));
            debug!("tail_transport_open: {} {job_id}", class.as_str());
            Ok(LiveConnection::new(rx, move || task.abort()))
        })
    }
}

enum Read {
    Appended(Vec<u8>),
    Rewritten,
}

/// Inode of the log file. A writer that replaces the log (write a temp file,
/// then rename) changes it even when the new file is not shorter. An in-place
/// rewrite to the same or a larger size keeps the inode and is read as an
/// append.
#[cfg(unix)]
fn file_identity(meta: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.ino())
}

#[cfg(not(unix))]
fn file_identity(_meta: &std::fs::Metadata) -> Option<u64> {
    None
}

struct LogCursor {
    offset: u64,
    identity: Option<u64>,
}

impl LogCursor {
    async fn read(&mut self, path: &Path) -> std::io::Result<Read> {
        let mut file = tokio::fs::File::open(path).await?;
        let meta = file.metadata().await?;
        let identity = file_identity(&meta);
        let replaced = matches!(
            (self.identity, identity),
            (Some(previous), Some(current)) if previous != current
        );
        if replaced || meta.len() < self.offset {
            self.offset = 0;
            self.identity = None;
            return Ok(Read::Rewritten);
        }
        self.identity = identity;

        let mut appended = Vec::new();
        if meta.len() > self.offset {
            file.seek(SeekFrom::Start(self.offset)).await?;
            file.read_to_end(&mut appended).await?;
            self.offset += appended.len() as u64;
        }
        Ok(Read::Appended(appended))
    }
}

/// Forwards decoded frames. Returns `false` once the receiver is gone.
async fn deliver(path: &Path, report: DecodeReport, tx: &mpsc::Sender<TransportEvent>) -> bool {
    if report.is_empty() {
        return true;
    }
    for err in report.errors {
        warn!("tail_transport_frame_error: {} {err}", path.display());
    }
    for frame in report.frames {
        if tx.send(TransportEvent::Message(frame)).await.is_err() {
            return false;
        }
    }
    true
}

async fn tail_events(path: PathBuf, poll: Duration, tx: mpsc::Sender<TransportEvent>) {
    let mut cursor = LogCursor {
        offset: 0,
        identity: None,
    };
    let mut decoder = LineFrameDecoder::new(DEFAULT_MAX_FRAME_BYTES);
    let mut quiet_polls = 0;
    let mut ticker = tokio::time::interval(poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = tx.closed() => return,
            _ = ticker.tick() => {}
        }

        let appended = match cursor.read(&path).await {
            Ok(Read::Appended(bytes)) => bytes,
            Ok(Read::Rewritten) => {
                warn!("tail_transport_rewritten: {}", path.display());
                decoder = LineFrameDecoder::new(DEFAULT_MAX_FRAME_BYTES);
                quiet_polls = 0;
                continue;
            }
            // The job may not have written its first event yet.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => {
                let _ = tx
                    .send(TransportEvent::Error(format!("{}: {err}", path.display())))
                    .await;
                return;
            }
        };

        let report = if !appended.is_empty() {
            quiet_polls = 0;
            decoder.push_chunk(&appended)
        } else if decoder.has_partial() {
            quiet_polls += 1;
            if quiet_polls < QUIET_POLLS_BEFORE_FLUSH {
                continue;
            }
            quiet_polls = 0;
            debug!("tail_transport_flush_partial: {}", path.display());
            decoder.finish()
        } else {
            continue;
        };
        if !deliver(&path, report, &tx).await {
            return;
        }
    }
}
