//! The single writer of the control channel
//!
//! Every check submits its directive batches to one unbounded queue. The sink
//! drains it and writes each batch as one contiguous buffer, so the BGP speaker
//! only ever sees complete lines and a check's batch is never split.

use std::path::Path;
use std::pin::Pin;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::route::RouteDirective;

/// Boxed control channel writer
pub type ControlWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Open the control channel: stdout, or a file/FIFO opened for append
pub async fn open_control(path: Option<&Path>) -> Result<ControlWriter> {
    match path {
        None => Ok(Box::pin(tokio::io::stdout())),
        Some(path) => {
            let file = tokio::fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(path)
                .await?;
            info!(path = %path.display(), "Writing route commands to file");
            Ok(Box::pin(file))
        }
    }
}

/// Create a connected handle/sink pair
pub fn channel() -> (SinkHandle, AnnouncementSink) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SinkHandle { tx }, AnnouncementSink { rx })
}

/// Cloneable producer side of the directive queue
#[derive(Clone)]
pub struct SinkHandle {
    tx: mpsc::UnboundedSender<Vec<RouteDirective>>,
}

impl SinkHandle {
    /// Queue a batch; it will be written atomically with respect to other batches
    pub fn submit(&self, batch: Vec<RouteDirective>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.tx.send(batch).map_err(|_| Error::SinkClosed)
    }
}

/// Consumer side, owned by the one task that writes the control channel
pub struct AnnouncementSink {
    rx: mpsc::UnboundedReceiver<Vec<RouteDirective>>,
}

fn render(batch: &[RouteDirective]) -> String {
    let mut buf = String::new();
    for directive in batch {
        buf.push_str(&directive.to_command());
        buf.push('\n');
    }
    buf
}

impl AnnouncementSink {
    /// Write batches until every [`SinkHandle`] is dropped.
    ///
    /// A write failure cancels `fatal` and returns [`Error::ControlChannel`]:
    /// once a line may have been lost the speaker's route state is unknown.
    /// Returns the number of lines written.
    pub async fn run<W>(mut self, mut writer: W, fatal: CancellationToken) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut written = 0u64;

        while let Some(batch) = self.rx.recv().await {
            let buf = render(&batch);
            let result = async {
                writer.write_all(buf.as_bytes()).await?;
                writer.flush().await
            }
            .await;

            if let Err(e) = result {
                error!(error = %e, "Control channel write failed, shutting down");
                fatal.cancel();
                return Err(Error::ControlChannel(e));
            }

            for directive in &batch {
                debug!(check = %directive.check, command = %directive.to_command(), "Route command written");
            }
            written += batch.len() as u64;
        }

        let _ = writer.shutdown().await;
        debug!(lines = written, "Announcement sink closed");
        Ok(written)
    }

    /// Take whatever is queued without writing it
    #[cfg(test)]
    pub(crate) fn drain_pending(&mut self) -> Vec<RouteDirective> {
        let mut out = Vec::new();
        while let Ok(batch) = self.rx.try_recv() {
            out.extend(batch);
        }
        out
    }
}
