//! Connection registry and writer task.
//!
//! The registry task is the sole owner of every connection's write half.
//! Workers and the accept loop talk to it through a bounded command queue,
//! so all writes to one stream happen on one task, in queue order.

use crate::server::ServerStats;
use crate::service::Service;
use crate::stream::MaybeTlsStream;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc;

/// Command consumed by the registry task.
pub enum IoCmd {
    /// Adds a connection's write half to the registry.
    Register {
        cid: u64,
        writer: WriteHalf<MaybeTlsStream>,
    },
    /// Writes bytes to a connection.
    Data { cid: u64, bytes: Bytes },
    /// Writes bytes, then closes the connection.
    CloseAfter { cid: u64, bytes: Bytes },
    /// Closes a connection.
    Close { cid: u64 },
    /// Closes every connection and stops the task. Queued writes ahead of
    /// this command are still delivered.
    Halt,
}

/// Runs the writer loop until the queue closes or a `Halt` arrives.
pub async fn run<S: Service>(
    mut rx: mpsc::Receiver<IoCmd>,
    service: Arc<S>,
    stats: Arc<ServerStats>,
    write_timeout: Duration,
) {
    let mut writers: HashMap<u64, WriteHalf<MaybeTlsStream>> = HashMap::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            IoCmd::Register { cid, writer } => {
                writers.insert(cid, writer);
            }
            IoCmd::Data { cid, bytes } => {
                let Some(writer) = writers.get_mut(&cid) else {
                    continue;
                };
                if let Err(e) = write_with_timeout(writer, &bytes, write_timeout).await {
                    tracing::debug!("[cid={}] write error: {}", cid, e);
                    stats.errors_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    remove(&mut writers, cid, &service, &stats).await;
                }
            }
            IoCmd::CloseAfter { cid, bytes } => {
                if let Some(writer) = writers.get_mut(&cid) {
                    if let Err(e) = write_with_timeout(writer, &bytes, write_timeout).await {
                        tracing::debug!("[cid={}] write error on close: {}", cid, e);
                    }
                }
                remove(&mut writers, cid, &service, &stats).await;
            }
            IoCmd::Close { cid } => {
                remove(&mut writers, cid, &service, &stats).await;
            }
            IoCmd::Halt => {
                let cids: Vec<u64> = writers.keys().copied().collect();
                for cid in cids {
                    remove(&mut writers, cid, &service, &stats).await;
                }
                break;
            }
        }
    }

    tracing::debug!("registry task exiting");
}

/// Writes the full buffer, treating a stalled peer as a write error.
async fn write_with_timeout(
    writer: &mut WriteHalf<MaybeTlsStream>,
    bytes: &Bytes,
    timeout: Duration,
) -> std::io::Result<()> {
    match tokio::time::timeout(timeout, writer.write_all(bytes)).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "write timed out",
        )),
    }
}

/// Removes a connection, shutting the stream down and notifying the service.
/// Idempotent: a second close for the same cid is a no-op.
async fn remove<S: Service>(
    writers: &mut HashMap<u64, WriteHalf<MaybeTlsStream>>,
    cid: u64,
    service: &Arc<S>,
    stats: &Arc<ServerStats>,
) {
    let Some(mut writer) = writers.remove(&cid) else {
        return;
    };
    let _ = writer.shutdown().await;
    stats
        .connections_active
        .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
    service.on_disconnect(cid);
    tracing::info!("[cid={}] disconnected", cid);
}
