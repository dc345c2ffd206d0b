//! Non-blocking relay between a client and its upstream.
//!
//! Neither reads nor writes ever wait on a peer. Bytes a peer cannot take
//! yet stay in the record's backlog for that direction, and that direction
//! is not read again until the backlog has been flushed. A slow reader
//! therefore only slows its own connection.

use crate::connection::{ConnectionRecord, ConnectionState, Direction};
use crate::error::ForwardError;
use crate::metrics::EngineMetrics;
use bytes::{Buf, BytesMut};
use log::{debug, trace, warn};
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// Outcome of one direction of a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Relay {
    /// Bytes delivered to the destination.
    Moved(usize),
    Idle,
    Closed,
}

/// Bytes delivered by a single forwarding pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub to_upstream: usize,
    pub to_client: usize,
}

impl PassReport {
    pub fn is_idle(&self) -> bool {
        self.to_upstream == 0 && self.to_client == 0
    }
}

pub struct Forwarder {
    metrics: Arc<EngineMetrics>,
}

impl Forwarder {
    pub fn new(metrics: Arc<EngineMetrics>) -> Self {
        Self { metrics }
    }

    /// Run one relay pass over a `Forwarding` record, using `buf` as scratch
    /// space. The record becomes `Complete` once both peers have closed their
    /// write side and every relayed byte has been delivered, or `Failed` on
    /// an I/O error.
    pub async fn forward(&self, record: &mut ConnectionRecord, buf: &mut [u8]) -> PassReport {
        debug_assert_eq!(record.state(), ConnectionState::Forwarding);

        match self.pass(record, buf).await {
            Ok(report) => {
                if record.client_eof && record.upstream_eof {
                    debug!(
                        "{}: both peers closed ({} bytes up, {} bytes down)",
                        record.id(),
                        record.bytes_to_upstream(),
                        record.bytes_to_client()
                    );
                    record.mark_complete();
                }
                report
            }
            Err(e) => {
                warn!("{}: {}", record.id(), e);
                record.mark_failed();
                PassReport::default()
            }
        }
    }

    async fn pass(&self, record: &mut ConnectionRecord, buf: &mut [u8]) -> Result<PassReport, ForwardError> {
        let id = record.id();
        let (client_eof, upstream_eof) = (record.client_eof, record.upstream_eof);
        let Some(mut pipes) = record.pipes_mut() else {
            return Err(ForwardError {
                direction: Direction::ClientToUpstream,
                source: std::io::Error::new(ErrorKind::NotConnected, "no upstream attached"),
            });
        };

        let up = if client_eof {
            Relay::Closed
        } else {
            relay_once(
                &mut *pipes.client,
                &mut *pipes.upstream,
                &mut *pipes.to_upstream,
                buf,
                Direction::ClientToUpstream,
            )
            .await?
        };
        let down = if upstream_eof {
            Relay::Closed
        } else {
            relay_once(
                &mut *pipes.upstream,
                &mut *pipes.client,
                &mut *pipes.to_client,
                buf,
                Direction::UpstreamToClient,
            )
            .await?
        };

        let mut report = PassReport::default();
        match up {
            Relay::Moved(n) => {
                report.to_upstream = n;
                record.bytes_to_upstream += n as u64;
                self.metrics.record_bytes_to_upstream(n as u64);
            }
            Relay::Closed if !client_eof => {
                debug!("{}: client finished sending", id);
                record.client_eof = true;
            }
            _ => {}
        }
        match down {
            Relay::Moved(n) => {
                report.to_client = n;
                record.bytes_to_client += n as u64;
                self.metrics.record_bytes_to_client(n as u64);
            }
            Relay::Closed if !upstream_eof => {
                debug!("{}: upstream finished sending", id);
                record.upstream_eof = true;
            }
            _ => {}
        }

        if !report.is_idle() {
            trace!(
                "{}: client {} <--> {} upstream, {} byte(s) backlogged",
                id,
                report.to_upstream,
                report.to_client,
                record.pending_bytes()
            );
        }
        Ok(report)
    }
}

/// Advance one direction without waiting on either peer. A non-empty
/// `pending` backlog is flushed first and blocks further reads from `src`.
/// A zero-byte read half-closes `dst`.
async fn relay_once(
    src: &mut TcpStream,
    dst: &mut TcpStream,
    pending: &mut BytesMut,
    buf: &mut [u8],
    direction: Direction,
) -> Result<Relay, ForwardError> {
    if !pending.is_empty() {
        let flushed = flush_pending(dst, pending, direction)?;
        if !pending.is_empty() {
            return Ok(if flushed > 0 { Relay::Moved(flushed) } else { Relay::Idle });
        }
    }

    match src.try_read(buf) {
        Ok(0) => {
            if let Err(e) = dst.shutdown().await {
                debug!("{} half-close failed: {}", direction, e);
            }
            Ok(Relay::Closed)
        }
        Ok(n) => {
            pending.extend_from_slice(&buf[..n]);
            match flush_pending(dst, pending, direction)? {
                0 => Ok(Relay::Idle),
                written => Ok(Relay::Moved(written)),
            }
        }
        Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(Relay::Idle),
        Err(source) => Err(ForwardError { direction, source }),
    }
}

/// Write as much of `pending` to `dst` as it takes right now.
fn flush_pending(dst: &TcpStream, pending: &mut BytesMut, direction: Direction) -> Result<usize, ForwardError> {
    let mut written = 0;
    while !pending.is_empty() {
        match dst.try_write(pending) {
            Ok(0) => {
                return Err(ForwardError {
                    direction,
                    source: std::io::Error::new(ErrorKind::WriteZero, "peer accepted no bytes"),
                });
            }
            Ok(n) => {
                pending.advance(n);
                written += n;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(source) => return Err(ForwardError { direction, source }),
        }
    }
    Ok(written)
}
