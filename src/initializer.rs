//! First step of every connection: read the client's request head, route it
//! and open the upstream connection.

use crate::config::Config;
use crate::connection::{ConnectionRecord, ConnectionState};
use crate::error::{InitError, ParseError};
use crate::request::{head_length, parse_request};
use crate::resolver::Resolver;
use bytes::BytesMut;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const INITIAL_READ_CAPACITY: usize = 2048;

pub struct Initializer {
    resolver: Arc<dyn Resolver>,
    max_header_size: usize,
    request_timeout: Duration,
    connect_timeout: Duration,
}

impl Initializer {
    pub fn new(resolver: Arc<dyn Resolver>, config: &Config) -> Self {
        Self {
            resolver,
            max_header_size: config.max_header_size,
            request_timeout: config.request_timeout(),
            connect_timeout: config.connect_timeout(),
        }
    }

    /// Move an `Uninitialized` record to `Forwarding`, or to `Failed` if the
    /// request cannot be read, parsed, resolved or delivered upstream.
    pub async fn initialize(&self, record: &mut ConnectionRecord) {
        debug_assert_eq!(record.state(), ConnectionState::Uninitialized);

        let result = match self.read_request_head(record.client_mut()).await {
            Ok(head) => self.establish(record, &head).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                info!(
                    "{}: {} -> {} established",
                    record.id(),
                    record.peer(),
                    record.target().map(|t| t.to_string()).unwrap_or_default()
                );
            }
            Err(e) => {
                warn!("{}: initialization failed for {}: {}", record.id(), record.peer(), e);
                record.mark_failed();
            }
        }
    }

    /// Read from the client until the buffer holds something the parser can
    /// judge, the size limit is reached, or the client stops sending.
    pub async fn read_request_head(&self, client: &mut TcpStream) -> Result<BytesMut, InitError> {
        let max = self.max_header_size;
        let read = async {
            let mut buf = BytesMut::with_capacity(INITIAL_READ_CAPACITY.min(max));
            loop {
                if let Some(head_len) = head_length(&buf) {
                    if buf.len() > head_len {
                        debug!("request head is {} bytes, {} body byte(s) follow", head_len, buf.len() - head_len);
                    }
                    return Ok(buf);
                }
                // A bad request line is reported before the rest of the head arrives.
                if !buf.is_empty() && matches!(parse_request(&buf), Err(ParseError::Malformed(_))) {
                    return Ok(buf);
                }
                if buf.len() >= max {
                    debug!("request head exceeds {} bytes", max);
                    return Ok(buf);
                }

                let remaining = (max - buf.len()) as u64;
                let n = (&mut *client)
                    .take(remaining)
                    .read_buf(&mut buf)
                    .await
                    .map_err(InitError::ClientRead)?;

                if n == 0 {
                    if buf.is_empty() {
                        return Err(InitError::ClientClosed);
                    }
                    // Let the parser report the incomplete head.
                    return Ok(buf);
                }
            }
        };

        timeout(self.request_timeout, read)
            .await
            .map_err(|_| InitError::Timeout("request read", self.request_timeout))?
    }

    /// Route `raw` and connect upstream. On success the record owns the new
    /// upstream socket and is `Forwarding`; on failure any socket opened here
    /// has already been closed.
    pub async fn establish(&self, record: &mut ConnectionRecord, raw: &[u8]) -> Result<(), InitError> {
        let request = parse_request(raw)?;
        record.set_target(request.target());
        debug!(
            "{}: {} {} via {}:{}",
            record.id(),
            request.method,
            request.path,
            request.host,
            request.port
        );

        let ip = self.resolver.resolve(&request.host).await?;
        let addr = SocketAddr::from((ip, request.port));

        let mut upstream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| InitError::Timeout("upstream connect", self.connect_timeout))?
            .map_err(|source| InitError::Connect { addr, source })?;

        // `upstream` drops, and closes, if the send fails.
        upstream
            .write_all(&request.rewritten)
            .await
            .map_err(InitError::Send)?;

        record.attach_upstream(upstream);
        Ok(())
    }
}
