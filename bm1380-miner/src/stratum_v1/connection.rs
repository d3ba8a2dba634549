//! Newline-delimited JSON-RPC over TCP.

use futures::SinkExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use super::error::{StratumError, StratumResult};
use super::messages::JsonRpcMessage;
use crate::tracing::prelude::*;

/// Longest line accepted from a pool. A notify with a deep merkle branch and
/// a large coinbase is a few kilobytes.
const MAX_LINE_LENGTH: usize = 64 * 1024;

const URL_SCHEME: &str = "stratum+tcp://";

/// Split a pool URL (`stratum+tcp://host:port` or `host:port`) into host and
/// port.
pub fn parse_url(url: &str) -> StratumResult<(String, u16)> {
    let authority = url.strip_prefix(URL_SCHEME).unwrap_or(url);
    let authority = authority.trim_end_matches('/');

    let (host, port) = authority
        .rsplit_once(':')
        .ok_or_else(|| StratumError::InvalidUrl(format!("{}: missing port", url)))?;
    if host.is_empty() || host.contains('/') {
        return Err(StratumError::InvalidUrl(format!("{}: bad host", url)));
    }
    let port = port
        .parse::<u16>()
        .map_err(|e| StratumError::InvalidUrl(format!("{}: bad port ({})", url, e)))?;

    Ok((host.to_string(), port))
}

/// A connection to a pool, one JSON message per line.
pub struct Connection {
    reader: FramedRead<OwnedReadHalf, LinesCodec>,
    writer: FramedWrite<OwnedWriteHalf, LinesCodec>,
}

impl Connection {
    pub async fn connect(url: &str) -> StratumResult<Self> {
        let (host, port) = parse_url(url)?;
        let stream = TcpStream::connect((host.as_str(), port)).await?;
        info!(host = %host, port, "Connected to pool");
        Ok(Self::new(stream))
    }

    pub fn new(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
            writer: FramedWrite::new(writer, LinesCodec::new()),
        }
    }

    pub async fn write_message(&mut self, msg: &JsonRpcMessage) -> StratumResult<()> {
        let line = serde_json::to_string(msg)?;
        trace!(tx = %line);
        self.writer.send(line).await?;
        Ok(())
    }

    /// Next message from the pool, or `None` once it hangs up.
    ///
    /// Cancel safe: a partially received line stays buffered.
    pub async fn read_message(&mut self) -> StratumResult<Option<JsonRpcMessage>> {
        loop {
            let Some(line) = self.reader.next().await else {
                return Ok(None);
            };
            let line = line?;
            trace!(rx = %line);

            if line.trim().is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(&line)?));
        }
    }
}
