//! QMP control-channel client.
//!
//! Line-framed JSON over a local stream socket (UNIX domain socket on
//! POSIX, named pipe on Windows), used strictly in synchronous
//! request-reply mode: one greeting on connect, one capabilities
//! negotiation, then one reply per command. The client is not
//! concurrency-safe; one owner at a time.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tracing::debug;

#[cfg(unix)]
type Stream = tokio::net::UnixStream;
#[cfg(windows)]
type Stream = tokio::net::windows::named_pipe::NamedPipeClient;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum QmpError {
    #[error("qmp: i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("qmp: connect timeout")]
    ConnectTimeout,
    #[error("qmp: connection closed")]
    Closed,
    #[error("qmp: malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("qmp: {class}: {desc}")]
    Protocol { class: String, desc: String },
}

#[derive(Serialize)]
struct Command<'a> {
    execute: &'a str,
}

#[derive(Deserialize)]
struct Response {
    #[serde(rename = "return")]
    ret: Option<Box<RawValue>>,
    error: Option<ProtocolError>,
    /// Asynchronous event frames are interleaved with replies; they carry
    /// an `event` key and are skipped.
    event: Option<String>,
}

#[derive(Deserialize)]
struct ProtocolError {
    class: String,
    desc: String,
}

#[derive(Debug, Deserialize)]
pub struct VmStatus {
    pub status: String,
    pub running: bool,
}

pub struct QmpClient {
    reader: BufReader<ReadHalf<Stream>>,
    writer: WriteHalf<Stream>,
}

impl QmpClient {
    /// Connect to the QMP endpoint, consume the greeting and negotiate
    /// capabilities.
    pub async fn connect(path: &str) -> Result<Self, QmpError> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, Self::dial(path))
            .await
            .map_err(|_| QmpError::ConnectTimeout)??;

        let (read, write) = tokio::io::split(stream);
        let mut client = Self {
            reader: BufReader::new(read),
            writer: write,
        };

        // One unsolicited greeting frame precedes everything else.
        let greeting = client.read_frame().await?;
        debug!(greeting = %greeting, "qmp greeting");

        client.execute("qmp_capabilities").await?;
        Ok(client)
    }

    #[cfg(unix)]
    async fn dial(path: &str) -> Result<Stream, QmpError> {
        Ok(tokio::net::UnixStream::connect(path).await?)
    }

    #[cfg(windows)]
    async fn dial(path: &str) -> Result<Stream, QmpError> {
        use tokio::net::windows::named_pipe::ClientOptions;
        Ok(ClientOptions::new().open(path)?)
    }

    /// Request a graceful guest shutdown.
    pub async fn system_powerdown(&mut self) -> Result<(), QmpError> {
        self.execute("system_powerdown").await.map(|_| ())
    }

    /// Query the current VM run state.
    pub async fn query_status(&mut self) -> Result<VmStatus, QmpError> {
        let ret = self.execute("query-status").await?;
        Ok(serde_json::from_str(ret.get())?)
    }

    /// Send one command and consume exactly one reply.
    async fn execute(&mut self, command: &str) -> Result<Box<RawValue>, QmpError> {
        let mut frame = serde_json::to_vec(&Command { execute: command })?;
        frame.push(b'\n');
        self.writer.write_all(&frame).await?;

        loop {
            let line = self.read_frame().await?;
            let resp: Response = serde_json::from_str(&line)?;
            if resp.event.is_some() {
                continue;
            }
            if let Some(err) = resp.error {
                return Err(QmpError::Protocol {
                    class: err.class,
                    desc: err.desc,
                });
            }
            return Ok(resp
                .ret
                .unwrap_or_else(|| RawValue::from_string("null".to_string()).unwrap()));
        }
    }

    async fn read_frame(&mut self) -> Result<String, QmpError> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(QmpError::Closed);
        }
        Ok(line)
    }
}
