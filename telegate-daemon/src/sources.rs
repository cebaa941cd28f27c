// Telegate - Instrument telemetry gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Instrument links named by a sensor's `port` setting
//!
//! ```text
//! tcp:<host>:<port>   serial-over-IP converter or instrument socket
//! file:<path>         append-only instrument log, followed from its end
//! http                push sensor fed through POST /push/<sensorid>
//! ```

use std::future::Future;
use std::io::{self, SeekFrom};
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use telegate::{ConfigError, Connector};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncSeekExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{self, Sleep};

/// How often a tailed file is checked for new bytes
const TAIL_POLL: Duration = Duration::from_millis(200);

/// Parsed `port` setting
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Tcp(String),
    File(PathBuf),
    Http,
}

impl Source {
    pub fn parse(sensorid: &str, port: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidSetting {
            sensorid: sensorid.to_string(),
            field: "port",
            reason: reason.to_string(),
        };
        let port = port.trim();
        if port.eq_ignore_ascii_case("http") {
            return Ok(Source::Http);
        }
        match port.split_once(':') {
            Some(("tcp", addr)) if addr.contains(':') => Ok(Source::Tcp(addr.to_string())),
            Some(("tcp", _)) => Err(invalid("expected tcp:<host>:<port>")),
            Some(("file", path)) if !path.is_empty() => Ok(Source::File(PathBuf::from(path))),
            _ => Err(invalid("expected tcp:<host>:<port>, file:<path> or http")),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Source::Tcp(addr) => format!("tcp:{}", addr),
            Source::File(path) => format!("file:{}", path.display()),
            Source::Http => "http".into(),
        }
    }
}

/// TCP link to an instrument
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn describe(&self) -> String {
        format!("tcp:{}", self.addr)
    }
}

/// Follows a growing log file, starting at its current end
#[derive(Debug, Clone)]
pub struct FileTailConnector {
    path: PathBuf,
    poll: Duration,
}

impl FileTailConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            poll: TAIL_POLL,
        }
    }

    pub fn with_poll(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }
}

#[async_trait]
impl Connector for FileTailConnector {
    type Stream = TailReader;

    async fn connect(&self) -> io::Result<TailReader> {
        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::End(0)).await?;
        Ok(TailReader {
            file,
            poll: self.poll,
            wait: None,
        })
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

/// Reader that never reports end of file; it waits for the file to grow.
// TODO: reopen the path when the log is rotated underneath us
#[derive(Debug)]
pub struct TailReader {
    file: File,
    poll: Duration,
    wait: Option<Pin<Box<Sleep>>>,
}

impl AsyncRead for TailReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if let Some(wait) = this.wait.as_mut() {
                ready!(wait.as_mut().poll(cx));
                this.wait = None;
            }
            let before = buf.filled().len();
            ready!(Pin::new(&mut this.file).poll_read(cx, buf))?;
            if buf.filled().len() > before {
                return Poll::Ready(Ok(()));
            }
            this.wait = Some(Box::pin(time::sleep(this.poll)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[test]
    fn test_parse_sources() {
        assert_eq!(
            Source::parse("A_1_0001", "tcp:10.0.0.12:4001").unwrap(),
            Source::Tcp("10.0.0.12:4001".into())
        );
        assert_eq!(
            Source::parse("A_1_0001", "file:/var/log/pos1.log").unwrap(),
            Source::File(PathBuf::from("/var/log/pos1.log"))
        );
        assert_eq!(Source::parse("A_1_0001", "HTTP").unwrap(), Source::Http);
        assert!(Source::parse("A_1_0001", "tcp:4001").is_err());
        assert!(Source::parse("A_1_0001", "/dev/ttyUSB0").is_err());
        assert_eq!(Source::Tcp("h:1".into()).describe(), "tcp:h:1");
    }

    #[tokio::test]
    async fn test_tail_reads_appended_lines_only() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "48000.1").unwrap();
        file.flush().unwrap();

        let connector = FileTailConnector::new(file.path()).with_poll(Duration::from_millis(10));
        let mut reader = BufReader::new(connector.connect().await.unwrap());

        let mut appender = std::fs::OpenOptions::new()
            .append(true)
            .open(file.path())
            .unwrap();
        writeln!(appender, "48000.2").unwrap();
        appender.flush().unwrap();

        let mut line = String::new();
        time::timeout(Duration::from_secs(5), reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line, "48000.2\n");
    }

    #[tokio::test]
    async fn test_tcp_connector_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let connector = TcpConnector::new(addr.to_string());
        assert!(connector.connect().await.is_err());
    }
}
