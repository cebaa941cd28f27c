// Telegate - Instrument telemetry gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Line-oriented stand-in transport
//!
//! Each publish becomes one line `<topic> q<qos> <payload>`, on stdout or
//! appended to a log file. A broker bridge can follow that output.
//!
//! Lines are written by a dedicated thread, so a slow terminal or disk never
//! blocks the worker task that published. Dropping the publisher writes out
//! every queued line before returning.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{mpsc, Mutex};
use std::thread::{self, JoinHandle};

use telegate::{Publisher, Qos, TransportError};
use tracing::warn;

pub struct LinePublisher {
    lines: Option<Mutex<mpsc::Sender<Vec<u8>>>>,
    writer: Option<JoinHandle<()>>,
}

impl LinePublisher {
    pub fn stdout() -> io::Result<Self> {
        Self::new(Box::new(io::stdout()))
    }

    pub fn append(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Self::new(Box::new(file))
    }

    fn new(mut out: Box<dyn Write + Send>) -> io::Result<Self> {
        let (lines, queued) = mpsc::channel::<Vec<u8>>();
        let writer = thread::Builder::new()
            .name("publish-writer".into())
            .spawn(move || {
                for line in queued {
                    if let Err(e) = out.write_all(&line).and_then(|()| out.flush()) {
                        warn!(error = %e, "publish line lost");
                    }
                }
            })?;
        Ok(Self {
            lines: Some(Mutex::new(lines)),
            writer: Some(writer),
        })
    }
}

impl Drop for LinePublisher {
    fn drop(&mut self) {
        self.lines.take();
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}

impl std::fmt::Debug for LinePublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinePublisher").finish_non_exhaustive()
    }
}

impl Publisher for LinePublisher {
    fn publish(&self, topic: &str, payload: &[u8], qos: Qos) -> Result<(), TransportError> {
        let mut line = format!("{} q{} ", topic, qos.level()).into_bytes();
        line.extend_from_slice(payload);
        line.push(b'\n');

        let sent = self.lines.as_ref().map_or(false, |lines| {
            lines
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .send(line)
                .is_ok()
        });
        if sent {
            Ok(())
        } else {
            Err(TransportError::PublishFailed {
                topic: topic.to_string(),
                reason: "publish writer stopped".into(),
            })
        }
    }
}
