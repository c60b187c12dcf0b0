//! Durable broker backed by one append-only NDJSON file per topic.
//!
//! Layout under the broker directory:
//!
//! - `<topic>.ndjson`: one [`LogRecord`] per line, offset = line number
//! - `<topic>.<group>.offset`: the group's committed resume offset
//!
//! A topic supports one producer process; any number of consumer groups
//! may read it concurrently.

use std::fs::{self, File, OpenOptions};
use std::future::Future;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stockdw_core::UtcDateTime;
use tokio::time::Instant;
use tracing::warn;

use super::{DeliveryCallback, QueueMessage, TopicConsumer, TopicProducer};
use crate::error::QueueError;

const POLL_STEP: Duration = Duration::from_millis(50);

#[derive(Debug, Serialize, Deserialize)]
struct LogRecord {
    offset: u64,
    key: String,
    /// Hex-encoded payload bytes.
    payload: String,
    appended_at: UtcDateTime,
}

#[derive(Debug, Clone)]
pub struct NdjsonBroker {
    dir: PathBuf,
}

impl NdjsonBroker {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn log_path(&self, topic: &str) -> PathBuf {
        self.dir.join(format!("{topic}.ndjson"))
    }

    fn offset_path(&self, topic: &str, group: &str) -> PathBuf {
        self.dir.join(format!("{topic}.{group}.offset"))
    }

    pub fn producer(&self, topic: &str) -> Result<NdjsonProducer, QueueError> {
        let path = self.log_path(topic);
        let next_offset = count_lines(&path)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(NdjsonProducer {
            file,
            next_offset,
            pending: Vec::new(),
        })
    }

    /// Opens `group` on `topic` at its committed offset, or at the current end of the log.
    pub fn consumer(&self, topic: &str, group: &str) -> Result<NdjsonConsumer, QueueError> {
        let log_path = self.log_path(topic);
        OpenOptions::new().create(true).append(true).open(&log_path)?;

        let offset_path = self.offset_path(topic, group);
        let start = match read_committed(&offset_path)? {
            Some(offset) => offset,
            None => count_lines(&log_path)?,
        };

        let mut reader = BufReader::new(File::open(&log_path)?);
        let mut skipped = 0;
        let mut line = String::new();
        while skipped < start {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                break;
            }
            skipped += 1;
        }

        Ok(NdjsonConsumer {
            reader,
            offset_path,
            position: skipped,
            partial: String::new(),
        })
    }
}

pub struct NdjsonProducer {
    file: File,
    next_offset: u64,
    pending: Vec<(String, Vec<u8>, DeliveryCallback)>,
}

impl TopicProducer for NdjsonProducer {
    fn produce(&mut self, key: &str, payload: Vec<u8>, on_delivery: DeliveryCallback) {
        self.pending.push((key.to_owned(), payload, on_delivery));
    }

    fn flush(&mut self) -> Result<usize, QueueError> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        let pending = std::mem::take(&mut self.pending);

        let mut buffer = Vec::new();
        let mut offsets = Vec::with_capacity(pending.len());
        let mut callbacks = Vec::with_capacity(pending.len());
        for (index, (key, payload, on_delivery)) in pending.into_iter().enumerate() {
            let offset = self.next_offset + index as u64;
            let record = LogRecord {
                offset,
                key,
                payload: hex::encode(payload),
                appended_at: UtcDateTime::now(),
            };
            match serde_json::to_writer(&mut buffer, &record) {
                Ok(()) => {
                    buffer.push(b'\n');
                    offsets.push(offset);
                    callbacks.push(on_delivery);
                }
                Err(error) => {
                    let error = QueueError::Codec(error.to_string());
                    on_delivery(Err(&error));
                }
            }
        }

        if let Err(error) = self.file.write_all(&buffer).and_then(|()| self.file.flush()) {
            let error = QueueError::Io(error);
            for on_delivery in callbacks {
                on_delivery(Err(&error));
            }
            return Err(error);
        }

        self.next_offset += offsets.len() as u64;
        let delivered = callbacks.len();
        for (offset, on_delivery) in offsets.into_iter().zip(callbacks) {
            on_delivery(Ok(offset));
        }
        Ok(delivered)
    }
}

pub struct NdjsonConsumer {
    reader: BufReader<File>,
    offset_path: PathBuf,
    position: u64,
    /// Bytes of a line the producer has not finished writing yet.
    partial: String,
}

impl NdjsonConsumer {
    pub fn position(&self) -> u64 {
        self.position
    }

    fn try_next(&mut self) -> Result<Option<QueueMessage>, QueueError> {
        if self.reader.read_line(&mut self.partial)? == 0 || !self.partial.ends_with('\n') {
            return Ok(None);
        }
        let line = std::mem::take(&mut self.partial);
        let offset = self.position;
        self.position += 1;

        let record: LogRecord = serde_json::from_str(line.trim_end())
            .map_err(|error| QueueError::Codec(format!("log line {offset}: {error}")))?;
        let payload = hex::decode(&record.payload)
            .map_err(|error| QueueError::Codec(format!("log line {offset}: {error}")))?;
        if record.offset != offset {
            warn!(expected = offset, found = record.offset, "log record offset mismatch");
        }
        Ok(Some(QueueMessage {
            offset,
            key: record.key,
            payload,
        }))
    }
}

impl TopicConsumer for NdjsonConsumer {
    fn poll<'a>(
        &'a mut self,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<QueueMessage>, QueueError>> + Send + 'a>> {
        Box::pin(async move {
            let deadline = Instant::now() + timeout;
            loop {
                if let Some(message) = self.try_next()? {
                    return Ok(Some(message));
                }
                let now = Instant::now();
                if now >= deadline {
                    return Ok(None);
                }
                tokio::time::sleep(POLL_STEP.min(deadline - now)).await;
            }
        })
    }

    fn commit(&mut self, next_offset: u64) -> Result<(), QueueError> {
        let tmp = self.offset_path.with_extension("offset.tmp");
        fs::write(&tmp, next_offset.to_string())?;
        fs::rename(&tmp, &self.offset_path)?;
        Ok(())
    }
}

fn count_lines(path: &Path) -> Result<u64, QueueError> {
    match File::open(path) {
        Ok(file) => {
            let mut count = 0;
            for line in BufReader::new(file).split(b'\n') {
                line?;
                count += 1;
            }
            Ok(count)
        }
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(error) => Err(error.into()),
    }
}

fn read_committed(path: &Path) -> Result<Option<u64>, QueueError> {
    match fs::read_to_string(path) {
        Ok(contents) => contents
            .trim()
            .parse()
            .map(Some)
            .map_err(|error| QueueError::Codec(format!("{}: {error}", path.display()))),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(error.into()),
    }
}
