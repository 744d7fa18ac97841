use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

#[cfg(test)] use mockall::automock;
use tracing::{error, warn};

use crate::error::BusError;

/// Durable storage a [crate::log::message_log::MessageLog] writes to
#[cfg_attr(test, automock)]
pub trait LogSink {
    fn write_chunk(&mut self, chunk: &[u8]) -> std::io::Result<()>;
    fn sync(&mut self) -> std::io::Result<()>;
}

pub struct FileSink {
    writer: BufWriter<File>,
}

impl FileSink {
    /// Creates a log file, never overwriting an existing one. If `path` can not be created, this
    ///  falls back to `emergency_path` (which must not exist either). Returns the path that was
    ///  actually used.
    pub fn create(path: &Path, emergency_path: &Path) -> Result<(FileSink, PathBuf), BusError> {
        match Self::create_new(path) {
            Ok(sink) => Ok((sink, path.to_path_buf())),
            Err(e) => {
                warn!("could not create log file {:?}: {} - trying emergency log file {:?}", path, e, emergency_path);
                match Self::create_new(emergency_path) {
                    Ok(sink) => Ok((sink, emergency_path.to_path_buf())),
                    Err(e) => {
                        error!("could not create emergency log file {:?}: {}", emergency_path, e);
                        Err(e.into())
                    }
                }
            }
        }
    }

    fn create_new(path: &Path) -> std::io::Result<FileSink> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(FileSink {
            writer: BufWriter::new(file),
        })
    }
}

impl LogSink for FileSink {
    fn write_chunk(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(chunk)
    }

    fn sync(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}
