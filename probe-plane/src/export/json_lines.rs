//! JSON-lines command sink
//!
//! Writes one JSON object per delivered command, tagged by `type`:
//!
//! ```text
//! {"type":"message","text":"tick","timestamp":0}
//! {"type":"exit","code":0}
//! ```
//!
//! Output is buffered by the caller's writer and flushed after `Exit`, the
//! last command an instance delivers.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use probe_plane_common::{Command, CommandListener};

pub struct JsonLinesSink<W: Write> {
    writer: W,
    written: u64,
}

impl JsonLinesSink<BufWriter<File>> {
    /// Create (or truncate) `path` and write to it
    ///
    /// # Errors
    /// Returns the I/O error from creating the file
    pub fn create(path: &Path) -> io::Result<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    /// Commands written so far
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> CommandListener for JsonLinesSink<W> {
    fn on_command(&mut self, cmd: Command) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, &cmd).map_err(io::Error::other)?;
        self.writer.write_all(b"\n")?;
        self.written += 1;
        if cmd.is_exit() {
            self.writer.flush()?;
        }
        Ok(())
    }
}
