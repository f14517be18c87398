//! Record sinks receiving admitted datapoints.

use std::fmt;
use std::io::{self, Write};

use crate::model::DataPoint;

#[derive(Debug)]
pub enum SinkError {
    Io(io::Error),
    Serialize(String),
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::Io(e) => write!(f, "sink write failed: {}", e),
            SinkError::Serialize(msg) => write!(f, "datapoint serialization failed: {}", msg),
        }
    }
}

impl std::error::Error for SinkError {}

impl From<io::Error> for SinkError {
    fn from(e: io::Error) -> Self {
        SinkError::Io(e)
    }
}

/// Destination for datapoints leaving the pipeline.
pub trait RecordSink: Send {
    fn write_batch(&mut self, points: &[DataPoint]) -> Result<(), SinkError>;

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Writes one JSON object per line.
pub struct JsonLinesSink<W: Write + Send> {
    writer: W,
    written: u64,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    /// Datapoints written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> RecordSink for JsonLinesSink<W> {
    fn write_batch(&mut self, points: &[DataPoint]) -> Result<(), SinkError> {
        for point in points {
            serde_json::to_writer(&mut self.writer, point)
                .map_err(|e| SinkError::Serialize(e.to_string()))?;
            self.writer.write_all(b"\n")?;
            self.written += 1;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps everything in memory. Useful for tests and embedding.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub points: Vec<DataPoint>,
}

impl RecordSink for MemorySink {
    fn write_batch(&mut self, points: &[DataPoint]) -> Result<(), SinkError> {
        self.points.extend_from_slice(points);
        Ok(())
    }
}
