//! Length-Prefixed Frames
//!
//! Pipes are byte streams; frames restore message boundaries.

use rkyv::ser::serializers::AllocSerializer;
use rkyv::validation::validators::DefaultValidator;
use rkyv::{Archive, CheckBytes, Deserialize, Infallible, Serialize};
use std::io::{BufReader, BufWriter, Read, Write};
use thiserror::Error;

/// Largest frame either side will accept (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const PIPE_BUFFER: usize = 64 * 1024;

/// Frame encoding/decoding failures
#[derive(Debug, Error)]
pub enum FrameError {
    /// Underlying pipe failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// rkyv could not serialize the message
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Payload failed archive validation
    #[error("validation error: {0}")]
    Validation(String),

    /// Declared length exceeds [`MAX_FRAME_SIZE`]
    #[error("frame too large: {size} bytes (max {max} bytes)")]
    FrameTooLarge {
        /// Declared or encoded size
        size: usize,
        /// Limit in force
        max: usize,
    },

    /// Structurally invalid frame
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Peer closed the pipe between frames
    #[error("end of stream")]
    EndOfStream,
}

/// Encode `message` as `[len: u32 LE][rkyv payload]` and flush.
pub fn write_frame<W, T>(writer: &mut BufWriter<W>, message: &T) -> Result<(), FrameError>
where
    W: Write,
    T: Serialize<AllocSerializer<256>>,
{
    let bytes =
        rkyv::to_bytes::<_, 256>(message).map_err(|e| FrameError::Serialization(e.to_string()))?;

    if bytes.len() > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
    writer.write_all(&bytes)?;
    // A worker may be killed right after this returns; nothing may linger in the buffer
    writer.flush()?;
    Ok(())
}

/// Decode one frame, validating the archive before deserializing it.
pub fn read_frame<R, T>(reader: &mut BufReader<R>) -> Result<T, FrameError>
where
    R: Read,
    T: Archive,
    T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, Infallible>,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::EndOfStream);
        }
        Err(e) => return Err(FrameError::Io(e)),
    }

    let len = u32::from_le_bytes(header) as usize;
    if len == 0 {
        return Err(FrameError::InvalidFrame("zero-length frame".to_string()));
    }
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut payload = rkyv::AlignedVec::with_capacity(len);
    payload.resize(len, 0);
    reader.read_exact(&mut payload).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::InvalidFrame(format!("truncated frame: expected {len} bytes"))
        } else {
            FrameError::Io(e)
        }
    })?;

    let archived = rkyv::check_archived_root::<T>(&payload)
        .map_err(|e| FrameError::Validation(e.to_string()))?;

    match archived.deserialize(&mut Infallible) {
        Ok(value) => Ok(value),
        Err(never) => match never {},
    }
}

/// Buffered frame writer over one end of a pipe
pub struct FrameWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> FrameWriter<W> {
    /// Wrap a writer
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::with_capacity(PIPE_BUFFER, writer),
        }
    }

    /// Send one message
    pub fn write<T>(&mut self, message: &T) -> Result<(), FrameError>
    where
        T: Serialize<AllocSerializer<256>>,
    {
        write_frame(&mut self.writer, message)
    }
}

/// Buffered frame reader over one end of a pipe
pub struct FrameReader<R: Read> {
    reader: BufReader<R>,
}

impl<R: Read> FrameReader<R> {
    /// Wrap a reader
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::with_capacity(PIPE_BUFFER, reader),
        }
    }

    /// Receive one message
    pub fn read<T>(&mut self) -> Result<T, FrameError>
    where
        T: Archive,
        T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, Infallible>,
    {
        read_frame(&mut self.reader)
    }

    /// Whether bytes are already buffered (a poll on the fd would miss them)
    pub fn has_buffered_data(&self) -> bool {
        !self.reader.buffer().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FailureKind, IterationSample, WorkerMessage};
    use std::io::Cursor;

    fn encode(messages: &[WorkerMessage]) -> Vec<u8> {
        let mut buffer = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut buffer);
            for message in messages {
                writer.write(message).unwrap();
            }
        }
        buffer
    }

    #[test]
    fn test_messages_keep_their_boundaries() {
        let buffer = encode(&[
            WorkerMessage::Sample(IterationSample::new(0, 0, 10_000_000, 1000)),
            WorkerMessage::Sample(IterationSample::new(1, 0, 11_000_000, 1000)),
            WorkerMessage::Failure {
                kind: FailureKind::Measurement,
                phase: "measurement".to_string(),
                fixture: None,
                iteration: Some(2),
                thread: Some(0),
                message: "boom".to_string(),
            },
        ]);

        let mut reader = FrameReader::new(Cursor::new(buffer));
        match reader.read::<WorkerMessage>().unwrap() {
            WorkerMessage::Sample(s) => assert_eq!(s.elapsed_nanos, 10_000_000),
            other => panic!("unexpected {other:?}"),
        }
        match reader.read::<WorkerMessage>().unwrap() {
            WorkerMessage::Sample(s) => assert_eq!(s.iteration, 1),
            other => panic!("unexpected {other:?}"),
        }
        match reader.read::<WorkerMessage>().unwrap() {
            WorkerMessage::Failure {
                kind, iteration, ..
            } => {
                assert_eq!(kind, FailureKind::Measurement);
                assert_eq!(iteration, Some(2));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            reader.read::<WorkerMessage>(),
            Err(FrameError::EndOfStream)
        ));
    }

    #[test]
    fn test_truncated_payload_is_invalid() {
        let mut buffer = encode(&[WorkerMessage::Sample(IterationSample::new(0, 0, 1, 1))]);
        buffer.truncate(buffer.len() - 3);

        let mut reader = FrameReader::new(Cursor::new(buffer));
        let result = reader.read::<WorkerMessage>();
        assert!(matches!(result, Err(FrameError::InvalidFrame(_))));
    }

    #[test]
    fn test_oversized_header_rejected() {
        let header = ((MAX_FRAME_SIZE + 1) as u32).to_le_bytes().to_vec();
        let mut reader = FrameReader::new(Cursor::new(header));
        let result = reader.read::<WorkerMessage>();
        assert!(matches!(result, Err(FrameError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_zero_length_frame_rejected() {
        let mut reader = FrameReader::new(Cursor::new(vec![0u8; 4]));
        let result = reader.read::<WorkerMessage>();
        assert!(matches!(result, Err(FrameError::InvalidFrame(_))));
    }
}
