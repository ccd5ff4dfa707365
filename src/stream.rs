//! Framed stream I/O for capture files.
//!
//! Frame layout, per frame: `[len: u32 LE][crc32: u32 LE][payload]` where
//! the payload is a bincode-serialized [`StreamFrame`]. The first frame must
//! be the header; every following frame is a record.
//!
//! The reader distinguishes two failure families, which callers handle
//! differently:
//! - [`StreamError::Truncation`] — input ended mid-frame (incomplete
//!   stream, e.g. a capture cut off by a crash). Clean EOF at a frame
//!   boundary is a normal end of stream, not an error.
//! - [`StreamError::Format`] — a structurally bad frame: CRC mismatch,
//!   undecodable payload, wrong frame kind, oversized length. Reported with
//!   the frame ordinal for diagnosability.
//!
//! An optional zstd pass can wrap the whole byte stream. It is invisible to
//! the framing: [`open_capture`] sniffs the zstd magic and inserts the
//! decompressor when present.

use crc32fast::Hasher as Crc32;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;

use crate::record::{EncodedRecord, StreamFrame, StreamHeader};

/// Upper bound on a single frame payload. Real records are tiny; anything
/// near this is a corrupt length field.
const MAX_FRAME_LEN: usize = 1 << 26;

/// First four bytes of a zstd-compressed stream.
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("incomplete stream: input ended {context} (frame {frame})")]
    Truncation { frame: usize, context: &'static str },

    #[error("malformed frame {frame}: {reason}")]
    Format { frame: usize, reason: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Writes one header frame followed by record frames.
pub struct StreamWriter<W: Write> {
    inner: W,
    frames: usize,
    header_written: bool,
}

impl<W: Write> StreamWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, frames: 0, header_written: false }
    }

    pub fn write_header(&mut self, header: &StreamHeader) -> Result<(), StreamError> {
        debug_assert!(!self.header_written);
        self.write_frame(&StreamFrame::Header(header.clone()))?;
        self.header_written = true;
        Ok(())
    }

    pub fn write_record(&mut self, record: &EncodedRecord) -> Result<(), StreamError> {
        debug_assert!(self.header_written);
        self.write_frame(&StreamFrame::Record(record.clone()))
    }

    fn write_frame(&mut self, frame: &StreamFrame) -> Result<(), StreamError> {
        let payload = bincode::serialize(frame).map_err(|e| StreamError::Format {
            frame: self.frames,
            reason: format!("serialize: {e}"),
        })?;
        let mut hasher = Crc32::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        self.inner.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.inner.write_all(&crc.to_le_bytes())?;
        self.inner.write_all(&payload)?;
        self.frames += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), StreamError> {
        self.inner.flush()?;
        Ok(())
    }

    /// Number of frames written so far (header included).
    pub fn frames(&self) -> usize {
        self.frames
    }
}

/// Reads the header frame, then record frames until clean EOF.
pub struct StreamReader<R: Read> {
    inner: R,
    frames: usize,
}

impl<R: Read> StreamReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, frames: 0 }
    }

    /// Read the stream header. Must be called exactly once, before any
    /// record is read.
    pub fn read_header(&mut self) -> Result<StreamHeader, StreamError> {
        match self.read_frame()? {
            Some(StreamFrame::Header(h)) => Ok(h),
            Some(StreamFrame::Record(_)) => Err(StreamError::Format {
                frame: self.frames - 1,
                reason: "expected stream header, found record".into(),
            }),
            None => Err(StreamError::Truncation { frame: 0, context: "before stream header" }),
        }
    }

    /// Next record, or `None` at a clean end of stream.
    pub fn next_record(&mut self) -> Result<Option<EncodedRecord>, StreamError> {
        match self.read_frame()? {
            Some(StreamFrame::Record(r)) => Ok(Some(r)),
            Some(StreamFrame::Header(_)) => Err(StreamError::Format {
                frame: self.frames - 1,
                reason: "duplicate stream header".into(),
            }),
            None => Ok(None),
        }
    }

    fn read_frame(&mut self) -> Result<Option<StreamFrame>, StreamError> {
        // Length word, read byte-wise so that EOF on the very first byte is
        // a clean end of stream while a partial word is truncation.
        let mut len_buf = [0u8; 4];
        let mut filled = 0;
        while filled < len_buf.len() {
            match self.inner.read(&mut len_buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(StreamError::Truncation {
                        frame: self.frames,
                        context: "inside frame length",
                    });
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(StreamError::Format {
                frame: self.frames,
                reason: format!("frame length {len} exceeds limit"),
            });
        }

        let mut crc_buf = [0u8; 4];
        self.read_exact_or_truncated(&mut crc_buf, "inside frame checksum")?;
        let crc_on_file = u32::from_le_bytes(crc_buf);

        let mut payload = vec![0u8; len];
        self.read_exact_or_truncated(&mut payload, "inside frame payload")?;

        let mut hasher = Crc32::new();
        hasher.update(&payload);
        let crc_calc = hasher.finalize();
        if crc_calc != crc_on_file {
            return Err(StreamError::Format {
                frame: self.frames,
                reason: format!("crc mismatch: file={crc_on_file:#010x}, calc={crc_calc:#010x}"),
            });
        }

        let frame: StreamFrame = bincode::deserialize(&payload).map_err(|e| StreamError::Format {
            frame: self.frames,
            reason: format!("deserialize: {e}"),
        })?;
        self.frames += 1;
        Ok(Some(frame))
    }

    fn read_exact_or_truncated(
        &mut self,
        buf: &mut [u8],
        context: &'static str,
    ) -> Result<(), StreamError> {
        self.inner.read_exact(buf).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                StreamError::Truncation { frame: self.frames, context }
            } else {
                StreamError::Io(e)
            }
        })
    }

    /// Number of frames fully read so far (header included).
    pub fn frames(&self) -> usize {
        self.frames
    }
}

/// Open a capture file for reading, transparently unwrapping the optional
/// zstd outer layer by sniffing the magic bytes.
pub fn open_capture(path: &Path) -> Result<StreamReader<Box<dyn Read>>, StreamError> {
    let mut reader = BufReader::new(File::open(path)?);
    let head = reader.fill_buf()?;
    let inner: Box<dyn Read> = if head.starts_with(&ZSTD_MAGIC) {
        Box::new(zstd::Decoder::new(reader)?)
    } else {
        Box::new(reader)
    };
    Ok(StreamReader::new(inner))
}

/// Create a capture file for writing, optionally behind a zstd encoder.
///
/// The zstd end-of-stream frame is written when the returned writer is
/// dropped; callers should flush the `StreamWriter` before letting it go.
pub fn create_capture(path: &Path, compress: bool) -> Result<StreamWriter<Box<dyn Write>>, StreamError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file = BufWriter::with_capacity(1 << 20, File::create(path)?);
    let inner: Box<dyn Write> = if compress {
        Box::new(zstd::Encoder::new(file, 3)?.auto_finish())
    } else {
        Box::new(file)
    };
    Ok(StreamWriter::new(inner))
}
