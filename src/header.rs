use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use serde::{Deserialize, Serialize};

/// Size, in bytes, of the fixed header frame every log file starts with.
pub const HEADER_BYTES: i64 = 128;

/// The version string stamped into freshly written headers.
pub const CURRENT_VERSION: &str = "1.0.0";

/// The fixed 128-byte prefix of every log file: a live-record marker byte, a JSON object, and
/// NUL padding up to the frame boundary, terminated by a newline.
///
/// Only `records` is load-bearing for engine behavior (it seeds `records_stored` on open when
/// present and trustworthy); `version` is carried for forward compatibility the way the original
/// tool stamped a build version into every file it created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub records: i64,
    pub version: String,
}

impl Header {
    pub fn new() -> Self {
        Self {
            records: 0,
            version: CURRENT_VERSION.to_string(),
        }
    }

    /// Serializes and writes the header at offset 0, NUL-padding the JSON body out to
    /// `HEADER_BYTES - 2` bytes (one byte for the leading marker, one for the trailing newline).
    ///
    /// # Errors
    ///
    /// Returns an error if the serialized JSON would not fit in the reserved header frame, or if
    /// the underlying write/sync fails.
    pub fn write(&self, file: &File) -> io::Result<()> {
        let body = serde_json::to_vec(self).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let budget = (HEADER_BYTES - 2) as usize;
        if body.len() > budget {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("header size exceeding {HEADER_BYTES} bytes, failed to write header"),
            ));
        }

        let mut frame = Vec::with_capacity(HEADER_BYTES as usize);
        frame.push(b' ');
        frame.extend_from_slice(&body);
        frame.resize(HEADER_BYTES as usize - 1, 0u8);
        frame.push(b'\n');
        debug_assert_eq!(frame.len(), HEADER_BYTES as usize);

        file.write_at(&frame, 0)?;
        file.sync_all()
    }

    /// Reads and parses the header frame at offset 0.
    ///
    /// Returns an error if the file is shorter than the header frame, or the JSON body (with the
    /// marker byte stripped and NUL padding trimmed) fails to parse — which happens on a freshly
    /// created, empty file, and is the engine's signal to rebuild the header by scanning instead.
    pub fn read(file: &File) -> io::Result<Self> {
        let mut buffer = vec![0u8; HEADER_BYTES as usize];
        file.read_at(&mut buffer, 0)?;

        if buffer.is_empty() || buffer[0] != b' ' {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "missing header marker"));
        }

        let trimmed: &[u8] = {
            let body = &buffer[1..];
            let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
            &body[..end]
        };

        serde_json::from_slice(trimmed).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::new()
    }
}
