use crate::protocol::error::{FnlbError, Result};
use crate::protocol::CapacitySnapshot;

/// Longest accepted snapshot line. Longer lines are rejected and skipped.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Incremental decoder for newline-delimited capacity snapshots.
///
/// Bytes may arrive split at arbitrary points; complete lines are decoded as
/// soon as their terminating `\n` is seen. Blank lines are ignored. Each
/// line decodes independently, so one malformed snapshot does not poison the
/// rest of the stream.
///
/// # Example
///
/// ```
/// use fnlb_common::transport::SnapshotDecoder;
///
/// let mut decoder = SnapshotDecoder::new();
/// assert!(decoder.feed(br#"{"nodeId":"n1","#).is_empty());
/// let decoded = decoder.feed(b"\"timestamp\":1}\n");
/// assert_eq!(decoded.len(), 1);
/// assert!(decoder.finish().is_none());
/// ```
#[derive(Debug, Default)]
pub struct SnapshotDecoder {
    buffer: Vec<u8>,
    /// Set while discarding the remainder of an overlong line
    skipping: bool,
}

impl SnapshotDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every snapshot completed by it, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Result<CapacitySnapshot>> {
        let mut out = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            let (line, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if self.skipping {
                self.skipping = false;
                self.buffer.clear();
                continue;
            }

            if self.buffer.len() + line.len() > MAX_LINE_BYTES {
                self.buffer.clear();
                out.push(Err(Self::overlong()));
                continue;
            }

            self.buffer.extend_from_slice(line);
            let decoded = Self::decode_line(&self.buffer);
            self.buffer.clear();
            if let Some(decoded) = decoded {
                out.push(decoded);
            }
        }

        if !self.skipping {
            if self.buffer.len() + rest.len() > MAX_LINE_BYTES {
                self.buffer.clear();
                self.skipping = true;
                out.push(Err(Self::overlong()));
            } else {
                self.buffer.extend_from_slice(rest);
            }
        }

        out
    }

    /// Decode whatever is left once the stream has ended.
    ///
    /// A final line without a trailing newline is still a snapshot.
    pub fn finish(&mut self) -> Option<Result<CapacitySnapshot>> {
        let skipping = std::mem::take(&mut self.skipping);
        let buffer = std::mem::take(&mut self.buffer);
        if skipping {
            return None;
        }
        Self::decode_line(&buffer)
    }

    fn decode_line(line: &[u8]) -> Option<Result<CapacitySnapshot>> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            return None;
        }
        Some(serde_json::from_slice(line).map_err(|e| {
            FnlbError::InvalidRequest(format!("malformed snapshot line: {}", e))
        }))
    }

    fn overlong() -> FnlbError {
        FnlbError::InvalidRequest(format!(
            "snapshot line exceeds {} bytes",
            MAX_LINE_BYTES
        ))
    }
}

/// Encode snapshots as newline-delimited JSON, one per line.
pub fn encode_ndjson(snapshots: &[CapacitySnapshot]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for snapshot in snapshots {
        serde_json::to_writer(&mut out, snapshot)?;
        out.push(b'\n');
    }
    Ok(out)
}
