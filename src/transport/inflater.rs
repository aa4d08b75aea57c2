//! Zlib decompression for compressed gateway frames

use std::io::Read;

use flate2::read::ZlibDecoder;
use flate2::{Decompress, FlushDecompress};

use crate::error::GatewayError;

/// Every complete zlib-stream message ends with a sync-flush marker.
const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];
const CHUNK_SIZE: usize = 32 * 1024;

/// Shared-context inflater for `compress=zlib-stream`.
///
/// One zlib context spans the whole connection, so frames must be fed in
/// order and the inflater must be reset on every new socket.
pub struct StreamInflater {
    decompress: Decompress,
    buffer: Vec<u8>,
}

impl StreamInflater {
    pub fn new() -> Self {
        Self {
            decompress: Decompress::new(true),
            buffer: Vec::new(),
        }
    }

    /// Feed one websocket frame.
    ///
    /// Returns `Ok(None)` while the message is still incomplete, and the
    /// inflated bytes once a frame ending in the sync-flush marker arrives.
    pub fn push(&mut self, frame: &[u8]) -> Result<Option<Vec<u8>>, GatewayError> {
        self.buffer.extend_from_slice(frame);
        if !self.buffer.ends_with(&ZLIB_SUFFIX) {
            return Ok(None);
        }

        let mut output = Vec::with_capacity(CHUNK_SIZE.max(self.buffer.len() * 4));
        let mut offset = 0;
        loop {
            if output.len() == output.capacity() {
                output.reserve(CHUNK_SIZE);
            }
            let before = self.decompress.total_in();
            self.decompress
                .decompress_vec(&self.buffer[offset..], &mut output, FlushDecompress::Sync)
                .map_err(|e| GatewayError::Decompress(e.to_string()))?;
            offset += (self.decompress.total_in() - before) as usize;

            // all input consumed and zlib stopped with room to spare
            if offset >= self.buffer.len() && output.len() < output.capacity() {
                break;
            }
        }

        self.buffer.clear();
        Ok(Some(output))
    }

    /// Bytes buffered for an incomplete message.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn reset(&mut self) {
        self.decompress.reset(true);
        self.buffer.clear();
    }
}

impl Default for StreamInflater {
    fn default() -> Self {
        Self::new()
    }
}

/// Inflate a self-contained zlib payload (`compress: true` in IDENTIFY).
pub fn inflate_payload(frame: &[u8]) -> Result<Vec<u8>, GatewayError> {
    let mut output = Vec::with_capacity(frame.len() * 4);
    ZlibDecoder::new(frame)
        .read_to_end(&mut output)
        .map_err(|e| GatewayError::Decompress(e.to_string()))?;
    Ok(output)
}
