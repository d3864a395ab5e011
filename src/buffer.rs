use bytes::{Bytes, BytesMut};

/// Bytes written while no data channel is open.
///
/// Appends keep write order; [`take`](Self::take) hands everything over in one
/// piece and leaves the buffer empty.
#[derive(Debug, Default)]
pub struct BufferedWriter {
    buf: BytesMut,
}

impl BufferedWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Remove and return all buffered bytes.
    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
