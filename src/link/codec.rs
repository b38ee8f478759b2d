use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::link::error::LinkError;

/// Longest line kept, anything longer is noise from a misbehaving device.
pub const MAX_LINE_LENGTH: usize = 8 * 1024;

/// Splits the byte stream from the device into lines,
/// and terminates each line written to it.
///
/// A trailing carriage return is removed from decoded lines,
/// since the firmware prints `\r\n`.
#[derive(Debug, Clone)]
pub struct LinesCodec {
    /// How far into the buffer we have already searched for a delimiter.
    searched: usize,

    /// Ends a line. Not part of the yielded lines.
    read_delimiter: u8,

    /// Appended to each line written, if any.
    write_delimiter: Option<u8>,

    /// See [`MAX_LINE_LENGTH`].
    max_length: usize,

    /// Dropping input until the end of an overlong line.
    discarding: bool,
}

impl LinesCodec {
    /// Create a new codec.
    pub fn new(read_delimiter: u8, write_delimiter: Option<u8>) -> Self {
        Self {
            searched: 0,
            read_delimiter,
            write_delimiter,
            max_length: MAX_LINE_LENGTH,
            discarding: false,
        }
    }

    /// Discard lines longer than this.
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }
}

impl Default for LinesCodec {
    fn default() -> Self {
        Self::new(b'\n', Some(b'\n'))
    }
}

impl Decoder for LinesCodec {
    type Item = Vec<u8>;
    type Error = LinkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let found = src[self.searched..]
                .iter()
                .position(|&byte| byte == self.read_delimiter)
                .map(|offset| self.searched + offset);

            match (self.discarding, found) {
                // The rest of an overlong line.
                (true, Some(end)) => {
                    src.advance(end + 1);
                    self.searched = 0;
                    self.discarding = false;
                }
                (true, None) => {
                    src.clear();
                    self.searched = 0;

                    return Ok(None);
                }
                (false, None) => {
                    if src.len() > self.max_length {
                        warn!(
                            "Discarding a line longer than {} bytes from the device",
                            self.max_length
                        );
                        src.clear();
                        self.searched = 0;
                        self.discarding = true;
                    } else {
                        self.searched = src.len();
                    }

                    return Ok(None);
                }
                (false, Some(end)) => {
                    self.searched = 0;

                    let mut line = src.split_to(end);
                    src.advance(1);

                    if line.last() == Some(&b'\r') {
                        line.truncate(line.len() - 1);
                    }

                    if line.len() > self.max_length {
                        warn!("Discarding a {} byte line from the device", line.len());
                        continue;
                    }

                    return Ok(Some(line.to_vec()));
                }
            }
        }
    }
}

impl Encoder<Vec<u8>> for LinesCodec {
    type Error = LinkError;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len() + 1);
        dst.extend_from_slice(&item);
        dst.extend(self.write_delimiter);

        Ok(())
    }
}
