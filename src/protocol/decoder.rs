use std::{num::TryFromIntError, str::Utf8Error};

/// An error while decoding packets.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("need at least {0} more bytes")]
    EndOfStream(usize),
    #[error("varint / varlong is too long")]
    VarIntTooLong,
    #[error("string of {len} chars exceeds the {max} char limit")]
    StringTooLong { len: usize, max: usize },
    #[error("unexpected packet id {actual:#04x}, expected {expected:#04x}")]
    UnexpectedPacketId { expected: i32, actual: i32 },
    #[error("invalid next state {0}")]
    InvalidNextState(i32),
    #[error("{0} trailing bytes after packet body")]
    TrailingBytes(usize),
    #[error("handshake address carries no forwarding suffix")]
    NoForwardedAddress,
    #[error("malformed forwarded address in handshake")]
    InvalidForwardedAddress,
    #[error(transparent)]
    Utf8(#[from] Utf8Error),
    #[error(transparent)]
    IntConversion(#[from] TryFromIntError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = DecodeError> = std::result::Result<T, E>;

/// A raw decoder over the body bytes of a single packet.
#[derive(Debug)]
pub struct Decoder<'a> {
    buffer: &'a [u8],
}

impl<'a> Decoder<'a> {
    /// Creates a decoder from the buffer it will read from.
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer }
    }

    /// Returns if there is no data left in the buffer.
    pub fn is_finished(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Number of bytes left in the buffer.
    pub fn remaining(&self) -> usize {
        self.buffer.len()
    }

    /// Consumes `n` bytes from the buffer, returning them as a slice.
    pub fn consume_slice(&mut self, n: usize) -> Result<&'a [u8]> {
        if n <= self.buffer.len() {
            let (data, buffer) = self.buffer.split_at(n);
            self.buffer = buffer;
            Ok(data)
        } else {
            Err(DecodeError::EndOfStream(n - self.buffer.len()))
        }
    }

    /// Consumes `N` bytes into an array.
    pub fn consume<const N: usize>(&mut self) -> Result<[u8; N]> {
        let data = self.consume_slice(N)?;
        Ok(<[u8; N]>::try_from(data).unwrap())
    }

    /// Reads an unsigned byte from the stream.
    pub fn read_u8(&mut self) -> Result<u8> {
        self.consume::<1>().map(|[x]| x)
    }

    /// Reads an unsigned big-endian short from the stream.
    pub fn read_u16(&mut self) -> Result<u16> {
        self.consume().map(u16::from_be_bytes)
    }

    /// Reads a signed big-endian long from the stream.
    pub fn read_i64(&mut self) -> Result<i64> {
        self.consume().map(i64::from_be_bytes)
    }

    /// Reads a VarInt from the stream.
    pub fn read_var_int(&mut self) -> Result<i32> {
        self.read_var_int_with_size().map(|(x, _)| x)
    }

    /// Reads a VarInt from the stream, additionally
    /// returning the number of bytes read.
    ///
    /// Overlong but terminated encodings are accepted.
    pub fn read_var_int_with_size(&mut self) -> Result<(i32, usize)> {
        let mut num_read = 0;
        let mut result = 0;

        loop {
            let read = self.read_u8()?;
            let value = i32::from(read & 0b0111_1111);
            result |= value.overflowing_shl(7 * num_read).0;

            num_read += 1;

            if num_read > 5 {
                return Err(DecodeError::VarIntTooLong);
            }
            if read & 0b1000_0000 == 0 {
                break;
            }
        }
        Ok((result, num_read as usize))
    }

    /// Reads a VarLong from the stream.
    pub fn read_var_long(&mut self) -> Result<i64> {
        let mut num_read = 0;
        let mut result = 0;

        loop {
            let read = self.read_u8()?;
            let value = i64::from(read & 0b0111_1111);
            result |= value.overflowing_shl(7 * num_read).0;

            num_read += 1;

            if num_read > 10 {
                return Err(DecodeError::VarIntTooLong);
            }
            if read & 0b1000_0000 == 0 {
                break;
            }
        }
        Ok(result)
    }

    /// Reads a varint-prefixed UTF-8 string of at most `max_chars`.
    pub fn read_string(&mut self, max_chars: usize) -> Result<&'a str> {
        let length = usize::try_from(self.read_var_int()?)?;

        // The prefix counts bytes; chars are checked after decoding.
        if length > max_chars * 4 {
            return Err(DecodeError::StringTooLong {
                len: length,
                max: max_chars,
            });
        }

        let string = std::str::from_utf8(self.consume_slice(length)?)?;
        let chars = string.chars().count();
        if chars > max_chars {
            return Err(DecodeError::StringTooLong {
                len: chars,
                max: max_chars,
            });
        }
        Ok(string)
    }
}
