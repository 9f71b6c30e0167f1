//! Varint-framed packet reading and writing over byte streams.
//!
//! On the wire a packet is `varint(len) | varint(id) | data` where `len`
//! covers the encoded id plus the data. Reads should go through a buffered
//! reader so the byte-at-a-time varint reads do not each hit a syscall.

use super::{DecodeError, Decoder, Encoder};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A single frame: the packet id and its undecoded body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub data: Vec<u8>,
}

/// An error while reading a frame from a stream.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("unexpected end of stream")]
    UnexpectedEof,
    #[error("varint / varlong is too long")]
    VarIntTooLong,
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
    #[error("frame with an empty body")]
    EmptyFrame,
    #[error(transparent)]
    Io(io::Error),
}

impl From<io::Error> for ReadError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            ReadError::UnexpectedEof
        } else {
            ReadError::Io(err)
        }
    }
}

impl Packet {
    pub fn new(id: i32, data: Vec<u8>) -> Self {
        Self { id, data }
    }

    /// The full on-wire encoding of this packet, length prefix included.
    pub fn wire_encoding(&self) -> Vec<u8> {
        let mut id_buf = Vec::with_capacity(5);
        Encoder::new(&mut id_buf).write_var_int(self.id);

        let mut frame = Vec::with_capacity(5 + id_buf.len() + self.data.len());
        let mut encoder = Encoder::new(&mut frame);
        encoder.write_var_int((id_buf.len() + self.data.len()) as i32);
        encoder.write_slice(&id_buf);
        encoder.write_slice(&self.data);
        frame
    }
}

/// Reads a VarInt from the stream, returning the value and the number
/// of bytes consumed.
pub async fn read_varint<R>(reader: &mut R) -> Result<(i32, usize), ReadError>
where
    R: AsyncRead + Unpin,
{
    read_varint_inner(reader, None).await
}

async fn read_varint_inner<R>(
    reader: &mut R,
    mut record: Option<&mut Vec<u8>>,
) -> Result<(i32, usize), ReadError>
where
    R: AsyncRead + Unpin,
{
    let mut num_read = 0;
    let mut result = 0;

    loop {
        let read = reader.read_u8().await?;
        if let Some(record) = record.as_mut() {
            record.push(read);
        }
        let value = i32::from(read & 0b0111_1111);
        result |= value.overflowing_shl(7 * num_read).0;

        num_read += 1;

        if num_read > 5 {
            return Err(ReadError::VarIntTooLong);
        }
        if read & 0b1000_0000 == 0 {
            break;
        }
    }
    Ok((result, num_read as usize))
}

/// Reads one frame of at most `max_size` bytes.
pub async fn read_packet<R>(reader: &mut R, max_size: usize) -> Result<Packet, ReadError>
where
    R: AsyncRead + Unpin,
{
    read_packet_inner(reader, max_size, None).await
}

/// Reads one frame, appending the exact bytes consumed from the stream
/// to `record`. Overlong encodings survive in `record` even though the
/// decoded packet would re-encode canonically.
pub async fn read_packet_recorded<R>(
    reader: &mut R,
    max_size: usize,
    record: &mut Vec<u8>,
) -> Result<Packet, ReadError>
where
    R: AsyncRead + Unpin,
{
    read_packet_inner(reader, max_size, Some(record)).await
}

async fn read_packet_inner<R>(
    reader: &mut R,
    max_size: usize,
    mut record: Option<&mut Vec<u8>>,
) -> Result<Packet, ReadError>
where
    R: AsyncRead + Unpin,
{
    let (len, _) = read_varint_inner(reader, record.as_mut().map(|record| &mut **record)).await?;
    if len <= 0 {
        return Err(ReadError::EmptyFrame);
    }
    let len = len as usize;
    if len > max_size {
        return Err(ReadError::FrameTooLarge { len, max: max_size });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    if let Some(record) = record {
        record.extend_from_slice(&body);
    }

    let mut decoder = Decoder::new(&body);
    let (id, id_size) = decoder.read_var_int_with_size().map_err(|err| match err {
        DecodeError::VarIntTooLong => ReadError::VarIntTooLong,
        _ => ReadError::UnexpectedEof,
    })?;

    Ok(Packet {
        id,
        data: body[id_size..].to_vec(),
    })
}

/// Writes one frame. The frame is assembled in memory and written with a
/// single call, so a writer that is not shared mid-call sees it atomically.
pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&packet.wire_encoding()).await?;
    writer.flush().await
}
