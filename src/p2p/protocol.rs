//! Wire framing
//!
//! Control frame: `[1 byte: 0x01] [4 bytes: length, little-endian] [payload]`
//! Stream signal: `[1 byte: 0x02]`, raw bytes follow with their size
//! announced out of band.

use super::{Rpc, TransportError};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// A control frame follows
pub const INCOMING_MESSAGE: u8 = 0x1;

/// Raw stream bytes follow
pub const INCOMING_STREAM: u8 = 0x2;

/// Largest control payload kept by the decoder; longer frames are truncated
pub const MAX_FRAME_SIZE: usize = 1028;

/// Write one control frame
pub fn write_message<W: Write + ?Sized>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let length = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "control frame too large"))?;

    writer.write_all(&[INCOMING_MESSAGE])?;
    writer.write_u32::<LittleEndian>(length)?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Write the stream tag; the caller writes the body next on the same writer
pub fn write_stream_signal<W: Write + ?Sized>(writer: &mut W) -> io::Result<()> {
    writer.write_all(&[INCOMING_STREAM])
}

/// Turns the connection byte stream into RPCs
pub trait Decoder: Send + Sync {
    /// Decode exactly one unit. Must not consume anything past a stream tag.
    fn decode(&self, reader: &mut dyn Read, rpc: &mut Rpc) -> Result<(), TransportError>;
}

/// Tag-byte decoder for the framing above
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDecoder;

impl Decoder for DefaultDecoder {
    fn decode(&self, reader: &mut dyn Read, rpc: &mut Rpc) -> Result<(), TransportError> {
        let mut tag = [0u8; 1];
        reader.read_exact(&mut tag)?;

        match tag[0] {
            INCOMING_STREAM => {
                rpc.stream = true;
                Ok(())
            }
            INCOMING_MESSAGE => {
                let length = reader.read_u32::<LittleEndian>()? as usize;
                let kept = length.min(MAX_FRAME_SIZE);

                let mut payload = vec![0u8; kept];
                reader.read_exact(&mut payload)?;

                if length > kept {
                    let excess = (length - kept) as u64;
                    io::copy(&mut (&mut *reader).take(excess), &mut io::sink())?;
                    log::warn!(
                        "control frame of {} bytes truncated to {}",
                        length,
                        MAX_FRAME_SIZE
                    );
                }

                log::trace!("decoded control frame ({} bytes)", kept);
                rpc.payload = payload;
                Ok(())
            }
            other => Err(TransportError::Decode(format!("unknown tag: {:#04x}", other))),
        }
    }
}
