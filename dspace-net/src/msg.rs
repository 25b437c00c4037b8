//! Message definitions for the remote query protocol.
//!
//! Each message on the wire is a fixed header followed by the payload:
//!
//! ```text
//! | code: u8 | flags: u8 | payload_size: u32 LE | length: u32 LE | payload |
//! ```
//!
//! `payload_size` is the size of the bincode-encoded payload before
//! compression, `length` the number of payload bytes that follow. Bit 0 of
//! `flags` marks an lz4-compressed payload.

use std::convert::TryFrom;
use std::io::{Read, Write};

use byteorder::{ByteOrder, LittleEndian};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::de::DeserializeOwned;
use serde::Serialize;

use dspace_core::query::{FieldImage, SnapshotInfo};
use dspace_core::{Coord, Pid};

use crate::error::{Error, Result};

pub const HEADER_SIZE: usize = 10;

const FLAG_COMPRESSED: u8 = 0b1;

/// Upper bound on a single payload, anything larger is treated as a
/// corrupted stream.
pub const MAX_PAYLOAD_SIZE: u32 = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageType {
    LockSnapshotRequest = 1,
    LockSnapshotResponse,
    UnlockSnapshotRequest,
    UnlockSnapshotResponse,
    PointToOwnerRequest,
    PointToOwnerResponse,
    FetchLeafStorageRequest,
    FetchLeafStorageResponse,
    ErrorResponse,
}

/// Implemented by every payload struct.
pub trait Payload: Serialize + DeserializeOwned {
    fn kind() -> MessageType;
}

macro_rules! payload {
    ($($name:ident),* $(,)?) => {
        $(
            impl Payload for $name {
                fn kind() -> MessageType {
                    MessageType::$name
                }
            }
        )*
    };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockSnapshotRequest {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockSnapshotResponse {
    pub info: SnapshotInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnlockSnapshotRequest {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnlockSnapshotResponse {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointToOwnerRequest {
    pub coord: Vec<Coord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointToOwnerResponse {
    pub owner: Pid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchLeafStorageRequest {
    pub leaf: Pid,
    /// Ask the server to compress the response
    pub compress: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchLeafStorageResponse {
    pub leaf: Pid,
    pub images: Vec<FieldImage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

payload!(
    LockSnapshotRequest,
    LockSnapshotResponse,
    UnlockSnapshotRequest,
    UnlockSnapshotResponse,
    PointToOwnerRequest,
    PointToOwnerResponse,
    FetchLeafStorageRequest,
    FetchLeafStorageResponse,
    ErrorResponse,
);

/// Single protocol message with an encoded payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub kind: MessageType,
    /// Size of uncompressed payload
    payload_size: u32,
    compressed: bool,
    payload: Vec<u8>,
}

impl Message {
    /// Creates a complete `Message` from a payload struct, optionally
    /// compressing the payload. Compression is skipped when the `lz4`
    /// feature is disabled.
    pub fn from_payload<P: Payload>(payload: &P, compress: bool) -> Result<Message> {
        let bytes = bincode::serialize(payload)?;
        let payload_size = bytes.len() as u32;
        #[cfg(feature = "lz4")]
        {
            if compress {
                return Ok(Message {
                    kind: P::kind(),
                    payload_size,
                    compressed: true,
                    payload: lz4::block::compress(&bytes, None, false)?,
                });
            }
        }
        #[cfg(not(feature = "lz4"))]
        let _ = compress;
        Ok(Message {
            kind: P::kind(),
            payload_size,
            compressed: false,
            payload: bytes,
        })
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Unpacks the payload into a payload struct of the provided type.
    pub fn unpack_payload<P: Payload>(&self) -> Result<P> {
        if self.kind != P::kind() {
            return Err(Error::UnexpectedMessage(self.kind));
        }
        if self.compressed {
            #[cfg(feature = "lz4")]
            {
                let decompressed =
                    lz4::block::decompress(&self.payload, Some(self.payload_size as i32))?;
                return Ok(bincode::deserialize(&decompressed)?);
            }
            #[cfg(not(feature = "lz4"))]
            return Err(Error::Other(
                "received compressed payload, lz4 support not enabled".to_string(),
            ));
        }
        Ok(bincode::deserialize(&self.payload)?)
    }

    /// Turns an error response into `Error::Remote`, passes every other
    /// message through.
    pub fn into_result(self) -> Result<Message> {
        if self.kind == MessageType::ErrorResponse {
            let resp: ErrorResponse = self.unpack_payload()?;
            return Err(Error::Remote(resp.error));
        }
        Ok(self)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_SIZE + self.payload.len()];
        buf[0] = self.kind.into();
        buf[1] = if self.compressed { FLAG_COMPRESSED } else { 0 };
        LittleEndian::write_u32(&mut buf[2..6], self.payload_size);
        LittleEndian::write_u32(&mut buf[6..10], self.payload.len() as u32);
        buf[HEADER_SIZE..].copy_from_slice(&self.payload);
        buf
    }
}

/// Writes a single message to the stream.
pub fn write_message<W: Write>(stream: &mut W, msg: &Message) -> Result<()> {
    stream.write_all(&msg.to_bytes())?;
    stream.flush()?;
    Ok(())
}

/// Reads a single message from the stream, blocking until it's complete.
pub fn read_message<R: Read>(stream: &mut R) -> Result<Message> {
    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header)?;
    let kind = MessageType::try_from(header[0])?;
    let compressed = header[1] & FLAG_COMPRESSED != 0;
    let payload_size = LittleEndian::read_u32(&header[2..6]);
    let len = LittleEndian::read_u32(&header[6..10]);
    if len > MAX_PAYLOAD_SIZE || payload_size > MAX_PAYLOAD_SIZE {
        return Err(Error::Other(format!(
            "payload of {} bytes exceeds limit",
            len.max(payload_size)
        )));
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload)?;
    Ok(Message {
        kind,
        payload_size,
        compressed,
        payload,
    })
}

/// Sends a request and waits for the response of the matching type.
pub fn request<S, Req, Resp>(stream: &mut S, req: &Req) -> Result<Resp>
where
    S: Read + Write,
    Req: Payload,
    Resp: Payload,
{
    write_message(stream, &Message::from_payload(req, false)?)?;
    read_message(stream)?.into_result()?.unpack_payload()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dspace_core::halo::ElementKind;
    use dspace_core::Region;
    use std::io::Cursor;

    fn leaf_response() -> FetchLeafStorageResponse {
        FetchLeafStorageResponse {
            leaf: 2,
            images: vec![FieldImage {
                name: "heat".to_string(),
                kind: ElementKind::F64,
                region: Region::new(vec![0, 0], vec![16, 16]).unwrap(),
                bytes: vec![0; 16 * 16 * 8],
            }],
        }
    }

    #[test]
    fn frame_layout() {
        let msg = Message::from_payload(&PointToOwnerResponse { owner: 3 }, false).unwrap();
        let bytes = msg.to_bytes();
        assert_eq!(bytes[0], MessageType::PointToOwnerResponse as u8);
        assert_eq!(bytes[1], 0);
        assert_eq!(LittleEndian::read_u32(&bytes[6..10]) as usize, bytes.len() - HEADER_SIZE);

        let read = read_message(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(read, msg);
        let resp: PointToOwnerResponse = read.unpack_payload().unwrap();
        assert_eq!(resp.owner, 3);
    }

    #[cfg(feature = "lz4")]
    #[test]
    fn compressed_payload_shrinks() {
        let plain = Message::from_payload(&leaf_response(), false).unwrap();
        let packed = Message::from_payload(&leaf_response(), true).unwrap();
        assert!(packed.is_compressed());
        assert!(packed.to_bytes().len() < plain.to_bytes().len());

        let read = read_message(&mut Cursor::new(packed.to_bytes())).unwrap();
        let resp: FetchLeafStorageResponse = read.unpack_payload().unwrap();
        assert_eq!(resp, leaf_response());
    }

    #[test]
    fn unknown_code_is_rejected() {
        let mut bytes = Message::from_payload(&UnlockSnapshotRequest {}, false)
            .unwrap()
            .to_bytes();
        bytes[0] = 200;
        match read_message(&mut Cursor::new(bytes)) {
            Err(Error::UnknownMsgCode(_)) => (),
            other => panic!("expected unknown code, got {:?}", other),
        }
    }

    #[test]
    fn wrong_payload_type() {
        let msg = Message::from_payload(&leaf_response(), false).unwrap();
        assert!(msg.unpack_payload::<PointToOwnerResponse>().is_err());
        let err = Message::from_payload(
            &ErrorResponse {
                error: "nope".to_string(),
            },
            false,
        )
        .unwrap();
        match err.into_result() {
            Err(Error::Remote(e)) => assert_eq!(e, "nope"),
            other => panic!("expected remote error, got {:?}", other),
        }
    }
}
