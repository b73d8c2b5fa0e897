use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Meta,
    Video,
    Audio,
}

/// One relayed media unit. The payload is opaque to the core; protocol
/// handlers on both ends agree on its encoding.
#[derive(Debug, Clone)]
pub struct Packet {
    pub kind: PacketType,
    pub timestamp: u32,
    pub payload: Bytes,
}

impl Packet {
    pub fn new<B>(kind: PacketType, timestamp: u32, payload: B) -> Self
    where
        B: Into<Bytes>,
    {
        Self {
            kind,
            timestamp,
            payload: payload.into(),
        }
    }

    pub fn new_video<B>(timestamp: u32, payload: B) -> Self
    where
        B: Into<Bytes>,
    {
        Self::new(PacketType::Video, timestamp, payload)
    }

    pub fn new_audio<B>(timestamp: u32, payload: B) -> Self
    where
        B: Into<Bytes>,
    {
        Self::new(PacketType::Audio, timestamp, payload)
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        &self.payload
    }
}
