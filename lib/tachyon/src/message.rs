use crate::keys::{KeySlots, SymmetricKey};
use crate::support::{ErrorType, NetworkError, NetworkResult};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use quark::crypto;
use quark::encoding::{compact_size_len, read_compact_size, write_compact_size, SizedRead};
use rand::Rng;
use std::io::{Cursor, Read};

pub type SequenceNumber = u16;
pub type ConnectionId = u64;
pub type CookieId = u64;

pub const PROTOCOL_VERSION_MAJOR: u8 = 0;
pub const PROTOCOL_VERSION_MINOR: u8 = 1;

/// Fixed header: mac(4) iv(4) seqnum(2) acknum(2) type_flags(1).
pub const HEADER_SIZE: usize = 13;
/// Upper bound on any length-prefixed payload blob.
pub const MAX_BLOB_LEN: usize = u16::MAX as usize;

const TYPE_MASK: u8 = 0b0000_1111;
const ACK_FLAG: u8 = 0b1000_0000;
const SEQNUM_FLAG: u8 = 0b0100_0000;

/// Flag bit inside the Syn payload signalling an attached cookie.
const SYN_COOKIE_FLAG: u8 = 0b0000_0001;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MessageType {
    Syn = 1,
    State = 2,
    Data = 3,
    EAck = 4,
    Mtud = 5,
    Reset = 6,
    Null = 7,
    Cookie = 8,
}

impl From<MessageType> for u8 {
    #[inline]
    fn from(message_type: MessageType) -> Self {
        message_type as u8
    }
}

/// One selectively acknowledged range of received sequence numbers,
/// inclusive on both ends.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AckRange {
    pub begin: SequenceNumber,
    pub end: SequenceNumber,
}

pub const ACK_RANGE_SIZE: usize = 4;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SynPayload {
    pub version_major: u8,
    pub version_minor: u8,
    pub connection_id: ConnectionId,
    pub port: u16,
    pub cookie: Option<CookieId>,
    pub handshake_data: Vec<u8>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct StatePayload {
    pub max_window_items: u32,
    pub max_window_bytes: u32,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Payload {
    Syn(SynPayload),
    State(StatePayload),
    Data(Vec<u8>),
    EAck(Vec<AckRange>),
    Mtud(Vec<u8>),
    Reset,
    Null,
    Cookie(CookieId),
}

/// One datagram: the header fields that are logically present plus the
/// type-specific payload. Encoding obfuscates and authenticates the frame;
/// decoding verifies and strips both layers.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Message {
    seqnum: Option<SequenceNumber>,
    acknum: Option<SequenceNumber>,
    payload: Payload,
}

impl Message {
    pub fn syn(seqnum: SequenceNumber, acknum: Option<SequenceNumber>, payload: SynPayload) -> Message {
        Message {
            seqnum: Some(seqnum),
            acknum,
            payload: Payload::Syn(payload),
        }
    }

    pub fn cookie(cookie_id: CookieId) -> Message {
        Message {
            seqnum: None,
            acknum: None,
            payload: Payload::Cookie(cookie_id),
        }
    }

    pub fn data(seqnum: SequenceNumber, acknum: SequenceNumber, bytes: Vec<u8>) -> Message {
        Message {
            seqnum: Some(seqnum),
            acknum: Some(acknum),
            payload: Payload::Data(bytes),
        }
    }

    pub fn state(seqnum: SequenceNumber, acknum: SequenceNumber, payload: StatePayload) -> Message {
        Message {
            seqnum: Some(seqnum),
            acknum: Some(acknum),
            payload: Payload::State(payload),
        }
    }

    pub fn eack(acknum: SequenceNumber, ranges: Vec<AckRange>) -> Message {
        Message {
            seqnum: None,
            acknum: Some(acknum),
            payload: Payload::EAck(ranges),
        }
    }

    pub fn mtud_probe(seqnum: SequenceNumber, bytes: Vec<u8>) -> Message {
        Message {
            seqnum: Some(seqnum),
            acknum: None,
            payload: Payload::Mtud(bytes),
        }
    }

    pub fn mtud_ack(acknum: SequenceNumber) -> Message {
        Message {
            seqnum: None,
            acknum: Some(acknum),
            payload: Payload::Mtud(Vec::new()),
        }
    }

    pub fn null() -> Message {
        Message {
            seqnum: None,
            acknum: None,
            payload: Payload::Null,
        }
    }

    pub fn reset() -> Message {
        Message {
            seqnum: None,
            acknum: None,
            payload: Payload::Reset,
        }
    }

    #[inline]
    pub fn message_type(&self) -> MessageType {
        match self.payload {
            Payload::Syn(_) => MessageType::Syn,
            Payload::State(_) => MessageType::State,
            Payload::Data(_) => MessageType::Data,
            Payload::EAck(_) => MessageType::EAck,
            Payload::Mtud(_) => MessageType::Mtud,
            Payload::Reset => MessageType::Reset,
            Payload::Null => MessageType::Null,
            Payload::Cookie(_) => MessageType::Cookie,
        }
    }

    #[inline]
    pub fn seqnum(&self) -> Option<SequenceNumber> {
        self.seqnum
    }

    #[inline]
    pub fn acknum(&self) -> Option<SequenceNumber> {
        self.acknum
    }

    #[inline]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    #[inline]
    pub fn into_payload(self) -> Payload {
        self.payload
    }

    /// Whether the header flags are consistent with the payload kind.
    pub fn validate(&self) -> bool {
        let has_seq = self.seqnum.is_some();
        let has_ack = self.acknum.is_some();

        match self.payload {
            Payload::Data(_) => has_seq && has_ack,
            Payload::State(_) => has_seq && has_ack,
            Payload::EAck(_) => has_ack,
            Payload::Syn(_) => has_seq,
            Payload::Mtud(_) => has_seq != has_ack,
            Payload::Null | Payload::Reset => !has_seq && !has_ack,
            Payload::Cookie(_) => !has_seq && !has_ack,
        }
    }

    /// Maximum application payload carried by one Data message given the
    /// current maximum datagram size.
    #[inline]
    pub fn max_data_size(max_message_size: usize) -> usize {
        MAX_BLOB_LEN.min(max_message_size - (HEADER_SIZE + compact_size_len(MAX_BLOB_LEN as u64)))
    }

    /// Maximum number of ack ranges carried by one EAck message.
    #[inline]
    pub fn max_ack_ranges(max_message_size: usize) -> usize {
        Self::max_data_size(max_message_size) / ACK_RANGE_SIZE
    }

    /// Serializes, obfuscates and authenticates the message into a datagram
    /// no larger than `max_message_size`.
    pub fn write(&self, max_message_size: usize, key: &SymmetricKey) -> NetworkResult<Vec<u8>> {
        // An expired key is read-only
        if key.is_expired() {
            return Err(NetworkError::Fatal(ErrorType::Crypto));
        }

        let mut rng = rand::thread_rng();
        let mut buffer = Vec::with_capacity(max_message_size.min(1 << 16));

        // Unused seqnum/acknum fields carry random bytes on the wire
        buffer.write_u32::<BigEndian>(0).expect("vec write");
        buffer.write_u32::<BigEndian>(rng.gen()).expect("vec write");
        buffer
            .write_u16::<BigEndian>(self.seqnum.unwrap_or_else(|| rng.gen()))
            .expect("vec write");
        buffer
            .write_u16::<BigEndian>(self.acknum.unwrap_or_else(|| rng.gen()))
            .expect("vec write");
        buffer.write_u8(self.type_flags()).expect("vec write");

        self.write_payload(&mut buffer)?;

        if buffer.len() > max_message_size {
            return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
        }

        // Random padding blunts traffic analysis; excluded for kinds whose
        // wire size must be precise (Mtud) or where throughput matters
        // (Data, EAck).
        if self.padding_allowed() {
            let free_space = max_message_size - buffer.len();
            if free_space > 0 {
                let pad = rng.gen_range(0..=free_space);
                let start = buffer.len();
                buffer.resize(start + pad, 0);
                rng.fill(&mut buffer[start..]);
            }
        }

        let iv = BigEndian::read_u32(&buffer[4..8]);
        obfuscate(&mut buffer[8..], key.key(), iv);

        let mac = crypto::mac32(key.auth_key(), &buffer[4..]);
        BigEndian::write_u32(&mut buffer[0..4], mac);

        Ok(buffer)
    }

    /// Authenticates and parses one datagram, trying the current key first
    /// and falling back to the prior key for its grace period.
    pub fn read(buffer: &[u8], keys: &KeySlots) -> NetworkResult<Message> {
        if buffer.len() < HEADER_SIZE {
            return Err(NetworkError::Fatal(ErrorType::Malformed));
        }

        match Self::read_with_key(buffer, keys.current()) {
            Err(NetworkError::Fatal(ErrorType::MacCheckFailed)) => match keys.previous() {
                Some(previous) => Self::read_with_key(buffer, previous),
                None => Err(NetworkError::Fatal(ErrorType::MacCheckFailed)),
            },
            result => result,
        }
    }

    fn read_with_key(buffer: &[u8], key: &SymmetricKey) -> NetworkResult<Message> {
        let mac = BigEndian::read_u32(&buffer[0..4]);
        if crypto::mac32(key.auth_key(), &buffer[4..]) != mac {
            return Err(NetworkError::Fatal(ErrorType::MacCheckFailed));
        }

        let mut work = buffer.to_vec();
        let iv = BigEndian::read_u32(&work[4..8]);
        obfuscate(&mut work[8..], key.key(), iv);

        let type_flags = work[12];
        let has_ack = type_flags & ACK_FLAG != 0;
        let has_seq = type_flags & SEQNUM_FLAG != 0;

        let seqnum = if has_seq {
            Some(BigEndian::read_u16(&work[8..10]))
        } else {
            None
        };
        let acknum = if has_ack {
            Some(BigEndian::read_u16(&work[10..12]))
        } else {
            None
        };

        let mut cursor = Cursor::new(&work[HEADER_SIZE..]);
        let payload = Self::read_payload(type_flags & TYPE_MASK, &mut cursor)?;

        let message = Message {
            seqnum,
            acknum,
            payload,
        };

        if !message.validate() {
            return Err(NetworkError::Fatal(ErrorType::Malformed));
        }

        Ok(message)
    }

    fn read_payload(type_nibble: u8, cursor: &mut Cursor<&[u8]>) -> NetworkResult<Payload> {
        let malformed = || NetworkError::Fatal(ErrorType::Malformed);

        let payload = match type_nibble {
            1 => {
                let version_major = cursor.read_u8().map_err(|_| malformed())?;
                let version_minor = cursor.read_u8().map_err(|_| malformed())?;
                let connection_id = cursor.read_u64::<BigEndian>().map_err(|_| malformed())?;
                let port = cursor.read_u16::<BigEndian>().map_err(|_| malformed())?;
                let syn_flags = cursor.read_u8().map_err(|_| malformed())?;

                let cookie = if syn_flags & SYN_COOKIE_FLAG != 0 {
                    Some(cursor.read_u64::<BigEndian>().map_err(|_| malformed())?)
                } else {
                    None
                };

                let len = read_compact_size(cursor, MAX_BLOB_LEN as u64).map_err(|_| malformed())?;
                let mut handshake_data = vec![0u8; len as usize];
                cursor.read_exact(&mut handshake_data).map_err(|_| malformed())?;

                Payload::Syn(SynPayload {
                    version_major,
                    version_minor,
                    connection_id,
                    port,
                    cookie,
                    handshake_data,
                })
            }
            2 => {
                let max_window_items = cursor.read_u32::<BigEndian>().map_err(|_| malformed())?;
                let max_window_bytes = cursor.read_u32::<BigEndian>().map_err(|_| malformed())?;

                Payload::State(StatePayload {
                    max_window_items,
                    max_window_bytes,
                })
            }
            3 => {
                let len = read_compact_size(cursor, MAX_BLOB_LEN as u64).map_err(|_| malformed())?;
                let mut bytes = vec![0u8; len as usize];
                cursor.read_exact(&mut bytes).map_err(|_| malformed())?;

                Payload::Data(bytes)
            }
            4 => {
                let len = read_compact_size(cursor, MAX_BLOB_LEN as u64).map_err(|_| malformed())?;

                // Size must be an exact multiple of one ack range
                if len as usize % ACK_RANGE_SIZE != 0 {
                    return Err(malformed());
                }

                let mut ranges = Vec::with_capacity(len as usize / ACK_RANGE_SIZE);
                for _ in 0..len as usize / ACK_RANGE_SIZE {
                    let begin = cursor.read_u16::<BigEndian>().map_err(|_| malformed())?;
                    let end = cursor.read_u16::<BigEndian>().map_err(|_| malformed())?;
                    ranges.push(AckRange { begin, end });
                }

                Payload::EAck(ranges)
            }
            5 => {
                // Probe contents are never inspected
                Payload::Mtud(Vec::new())
            }
            6 => Payload::Reset,
            7 => Payload::Null,
            8 => Payload::Cookie(cursor.read_u64::<BigEndian>().map_err(|_| malformed())?),
            _ => return Err(malformed()),
        };

        Ok(payload)
    }

    fn write_payload(&self, buffer: &mut Vec<u8>) -> NetworkResult<()> {
        match &self.payload {
            Payload::Syn(syn) => {
                buffer.write_u8(syn.version_major).expect("vec write");
                buffer.write_u8(syn.version_minor).expect("vec write");
                buffer.write_u64::<BigEndian>(syn.connection_id).expect("vec write");
                buffer.write_u16::<BigEndian>(syn.port).expect("vec write");

                let syn_flags = match syn.cookie {
                    Some(_) => SYN_COOKIE_FLAG,
                    None => 0,
                };
                buffer.write_u8(syn_flags).expect("vec write");

                if let Some(cookie_id) = syn.cookie {
                    buffer.write_u64::<BigEndian>(cookie_id).expect("vec write");
                }

                Self::write_blob(buffer, &syn.handshake_data)?;
            }
            Payload::State(state) => {
                buffer.write_u32::<BigEndian>(state.max_window_items).expect("vec write");
                buffer.write_u32::<BigEndian>(state.max_window_bytes).expect("vec write");
            }
            Payload::Data(bytes) => {
                Self::write_blob(buffer, bytes)?;
            }
            Payload::EAck(ranges) => {
                let len = ranges.len() * ACK_RANGE_SIZE;
                if len > MAX_BLOB_LEN {
                    return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
                }

                write_compact_size(buffer, len as u64).expect("vec write");
                for range in ranges {
                    buffer.write_u16::<BigEndian>(range.begin).expect("vec write");
                    buffer.write_u16::<BigEndian>(range.end).expect("vec write");
                }
            }
            Payload::Mtud(bytes) => {
                // The ack form carries no payload at all
                if !bytes.is_empty() {
                    Self::write_blob(buffer, bytes)?;
                }
            }
            Payload::Cookie(cookie_id) => {
                buffer.write_u64::<BigEndian>(*cookie_id).expect("vec write");
            }
            Payload::Null | Payload::Reset => {}
        }

        Ok(())
    }

    fn write_blob(buffer: &mut Vec<u8>, bytes: &[u8]) -> NetworkResult<()> {
        if bytes.len() > MAX_BLOB_LEN {
            return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
        }

        write_compact_size(buffer, bytes.len() as u64).expect("vec write");
        buffer.extend_from_slice(bytes);

        Ok(())
    }

    fn type_flags(&self) -> u8 {
        let mut flags: u8 = self.message_type().into();

        if self.acknum.is_some() {
            flags |= ACK_FLAG;
        }

        if self.seqnum.is_some() {
            flags |= SEQNUM_FLAG;
        }

        flags
    }

    fn padding_allowed(&self) -> bool {
        matches!(
            self.payload,
            Payload::Syn(_) | Payload::State(_) | Payload::Null | Payload::Reset | Payload::Cookie(_)
        )
    }
}

/// XORs the region with the obfuscation key after folding the IV into both
/// key halves. Applying it twice restores the original bytes.
fn obfuscate(data: &mut [u8], key: &[u8], iv: u32) {
    let mut ivkey = [0u8; crypto::KEY_LEN];
    ivkey.copy_from_slice(key);

    let iv_bytes = iv.to_be_bytes();
    for (index, byte) in ivkey.iter_mut().enumerate() {
        *byte ^= iv_bytes[index % iv_bytes.len()];
    }

    for (index, byte) in data.iter_mut().enumerate() {
        *byte ^= ivkey[index % crypto::KEY_LEN];
    }
}
