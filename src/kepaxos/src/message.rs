use bytes::{Buf, BufMut, BytesMut};

/// Fixed-size portion of an encoded message: sender_len(2) + ballot(8) +
/// seq(8) + mtype(1) + ctype(1) + committed(1) + klen(4) + dlen(4).
const FIXED_LEN: usize = 2 + 4 + 4 + 4 + 4 + 1 + 1 + 1 + 4 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    PreAccept,
    PreAcceptResponse,
    Accept,
    AcceptResponse,
    Commit,
}

impl MessageType {
    fn to_wire(self) -> u8 {
        match self {
            MessageType::PreAccept => 0x01,
            MessageType::PreAcceptResponse => 0x02,
            MessageType::Accept => 0x03,
            MessageType::AcceptResponse => 0x04,
            MessageType::Commit => 0x05,
        }
    }

    fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(MessageType::PreAccept),
            0x02 => Some(MessageType::PreAcceptResponse),
            0x03 => Some(MessageType::Accept),
            0x04 => Some(MessageType::AcceptResponse),
            0x05 => Some(MessageType::Commit),
            _ => None,
        }
    }
}

/// A PreAccept/Accept/Commit command or its matching response, as sent
/// over the wire between peers.
#[derive(Debug, Clone)]
pub struct WireMessage {
    pub sender: String,
    pub ballot: u64,
    pub seq: u64,
    pub mtype: MessageType,
    pub ctype: u8,
    pub committed: bool,
    pub key: Vec<u8>,
    pub data: Vec<u8>,
}

impl WireMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut sender_bytes = self.sender.clone().into_bytes();
        sender_bytes.push(0);
        let sender_len = sender_bytes.len();

        let mut out = BytesMut::with_capacity(
            FIXED_LEN + sender_len + self.key.len() + self.data.len(),
        );
        out.put_u16(sender_len as u16);
        out.put_slice(&sender_bytes);
        out.put_u32((self.ballot >> 32) as u32);
        out.put_u32((self.ballot & 0xFFFF_FFFF) as u32);
        out.put_u32((self.seq >> 32) as u32);
        out.put_u32((self.seq & 0xFFFF_FFFF) as u32);
        out.put_u8(self.mtype.to_wire());
        out.put_u8(self.ctype);
        out.put_u8(self.committed as u8);
        out.put_u32(self.key.len() as u32);
        out.put_slice(&self.key);
        out.put_u32(self.data.len() as u32);
        out.put_slice(&self.data);
        out.to_vec()
    }

    /// Parses a wire message, returning `None` on truncated input or an
    /// unrecognized message type. Malformed or unknown messages are
    /// silently dropped by callers rather than treated as fatal.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < FIXED_LEN {
            return None;
        }
        let mut cursor = buf;

        let sender_len = cursor.get_u16() as usize;
        if cursor.remaining() < sender_len {
            return None;
        }
        let sender_bytes = cursor.copy_to_bytes(sender_len);
        let sender_bytes = sender_bytes.strip_suffix(&[0]).unwrap_or(&sender_bytes);
        let sender = String::from_utf8_lossy(sender_bytes).into_owned();

        if cursor.remaining() < FIXED_LEN - 2 {
            return None;
        }
        let ballot_hi = cursor.get_u32() as u64;
        let ballot_lo = cursor.get_u32() as u64;
        let ballot = (ballot_hi << 32) | ballot_lo;
        let seq_hi = cursor.get_u32() as u64;
        let seq_lo = cursor.get_u32() as u64;
        let seq = (seq_hi << 32) | seq_lo;
        let mtype = MessageType::from_wire(cursor.get_u8())?;
        let ctype = cursor.get_u8();
        let committed = cursor.get_u8() != 0;

        if cursor.remaining() < 4 {
            return None;
        }
        let klen = cursor.get_u32() as usize;
        if cursor.remaining() < klen + 4 {
            return None;
        }
        let key = cursor.copy_to_bytes(klen).to_vec();
        let dlen = cursor.get_u32() as usize;
        if cursor.remaining() < dlen {
            return None;
        }
        let data = cursor.copy_to_bytes(dlen).to_vec();

        Some(WireMessage {
            sender,
            ballot,
            seq,
            mtype,
            ctype,
            committed,
            key,
            data,
        })
    }
}
