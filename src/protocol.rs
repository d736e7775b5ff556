//! Wire formats for audio packets, time sync, and receiver control.
//!
//! Audio packet: `[playback_at: i64 BE µs][pcm payload]`. The payload is
//! raw s16le interleaved PCM, exactly one step long.
//!
//! Control frames start with a 4-byte ASCII opcode. `SYNC` carries one
//! timestamp in a request and three in a response; the other opcodes have
//! no payload. Unknown opcodes decode to `None` and are ignored by callers.

use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol_constants::{OPCODE_LEN, TIMESTAMP_LEN};

const OP_PLAY: &[u8; 4] = b"PLAY";
const OP_FLSH: &[u8; 4] = b"FLSH";
const OP_STOP: &[u8; 4] = b"STOP";
const OP_SYNC: &[u8; 4] = b"SYNC";

/// Encodes one audio frame for the wire.
#[must_use]
pub fn encode_audio_packet(playback_at: u64, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(TIMESTAMP_LEN + payload.len());
    buf.put_i64(playback_at as i64);
    buf.put_slice(payload);
    buf.freeze()
}

/// Decodes an audio frame: `(playback_at, payload)`.
///
/// Returns `None` when the buffer is too short to carry a timestamp.
#[must_use]
pub fn decode_audio_packet(buf: &[u8]) -> Option<(u64, Bytes)> {
    if buf.len() < TIMESTAMP_LEN {
        return None;
    }
    let playback_at = i64::from_be_bytes(buf[..TIMESTAMP_LEN].try_into().ok()?) as u64;
    Some((playback_at, Bytes::copy_from_slice(&buf[TIMESTAMP_LEN..])))
}

/// Control commands exchanged with a receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Start rendering the packet stream (implicit once packets flow).
    Play,
    /// Discard buffered unplayed packets.
    Flush,
    /// Leave the channel and release the audio device.
    Stop,
    /// Time-sync request carrying the requester's send timestamp.
    SyncRequest {
        /// Receiver-local time the request was sent.
        t1: u64,
    },
    /// Time-sync response echoing `t1` with broadcaster receive/send stamps.
    SyncResponse {
        /// Receiver-local time the request was sent.
        t1: u64,
        /// Broadcaster time the request arrived.
        t2: u64,
        /// Broadcaster time the response left.
        t3: u64,
    },
}

impl ControlMessage {
    /// Encodes the message with its 4-byte ASCII opcode.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(OPCODE_LEN + 3 * TIMESTAMP_LEN);
        match self {
            Self::Play => buf.put_slice(OP_PLAY),
            Self::Flush => buf.put_slice(OP_FLSH),
            Self::Stop => buf.put_slice(OP_STOP),
            Self::SyncRequest { t1 } => {
                buf.put_slice(OP_SYNC);
                buf.put_i64(*t1 as i64);
            }
            Self::SyncResponse { t1, t2, t3 } => {
                buf.put_slice(OP_SYNC);
                buf.put_i64(*t1 as i64);
                buf.put_i64(*t2 as i64);
                buf.put_i64(*t3 as i64);
            }
        }
        buf.freeze()
    }

    /// Decodes a control frame. Unknown opcodes and malformed sync payloads
    /// yield `None`.
    #[must_use]
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < OPCODE_LEN {
            return None;
        }
        let (opcode, rest) = buf.split_at(OPCODE_LEN);
        let opcode: &[u8; 4] = opcode.try_into().ok()?;
        match opcode {
            OP_PLAY => Some(Self::Play),
            OP_FLSH => Some(Self::Flush),
            OP_STOP => Some(Self::Stop),
            OP_SYNC => match rest.len() {
                n if n == TIMESTAMP_LEN => Some(Self::SyncRequest {
                    t1: read_ts(rest, 0)?,
                }),
                n if n == 3 * TIMESTAMP_LEN => Some(Self::SyncResponse {
                    t1: read_ts(rest, 0)?,
                    t2: read_ts(rest, 1)?,
                    t3: read_ts(rest, 2)?,
                }),
                _ => None,
            },
            _ => None,
        }
    }
}

fn read_ts(buf: &[u8], index: usize) -> Option<u64> {
    let start = index * TIMESTAMP_LEN;
    let bytes = buf.get(start..start + TIMESTAMP_LEN)?;
    Some(i64::from_be_bytes(bytes.try_into().ok()?) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_packet_round_trips() {
        let payload = vec![0x11u8; 32];
        let wire = encode_audio_packet(1_234_567, &payload);
        assert_eq!(wire.len(), TIMESTAMP_LEN + 32);

        let (playback_at, decoded) = decode_audio_packet(&wire).expect("decodes");
        assert_eq!(playback_at, 1_234_567);
        assert_eq!(decoded.as_ref(), payload.as_slice());
    }

    #[test]
    fn short_audio_packet_is_rejected() {
        assert!(decode_audio_packet(&[0u8; 4]).is_none());
    }

    #[test]
    fn control_opcodes_round_trip() {
        for msg in [
            ControlMessage::Play,
            ControlMessage::Flush,
            ControlMessage::Stop,
            ControlMessage::SyncRequest { t1: 42 },
            ControlMessage::SyncResponse {
                t1: 42,
                t2: 43,
                t3: 44,
            },
        ] {
            let wire = msg.encode();
            assert_eq!(ControlMessage::decode(&wire), Some(msg));
        }
    }

    #[test]
    fn unknown_opcode_is_ignored() {
        assert_eq!(ControlMessage::decode(b"NOPE"), None);
        assert_eq!(ControlMessage::decode(b"SY"), None);
    }

    #[test]
    fn sync_with_odd_payload_is_rejected() {
        let mut wire = ControlMessage::SyncRequest { t1: 1 }.encode().to_vec();
        wire.push(0xff);
        assert_eq!(ControlMessage::decode(&wire), None);
    }
}
