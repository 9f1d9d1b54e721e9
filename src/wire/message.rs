//! The outer frame carried over a single `Transport::send_payload` call.
use prost::Message as ProstMessage;

use super::proto;
use super::Error;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    Envelope = 0,
    RouteRequest = 1,
    RouteResponse = 2,
}

impl TryFrom<u8> for Tag {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Envelope),
            1 => Ok(Self::RouteRequest),
            2 => Ok(Self::RouteResponse),
            other => Err(other),
        }
    }
}

/// One of the three message kinds a neighbor link carries.
///
/// `Envelope` is the encrypted chat channel (key exchange bundles and
/// Signal-wrapped application bodies); `RouteRequest` / `RouteResponse`
/// are the plaintext route-discovery control messages. Keeping discovery
/// unencrypted means an intermediate relay can inspect and re-broadcast it
/// without holding a session with either endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Envelope(proto::NearbyMessage),
    RouteRequest(proto::RouteRequestMessage),
    RouteResponse(proto::RouteResponseMessage),
}

impl Message {
    fn tag(&self) -> Tag {
        match self {
            Self::Envelope(_) => Tag::Envelope,
            Self::RouteRequest(_) => Tag::RouteRequest,
            Self::RouteResponse(_) => Tag::RouteResponse,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.tag() as u8];
        match self {
            Self::Envelope(m) => m.encode(&mut buf),
            Self::RouteRequest(m) => m.encode(&mut buf),
            Self::RouteResponse(m) => m.encode(&mut buf),
        }
        .expect("encoding into a Vec<u8> is infallible");
        buf
    }

    /// Frames bytes that are already a serialized `proto::NearbyMessage`
    /// (as produced by `Envelope::wrap`/`wrap_key_exchange`) without
    /// paying for a decode/re-encode round trip.
    pub fn frame_encoded_envelope(encoded: Vec<u8>) -> Vec<u8> {
        let mut framed = Vec::with_capacity(encoded.len() + 1);
        framed.push(Tag::Envelope as u8);
        framed.extend(encoded);
        framed
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let (tag, body) = bytes.split_first().ok_or(Error::UnknownTag(0))?;
        match Tag::try_from(*tag).map_err(Error::UnknownTag)? {
            Tag::Envelope => Ok(Self::Envelope(proto::NearbyMessage::decode(body)?)),
            Tag::RouteRequest => Ok(Self::RouteRequest(proto::RouteRequestMessage::decode(body)?)),
            Tag::RouteResponse => {
                Ok(Self::RouteResponse(proto::RouteResponseMessage::decode(body)?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_the_frame() {
        let inner = proto::NearbyMessage {
            exchange: false,
            payload: Some(proto::nearby_message::Payload::Body(
                proto::NearbyMessageBody {
                    r#type: proto::MessageType::EncryptedMessage as i32,
                    encrypted_data: b"ciphertext".to_vec(),
                },
            )),
        };
        let framed = Message::Envelope(inner.clone());
        let decoded = Message::decode(&framed.encode()).unwrap();
        assert_eq!(decoded, Message::Envelope(inner));
    }

    #[test]
    fn route_request_round_trips_through_the_frame() {
        let inner = proto::RouteRequestMessage {
            request_uuid: "00000000-0000-0000-0000-000000000000".to_string(),
            destination_address_name: "bob".to_string(),
            remaining_hops: 10,
            max_ttl_epoch_ms: 12345,
        };
        let framed = Message::RouteRequest(inner.clone());
        let decoded = Message::decode(&framed.encode()).unwrap();
        assert_eq!(decoded, Message::RouteRequest(inner));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = Message::decode(&[0xff]).unwrap_err();
        assert!(matches!(err, Error::UnknownTag(0xff)));
    }
}
