//! Secure Envelope.
//!
//! Hands plaintext to an opaque Signal capability, frames ciphertext as
//! the two-variant `NearbyMessage` wire envelope, and reverses the
//! process on receive. Grounded on `radicle_crypto::Signer` for the shape
//! of an opaque cryptographic capability trait, and on `service::routing`'s
//! `Table`/`Store` split for the debounce bookkeeping in
//! [`key_exchange`].
pub mod key_exchange;

use std::fmt;

use prost::Message as _;
use thiserror::Error;

use crate::clock::RefClock;
use crate::config;
use crate::ids::AddressName;
use crate::wire::proto;

pub use key_exchange::{KeyExchangeState, Store as KeyExchangeStore};

/// An opaque outcome of a cipher operation that may fail for a reason the
/// envelope layer must react to (`NoSession`) versus any other
/// implementation-specific failure.
#[derive(Debug)]
pub enum CipherError<E> {
    NoSession,
    Other(E),
}

impl<E: fmt::Display> fmt::Display for CipherError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSession => write!(f, "no established session"),
            Self::Other(e) => write!(f, "{e}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CipherError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::NoSession => None,
            Self::Other(e) => Some(e),
        }
    }
}

/// The Signal protocol library, consumed as an opaque capability. Identity
/// keys, prekeys, sessions and ciphertext formats are never named by this
/// crate; only this narrow surface is.
pub trait SessionCipher: Send + Sync {
    type Bundle;
    type Error: std::error::Error + Send + Sync + 'static;

    fn has_session(&self, address: &AddressName) -> bool;

    fn generate_local_prekey_bundle(&self) -> Result<Self::Bundle, Self::Error>;

    fn serialize_bundle(&self, bundle: &Self::Bundle) -> Vec<u8>;

    fn deserialize_bundle(&self, bytes: &[u8]) -> Result<Self::Bundle, Self::Error>;

    fn establish_session_from_bundle(
        &self,
        address: &AddressName,
        bundle: Self::Bundle,
    ) -> Result<(), Self::Error>;

    fn encrypt(
        &self,
        address: &AddressName,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CipherError<Self::Error>>;

    fn decrypt(
        &self,
        address: &AddressName,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CipherError<Self::Error>>;
}

#[derive(Error, Debug)]
pub enum Error {
    /// Protobuf parse failure. Logged and dropped; no reply.
    #[error("malformed wire envelope")]
    InvalidWireFormat,

    /// Encryption attempted without a session. The dispatcher is expected
    /// to stage the message as `PendingKeyExchange`.
    #[error("no established session with {0}")]
    NoSession(AddressName),

    /// Signal decrypt error. Carries the bundle (if any) that
    /// `ensure_session` produced as a side effect of reacting to a
    /// no-session decrypt failure, so the caller can hand it to the
    /// transport without a second round trip.
    #[error("decryption failed")]
    DecryptionFailed { resend_bundle: Option<Vec<u8>> },

    #[error("signal cipher error: {0}")]
    Crypto(String),

    #[error("key exchange state storage error: {0}")]
    Storage(String),
}

/// Outcome of [`Envelope::unwrap`].
#[derive(Debug)]
pub enum Received {
    /// A prekey bundle was received and a session (re-)established. If
    /// `reply_bundle` is set, our own bundle must now be sent back
    /// proactively (we had never sent one to this address before).
    KeyExchange { reply_bundle: Option<Vec<u8>> },
    Body(proto::NearbyMessageBody),
}

/// Wraps/unwraps the wire envelope for a single node, serializing session
/// establishment per peer. Stateless across calls except for the
/// persistent [`KeyExchangeStore`] debounce bookkeeping; all mutation
/// happens inside the `SessionCipher`/`KeyExchangeStore` capabilities
/// handed in at construction.
pub struct Envelope<C, S> {
    cipher: C,
    store: S,
    clock: RefClock,
}

impl<C, S> Envelope<C, S>
where
    C: SessionCipher,
    S: KeyExchangeStore,
{
    pub fn new(cipher: C, store: S, clock: RefClock) -> Self {
        Self {
            cipher,
            store,
            clock,
        }
    }

    fn now_ms(&self) -> i64 {
        self.clock.timestamp() as i64 * 1_000
    }

    fn store_err(e: key_exchange::Error) -> Error {
        Error::Storage(e.to_string())
    }

    /// Sends a fresh prekey bundle unless one was already sent inside the
    /// debounce window and a session still exists. Returns the serialized
    /// bundle when one must be transmitted as `exchange=true`.
    pub fn ensure_session(&mut self, address: &AddressName) -> Result<Option<Vec<u8>>, Error> {
        let now_ms = self.now_ms();
        let state = self.store.get(address).map_err(Self::store_err)?;
        let debounce_window_ms = config::DEBOUNCE_WINDOW.as_secs() as i64 * 1_000;

        let recently_sent = state
            .as_ref()
            .and_then(|s| s.last_our_sent)
            .map(|last| now_ms.saturating_sub(last) < debounce_window_ms)
            .unwrap_or(false);

        if self.cipher.has_session(address) && recently_sent {
            return Ok(None);
        }

        let bundle = self
            .cipher
            .generate_local_prekey_bundle()
            .map_err(|e| Error::Crypto(e.to_string()))?;
        let bytes = self.cipher.serialize_bundle(&bundle);
        self.store
            .set_last_our_sent(address, now_ms)
            .map_err(Self::store_err)?;
        Ok(Some(bytes))
    }

    /// Serializes `body`, encrypts it and frames it as `NearbyMessage {
    /// exchange: false, body: ciphertext }`.
    pub fn wrap(
        &self,
        address: &AddressName,
        body: proto::NearbyMessageBody,
    ) -> Result<Vec<u8>, Error> {
        let plaintext = body.encode_to_vec();
        let ciphertext = self.cipher.encrypt(address, &plaintext).map_err(|e| match e {
            CipherError::NoSession => Error::NoSession(address.clone()),
            CipherError::Other(e) => Error::Crypto(e.to_string()),
        })?;

        let envelope = proto::NearbyMessage {
            exchange: false,
            payload: Some(proto::nearby_message::Payload::Body(ciphertext)),
        };
        Ok(envelope.encode_to_vec())
    }

    /// Frames a serialized prekey bundle as `NearbyMessage { exchange:
    /// true, key_exchange_bundle: bundle }`.
    pub fn wrap_key_exchange(bundle: Vec<u8>) -> Vec<u8> {
        let envelope = proto::NearbyMessage {
            exchange: true,
            payload: Some(proto::nearby_message::Payload::KeyExchangeBundle(bundle)),
        };
        envelope.encode_to_vec()
    }

    /// Parses `bytes` as a `NearbyMessage` and either establishes a
    /// session (`exchange = true`) or decrypts the body (`exchange =
    /// false`).
    pub fn unwrap(&mut self, address: &AddressName, bytes: &[u8]) -> Result<Received, Error> {
        let envelope = proto::NearbyMessage::decode(bytes).map_err(|_| Error::InvalidWireFormat)?;

        match envelope.payload {
            Some(proto::nearby_message::Payload::KeyExchangeBundle(bundle_bytes)) => {
                let bundle = self
                    .cipher
                    .deserialize_bundle(&bundle_bytes)
                    .map_err(|e| Error::Crypto(e.to_string()))?;
                self.cipher
                    .establish_session_from_bundle(address, bundle)
                    .map_err(|e| Error::Crypto(e.to_string()))?;

                let now_ms = self.now_ms();
                self.store
                    .set_last_their_received(address, now_ms)
                    .map_err(Self::store_err)?;

                let have_sent = self
                    .store
                    .get(address)
                    .map_err(Self::store_err)?
                    .and_then(|s| s.last_our_sent)
                    .is_some();

                let reply_bundle = if have_sent {
                    None
                } else {
                    self.ensure_session(address)?
                };
                Ok(Received::KeyExchange { reply_bundle })
            }
            Some(proto::nearby_message::Payload::Body(ciphertext)) => {
                match self.cipher.decrypt(address, &ciphertext) {
                    Ok(plaintext) => {
                        let body = proto::NearbyMessageBody::decode(plaintext.as_slice())
                            .map_err(|_| Error::InvalidWireFormat)?;
                        Ok(Received::Body(body))
                    }
                    Err(CipherError::NoSession) => {
                        let resend_bundle = self.ensure_session(address)?;
                        Err(Error::DecryptionFailed { resend_bundle })
                    }
                    Err(CipherError::Other(_)) => Err(Error::DecryptionFailed {
                        resend_bundle: None,
                    }),
                }
            }
            None => Err(Error::InvalidWireFormat),
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! An in-memory `SessionCipher` for tests: "encryption" is the
    //! identity function gated on an established session, modeling the
    //! Signal contract without any real cryptography.
    use std::cell::RefCell;
    use std::collections::HashSet;

    use thiserror::Error;

    use super::*;

    #[derive(Error, Debug, PartialEq, Eq)]
    #[error("fake cipher error: {0}")]
    pub struct FakeCipherError(pub String);

    #[derive(Default)]
    pub struct FakeSessionCipher {
        sessions: RefCell<HashSet<AddressName>>,
    }

    impl SessionCipher for FakeSessionCipher {
        type Bundle = Vec<u8>;
        type Error = FakeCipherError;

        fn has_session(&self, address: &AddressName) -> bool {
            self.sessions.borrow().contains(address)
        }

        fn generate_local_prekey_bundle(&self) -> Result<Self::Bundle, Self::Error> {
            Ok(b"prekey-bundle".to_vec())
        }

        fn serialize_bundle(&self, bundle: &Self::Bundle) -> Vec<u8> {
            bundle.clone()
        }

        fn deserialize_bundle(&self, bytes: &[u8]) -> Result<Self::Bundle, Self::Error> {
            Ok(bytes.to_vec())
        }

        fn establish_session_from_bundle(
            &self,
            address: &AddressName,
            _bundle: Self::Bundle,
        ) -> Result<(), Self::Error> {
            self.sessions.borrow_mut().insert(address.clone());
            Ok(())
        }

        fn encrypt(
            &self,
            address: &AddressName,
            plaintext: &[u8],
        ) -> Result<Vec<u8>, CipherError<Self::Error>> {
            if !self.has_session(address) {
                return Err(CipherError::NoSession);
            }
            Ok(plaintext.to_vec())
        }

        fn decrypt(
            &self,
            address: &AddressName,
            ciphertext: &[u8],
        ) -> Result<Vec<u8>, CipherError<Self::Error>> {
            if !self.has_session(address) {
                return Err(CipherError::NoSession);
            }
            Ok(ciphertext.to_vec())
        }
    }
}

#[cfg(test)]
mod tests {
    use localtime::LocalTime;
    use qcheck_macros::quickcheck;

    use super::fake::FakeSessionCipher;
    use super::*;

    fn envelope() -> Envelope<FakeSessionCipher, key_exchange::Table> {
        Envelope::new(
            FakeSessionCipher::default(),
            key_exchange::Table::memory().unwrap(),
            RefClock::from(LocalTime::from_secs(1_700_000_000)),
        )
    }

    #[test]
    fn wrap_without_session_is_no_session() {
        let env = envelope();
        let body = proto::NearbyMessageBody {
            r#type: proto::MessageType::EncryptedMessage as i32,
            encrypted_data: b"hi".to_vec(),
        };
        assert!(matches!(
            env.wrap(&AddressName::new("bob"), body),
            Err(Error::NoSession(_))
        ));
    }

    #[test]
    fn round_trips_a_body_once_a_session_exists() {
        let mut env = envelope();
        let bob = AddressName::new("bob");

        let bundle = env.ensure_session(&bob).unwrap().expect("no session yet");
        let exchange_bytes = Envelope::<FakeSessionCipher, key_exchange::Table>::wrap_key_exchange(
            bundle,
        );

        match env.unwrap(&bob, &exchange_bytes).unwrap() {
            Received::KeyExchange { .. } => {}
            Received::Body(_) => panic!("expected a key exchange"),
        }

        let body = proto::NearbyMessageBody {
            r#type: proto::MessageType::EncryptedMessage as i32,
            encrypted_data: b"hi".to_vec(),
        };
        let wire = env.wrap(&bob, body).unwrap();

        match env.unwrap(&bob, &wire).unwrap() {
            Received::Body(body) => assert_eq!(body.encrypted_data, b"hi"),
            Received::KeyExchange { .. } => panic!("expected a body"),
        }
    }

    #[test]
    fn receiving_a_bundle_replies_in_kind_the_first_time() {
        let mut env = envelope();
        let bob = AddressName::new("bob");

        let their_bundle =
            Envelope::<FakeSessionCipher, key_exchange::Table>::wrap_key_exchange(b"bob-bundle".to_vec());

        match env.unwrap(&bob, &their_bundle).unwrap() {
            Received::KeyExchange { reply_bundle } => assert!(reply_bundle.is_some()),
            Received::Body(_) => panic!("expected a key exchange"),
        }

        // A second bundle from the same peer within the debounce window
        // must not trigger yet another reply (we've already sent ours).
        match env.unwrap(&bob, &their_bundle).unwrap() {
            Received::KeyExchange { reply_bundle } => assert!(reply_bundle.is_none()),
            Received::Body(_) => panic!("expected a key exchange"),
        }
    }

    #[test]
    fn ensure_session_debounces_resends_within_the_window() {
        let mut env = envelope();
        let bob = AddressName::new("bob");

        let first = env.ensure_session(&bob).unwrap();
        assert!(first.is_some());
        // No session yet, so still not debounced even though we just sent.
        let second = env.ensure_session(&bob).unwrap();
        assert!(second.is_some());

        env.cipher
            .establish_session_from_bundle(&bob, vec![])
            .unwrap();
        let third = env.ensure_session(&bob).unwrap();
        assert!(third.is_none(), "debounced once a session exists");
    }

    #[test]
    fn decrypt_without_session_triggers_ensure_session() {
        let mut env = envelope();
        let bob = AddressName::new("bob");
        let wire = proto::NearbyMessage {
            exchange: false,
            payload: Some(proto::nearby_message::Payload::Body(b"ct".to_vec())),
        }
        .encode_to_vec();

        match env.unwrap(&bob, &wire) {
            Err(Error::DecryptionFailed { resend_bundle }) => assert!(resend_bundle.is_some()),
            other => panic!("expected DecryptionFailed, got {other:?}"),
        }
    }

    /// P7: for an established session, unwrapping a wrapped body always
    /// yields the original plaintext back out, for any payload.
    #[quickcheck]
    fn prop_wrap_unwrap_round_trips_arbitrary_payloads(data: Vec<u8>) {
        let mut env = envelope();
        let bob = AddressName::new("bob");
        let bundle = env.ensure_session(&bob).unwrap().unwrap();
        env.unwrap(
            &bob,
            &Envelope::<FakeSessionCipher, key_exchange::Table>::wrap_key_exchange(bundle),
        )
        .unwrap();

        let body = proto::NearbyMessageBody {
            r#type: proto::MessageType::EncryptedMessage as i32,
            encrypted_data: data.clone(),
        };
        let wire = env.wrap(&bob, body).unwrap();

        match env.unwrap(&bob, &wire).unwrap() {
            Received::Body(body) => assert_eq!(body.encrypted_data, data),
            Received::KeyExchange { .. } => panic!("expected a body"),
        }
    }
}
