//! Per-direction frame protection.
//!
//! Each direction owns a ChaCha20 keystream and a running HMAC-SHA256 state.
//! A frame is protected in two steps that share both states: first the
//! encrypted length prefix and its tag, then the encrypted body and its tag.
//! The MAC is never reset, so every tag covers everything sent earlier in
//! the same direction and reordering, replaying or dropping frames breaks
//! verification. The length is verified before the body is read, so a
//! tampered length can never leave the reader waiting for bytes.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::{ChaCha20, Key, Nonce};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::keys::DirectionKeys;
use crate::LinkError;

type HmacSha256 = Hmac<Sha256>;

/// Length of a frame tag in bytes
pub const TAG_LEN: usize = 32;

/// Encrypted length followed by its tag
pub const LEN_PREFIX: usize = 4 + TAG_LEN;

struct DirectionState {
    cipher: ChaCha20,
    mac: HmacSha256,
}

impl DirectionState {
    fn new(keys: &DirectionKeys) -> Result<Self, LinkError> {
        let cipher = ChaCha20::new(Key::from_slice(keys.enc.as_slice()), &Nonce::default());
        let mac = <HmacSha256 as Mac>::new_from_slice(keys.mac.as_slice())
            .map_err(|_| LinkError::KeyMaterial)?;
        Ok(Self { cipher, mac })
    }

    fn absorb(&mut self, data: &[u8]) -> [u8; TAG_LEN] {
        self.mac.update(data);
        let digest = self.mac.clone().finalize().into_bytes();
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&digest);
        tag
    }

    fn verify(&mut self, data: &[u8], tag: &[u8]) -> Result<(), LinkError> {
        let expected = self.absorb(data);
        if bool::from(expected.as_slice().ct_eq(tag)) {
            Ok(())
        } else {
            Err(LinkError::Authentication)
        }
    }

    fn apply(&mut self, data: &mut [u8]) -> Result<(), LinkError> {
        self.cipher
            .try_apply_keystream(data)
            .map_err(|_| LinkError::Exhausted)
    }
}

/// Outbound half: encrypts then tags.
///
/// [`seal_len`](Self::seal_len) and [`seal`](Self::seal) must alternate,
/// one pair per frame.
pub struct Sealer {
    state: DirectionState,
}

impl Sealer {
    /// Create a sealer from outbound keys
    pub fn new(keys: &DirectionKeys) -> Result<Self, LinkError> {
        Ok(Self {
            state: DirectionState::new(keys)?,
        })
    }

    /// Encrypt and tag the body length of the next frame
    pub fn seal_len(&mut self, len: u32) -> Result<[u8; LEN_PREFIX], LinkError> {
        let mut prefix = [0u8; LEN_PREFIX];
        prefix[..4].copy_from_slice(&len.to_be_bytes());
        self.state.apply(&mut prefix[..4])?;
        let tag = self.state.absorb(&prefix[..4]);
        prefix[4..].copy_from_slice(&tag);
        Ok(prefix)
    }

    /// Encrypt `body` in place and return its tag
    pub fn seal(&mut self, body: &mut [u8]) -> Result<[u8; TAG_LEN], LinkError> {
        self.state.apply(body)?;
        Ok(self.state.absorb(body))
    }
}

/// Inbound half: verifies then decrypts.
///
/// [`open_len`](Self::open_len) and [`open`](Self::open) must alternate,
/// one pair per frame.
pub struct Opener {
    state: DirectionState,
}

impl Opener {
    /// Create an opener from inbound keys
    pub fn new(keys: &DirectionKeys) -> Result<Self, LinkError> {
        Ok(Self {
            state: DirectionState::new(keys)?,
        })
    }

    /// Verify a length prefix and return the body length it carries
    pub fn open_len(&mut self, prefix: &[u8; LEN_PREFIX]) -> Result<u32, LinkError> {
        let mut len = [0u8; 4];
        len.copy_from_slice(&prefix[..4]);
        self.state.verify(&len, &prefix[4..])?;
        self.state.apply(&mut len)?;
        Ok(u32::from_be_bytes(len))
    }

    /// Verify `tag` over `body` and decrypt it in place
    pub fn open(&mut self, tag: &[u8], body: &mut [u8]) -> Result<(), LinkError> {
        self.state.verify(body, tag)?;
        self.state.apply(body)
    }
}
