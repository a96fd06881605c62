//! Key schedule for secure links.
//!
//! Both endpoints read four 32-byte slots from the same key material source
//! in a fixed order: client encryption, client MAC, server encryption and
//! server MAC. The role then decides which pair protects outbound traffic
//! and which pair verifies inbound traffic, so one side's outbound keys are
//! always the other side's inbound keys.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::LinkError;

/// Length of every key slot in bytes
pub const KEY_LEN: usize = 32;

/// Number of key slots consumed per link
pub const KEY_SLOTS: usize = 4;

/// Default HKDF salt for mesh links
pub const HKDF_SALT: &[u8] = b"mesh.link.hkdf.salt.v1";

/// Default HKDF info string for mesh links
pub const HKDF_INFO: &[u8] = b"mesh.link.hkdf.info.v1";

/// Which end of the link this side is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiating side
    Client,
    /// Accepting side
    Server,
}

impl Role {
    /// The role of the other endpoint
    pub fn peer(self) -> Self {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }
}

/// A deterministic byte source for link keys.
///
/// Both endpoints must construct equivalent sources so that sequential reads
/// produce identical bytes on each side.
pub trait KeyMaterial {
    /// Fill `out` with the next bytes of key material
    fn read_key(&mut self, out: &mut [u8]) -> Result<(), LinkError>;
}

/// HKDF-SHA256 expansion of a shared secret
pub struct HkdfKeyMaterial {
    okm: Zeroizing<Vec<u8>>,
    offset: usize,
}

impl HkdfKeyMaterial {
    /// Expand `secret` with the default mesh salt and info
    pub fn new(secret: &[u8]) -> Result<Self, LinkError> {
        Self::with_params(secret, HKDF_SALT, HKDF_INFO)
    }

    /// Expand `secret` with an explicit salt and info string
    pub fn with_params(secret: &[u8], salt: &[u8], info: &[u8]) -> Result<Self, LinkError> {
        let hk = Hkdf::<Sha256>::new(Some(salt), secret);
        let mut okm = Zeroizing::new(vec![0u8; KEY_LEN * KEY_SLOTS]);
        hk.expand(info, okm.as_mut_slice())
            .map_err(|_| LinkError::KeyMaterial)?;
        Ok(Self { okm, offset: 0 })
    }
}

impl KeyMaterial for HkdfKeyMaterial {
    fn read_key(&mut self, out: &mut [u8]) -> Result<(), LinkError> {
        let end = self.offset + out.len();
        if end > self.okm.len() {
            return Err(LinkError::KeyMaterial);
        }
        out.copy_from_slice(&self.okm[self.offset..end]);
        self.offset = end;
        Ok(())
    }
}

/// One direction's cipher and MAC keys
pub struct DirectionKeys {
    /// Stream cipher key
    pub enc: Zeroizing<[u8; KEY_LEN]>,
    /// MAC key
    pub mac: Zeroizing<[u8; KEY_LEN]>,
}

/// All four key slots of a link, split per direction
pub struct KeySet {
    client: DirectionKeys,
    server: DirectionKeys,
}

impl KeySet {
    /// Read the four slots in order from `material`
    pub fn read_from<K: KeyMaterial + ?Sized>(material: &mut K) -> Result<Self, LinkError> {
        let client = DirectionKeys {
            enc: read_slot(material)?,
            mac: read_slot(material)?,
        };
        let server = DirectionKeys {
            enc: read_slot(material)?,
            mac: read_slot(material)?,
        };
        Ok(Self { client, server })
    }

    /// Split into (outbound, inbound) keys for `role`
    pub fn split(self, role: Role) -> (DirectionKeys, DirectionKeys) {
        match role {
            Role::Client => (self.client, self.server),
            Role::Server => (self.server, self.client),
        }
    }
}

fn read_slot<K: KeyMaterial + ?Sized>(
    material: &mut K,
) -> Result<Zeroizing<[u8; KEY_LEN]>, LinkError> {
    let mut slot = Zeroizing::new([0u8; KEY_LEN]);
    material.read_key(slot.as_mut_slice())?;
    Ok(slot)
}
