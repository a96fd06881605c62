//! Secure link with direct (caller-driven) send and receive.

use mesh_wire::Envelope;
use tokio::io::{split, AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tracing::debug;

use crate::cipher::{Opener, Sealer};
use crate::frame::{FrameReader, FrameWriter};
use crate::keys::{KeyMaterial, KeySet, Role};
use crate::queued::QueuedLink;
use crate::LinkError;

/// An authenticated, encrypted, ordered envelope channel over a byte stream.
///
/// In direct mode the caller drives [`send_direct`](Self::send_direct) and
/// [`recv_direct`](Self::recv_direct). At most one sender and one receiver
/// may operate at a time, which `&mut self` enforces. Calling
/// [`start`](Self::start) hands the link over to background workers.
///
/// Any authentication, framing or stream failure marks the link dead and
/// every later operation fails.
pub struct SecureLink<S> {
    writer: FrameWriter<WriteHalf<S>>,
    reader: FrameReader<ReadHalf<S>>,
    role: Role,
    failure: Option<String>,
}

impl<S> SecureLink<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap `stream`, reading the four key slots from `key_material`
    pub fn new<K>(stream: S, key_material: &mut K, role: Role) -> Result<Self, LinkError>
    where
        K: KeyMaterial + ?Sized,
    {
        let (outbound, inbound) = KeySet::read_from(key_material)?.split(role);
        let sealer = Sealer::new(&outbound)?;
        let opener = Opener::new(&inbound)?;
        let (read_half, write_half) = split(stream);

        debug!(?role, "Secure link established");
        Ok(Self {
            writer: FrameWriter::new(write_half, sealer),
            reader: FrameReader::new(read_half, opener),
            role,
            failure: None,
        })
    }

    /// Role of this endpoint
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether an earlier failure made the link unusable
    pub fn is_dead(&self) -> bool {
        self.failure.is_some()
    }

    /// Seal and send one envelope
    pub async fn send_direct(&mut self, envelope: &Envelope) -> Result<(), LinkError> {
        self.check_alive()?;
        // Encoding errors leave the stream untouched
        let body = envelope.encode()?;
        let result = self.writer.write_body(body).await;
        self.track(result)
    }

    /// Receive and verify the next envelope
    pub async fn recv_direct(&mut self) -> Result<Envelope, LinkError> {
        self.check_alive()?;
        let result = self.reader.read().await;
        self.track(result)
    }

    /// Shut down the outbound half of the stream
    pub async fn close(mut self) -> Result<(), LinkError> {
        self.writer.shutdown().await
    }

    /// Switch to queued mode with bounded queues of `capacity` envelopes
    pub fn start(self, capacity: usize) -> QueuedLink {
        QueuedLink::spawn(self.writer, self.reader, capacity, self.failure)
    }

    fn check_alive(&self) -> Result<(), LinkError> {
        match &self.failure {
            Some(reason) => Err(LinkError::Dead(reason.clone())),
            None => Ok(()),
        }
    }

    fn track<T>(&mut self, result: Result<T, LinkError>) -> Result<T, LinkError> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.failure = Some(e.to_string());
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FRAME_OVERHEAD;
    use crate::keys::HkdfKeyMaterial;
    use bytes::Bytes;
    use mesh_wire::{Header, MAX_ENVELOPE_SIZE};
    use std::time::Duration;
    use rand::{Rng, RngCore};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn link_pair(secret: &[u8]) -> (SecureLink<DuplexStream>, SecureLink<DuplexStream>) {
        let (a, b) = duplex(64 * 1024);
        let client = SecureLink::new(a, &mut HkdfKeyMaterial::new(secret).unwrap(), Role::Client)
            .unwrap();
        let server = SecureLink::new(b, &mut HkdfKeyMaterial::new(secret).unwrap(), Role::Server)
            .unwrap();
        (client, server)
    }

    fn random_envelope(rng: &mut impl RngCore) -> Envelope {
        let mut payload = vec![0u8; rng.gen_range(0..1024)];
        rng.fill_bytes(&mut payload);
        Envelope::new(
            Header::Broadcast {
                topic: format!("topic-{}", rng.gen_range(0..16)),
            },
            payload,
        )
    }

    #[tokio::test]
    async fn test_direct_exchange_both_ways() {
        let (mut client, mut server) = link_pair(b"direct");
        let mut rng = rand::thread_rng();

        for _ in 0..1000 {
            let envelope = random_envelope(&mut rng);
            client.send_direct(&envelope).await.unwrap();
            assert_eq!(server.recv_direct().await.unwrap(), envelope);

            let envelope = random_envelope(&mut rng);
            server.send_direct(&envelope).await.unwrap();
            assert_eq!(client.recv_direct().await.unwrap(), envelope);
        }
    }

    #[tokio::test]
    async fn test_clean_close_reports_closed() {
        let (client, mut server) = link_pair(b"close");
        client.close().await.unwrap();
        assert!(matches!(server.recv_direct().await, Err(LinkError::Closed)));
        assert!(server.is_dead());
    }

    #[tokio::test]
    async fn test_mismatched_secret_kills_link() {
        let (a, b) = duplex(64 * 1024);
        let mut client =
            SecureLink::new(a, &mut HkdfKeyMaterial::new(b"one").unwrap(), Role::Client).unwrap();
        let mut server =
            SecureLink::new(b, &mut HkdfKeyMaterial::new(b"two").unwrap(), Role::Server).unwrap();

        let envelope = Envelope::new(
            Header::Publish {
                topic: "t".to_string(),
            },
            Bytes::from_static(b"hello"),
        );
        client.send_direct(&envelope).await.unwrap();
        assert!(matches!(
            server.recv_direct().await,
            Err(LinkError::Authentication)
        ));
        assert!(matches!(
            server.recv_direct().await,
            Err(LinkError::Dead(_))
        ));
        assert!(matches!(
            server.send_direct(&envelope).await,
            Err(LinkError::Dead(_))
        ));
    }

    #[tokio::test]
    async fn test_every_bit_flip_on_the_wire_detected() {
        let (a, mut tap) = duplex(64 * 1024);
        let mut client =
            SecureLink::new(a, &mut HkdfKeyMaterial::new(b"k").unwrap(), Role::Client).unwrap();

        let envelope = Envelope::new(
            Header::Broadcast {
                topic: "flip".to_string(),
            },
            vec![7u8; 64],
        );
        client.send_direct(&envelope).await.unwrap();

        let mut frame = vec![0u8; FRAME_OVERHEAD + envelope.encode().unwrap().len()];
        tap.read_exact(&mut frame).await.unwrap();

        for bit in 0..frame.len() * 8 {
            let mut flipped = frame.clone();
            flipped[bit / 8] ^= 1 << (bit % 8);

            // The writer stays open so a stalled read cannot end in EOF
            let (mut raw, b) = duplex(64 * 1024);
            let mut server =
                SecureLink::new(b, &mut HkdfKeyMaterial::new(b"k").unwrap(), Role::Server)
                    .unwrap();
            raw.write_all(&flipped).await.unwrap();

            let result = tokio::time::timeout(Duration::from_secs(1), server.recv_direct())
                .await
                .unwrap_or_else(|_| panic!("read stalled after flipping bit {}", bit));
            assert!(
                matches!(result, Err(LinkError::Authentication)),
                "bit {} gave {:?}",
                bit,
                result
            );
            assert!(server.is_dead());
            drop(raw);
        }
    }

    #[tokio::test]
    async fn test_oversized_length_is_malformed() {
        let (mut raw, b) = duplex(1024);
        let mut server =
            SecureLink::new(b, &mut HkdfKeyMaterial::new(b"k").unwrap(), Role::Server).unwrap();

        let mut material = HkdfKeyMaterial::new(b"k").unwrap();
        let (outbound, _) = KeySet::read_from(&mut material).unwrap().split(Role::Client);
        let mut sealer = Sealer::new(&outbound).unwrap();
        let prefix = sealer.seal_len(MAX_ENVELOPE_SIZE as u32 + 1).unwrap();
        raw.write_all(&prefix).await.unwrap();

        assert!(matches!(
            server.recv_direct().await,
            Err(LinkError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_forged_length_prefix_is_rejected() {
        let (mut raw, b) = duplex(1024);
        let mut server =
            SecureLink::new(b, &mut HkdfKeyMaterial::new(b"k").unwrap(), Role::Server).unwrap();
        let mut forged = [0u8; FRAME_OVERHEAD];
        forged[..4].copy_from_slice(&u32::MAX.to_be_bytes());
        raw.write_all(&forged).await.unwrap();
        assert!(matches!(
            server.recv_direct().await,
            Err(LinkError::Authentication)
        ));
    }

    #[tokio::test]
    async fn test_eof_inside_frame_is_io_error() {
        let (mut raw, b) = duplex(1024);
        let mut server =
            SecureLink::new(b, &mut HkdfKeyMaterial::new(b"k").unwrap(), Role::Server).unwrap();
        raw.write_all(&[0, 0, 0, 16, 1, 2, 3]).await.unwrap();
        drop(raw);
        assert!(matches!(server.recv_direct().await, Err(LinkError::Io(_))));
    }
}
