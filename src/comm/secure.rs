use std::io;

use aead::{AeadCore, AeadInPlace, Key, KeyInit, Nonce, OsRng};
use aes_gcm::Aes256Gcm;
use bytes::{Buf, BufMut, BytesMut};
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tracing::trace;


#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum HandshakePhase {
    Securing,
    Ready,
}

/// The authenticated, ordered, reliable byte stream a connection runs on.
///
/// All calls are non-blocking: `WouldBlock` means "nothing to do until the
///  next poll", any other error is fatal for the connection. `try_read_buf`
///  returning `Ok(0)` means the peer closed the stream.
pub trait SecureStream: Send {
    fn try_handshake(&mut self) -> io::Result<HandshakePhase>;

    fn try_read_buf(&mut self, buf: &mut BytesMut) -> io::Result<usize>;

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Pushes out bytes the stream itself buffered (e.g. ciphertext of an
    ///  already-accepted record).
    fn try_flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn peer_description(&self) -> String;
}

#[async_trait::async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &str) -> anyhow::Result<Box<dyn SecureStream>>;
}


pub struct PlainTcpStream {
    stream: TcpStream,
}

impl PlainTcpStream {
    pub fn new(stream: TcpStream) -> PlainTcpStream {
        PlainTcpStream { stream }
    }
}

impl SecureStream for PlainTcpStream {
    fn try_handshake(&mut self) -> io::Result<HandshakePhase> {
        Ok(HandshakePhase::Ready)
    }

    fn try_read_buf(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        self.stream.try_read_buf(buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.try_write(buf)
    }

    fn peer_description(&self) -> String {
        self.stream.peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string())
    }
}


/// TCP with an AES-256-GCM record layer on top: each record is a 2-byte
///  big-endian ciphertext length followed by ciphertext plus tag.
///
/// The key is the SHA-256 of a shared secret. Nonces are per-direction: a
///  random 4-byte salt exchanged during the handshake plus a record counter,
///  so the two directions and successive records never reuse a nonce under
///  one key. Peers that do not hold the secret fail the first record's tag
///  check, which surfaces as an I/O error and resets the connection.
pub struct AesGcmTcpStream {
    stream: TcpStream,
    cipher: Aes256Gcm,
    send_salt: u32,
    recv_salt: Option<u32>,
    send_counter: u64,
    recv_counter: u64,
    salt_queued: bool,
    pending_out: BytesMut,
    raw_in: BytesMut,
}

/// One record carries at most this much plaintext; larger writes are
///  accepted chunk by chunk.
pub const MAX_RECORD_PLAINTEXT: usize = 16 * 1024;

const TAG_LEN: usize = 16;

impl AesGcmTcpStream {
    pub fn new(stream: TcpStream, secret: &[u8]) -> AesGcmTcpStream {
        let key = Sha256::digest(secret);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice()));

        let salt_bytes = Aes256Gcm::generate_nonce(&mut OsRng);
        let send_salt = u32::from_be_bytes([salt_bytes[0], salt_bytes[1], salt_bytes[2], salt_bytes[3]]);

        AesGcmTcpStream {
            stream,
            cipher,
            send_salt,
            recv_salt: None,
            send_counter: 0,
            recv_counter: 0,
            salt_queued: false,
            pending_out: BytesMut::new(),
            raw_in: BytesMut::new(),
        }
    }

    fn nonce_for(salt: u32, counter: u64) -> Nonce<Aes256Gcm> {
        let mut buf = [0u8; 12];
        buf[..4].copy_from_slice(&salt.to_be_bytes());
        buf[4..].copy_from_slice(&counter.to_be_bytes());
        Nonce::<Aes256Gcm>::clone_from_slice(&buf)
    }

    /// Writes as much buffered ciphertext as the socket accepts.
    fn flush_pending(&mut self) -> io::Result<()> {
        while !self.pending_out.is_empty() {
            match self.stream.try_write(&self.pending_out) {
                Ok(n) => {
                    self.pending_out.advance(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Extracts and decrypts the next complete record from `raw_in`, if one
    ///  is fully buffered.
    fn take_record(&mut self) -> io::Result<Option<BytesMut>> {
        if self.raw_in.len() < 2 {
            return Ok(None);
        }
        let record_len = u16::from_be_bytes([self.raw_in[0], self.raw_in[1]]) as usize;
        if record_len < TAG_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "record shorter than auth tag"));
        }
        if self.raw_in.len() < 2 + record_len {
            return Ok(None);
        }

        self.raw_in.advance(2);
        let mut record = self.raw_in.split_to(record_len);

        let salt = self.recv_salt
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "record before handshake"))?;
        let nonce = Self::nonce_for(salt, self.recv_counter);
        self.recv_counter += 1;

        self.cipher.decrypt_in_place(&nonce, b"", &mut record)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "record failed authentication"))?;
        trace!("decrypted record of {} bytes", record.len());
        Ok(Some(record))
    }
}

impl SecureStream for AesGcmTcpStream {
    fn try_handshake(&mut self) -> io::Result<HandshakePhase> {
        if !self.salt_queued {
            self.pending_out.put_u32(self.send_salt);
            self.salt_queued = true;
        }
        self.flush_pending()?;

        if self.recv_salt.is_none() {
            match self.stream.try_read_buf(&mut self.raw_in) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
            if self.raw_in.len() >= 4 {
                self.recv_salt = Some(self.raw_in.get_u32());
            }
        }

        if self.pending_out.is_empty() && self.recv_salt.is_some() {
            Ok(HandshakePhase::Ready)
        } else {
            Ok(HandshakePhase::Securing)
        }
    }

    fn try_read_buf(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        let mut delivered = 0;
        loop {
            while let Some(record) = self.take_record()? {
                delivered += record.len();
                buf.extend_from_slice(&record);
            }

            match self.stream.try_read_buf(&mut self.raw_in) {
                Ok(0) => return Ok(delivered), // promotes to EOF only with nothing delivered
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return if delivered > 0 { Ok(delivered) } else { Err(e) };
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.flush_pending()?;
        if !self.pending_out.is_empty() {
            // only one record in flight, to bound buffered ciphertext
            return Err(io::ErrorKind::WouldBlock.into());
        }

        let chunk = &buf[..buf.len().min(MAX_RECORD_PLAINTEXT)];
        let mut record = BytesMut::with_capacity(chunk.len() + TAG_LEN);
        record.extend_from_slice(chunk);

        let nonce = Self::nonce_for(self.send_salt, self.send_counter);
        self.send_counter += 1;
        self.cipher.encrypt_in_place(&nonce, b"", &mut record)
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "encryption failed"))?;

        self.pending_out.put_u16(record.len() as u16);
        self.pending_out.extend_from_slice(&record);
        self.flush_pending()?;
        Ok(chunk.len())
    }

    fn try_flush(&mut self) -> io::Result<()> {
        self.flush_pending()
    }

    fn peer_description(&self) -> String {
        self.stream.peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string())
    }
}


/// Wraps a freshly established TCP stream according to the configured secret.
pub fn wrap_stream(stream: TcpStream, secret: Option<&[u8]>) -> Box<dyn SecureStream> {
    match secret {
        Some(secret) => Box::new(AesGcmTcpStream::new(stream, secret)),
        None => Box::new(PlainTcpStream::new(stream)),
    }
}

pub struct TcpDialer {
    secret: Option<Vec<u8>>,
}

impl TcpDialer {
    pub fn new(secret: Option<Vec<u8>>) -> TcpDialer {
        TcpDialer { secret }
    }
}

#[async_trait::async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> anyhow::Result<Box<dyn SecureStream>> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(wrap_stream(stream, self.secret.as_deref()))
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;
    use tokio::net::TcpListener;
    use super::*;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    async fn pump_handshake(a: &mut dyn SecureStream, b: &mut dyn SecureStream) {
        for _ in 0..100 {
            let pa = a.try_handshake().unwrap();
            let pb = b.try_handshake().unwrap();
            if pa == HandshakePhase::Ready && pb == HandshakePhase::Ready {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("handshake did not complete");
    }

    async fn read_exactly(stream: &mut dyn SecureStream, n: usize) -> BytesMut {
        let mut buf = BytesMut::new();
        for _ in 0..100 {
            match stream.try_read_buf(&mut buf) {
                Ok(0) => panic!("unexpected eof"),
                Ok(_) => {
                    if buf.len() >= n {
                        return buf;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => panic!("read error: {}", e),
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("expected {} bytes, got {}", n, buf.len());
    }

    #[tokio::test]
    async fn test_aes_gcm_stream_round_trip() {
        let (client, server) = tcp_pair().await;
        let mut a = AesGcmTcpStream::new(client, b"topsecret");
        let mut b = AesGcmTcpStream::new(server, b"topsecret");

        pump_handshake(&mut a, &mut b).await;

        assert_eq!(a.try_write(b"hello mesh").unwrap(), 10);
        a.try_flush().unwrap();
        let received = read_exactly(&mut b, 10).await;
        assert_eq!(&received[..], b"hello mesh");

        // and the other direction, twice, to exercise the nonce counters
        assert_eq!(b.try_write(b"one").unwrap(), 3);
        assert_eq!(b.try_write(b"two").unwrap(), 3);
        b.try_flush().unwrap();
        let received = read_exactly(&mut a, 6).await;
        assert_eq!(&received[..], b"onetwo");
    }

    #[tokio::test]
    async fn test_aes_gcm_stream_rejects_wrong_secret() {
        let (client, server) = tcp_pair().await;
        let mut a = AesGcmTcpStream::new(client, b"secret one");
        let mut b = AesGcmTcpStream::new(server, b"secret two");

        // salts are exchanged in the clear, so the handshake itself completes
        pump_handshake(&mut a, &mut b).await;

        a.try_write(b"hello").unwrap();
        a.try_flush().unwrap();

        let mut buf = BytesMut::new();
        for _ in 0..100 {
            match b.try_read_buf(&mut buf) {
                Ok(_) => panic!("decryption unexpectedly succeeded"),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                Err(e) => {
                    assert_eq!(e.kind(), io::ErrorKind::InvalidData);
                    return;
                }
            }
        }
        panic!("tampered record was never rejected");
    }

    #[tokio::test]
    async fn test_plain_stream_round_trip() {
        let (client, server) = tcp_pair().await;
        let mut a = PlainTcpStream::new(client);
        let mut b = PlainTcpStream::new(server);

        assert_eq!(a.try_handshake().unwrap(), HandshakePhase::Ready);
        assert_eq!(b.try_handshake().unwrap(), HandshakePhase::Ready);

        assert_eq!(a.try_write(b"plain").unwrap(), 5);
        let received = read_exactly(&mut b, 5).await;
        assert_eq!(&received[..], b"plain");
    }
}
