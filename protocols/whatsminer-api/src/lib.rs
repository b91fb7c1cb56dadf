// Copyright (C) 2020  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU Common Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Common Public License for more details.
//
// You should have received a copy of the GNU Common Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Client for the Whatsminer v3 TCP API
//!
//! Wire format: a little-endian `u32` length prefix followed by that many
//! payload bytes. The outbound payload is compact UTF-8 JSON. The first
//! response of a session arrives as plain JSON and carries a `salt`;
//! every later payload is AES-128-ECB ciphertext (PKCS#7 padded) under a
//! session key derived as `MD5(account || password || salt)` truncated to
//! its first 16 hex characters (ASCII bytes).

pub mod command;
pub mod response;

mod error;
pub use error::{Error, ErrorKind, Result};

/// Re-export json because response bodies are partially schemaless
pub use serde_json as json;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit};
use aes::Aes128;
use md5::{Digest, Md5};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

type Aes128EcbEnc = ecb::Encryptor<Aes128>;
type Aes128EcbDec = ecb::Decryptor<Aes128>;

/// TCP port of the miner API
pub const DEFAULT_PORT: u16 = 4433;

/// Factory account/password pair
pub const DEFAULT_ACCOUNT: &str = "super";
pub const DEFAULT_PASSWORD: &str = "super";

/// Frames longer than this are a protocol fault, not data
pub const MAX_FRAME_SIZE: u32 = 100_000;

/// Deadline for connect and for each read/write of a frame
pub const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Derive the AES-128 session key from credentials and the session salt.
/// The key bytes are the ASCII hex characters, not the raw digest.
pub fn derive_session_key(account: &str, password: &str, salt: &str) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(account.as_bytes());
    hasher.update(password.as_bytes());
    hasher.update(salt.as_bytes());
    let hexdigest = hex::encode(hasher.finalize());

    let mut key = [0u8; 16];
    key.copy_from_slice(&hexdigest.as_bytes()[..16]);
    key
}

/// Per-connection crypto state
///
/// The salt captured from the first (unencrypted) response selects the key
/// for every later exchange of the same session.
#[derive(Clone, Debug)]
pub struct Session {
    account: String,
    password: String,
    salt: Option<String>,
}

impl Session {
    pub fn new(account: &str, password: &str) -> Self {
        Self {
            account: account.to_string(),
            password: password.to_string(),
            salt: None,
        }
    }

    pub fn set_salt(&mut self, salt: &str) {
        self.salt = Some(salt.to_string());
    }

    pub fn salt(&self) -> Option<&str> {
        self.salt.as_deref()
    }

    fn key(&self) -> Option<[u8; 16]> {
        self.salt
            .as_deref()
            .map(|salt| derive_session_key(&self.account, &self.password, salt))
    }

    /// Serialize a command for sending. Before a salt is known the payload
    /// goes out in the clear; afterwards it is encrypted.
    pub fn encode_command(&self, command: &command::Command) -> Result<Vec<u8>> {
        let plaintext = command.to_payload()?;
        match self.key() {
            None => Ok(plaintext),
            Some(key) => {
                let cipher = Aes128EcbEnc::new_from_slice(&key)
                    .map_err(|e| ErrorKind::Crypto(e.to_string()))?;
                Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(&plaintext))
            }
        }
    }

    /// Interpret an inbound payload: plain JSON first, ciphertext fallback
    pub fn decode_payload(&self, payload: &[u8]) -> Result<json::Value> {
        if let Ok(value) = json::from_slice(payload) {
            return Ok(value);
        }
        let key = self.key().ok_or_else(|| {
            Error::from(ErrorKind::Decode(
                "payload is not JSON and no session salt is known".to_string(),
            ))
        })?;
        let cipher =
            Aes128EcbDec::new_from_slice(&key).map_err(|e| ErrorKind::Crypto(e.to_string()))?;
        let plaintext = cipher
            .decrypt_padded_vec_mut::<Pkcs7>(payload)
            .map_err(|e| ErrorKind::Crypto(format!("unpad: {}", e)))?;
        Ok(json::from_slice(&plaintext)?)
    }
}

/// Read one length-prefixed frame.
///
/// The length guard fires before any body byte is consumed, so a lying
/// peer cannot make us allocate or wait for 100+ kB.
pub async fn read_frame<R>(stream: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    timeout(IO_TIMEOUT, stream.read_exact(&mut header))
        .await
        .map_err(|_| Error::from(ErrorKind::Timeout("frame header".to_string())))??;

    let length = u32::from_le_bytes(header);
    if length > MAX_FRAME_SIZE {
        Err(ErrorKind::LengthAbsurd(length))?;
    }

    let mut payload = vec![0u8; length as usize];
    timeout(IO_TIMEOUT, stream.read_exact(&mut payload))
        .await
        .map_err(|_| Error::from(ErrorKind::Timeout("frame body".to_string())))??;
    Ok(payload)
}

/// Write one length-prefixed frame
pub async fn write_frame<W>(stream: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = (payload.len() as u32).to_le_bytes();
    timeout(IO_TIMEOUT, async {
        stream.write_all(&header).await?;
        stream.write_all(payload).await?;
        stream.flush().await
    })
    .await
    .map_err(|_| Error::from(ErrorKind::Timeout("frame write".to_string())))??;
    Ok(())
}

/// One-shot API client
///
/// Each `send_command` opens a fresh TCP session, performs a single
/// request/response exchange and closes the socket, which is how the
/// firmware expects occasional pollers to behave (no connection pooling).
pub struct Client {
    addr: SocketAddr,
    session: Session,
}

impl Client {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self::with_credentials(ip, port, DEFAULT_ACCOUNT, DEFAULT_PASSWORD)
    }

    pub fn with_credentials(ip: Ipv4Addr, port: u16, account: &str, password: &str) -> Self {
        Self {
            addr: SocketAddr::new(ip.into(), port),
            session: Session::new(account, password),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Cheap reachability test without issuing a command
    pub async fn probe(&self) -> bool {
        matches!(
            timeout(IO_TIMEOUT, TcpStream::connect(self.addr)).await,
            Ok(Ok(_))
        )
    }

    /// Single request/response exchange over a fresh connection
    pub async fn send_command(&mut self, command: &command::Command) -> Result<json::Value> {
        let mut stream = timeout(IO_TIMEOUT, TcpStream::connect(self.addr))
            .await
            .map_err(|_| Error::from(ErrorKind::Timeout(format!("connect {}", self.addr))))?
            .map_err(|e| Error::from(ErrorKind::Connect(format!("{}: {}", self.addr, e))))?;

        let payload = self.session.encode_command(command)?;
        write_frame(&mut stream, &payload).await?;
        let response = read_frame(&mut stream).await?;
        // Socket closes when `stream` drops, regardless of decode outcome
        self.session.decode_payload(&response)
    }

    /// Fetch device info and capture the session salt for later commands
    pub async fn fetch_device_info(&mut self) -> Result<response::DeviceInfo> {
        let value = self
            .send_command(&command::Command::new(command::GET_DEVICE_INFO))
            .await?;
        let envelope = response::Envelope::from_value(value)?.check()?;
        let info = response::DeviceInfo::from_msg(&envelope.msg);
        if let Some(salt) = info.salt.as_deref() {
            self.session.set_salt(salt);
        }
        Ok(info)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use tokio::io::duplex;
    use tokio::net::TcpListener;

    #[test]
    fn test_session_key_shape() {
        let key = derive_session_key(DEFAULT_ACCOUNT, DEFAULT_PASSWORD, "BQ5hoXV9");
        // The key is lowercase hex text, thus always ASCII
        assert!(key.iter().all(|b| b.is_ascii_hexdigit()));
        // Same inputs, same key; different salt, different key
        assert_eq!(
            key,
            derive_session_key(DEFAULT_ACCOUNT, DEFAULT_PASSWORD, "BQ5hoXV9")
        );
        assert_ne!(
            key,
            derive_session_key(DEFAULT_ACCOUNT, DEFAULT_PASSWORD, "other")
        );
    }

    #[test]
    fn test_first_command_goes_out_in_the_clear() {
        let session = Session::new(DEFAULT_ACCOUNT, DEFAULT_PASSWORD);
        let payload = session
            .encode_command(&command::Command::new(command::GET_DEVICE_INFO))
            .unwrap();
        assert_eq!(
            payload.as_slice(),
            br#"{"cmd":"get.device.info","param":null}"#
        );
    }

    /// After a salt is set, commands are encrypted and a matching session
    /// can decode them back.
    #[test]
    fn test_encrypted_round_trip() {
        let mut session = Session::new(DEFAULT_ACCOUNT, DEFAULT_PASSWORD);
        session.set_salt("BQ5hoXV9");

        let command = command::Command::new("get.miner.status");
        let ciphertext = session.encode_command(&command).unwrap();
        // PKCS#7 keeps the ciphertext block aligned
        assert_eq!(ciphertext.len() % 16, 0);
        assert_ne!(ciphertext.as_slice(), command.to_payload().unwrap().as_slice());

        let decoded = session.decode_payload(&ciphertext).unwrap();
        assert_eq!(decoded["cmd"], "get.miner.status");
    }

    #[test]
    fn test_decode_without_salt_fails() {
        let session = Session::new(DEFAULT_ACCOUNT, DEFAULT_PASSWORD);
        match session.decode_payload(b"\x01\x02\x03\x04") {
            Err(e) => assert_variant_decode(e.kind()),
            Ok(_) => panic!("garbage must not decode"),
        }
    }

    fn assert_variant_decode(kind: ErrorKind) {
        match kind {
            ErrorKind::Decode(_) => (),
            other => panic!("expected Decode error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut a, mut b) = duplex(1024);
        write_frame(&mut a, b"{\"code\":0}").await.unwrap();
        let payload = read_frame(&mut b).await.unwrap();
        assert_eq!(payload.as_slice(), b"{\"code\":0}");
    }

    /// An absurd length prefix must abort before any body byte is read
    #[tokio::test]
    async fn test_frame_length_guard() {
        let (mut a, mut b) = duplex(1024);
        // 0x000493E1 == 300001 > MAX_FRAME_SIZE
        a.write_all(&0x0004_93E1u32.to_le_bytes()).await.unwrap();
        a.write_all(b"leftover").await.unwrap();

        match read_frame(&mut b).await {
            Err(e) => assert_eq!(e.kind(), ErrorKind::LengthAbsurd(300_001)),
            Ok(_) => panic!("oversized frame must be rejected"),
        }
        // The body bytes are still in the stream, untouched
        let mut rest = [0u8; 8];
        b.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"leftover");
    }

    #[tokio::test]
    async fn test_truncated_frame_is_short_read() {
        let (mut a, mut b) = duplex(1024);
        a.write_all(&20u32.to_le_bytes()).await.unwrap();
        a.write_all(b"only-ten-b").await.unwrap();
        drop(a);

        match read_frame(&mut b).await {
            Err(e) => match e.kind() {
                ErrorKind::ShortRead(_) => (),
                other => panic!("expected ShortRead, got {:?}", other),
            },
            Ok(_) => panic!("truncated frame must be rejected"),
        }
    }

    async fn serve_one_response(response: Vec<u8>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // Consume the request frame first
            let _request = read_frame(&mut stream).await.unwrap();
            stream.write_all(&response).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_fetch_device_info() {
        let body = br#"{"code":0,"msg":{"salt":"abc123","power":{"liquid-temperature":47.25,"temp0":40.0,"fanspeed":2980}}}"#;
        let mut response = (body.len() as u32).to_le_bytes().to_vec();
        response.extend_from_slice(body);
        let addr = serve_one_response(response).await;

        let mut client = Client::new(Ipv4Addr::LOCALHOST, addr.port());
        let info = client.fetch_device_info().await.unwrap();
        assert_eq!(info.power.liquid_temperature, Some(47.25));
        assert_eq!(info.power.fan_speed, Some(2980));
        // Salt was captured for the rest of the session
        assert_eq!(client.session().salt(), Some("abc123"));
    }

    #[tokio::test]
    async fn test_fetch_device_info_api_error() {
        let body = br#"{"code":23,"msg":"token expired"}"#;
        let mut response = (body.len() as u32).to_le_bytes().to_vec();
        response.extend_from_slice(body);
        let addr = serve_one_response(response).await;

        let mut client = Client::new(Ipv4Addr::LOCALHOST, addr.port());
        match client.fetch_device_info().await {
            Err(e) => assert_eq!(e.kind(), ErrorKind::Api(23)),
            Ok(_) => panic!("non-zero code must fail the fetch"),
        }
    }

    #[tokio::test]
    async fn test_client_length_guard_end_to_end() {
        let mut response = 0x0004_93E1u32.to_le_bytes().to_vec();
        response.extend_from_slice(b"junk that must never be read");
        let addr = serve_one_response(response).await;

        let mut client = Client::new(Ipv4Addr::LOCALHOST, addr.port());
        match client.fetch_device_info().await {
            Err(e) => assert_eq!(e.kind(), ErrorKind::LengthAbsurd(300_001)),
            Ok(_) => panic!("oversized response must be rejected"),
        }
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Port 1 is essentially never listening on loopback
        let mut client = Client::new(Ipv4Addr::LOCALHOST, 1);
        match client.fetch_device_info().await {
            Err(e) => match e.kind() {
                ErrorKind::Connect(_) | ErrorKind::Timeout(_) => (),
                other => panic!("expected Connect/Timeout, got {:?}", other),
            },
            Ok(_) => panic!("connection must fail"),
        }
    }
}
