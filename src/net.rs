//! Connection transport: fixed-size request/reply records over TCP.
//!
//! Every client interaction is one 12-byte record each way. Reads and
//! writes always transfer the full record; a clean disconnect mid-record
//! surfaces as `None` rather than an error.

use anyhow::Result;
use std::io::ErrorKind;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::table::KEY_SPACE;

/// Wire status/operation codes, in protocol order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Code {
    Put = 0,
    Get = 1,
    Success = 2,
    Error = 3,
    Full = 4,
    NotFound = 5,
}

impl Code {
    fn from_u32(raw: u32) -> Result<Self> {
        Ok(match raw {
            0 => Code::Put,
            1 => Code::Get,
            2 => Code::Success,
            3 => Code::Error,
            4 => Code::Full,
            5 => Code::NotFound,
            other => anyhow::bail!("unknown wire code {other}"),
        })
    }
}

/// The request/reply record. The key travels as a u32 and is range-checked
/// against the key domain at dispatch, before it can reach a table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Message {
    pub key: u32,
    pub value: i32,
    pub code: Code,
}

pub const MESSAGE_BYTES: usize = 12;

impl Message {
    pub fn to_bytes(&self) -> [u8; MESSAGE_BYTES] {
        let mut buf = [0u8; MESSAGE_BYTES];
        buf[0..4].copy_from_slice(&self.key.to_le_bytes());
        buf[4..8].copy_from_slice(&self.value.to_le_bytes());
        buf[8..12].copy_from_slice(&(self.code as u32).to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; MESSAGE_BYTES]) -> Result<Self> {
        let key = u32::from_le_bytes(buf[0..4].try_into()?);
        let value = i32::from_le_bytes(buf[4..8].try_into()?);
        let code = Code::from_u32(u32::from_le_bytes(buf[8..12].try_into()?))?;
        Ok(Self { key, value, code })
    }

    pub fn key_in_domain(&self) -> bool {
        (self.key as usize) < KEY_SPACE
    }
}

/// Read a full buffer, mapping a clean peer disconnect to `Ok(false)`.
pub async fn read_exact_checked<R>(sock: &mut R, buf: &mut [u8]) -> Result<bool>
where
    R: AsyncRead + Unpin,
{
    match sock.read_exact(buf).await {
        Ok(_) => Ok(true),
        Err(ref e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(ref e) if e.kind() == ErrorKind::ConnectionReset => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Read one record; `None` when the peer hung up before or during it.
pub async fn read_message<R>(sock: &mut R) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; MESSAGE_BYTES];
    if !read_exact_checked(sock, &mut buf).await? {
        return Ok(None);
    }
    Ok(Some(Message::from_bytes(&buf)?))
}

pub async fn write_message<W>(sock: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    sock.write_all(&msg.to_bytes()).await?;
    Ok(())
}

/// Length-prefixed byte frame, used for the channel-descriptor exchange.
pub async fn write_frame<W>(sock: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    sock.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    sock.write_all(payload).await?;
    Ok(())
}

pub async fn read_frame<R>(sock: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    if !read_exact_checked(sock, &mut len_buf).await? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    if !read_exact_checked(sock, &mut payload).await? {
        return Ok(None);
    }
    Ok(Some(payload))
}

/// Passive open: bind and listen.
pub async fn listen(addr: SocketAddr) -> Result<TcpListener> {
    Ok(TcpListener::bind(addr).await?)
}

/// Active open: connect to a remote.
pub async fn connect(addr: SocketAddr) -> Result<TcpStream> {
    Ok(TcpStream::connect(addr).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_encoding_is_stable() {
        let msg = Message {
            key: 5,
            value: -7,
            code: Code::Put,
        };
        let bytes = msg.to_bytes();
        assert_eq!(bytes.len(), MESSAGE_BYTES);
        assert_eq!(Message::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn unknown_code_is_rejected() {
        let mut bytes = Message {
            key: 1,
            value: 2,
            code: Code::Get,
        }
        .to_bytes();
        bytes[8..12].copy_from_slice(&99u32.to_le_bytes());
        assert!(Message::from_bytes(&bytes).is_err());
    }

    #[test]
    fn key_domain_check() {
        let mut msg = Message {
            key: 255,
            value: 0,
            code: Code::Get,
        };
        assert!(msg.key_in_domain());
        msg.key = 300;
        assert!(!msg.key_in_domain());
    }

    #[tokio::test]
    async fn short_read_is_a_disconnect_not_an_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[1, 2, 3]).await.unwrap();
        drop(a);
        assert_eq!(read_message(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn frames_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, b"descriptor").await.unwrap();
        let got = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(got, b"descriptor");
    }
}
