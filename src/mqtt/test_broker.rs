//! Minimal in-process MQTT 3.1.1 broker for connection manager tests.
//!
//! Speaks just enough of the protocol to accept a CONNECT, answer with a
//! configurable CONNACK, answer PINGREQ and decode incoming PUBLISH packets.

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const CONNECT: u8 = 0x10;
const PUBLISH: u8 = 0x30;
const PINGREQ: u8 = 0xC0;
const DISCONNECT: u8 = 0xE0;
const USERNAME_FLAG: u8 = 0x80;

pub struct FakeBroker {
    listener: TcpListener,
    addr: SocketAddr,
}

#[derive(Debug)]
pub struct ReceivedPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Low nibble of the fixed header: DUP, QoS and RETAIN bits.
    pub flags: u8,
}

pub struct FakeSession {
    stream: TcpStream,
    connect_flags: u8,
}

impl FakeBroker {
    pub const ACCEPTED: u8 = 0x00;
    pub const NOT_AUTHORIZED: u8 = 0x05;

    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        Self { listener, addr }
    }

    /// A port nothing listens on.
    pub async fn unused_port() -> u16 {
        let broker = Self::bind().await;
        broker.port()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Accepts one client, reads its CONNECT and replies with `return_code`.
    pub async fn accept(&self, return_code: u8) -> FakeSession {
        let (mut stream, _) = self.listener.accept().await.unwrap();
        let (header, body) = read_packet(&mut stream).await.unwrap().unwrap();
        assert_eq!(header & 0xF0, CONNECT, "first packet must be CONNECT");

        let name_len = u16::from_be_bytes([body[0], body[1]]) as usize;
        // protocol name, protocol level, then the connect flags
        let connect_flags = body[2 + name_len + 1];

        stream
            .write_all(&[0x20, 0x02, 0x00, return_code])
            .await
            .unwrap();

        FakeSession {
            stream,
            connect_flags,
        }
    }
}

impl FakeSession {
    pub fn connect_had_credentials(&self) -> bool {
        self.connect_flags & USERNAME_FLAG != 0
    }

    /// Next PUBLISH from the client, or `None` once it disconnects.
    pub async fn next_publish(&mut self) -> Option<ReceivedPublish> {
        loop {
            let (header, body) = read_packet(&mut self.stream).await.ok()??;
            match header & 0xF0 {
                PUBLISH => {
                    let flags = header & 0x0F;
                    let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
                    let topic = String::from_utf8(body[2..2 + topic_len].to_vec()).unwrap();
                    let mut offset = 2 + topic_len;
                    if (flags >> 1) & 0x03 > 0 {
                        offset += 2;
                    }
                    return Some(ReceivedPublish {
                        topic,
                        payload: body[offset..].to_vec(),
                        flags,
                    });
                }
                PINGREQ => {
                    self.stream.write_all(&[0xD0, 0x00]).await.ok()?;
                }
                DISCONNECT => return None,
                _ => {}
            }
        }
    }
}

async fn read_packet(stream: &mut TcpStream) -> io::Result<Option<(u8, Vec<u8>)>> {
    let mut header = [0u8; 1];
    if stream.read(&mut header).await? == 0 {
        return Ok(None);
    }

    let mut remaining = 0usize;
    let mut multiplier = 1usize;
    loop {
        let byte = stream.read_u8().await?;
        remaining += (byte & 0x7F) as usize * multiplier;
        if byte & 0x80 == 0 {
            break;
        }
        multiplier *= 128;
    }

    let mut body = vec![0u8; remaining];
    stream.read_exact(&mut body).await?;
    Ok(Some((header[0], body)))
}
