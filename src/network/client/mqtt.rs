//! MQTT 3.1.1 client for embedded systems.
//!
//! A small synchronous client that speaks just enough MQTT for the device API:
//! CONNECT with access-token credentials, PUBLISH (QoS 0 and 1), SUBSCRIBE,
//! UNSUBSCRIBE, PINGREQ and DISCONNECT. It works over any byte stream that
//! implements [`Connection`].
//!
//! # Receive buffer
//!
//! Inbound packets larger than the receive buffer are read and dropped. The
//! firmware update controller enlarges the buffer through
//! [`Transport::set_buffer_size`] for the duration of a download.
//!
//! # Examples
//!
//! ```rust,no_run
//! use cloudlink::network::client::mqtt::{Client, Options};
//! # use cloudlink::network::Connection;
//! # struct TcpConnection;
//! # impl Connection for TcpConnection {}
//! # impl cloudlink::network::Read for TcpConnection {
//! #     type Error = ();
//! #     fn read(&mut self, _buf: &mut [u8]) -> Result<usize, Self::Error> { Ok(0) }
//! # }
//! # impl cloudlink::network::Write for TcpConnection {
//! #     type Error = ();
//! #     fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> { Ok(buf.len()) }
//! #     fn flush(&mut self) -> Result<(), Self::Error> { Ok(()) }
//! # }
//! # impl cloudlink::network::Close for TcpConnection {
//! #     type Error = ();
//! #     fn close(self) -> Result<(), Self::Error> { Ok(()) }
//! # }
//!
//! let options = Options {
//!     client_id: "thermostat-17",
//!     keep_alive_seconds: 60,
//!     clean_session: true,
//!     username: Some("A1_TEST_TOKEN"),
//!     password: None,
//! };
//!
//! // let mut client = Client::connect(TcpConnection, options)?;
//! // while let Some(message) = client.poll()? { /* device.on_message(...) */ }
//! ```

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;

use crate::network::error::Error;
use crate::network::{Connection, Read, Transport, Write};

// MQTT Control Packet types - these are the fixed header packet type values
const CONNECT: u8 = 0x10;
const CONNACK: u8 = 0x20;
const PUBLISH: u8 = 0x30;
const PUBACK: u8 = 0x40;
const SUBSCRIBE: u8 = 0x82;
const SUBACK: u8 = 0x90;
const UNSUBSCRIBE: u8 = 0xA2;
const UNSUBACK: u8 = 0xB0;
const PINGREQ: u8 = 0xC0;
const DISCONNECT: u8 = 0xE0;

const PROTOCOL_NAME: &[u8] = b"MQTT";
const PROTOCOL_LEVEL: u8 = 4; // MQTT 3.1.1

/// SUBACK return code signalling a refused subscription.
const SUBACK_FAILURE: u8 = 0x80;

/// Receive buffer size until the application asks for more.
pub const DEFAULT_BUFFER_SIZE: usize = 256;

/// Quality of Service levels for MQTT messages.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum QoS {
    /// Fire and forget.
    AtMostOnce = 0,
    /// Acknowledged delivery; duplicates possible.
    AtLeastOnce = 1,
}

#[cfg(feature = "defmt")]
impl defmt::Format for QoS {
    fn format(&self, f: defmt::Formatter) {
        match self {
            QoS::AtMostOnce => defmt::write!(f, "AtMostOnce"),
            QoS::AtLeastOnce => defmt::write!(f, "AtLeastOnce"),
        }
    }
}

/// Connection options.
#[derive(Debug, Clone)]
pub struct Options<'a> {
    /// The client identifier, unique per broker.
    pub client_id: &'a str,
    /// Keep-alive interval in seconds; 0 disables it.
    pub keep_alive_seconds: u16,
    /// Discard any previous session state on the broker.
    pub clean_session: bool,
    /// User name; the platform expects the device access token here.
    pub username: Option<&'a str>,
    /// Password, only sent together with a user name.
    pub password: Option<&'a str>,
}

/// An inbound PUBLISH.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Message {
    /// Topic the message was published on.
    pub topic: String,
    /// Raw payload.
    pub payload: Vec<u8>,
}

enum Incoming {
    Idle,
    Dropped,
    Packet(u8),
}

/// A synchronous MQTT client.
#[derive(Debug)]
pub struct Client<C: Connection> {
    connection: C,
    is_connected: bool,
    next_packet_id: u16,
    publish_qos: QoS,
    buffer_size: usize,
    rx: Vec<u8>,
    backlog: VecDeque<Message>,
}

impl<C: Connection> Client<C> {
    /// Performs the CONNECT/CONNACK handshake.
    ///
    /// # Errors
    ///
    /// * [`Error::WriteError`] - Failed to send CONNECT packet
    /// * [`Error::ConnectionClosed`] - Connection closed during handshake
    /// * [`Error::ConnectionRefused`] - Broker refused the connection, e.g. a bad access token
    /// * [`Error::ProtocolError`] - Invalid CONNACK packet received
    pub fn connect(connection: C, options: Options) -> Result<Self, Error> {
        let mut client = Self {
            connection,
            is_connected: false,
            next_packet_id: 1,
            publish_qos: QoS::AtMostOnce,
            buffer_size: DEFAULT_BUFFER_SIZE,
            rx: Vec::new(),
            backlog: VecDeque::new(),
        };

        // --- Variable Header ---
        let mut packet = Vec::new();
        put_str(&mut packet, PROTOCOL_NAME)?;
        packet.push(PROTOCOL_LEVEL);

        let mut connect_flags = 0;
        if options.clean_session {
            connect_flags |= 0x02;
        }
        if options.username.is_some() {
            connect_flags |= 0x80;
            if options.password.is_some() {
                connect_flags |= 0x40;
            }
        }
        packet.push(connect_flags);
        packet.extend_from_slice(&options.keep_alive_seconds.to_be_bytes());

        // --- Payload ---
        put_str(&mut packet, options.client_id.as_bytes())?;
        if let Some(username) = options.username {
            put_str(&mut packet, username.as_bytes())?;
            if let Some(password) = options.password {
                put_str(&mut packet, password.as_bytes())?;
            }
        }

        client.send(CONNECT, &packet)?;

        let mut connack = [0u8; 4];
        read_exact(&mut client.connection, &mut connack)?;
        if connack[0] != CONNACK || connack[1] != 2 {
            return Err(Error::ProtocolError);
        }

        match connack[3] {
            0 => {
                client.is_connected = true;
                log::info!("connected as {}", options.client_id);
                Ok(client)
            }
            1..=5 => Err(Error::ConnectionRefused),
            _ => Err(Error::ProtocolError),
        }
    }

    /// Returns `true` while the session is established.
    pub fn is_connected(&self) -> bool {
        self.is_connected
    }

    /// QoS used by [`Transport::publish`].
    pub fn set_publish_qos(&mut self, qos: QoS) {
        self.publish_qos = qos;
    }

    /// Publishes with an explicit QoS.
    pub fn publish_with_qos(&mut self, topic: &str, payload: &[u8], qos: QoS) -> Result<(), Error> {
        self.ensure_connected()?;

        let mut packet = Vec::with_capacity(topic.len() + payload.len() + 4);
        put_str(&mut packet, topic.as_bytes())?;
        if qos == QoS::AtLeastOnce {
            let packet_id = self.allocate_packet_id();
            packet.extend_from_slice(&packet_id.to_be_bytes());
        }
        packet.extend_from_slice(payload);

        self.send(PUBLISH | ((qos as u8) << 1), &packet)
    }

    /// Reads at most one packet from the connection.
    ///
    /// Returns `Ok(None)` when no data is available or the packet was not a
    /// PUBLISH. Messages that arrived while waiting for an acknowledgement are
    /// returned first.
    pub fn poll(&mut self) -> Result<Option<Message>, Error> {
        if let Some(message) = self.backlog.pop_front() {
            return Ok(Some(message));
        }
        self.ensure_connected()?;

        match self.next_packet()? {
            Incoming::Packet(header) if header & 0xF0 == PUBLISH => {
                self.decode_publish(header).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Sends PINGREQ. The PINGRESP is consumed by [`Client::poll`].
    pub fn ping(&mut self) -> Result<(), Error> {
        self.ensure_connected()?;
        self.send(PINGREQ, &[])
    }

    /// Sends DISCONNECT and closes the connection.
    pub fn disconnect(mut self) -> Result<(), Error> {
        if self.is_connected {
            self.send(DISCONNECT, &[])?;
            self.is_connected = false;
        }
        self.connection.close().map_err(|_| Error::WriteError)
    }

    fn ensure_connected(&self) -> Result<(), Error> {
        if self.is_connected {
            Ok(())
        } else {
            Err(Error::NotOpen)
        }
    }

    fn allocate_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        // packet id 0 is reserved
        self.next_packet_id = match id.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        id
    }

    fn send(&mut self, header: u8, body: &[u8]) -> Result<(), Error> {
        let mut fixed_header: heapless::Vec<u8, 5> = heapless::Vec::new();
        fixed_header
            .push(header)
            .map_err(|_| Error::ProtocolError)?;
        encode_remaining_length(&mut fixed_header, body.len())?;

        write_all(&mut self.connection, &fixed_header)?;
        write_all(&mut self.connection, body)?;
        self.connection.flush().map_err(|_| Error::WriteError)
    }

    fn next_packet(&mut self) -> Result<Incoming, Error> {
        let mut header = [0u8; 1];
        match self.connection.read(&mut header) {
            Ok(0) => return Ok(Incoming::Idle),
            Ok(_) => {}
            Err(_) => return Err(Error::ReadError),
        }

        let remaining = read_remaining_length(&mut self.connection)?;
        if remaining > self.buffer_size {
            discard(&mut self.connection, remaining)?;
            log::warn!(
                "dropped {} byte packet, receive buffer is {} bytes",
                remaining,
                self.buffer_size
            );
            return Ok(Incoming::Dropped);
        }

        self.rx.clear();
        self.rx.resize(remaining, 0);
        read_exact(&mut self.connection, &mut self.rx)?;
        Ok(Incoming::Packet(header[0]))
    }

    fn decode_publish(&mut self, header: u8) -> Result<Message, Error> {
        let qos = (header >> 1) & 0x03;
        if self.rx.len() < 2 {
            return Err(Error::ProtocolError);
        }
        let topic_len = u16::from_be_bytes([self.rx[0], self.rx[1]]) as usize;
        let mut offset = 2 + topic_len;
        let topic = self
            .rx
            .get(2..offset)
            .and_then(|bytes| core::str::from_utf8(bytes).ok())
            .map(String::from)
            .ok_or(Error::ProtocolError)?;

        let mut packet_id = None;
        if qos > 0 {
            let id = self
                .rx
                .get(offset..offset + 2)
                .ok_or(Error::ProtocolError)?;
            packet_id = Some([id[0], id[1]]);
            offset += 2;
        }
        let payload = self.rx[offset..].to_vec();

        if let (1, Some(id)) = (qos, packet_id) {
            self.send(PUBACK, &id)?;
        }
        Ok(Message { topic, payload })
    }

    fn await_ack(&mut self, kind: u8, packet_id: u16) -> Result<(), Error> {
        loop {
            match self.next_packet()? {
                Incoming::Idle => return Err(Error::ConnectionClosed),
                Incoming::Dropped => continue,
                Incoming::Packet(header) if header & 0xF0 == PUBLISH => {
                    let message = self.decode_publish(header)?;
                    self.backlog.push_back(message);
                }
                Incoming::Packet(header) if header == kind => {
                    if self.rx.len() < 2 || u16::from_be_bytes([self.rx[0], self.rx[1]]) != packet_id
                    {
                        return Err(Error::ProtocolError);
                    }
                    if kind == SUBACK && self.rx.get(2) == Some(&SUBACK_FAILURE) {
                        return Err(Error::SubscriptionRejected);
                    }
                    return Ok(());
                }
                Incoming::Packet(_) => continue,
            }
        }
    }
}

impl<C: Connection> Transport for Client<C> {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), Error> {
        self.publish_with_qos(topic, payload, self.publish_qos)
    }

    fn subscribe(&mut self, filter: &str) -> Result<(), Error> {
        self.ensure_connected()?;
        let packet_id = self.allocate_packet_id();

        let mut packet = Vec::with_capacity(filter.len() + 5);
        packet.extend_from_slice(&packet_id.to_be_bytes());
        put_str(&mut packet, filter.as_bytes())?;
        packet.push(QoS::AtMostOnce as u8);

        self.send(SUBSCRIBE, &packet)?;
        self.await_ack(SUBACK, packet_id)
    }

    fn unsubscribe(&mut self, filter: &str) -> Result<(), Error> {
        self.ensure_connected()?;
        let packet_id = self.allocate_packet_id();

        let mut packet = Vec::with_capacity(filter.len() + 4);
        packet.extend_from_slice(&packet_id.to_be_bytes());
        put_str(&mut packet, filter.as_bytes())?;

        self.send(UNSUBSCRIBE, &packet)?;
        self.await_ack(UNSUBACK, packet_id)
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn set_buffer_size(&mut self, size: usize) -> Result<(), Error> {
        if size > self.rx.capacity() {
            self.rx
                .try_reserve_exact(size - self.rx.len())
                .map_err(|_| Error::OutOfMemory)?;
        } else {
            self.rx.truncate(size);
            self.rx.shrink_to(size);
        }
        self.buffer_size = size;
        Ok(())
    }
}

fn put_str(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<(), Error> {
    let len = u16::try_from(bytes.len()).map_err(|_| Error::PacketTooLarge)?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

fn encode_remaining_length(buf: &mut heapless::Vec<u8, 5>, mut len: usize) -> Result<(), Error> {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.push(byte).map_err(|_| Error::PacketTooLarge)?;
        if len == 0 {
            return Ok(());
        }
    }
}

fn read_remaining_length<R: Read>(connection: &mut R) -> Result<usize, Error> {
    let mut value = 0usize;
    for shift in [0u32, 7, 14, 21] {
        let mut byte = [0u8; 1];
        read_exact(connection, &mut byte)?;
        value |= ((byte[0] & 0x7F) as usize) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(Error::ProtocolError)
}

fn read_exact<R: Read>(connection: &mut R, buf: &mut [u8]) -> Result<(), Error> {
    let mut total_read = 0;
    while total_read < buf.len() {
        match connection.read(&mut buf[total_read..]) {
            Ok(0) => return Err(Error::ConnectionClosed),
            Ok(n) => total_read += n,
            Err(_) => return Err(Error::ReadError),
        }
    }
    Ok(())
}

fn write_all<W: Write>(connection: &mut W, mut buf: &[u8]) -> Result<(), Error> {
    while !buf.is_empty() {
        match connection.write(buf) {
            Ok(0) => return Err(Error::ConnectionClosed),
            Ok(n) => buf = &buf[n..],
            Err(_) => return Err(Error::WriteError),
        }
    }
    Ok(())
}

fn discard<R: Read>(connection: &mut R, mut len: usize) -> Result<(), Error> {
    let mut scratch = [0u8; 64];
    while len > 0 {
        let step = len.min(scratch.len());
        read_exact(connection, &mut scratch[..step])?;
        len -= step;
    }
    Ok(())
}
