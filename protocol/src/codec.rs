//! CBOR encoding for streams and datagrams.

use crate::{message::Envelope, BROADCAST_CODE, RESPONSE_CODE};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    io::{Read, Write},
    net::TcpStream,
};
use thiserror::Error;

/// Largest payload a UDP datagram can carry
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

pub type RecvError = ciborium::de::Error<std::io::Error>;
pub type SendError = ciborium::ser::Error<std::io::Error>;

#[derive(Error, Debug)]
pub enum CborRecvError {
    #[error("Failed to receive incoming CBOR")]
    Receive(#[from] RecvError),
}

#[derive(Error, Debug)]
pub enum CborSendError {
    #[error("Failed to send CBOR")]
    Send(#[from] SendError),
}

#[derive(Error, Debug)]
pub enum DatagramError {
    #[error("Failed to encode datagram")]
    Encode(#[from] SendError),
    #[error("Failed to decode datagram")]
    Decode(#[from] RecvError),
    #[error("Datagram of {0} bytes exceeds the UDP payload limit")]
    TooLarge(usize),
}

pub trait RecvCbor<M: DeserializeOwned>: Sized + Read {
    /// # Receive a message from self
    /// This function can block the calling thread for the stream's current read timeout setting
    /// (see [`TcpStream::set_read_timeout`]).
    fn recv(&mut self) -> Result<M, CborRecvError> {
        Ok(ciborium::from_reader(self)?)
    }
}

pub trait SendCbor<M: Serialize>: Sized + Write {
    /// # Send a message over self
    fn send(&mut self, message: &M) -> Result<(), CborSendError> {
        ciborium::into_writer(message, &mut *self)?;
        self.flush()
            .map_err(|e| CborSendError::Send(ciborium::ser::Error::Io(e)))
    }
}

impl RecvCbor<Envelope> for TcpStream {}
impl SendCbor<Envelope> for TcpStream {}

/// Acknowledgement of one multicast envelope, sent back to the datagram's source
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub clock: u64,
}

/// Discovery datagram broadcast on the LAN
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Beacon {
    /// Sent by a node looking for the leader
    Solicit { code: String },
    /// Sent back by the leader, with the port of its unicast listener
    Advertise { code: String, port: u16 },
}

impl Beacon {
    #[must_use]
    pub fn solicit() -> Self {
        Beacon::Solicit {
            code: BROADCAST_CODE.to_owned(),
        }
    }

    #[must_use]
    pub fn advertise(port: u16) -> Self {
        Beacon::Advertise {
            code: RESPONSE_CODE.to_owned(),
            port,
        }
    }

    /// Whether the beacon carries the code its kind requires.
    #[must_use]
    pub fn is_genuine(&self) -> bool {
        match self {
            Beacon::Solicit { code } => code == BROADCAST_CODE,
            Beacon::Advertise { code, .. } => code == RESPONSE_CODE,
        }
    }
}

pub fn encode_datagram<M: Serialize>(message: &M) -> Result<Vec<u8>, DatagramError> {
    let mut buf = Vec::new();
    ciborium::into_writer(message, &mut buf)?;
    if buf.len() > MAX_DATAGRAM_SIZE {
        return Err(DatagramError::TooLarge(buf.len()));
    }
    Ok(buf)
}

pub fn decode_datagram<M: DeserializeOwned>(buf: &[u8]) -> Result<M, DatagramError> {
    Ok(ciborium::from_reader(buf)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Unwrap is ok in test code")]
mod tests {
    use super::*;
    use crate::{address::NodeAddress, message::Command};
    use std::collections::VecDeque;

    struct Pipe(VecDeque<u8>);

    impl Read for Pipe {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.0.read(buf)
        }
    }

    impl Write for Pipe {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl RecvCbor<Envelope> for Pipe {}
    impl SendCbor<Envelope> for Pipe {}

    #[test]
    fn stream_carries_consecutive_envelopes() {
        let sender = NodeAddress::new("10.0.0.1", 10001);
        let first = Envelope::unicast(Command::Ping, sender.clone());
        let second = Envelope::multicast(
            Command::Lead {
                leader: sender.clone(),
            },
            sender,
            3,
        );

        let mut pipe = Pipe(VecDeque::new());
        pipe.send(&first).unwrap();
        pipe.send(&second).unwrap();

        let received: Envelope = pipe.recv().unwrap();
        assert_eq!(received, first);
        assert_eq!(received.clock, None);
        let received: Envelope = pipe.recv().unwrap();
        assert_eq!(received.clock, Some(3));
        assert!(RecvCbor::<Envelope>::recv(&mut pipe).is_err());
    }

    #[test]
    fn beacon_codes_are_checked() {
        let buf = encode_datagram(&Beacon::advertise(10001)).unwrap();
        let beacon: Beacon = decode_datagram(&buf).unwrap();
        assert!(beacon.is_genuine());
        assert_eq!(beacon, Beacon::advertise(10001));

        let forged = Beacon::Advertise {
            code: BROADCAST_CODE.to_owned(),
            port: 1,
        };
        assert!(!forged.is_genuine());
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let result = decode_datagram::<Envelope>(b"#*#JOIN");
        assert!(matches!(result, Err(DatagramError::Decode(_))));
    }
}
