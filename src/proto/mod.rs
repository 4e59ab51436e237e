//! The Everlog wire protocol: length-prefixed frames carrying typed
//! packages.
//!
//! A package is `command | flags | correlation id | [credentials] |
//! payload`, everything little-endian. Payload schemas per command live in
//! [`messages`]. The codec types here are public so test harnesses and
//! tooling can speak the protocol with the same code the client uses.

mod frame;
pub mod messages;
pub(crate) mod wire;

pub use frame::{FrameCodec, MAX_FRAME_SIZE};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

use crate::settings::Credentials;
use wire::{Reader, Writer};

/// Command bytes understood by this client.
pub mod command {
    pub const HEARTBEAT_REQUEST: u8 = 0x01;
    pub const HEARTBEAT_RESPONSE: u8 = 0x02;

    pub const WRITE_EVENTS: u8 = 0x82;
    pub const WRITE_EVENTS_COMPLETED: u8 = 0x83;
    pub const TRANSACTION_START: u8 = 0x84;
    pub const TRANSACTION_START_COMPLETED: u8 = 0x85;
    pub const TRANSACTION_WRITE: u8 = 0x86;
    pub const TRANSACTION_WRITE_COMPLETED: u8 = 0x87;
    pub const TRANSACTION_COMMIT: u8 = 0x88;
    pub const TRANSACTION_COMMIT_COMPLETED: u8 = 0x89;
    pub const DELETE_STREAM: u8 = 0x8A;
    pub const DELETE_STREAM_COMPLETED: u8 = 0x8B;

    pub const READ_EVENT: u8 = 0xB0;
    pub const READ_EVENT_COMPLETED: u8 = 0xB1;
    pub const READ_STREAM_EVENTS_FORWARD: u8 = 0xB2;
    pub const READ_STREAM_EVENTS_FORWARD_COMPLETED: u8 = 0xB3;
    pub const READ_STREAM_EVENTS_BACKWARD: u8 = 0xB4;
    pub const READ_STREAM_EVENTS_BACKWARD_COMPLETED: u8 = 0xB5;
    pub const READ_ALL_EVENTS_FORWARD: u8 = 0xB6;
    pub const READ_ALL_EVENTS_FORWARD_COMPLETED: u8 = 0xB7;
    pub const READ_ALL_EVENTS_BACKWARD: u8 = 0xB8;
    pub const READ_ALL_EVENTS_BACKWARD_COMPLETED: u8 = 0xB9;

    pub const SUBSCRIBE_TO_STREAM: u8 = 0xC0;
    pub const SUBSCRIPTION_CONFIRMATION: u8 = 0xC1;
    pub const STREAM_EVENT_APPEARED: u8 = 0xC2;
    pub const UNSUBSCRIBE_FROM_STREAM: u8 = 0xC3;
    pub const SUBSCRIPTION_DROPPED: u8 = 0xC4;
    pub const CONNECT_TO_PERSISTENT_SUBSCRIPTION: u8 = 0xC5;
    pub const PERSISTENT_SUBSCRIPTION_CONFIRMATION: u8 = 0xC6;
    pub const PERSISTENT_SUBSCRIPTION_EVENT_APPEARED: u8 = 0xC7;
    pub const CREATE_PERSISTENT_SUBSCRIPTION: u8 = 0xC8;
    pub const CREATE_PERSISTENT_SUBSCRIPTION_COMPLETED: u8 = 0xC9;
    pub const DELETE_PERSISTENT_SUBSCRIPTION: u8 = 0xCA;
    pub const DELETE_PERSISTENT_SUBSCRIPTION_COMPLETED: u8 = 0xCB;
    pub const PERSISTENT_SUBSCRIPTION_ACK_EVENTS: u8 = 0xCC;
    pub const PERSISTENT_SUBSCRIPTION_NAK_EVENTS: u8 = 0xCD;
    pub const UPDATE_PERSISTENT_SUBSCRIPTION: u8 = 0xCE;
    pub const UPDATE_PERSISTENT_SUBSCRIPTION_COMPLETED: u8 = 0xCF;

    pub const BAD_REQUEST: u8 = 0xF0;
    pub const NOT_HANDLED: u8 = 0xF1;
    pub const AUTHENTICATE: u8 = 0xF2;
    pub const AUTHENTICATED: u8 = 0xF3;
    pub const NOT_AUTHENTICATED: u8 = 0xF4;
}

/// Package header flags.
pub mod flags {
    pub const NONE: u8 = 0x00;
    /// Credentials are present in the header.
    pub const AUTHENTICATED: u8 = 0x01;
}

/// Error thrown while framing or parsing protocol bytes. Fatal for the
/// channel that produced it.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The length prefix cannot even cover itself
    #[error("declared frame length {0} is below the 4 byte minimum")]
    InvalidLength(usize),

    /// The frame exceeds [`MAX_FRAME_SIZE`]
    #[error("frame of {0} bytes exceeds the 64 MiB limit")]
    FrameTooLarge(usize),

    /// The buffer ended in the middle of a field
    #[error("package truncated while reading {0}")]
    Truncated(&'static str),

    /// A string field was not valid UTF-8
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),

    /// An enum field carried a value this client does not know
    #[error("unknown {0} value {1}")]
    UnknownValue(&'static str, u8),

    /// A credential field exceeds the one-byte length prefix
    #[error("credential field of {0} bytes exceeds 255")]
    CredentialTooLong(usize),

    /// std IO error forwarding
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A single protocol exchange unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Package {
    pub command: u8,
    pub correlation: Uuid,
    pub credentials: Option<Credentials>,
    pub payload: Bytes,
}

impl Package {
    pub fn new(command: u8, correlation: Uuid, payload: Bytes) -> Self {
        Self { command, correlation, credentials: None, payload }
    }

    pub fn authenticated(
        command: u8,
        correlation: Uuid,
        credentials: Credentials,
        payload: Bytes,
    ) -> Self {
        Self { command, correlation, credentials: Some(credentials), payload }
    }

    pub(crate) fn heartbeat_request(correlation: Uuid) -> Self {
        Self::new(command::HEARTBEAT_REQUEST, correlation, Bytes::new())
    }

    pub(crate) fn heartbeat_response(correlation: Uuid) -> Self {
        Self::new(command::HEARTBEAT_RESPONSE, correlation, Bytes::new())
    }

    /// Header flags implied by this package's contents.
    pub fn flags(&self) -> u8 {
        if self.credentials.is_some() {
            flags::AUTHENTICATED
        } else {
            flags::NONE
        }
    }

    /// Encodes this package into the contents of a single frame.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(18 + self.payload.len());
        let mut w = Writer::new(&mut buf);
        w.u8(self.command);
        w.u8(self.flags());
        w.uuid(self.correlation);
        if let Some(creds) = &self.credentials {
            for field in [creds.login(), creds.password()] {
                let len = u8::try_from(field.len())
                    .map_err(|_| CodecError::CredentialTooLong(field.len()))?;
                w.u8(len);
                w.raw(field.as_bytes());
            }
        }
        w.raw(&self.payload);
        Ok(buf.freeze())
    }

    /// Decodes the contents of a frame into a package.
    pub fn decode(frame: Bytes) -> Result<Self, CodecError> {
        let mut r = Reader::new(&frame);
        let command = r.u8("command")?;
        let flag_bits = r.u8("flags")?;
        let correlation = r.uuid("correlation id")?;

        let credentials = if flag_bits & flags::AUTHENTICATED != 0 {
            let login = read_credential(&mut r, "login")?;
            let password = read_credential(&mut r, "password")?;
            Some(Credentials::new(login, password))
        } else {
            None
        };

        let payload = frame.slice(frame.len() - r.remaining()..);
        Ok(Self { command, correlation, credentials, payload })
    }
}

fn read_credential(r: &mut Reader<'_>, what: &'static str) -> Result<String, CodecError> {
    let len = r.u8(what)? as usize;
    let bytes = r.raw(len, what)?;
    std::str::from_utf8(bytes).map(str::to_owned).map_err(|_| CodecError::InvalidUtf8(what))
}

/// Frame plus package codec for a `Framed` transport.
#[derive(Debug, Default)]
pub struct PackageCodec {
    frame: FrameCodec,
}

impl Decoder for PackageCodec {
    type Item = Package;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Package>, CodecError> {
        match self.frame.decode(src)? {
            Some(contents) => Ok(Some(Package::decode(contents.freeze())?)),
            None => Ok(None),
        }
    }
}

impl Encoder<Package> for PackageCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Package, dst: &mut BytesMut) -> Result<(), CodecError> {
        let body = item.encode()?;
        self.frame.encode(body, dst)
    }
}
