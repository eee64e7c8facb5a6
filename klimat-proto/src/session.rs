use crate::{ProtocolError, Result};
use rand::RngCore;
use std::fmt;
use tracing::debug;

/// Number of hex characters in the textual form of a [`SessionId`]
pub const SESSION_HEX_LEN: usize = 8;

/// Counter the device uses to key every encrypted exchange.
///
/// The device hands out its current value on `/sys/dev/sync` and expects it
/// to advance by one for every command sent after that. It stands in for the
/// CoAP message id, which the firmware pins to a constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SessionId(u32);

impl SessionId {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(self) -> u32 {
        self.0
    }

    /// Draws a fresh id from the given generator
    pub fn generate<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        Self(rng.next_u32())
    }

    /// Lenient parse: only the first 8 characters are considered and anything
    /// that isn't valid hex yields zero.
    pub fn parse(data: &[u8]) -> Self {
        Self::from_hex(data).unwrap_or_default()
    }

    /// Strict parse of the first 8 characters
    pub fn from_hex(data: &[u8]) -> Result<Self> {
        let prefix = &data[..data.len().min(SESSION_HEX_LEN)];
        // from_str_radix would also take a leading sign
        if prefix.is_empty() || !prefix.iter().all(u8::is_ascii_hexdigit) {
            return Err(ProtocolError::Format(format!(
                "invalid session id {:?}",
                String::from_utf8_lossy(prefix)
            )));
        }
        let text = std::str::from_utf8(prefix)
            .map_err(|_| ProtocolError::Format("session id is not ASCII".to_string()))?;

        u32::from_str_radix(text, 16)
            .map(Self)
            .map_err(|e| ProtocolError::Format(format!("invalid session id {:?}: {}", text, e)))
    }

    /// Uppercase, zero-padded 8 character hex form
    pub fn hex(self) -> String {
        format!("{:08X}", self.0)
    }

    pub fn increment(&mut self) {
        self.0 = self.0.wrapping_add(1);
    }

    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Generated locally, not yet confirmed by a device
    Unbound,
    /// Confirmed through the sync handshake
    Active,
}

/// The live session of one device connection
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    state: SessionState,
}

impl Session {
    pub fn unbound<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        Self {
            id: SessionId::generate(rng),
            state: SessionState::Unbound,
        }
    }

    /// Adopts the counter returned by the device. The next command goes out
    /// under `device_counter + 1`.
    pub fn bind(&mut self, device_counter: SessionId) {
        self.id = device_counter.next();
        self.state = SessionState::Active;
        debug!("Session bound to {} (device counter {})", self.id, device_counter);
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Moves on to the id for the next command
    pub fn advance(&mut self) {
        self.id.increment();
    }
}
