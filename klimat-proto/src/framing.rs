use crate::crypto::{self, BLOCK_SIZE};
use crate::{ProtocolError, Result, SessionId};
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

/// Raw bytes of the SHA-256 suffix on every frame
pub const CHECKSUM_LEN: usize = 32;

/// Raw bytes of the session prefix on every frame
pub const SESSION_PREFIX_LEN: usize = 4;

/// Pads to the next block boundary with bytes holding the pad length.
/// Aligned input gets no padding at all, unlike PKCS#7.
pub fn pad(data: &mut Vec<u8>) {
    let padding = (BLOCK_SIZE - data.len() % BLOCK_SIZE) % BLOCK_SIZE;
    data.resize(data.len() + padding, padding as u8);
}

/// Strips trailing bytes while they look like padding (1..=16).
///
/// Aligned messages sometimes arrive with an extra block of 0x10 bytes;
/// this loop removes that block as well.
pub fn unpad(data: &mut Vec<u8>) {
    while let Some(&last) = data.last() {
        if !(1..=BLOCK_SIZE as u8).contains(&last) {
            break;
        }
        data.pop();
    }
}

/// Builds a wire frame:
/// hex(session) | hex(ciphertext) | hex(sha256(hex(session) | hex(ciphertext)))
pub fn encode_message(session: SessionId, plaintext: &[u8]) -> Result<Vec<u8>> {
    if plaintext.is_empty() {
        return Err(ProtocolError::Format("cannot encode an empty message".to_string()));
    }

    let mut data = plaintext.to_vec();
    pad(&mut data);
    let ciphertext = crypto::encrypt(session, &data)?;

    let mut frame = session.hex();
    frame.push_str(&hex::encode_upper(&ciphertext));

    let checksum = Sha256::digest(frame.as_bytes());
    frame.push_str(&hex::encode_upper(checksum));

    debug!(
        "Encoded {} byte message under session {} ({} byte frame)",
        plaintext.len(),
        session,
        frame.len()
    );

    Ok(frame.into_bytes())
}

/// Decodes a frame and reports the session it was keyed with.
///
/// The checksum suffix is dropped without being verified. The caller decides
/// whether the embedded session is the one it expected.
pub fn decode_frame(frame: &[u8]) -> Result<(SessionId, Vec<u8>)> {
    let session = SessionId::parse(frame);
    let raw = hex::decode(frame)?;

    if raw.len() < SESSION_PREFIX_LEN + CHECKSUM_LEN {
        return Err(ProtocolError::Format(format!(
            "frame too short: {} bytes (min: {})",
            raw.len(),
            SESSION_PREFIX_LEN + CHECKSUM_LEN
        )));
    }

    let ciphertext = &raw[SESSION_PREFIX_LEN..raw.len() - CHECKSUM_LEN];
    trace!("Decoding {} bytes of ciphertext under session {}", ciphertext.len(), session);

    let mut plaintext = crypto::decrypt(session, ciphertext)?;
    unpad(&mut plaintext);

    Ok((session, plaintext))
}

/// Plaintext of a received frame, see [`decode_frame`]
pub fn decode_message(frame: &[u8]) -> Result<Vec<u8>> {
    decode_frame(frame).map(|(_, plaintext)| plaintext)
}
