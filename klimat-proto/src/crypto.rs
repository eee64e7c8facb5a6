use crate::{ProtocolError, Result, SessionId};
use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use md5::{Digest, Md5};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Cipher block size in bytes
pub const BLOCK_SIZE: usize = 16;

/// Prefix the firmware mixes into every key derivation
const MAGIC_WORD: &str = "JiangPan";

/// Derives the AES key and IV for a session:
/// MD5(magic | hex(session)), first half -> key, second half -> IV.
///
/// Each 8 byte half is hex encoded in uppercase and the resulting 16 ASCII
/// characters are used as the key/IV bytes.
pub fn derive_key_iv(session: SessionId) -> (String, String) {
    let digest = Md5::digest(format!("{}{}", MAGIC_WORD, session.hex()).as_bytes());
    let key = hex::encode_upper(&digest[..8]);
    let iv = hex::encode_upper(&digest[8..]);
    (key, iv)
}

/// AES-128-CBC encrypts block aligned data with the session's key
pub fn encrypt(session: SessionId, data: &[u8]) -> Result<Vec<u8>> {
    check_block_aligned(data)?;
    let (key, iv) = derive_key_iv(session);

    let cipher = Aes128CbcEnc::new_from_slices(key.as_bytes(), iv.as_bytes())
        .map_err(|e| ProtocolError::Crypto(format!("key setup failed: {}", e)))?;

    let mut buf = data.to_vec();
    let len = buf.len();
    cipher
        .encrypt_padded_mut::<NoPadding>(&mut buf, len)
        .map_err(|e| ProtocolError::Crypto(format!("encryption failed: {}", e)))?;
    Ok(buf)
}

/// AES-128-CBC decrypts block aligned data with the session's key
pub fn decrypt(session: SessionId, data: &[u8]) -> Result<Vec<u8>> {
    check_block_aligned(data)?;
    let (key, iv) = derive_key_iv(session);

    let cipher = Aes128CbcDec::new_from_slices(key.as_bytes(), iv.as_bytes())
        .map_err(|e| ProtocolError::Crypto(format!("key setup failed: {}", e)))?;

    let mut buf = data.to_vec();
    cipher
        .decrypt_padded_mut::<NoPadding>(&mut buf)
        .map_err(|e| ProtocolError::Crypto(format!("decryption failed: {}", e)))?;
    Ok(buf)
}

fn check_block_aligned(data: &[u8]) -> Result<()> {
    if data.len() % BLOCK_SIZE != 0 {
        return Err(ProtocolError::Format(format!(
            "cipher input of {} bytes is not a multiple of {}",
            data.len(),
            BLOCK_SIZE
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;

    #[test]
    fn test_known_key_iv() {
        let (key, iv) = derive_key_iv(SessionId::new(0x0000000B));
        assert_eq!(key, "2A564B6FD1B753B4");
        assert_eq!(iv, "DB4DB0F798FB6BD4");

        let (key, iv) = derive_key_iv(SessionId::new(0x12345678));
        assert_eq!(key, "52275D881651629A");
        assert_eq!(iv, "637A47B2119093B9");
    }

    #[test]
    fn test_key_iv_deterministic() {
        let id = SessionId::new(0xcafe);
        assert_eq!(derive_key_iv(id), derive_key_iv(id));
        assert_ne!(derive_key_iv(id), derive_key_iv(id.next()));
    }

    #[test]
    fn test_key_iv_unique_across_sessions() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut ids = HashSet::new();
        while ids.len() < 10_000 {
            ids.insert(SessionId::new(rng.gen()));
        }

        let pairs: HashSet<(String, String)> = ids.iter().map(|id| derive_key_iv(*id)).collect();
        assert_eq!(pairs.len(), ids.len());

        for (key, iv) in pairs.iter().take(10) {
            assert_eq!(key.len(), 16);
            assert_eq!(iv.len(), 16);
            assert_eq!(key, &key.to_uppercase());
        }
    }

    #[test]
    fn test_encrypt_decrypt() {
        let id = SessionId::new(77);
        let data = b"0123456789abcdef0123456789ABCDEF";

        let ciphertext = encrypt(id, data).unwrap();
        assert_eq!(ciphertext.len(), data.len());
        assert_ne!(&ciphertext[..], &data[..]);

        assert_eq!(decrypt(id, &ciphertext).unwrap(), data);
    }

    #[test]
    fn test_unaligned_input_rejected() {
        let id = SessionId::new(1);
        assert!(matches!(encrypt(id, b"short"), Err(ProtocolError::Format(_))));
        assert!(matches!(decrypt(id, &[0u8; 17]), Err(ProtocolError::Format(_))));
    }
}
