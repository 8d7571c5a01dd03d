//! Per-connection AES-128-CBC body encryption.
//!
//! Bodies are padded with PKCS#7. The 16 key bytes double as the IV, which is
//! what existing clients speak; the key is exchanged out of band per connection.

use crate::error::FrameError;
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use std::fmt;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

pub const KEY_SIZE: usize = 16;

#[derive(Clone, PartialEq, Eq)]
pub struct CipherKey([u8; KEY_SIZE]);

impl CipherKey {
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, FrameError> {
        let key: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            let got = bytes.len();
            FrameError::InvalidConfig(format!("cipher key must be {KEY_SIZE} bytes, got {got}"))
        })?;
        Ok(Self(key))
    }

    /// Random key for a new connection.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    pub fn encrypt(&self, plain: &[u8]) -> Vec<u8> {
        Aes128CbcEnc::new(&self.0.into(), &self.0.into()).encrypt_padded_vec_mut::<Pkcs7>(plain)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, FrameError> {
        Aes128CbcDec::new(&self.0.into(), &self.0.into())
            .decrypt_padded_vec_mut::<Pkcs7>(data)
            .map_err(|_| {
                FrameError::Decrypt(format!("bad padding or length ({} bytes)", data.len()))
            })
    }
}

impl fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CipherKey(..)")
    }
}
