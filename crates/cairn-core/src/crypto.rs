//! Authenticated boxes and content-addressed naming.
//!
//! Two constructions cover every ciphertext in the system:
//!
//! - [`SecretBox`]: XChaCha20-Poly1305 with a fresh random 24-byte nonce
//!   prepended, so every box costs [`SYM_OVERHEAD`] bytes over its payload.
//! - the hybrid sealed box ([`seal`] / [`unseal`]): ML-KEM-1024
//!   encapsulation plus an ephemeral X25519 exchange, HKDF-SHA3-384 into a
//!   one-shot [`SecretBox`]. The envelope prefix is fixed-size
//!   ([`SEALED_OVERHEAD`]); decryption rejects anything shorter instead of
//!   probing alternative layouts.

use aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use sha3::Sha3_384;
use zeroize::Zeroize;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;

use pqcrypto_mlkem::mlkem1024;
use pqcrypto_traits::kem::{Ciphertext as _, SharedSecret as _};

use crate::error::{Error, Result};
use crate::keys::{PublicKey, SecretKey};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 24;
pub const MAC_SIZE: usize = 16;
/// Per-message overhead of a [`SecretBox`]: nonce plus Poly1305 tag.
pub const SYM_OVERHEAD: usize = NONCE_SIZE + MAC_SIZE;

pub const MLKEM_PK_LEN: usize = 1568;
pub const MLKEM_SK_LEN: usize = 3168;
pub const MLKEM_CT_LEN: usize = 1568;
pub const X25519_KEY_LEN: usize = 32;
/// Fixed prefix of a sealed envelope: KEM ciphertext, ephemeral X25519
/// public key, then a [`SecretBox`] over the payload. Part of the file
/// format; manifests and chunks written with a different construction are
/// rejected, not probed.
pub const SEALED_OVERHEAD: usize = MLKEM_CT_LEN + X25519_KEY_LEN + SYM_OVERHEAD;

/// Symmetric authenticated box. Output layout: `nonce ‖ ciphertext ‖ tag`.
pub struct SecretBox {
    cipher: XChaCha20Poly1305,
}

impl SecretBox {
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        SecretBox {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let boxed = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| Error::Codec("aead seal failed".into()))?;
        let mut out = Vec::with_capacity(NONCE_SIZE + boxed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&boxed);
        Ok(out)
    }

    pub fn decrypt(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        if bytes.len() < SYM_OVERHEAD {
            return Err(Error::CryptoAuth("truncated box"));
        }
        let (nonce, boxed) = bytes.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(XNonce::from_slice(nonce), boxed)
            .map_err(|_| Error::CryptoAuth("tag mismatch"))
    }
}

/// HMAC-SHA256.
pub fn keyed_hash(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac =
        <Hmac<Sha256> as Mac>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Content-addressed name of a chunk: URL-safe base64 (44 chars, trailing
/// `=`) of `HMAC-SHA256(secret, plaintext)`.
///
/// Deterministic in `(plaintext, secret)`, so identical chunks collide by
/// name across files and runs; without the secret, the name of a chosen
/// plaintext cannot be precomputed.
pub fn blob_name(plaintext: &[u8], secret: &[u8; KEY_SIZE]) -> String {
    URL_SAFE.encode(keyed_hash(secret, plaintext))
}

fn seal_key(kem_ss: &[u8], x_ss: &[u8], eph_pk: &[u8]) -> [u8; KEY_SIZE] {
    let mut ikm = Vec::with_capacity(kem_ss.len() + x_ss.len());
    ikm.extend_from_slice(kem_ss);
    ikm.extend_from_slice(x_ss);

    let mut info = b"cairn/seal/key".to_vec();
    info.extend_from_slice(eph_pk);

    let hk = Hkdf::<Sha3_384>::new(Some(b"cairn/seal/v1"), &ikm);
    let mut out = [0u8; KEY_SIZE];
    hk.expand(&info, &mut out).expect("HKDF expand");
    ikm.zeroize();
    out
}

/// Anonymous hybrid sealing: anyone holding the public key can produce an
/// envelope only the private key can open.
pub fn seal(pk: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let (ss, kem_ct) = mlkem1024::encapsulate(&pk.kem);

    let eph = x25519_dalek::StaticSecret::random_from_rng(rand::rngs::OsRng);
    let eph_pk = x25519_dalek::PublicKey::from(&eph);
    let x_ss = eph.diffie_hellman(&pk.dh);

    let mut key = seal_key(ss.as_bytes(), x_ss.as_bytes(), eph_pk.as_bytes());
    let boxed = SecretBox::new(&key).encrypt(plaintext)?;
    key.zeroize();

    let mut out = Vec::with_capacity(SEALED_OVERHEAD + plaintext.len());
    out.extend_from_slice(kem_ct.as_bytes());
    out.extend_from_slice(eph_pk.as_bytes());
    out.extend_from_slice(&boxed);
    Ok(out)
}

pub fn unseal(sk: &SecretKey, bytes: &[u8]) -> Result<Vec<u8>> {
    if bytes.len() < SEALED_OVERHEAD {
        return Err(Error::CryptoAuth("sealed envelope too short"));
    }
    let kem_ct = mlkem1024::Ciphertext::from_bytes(&bytes[..MLKEM_CT_LEN])
        .map_err(|_| Error::CryptoAuth("malformed KEM ciphertext"))?;
    let mut eph_pk = [0u8; X25519_KEY_LEN];
    eph_pk.copy_from_slice(&bytes[MLKEM_CT_LEN..MLKEM_CT_LEN + X25519_KEY_LEN]);

    let ss = mlkem1024::decapsulate(&kem_ct, &sk.kem);
    let x_ss = sk.dh.diffie_hellman(&x25519_dalek::PublicKey::from(eph_pk));

    let mut key = seal_key(ss.as_bytes(), x_ss.as_bytes(), &eph_pk);
    let plaintext = SecretBox::new(&key).decrypt(&bytes[MLKEM_CT_LEN + X25519_KEY_LEN..]);
    key.zeroize();
    plaintext
}

/// The box that encrypts chunks and the manifest body.
///
/// Symmetric in keyfile/passphrase mode; a sealed box over the hybrid
/// keypair in asymmetric mode, where the encrypt-only variant holds just
/// the public key.
pub enum DataBox {
    Symmetric(SecretBox),
    Seal(PublicKey),
    Open(SecretKey),
}

impl DataBox {
    /// Constant per-message overhead of this box, as written on disk.
    pub fn overhead(&self) -> usize {
        match self {
            DataBox::Symmetric(_) => SYM_OVERHEAD,
            DataBox::Seal(_) | DataBox::Open(_) => SEALED_OVERHEAD,
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        match self {
            DataBox::Symmetric(sbox) => sbox.encrypt(plaintext),
            DataBox::Seal(pk) => seal(pk, plaintext),
            DataBox::Open(sk) => seal(&sk.public, plaintext),
        }
    }

    pub fn decrypt(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        match self {
            DataBox::Symmetric(sbox) => sbox.decrypt(bytes),
            DataBox::Seal(_) => Err(Error::CryptoAuth(
                "sealed box requires the private key",
            )),
            DataBox::Open(sk) => unseal(sk, bytes),
        }
    }
}
