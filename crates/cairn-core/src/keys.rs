//! Content secret derivation and the hybrid keypair.
//!
//! The 32-byte content secret `S` names blobs and encrypts the manifest
//! index. It is derived once per invocation and never persisted:
//!
//! - from a passphrase, via Argon2id (prompted passphrases are weak, the
//!   memory-hard KDF makes up some of the difference);
//! - from a keyfile, via streamed SHA-256 (keyfiles are assumed to already
//!   be high-entropy);
//! - in asymmetric mode, from the public key material itself, so that a
//!   holder of only the public key can still read manifest indexes and
//!   answer "which chunks have I already uploaded".

use std::io::Read;
use std::path::Path;

use secrecy::{ExposeSecret, Secret};
use sha2::{Digest, Sha256};

use pqcrypto_mlkem::mlkem1024;
use pqcrypto_traits::kem::{PublicKey as _, SecretKey as _};

use crate::crypto::{
    self, DataBox, SecretBox, KEY_SIZE, MLKEM_PK_LEN, MLKEM_SK_LEN, X25519_KEY_LEN,
};
use crate::error::{Error, Result};

/// Opt-in environment variable: when set in public-key mode, the content
/// secret becomes `HMAC-SHA256(passphrase, public key material)` instead of
/// `SHA-256(public key material)`. Manifests written with and without the
/// mix do not interoperate.
pub const INDEX_PASSPHRASE_ENV: &str = "CAIRN_INDEX_PASSPHRASE";

const PK_MAGIC: &[u8; 10] = b"cairn/pk1\n";
const SK_MAGIC: &[u8; 10] = b"cairn/sk1\n";

const PK_BODY_LEN: usize = MLKEM_PK_LEN + X25519_KEY_LEN;
const SK_BODY_LEN: usize = MLKEM_SK_LEN + X25519_KEY_LEN + PK_BODY_LEN;

/// The 32-byte content secret. Zeroed on drop.
pub struct ContentSecret(Secret<[u8; KEY_SIZE]>);

impl ContentSecret {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        ContentSecret(Secret::new(bytes))
    }

    /// Memory-hard KDF over a passphrase, with `SHA-256(passphrase)` as the
    /// salt-equivalent.
    pub fn from_passphrase(passphrase: &str) -> Result<Self> {
        use argon2::{Algorithm, Argon2, Params, Version};

        let salt: [u8; KEY_SIZE] = Sha256::digest(passphrase.as_bytes()).into();
        let params = Params::new(102_400, 8, 8, Some(KEY_SIZE))
            .map_err(|e| Error::Key(format!("argon2 parameters: {e}")))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut out = [0u8; KEY_SIZE];
        argon2
            .hash_password_into(passphrase.as_bytes(), &salt, &mut out)
            .map_err(|e| Error::Key(format!("argon2: {e}")))?;
        Ok(ContentSecret::from_bytes(out))
    }

    /// SHA-256 over the file contents, streamed in 16 KiB buffers.
    pub fn from_keyfile(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| Error::io(path, e))?;
        Self::digest_reader(file, &[]).map_err(|e| Error::io(path, e))
    }

    fn digest_reader(mut reader: impl Read, prefix: &[u8]) -> std::io::Result<Self> {
        let mut hasher = Sha256::new();
        hasher.update(prefix);
        let mut buffer = [0u8; 16384];
        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        Ok(ContentSecret::from_bytes(hasher.finalize().into()))
    }

    /// Derive the content secret from public key material, mixing in the
    /// passphrase from [`INDEX_PASSPHRASE_ENV`] when present.
    pub fn from_public_key(pk: &PublicKey) -> Self {
        let passphrase = std::env::var(INDEX_PASSPHRASE_ENV).ok();
        Self::from_public_key_with(pk, passphrase.as_deref())
    }

    fn from_public_key_with(pk: &PublicKey, passphrase: Option<&str>) -> Self {
        let material = pk.material();
        let digest = match passphrase {
            Some(pw) => crypto::keyed_hash(pw.as_bytes(), &material),
            None => Sha256::digest(&material).into(),
        };
        ContentSecret::from_bytes(digest)
    }

    pub fn expose(&self) -> &[u8; KEY_SIZE] {
        self.0.expose_secret()
    }
}

/// Hybrid public key: ML-KEM-1024 plus X25519.
#[derive(Clone)]
pub struct PublicKey {
    pub(crate) kem: mlkem1024::PublicKey,
    pub(crate) dh: x25519_dalek::PublicKey,
}

impl PublicKey {
    /// Raw key material, KEM key first. This is also the input to the
    /// public-key-mode content secret.
    pub fn material(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PK_BODY_LEN);
        out.extend_from_slice(self.kem.as_bytes());
        out.extend_from_slice(self.dh.as_bytes());
        out
    }

    pub fn keyfile_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PK_MAGIC.len() + PK_BODY_LEN);
        out.extend_from_slice(PK_MAGIC);
        out.extend_from_slice(&self.material());
        out
    }

    fn from_body(body: &[u8]) -> Result<Self> {
        if body.len() != PK_BODY_LEN {
            return Err(Error::Key(format!(
                "public keyfile body must be {PK_BODY_LEN} bytes, got {}",
                body.len()
            )));
        }
        let kem = mlkem1024::PublicKey::from_bytes(&body[..MLKEM_PK_LEN])
            .map_err(|_| Error::Key("malformed ML-KEM public key".into()))?;
        let mut dh = [0u8; X25519_KEY_LEN];
        dh.copy_from_slice(&body[MLKEM_PK_LEN..]);
        Ok(PublicKey {
            kem,
            dh: x25519_dalek::PublicKey::from(dh),
        })
    }
}

/// Hybrid secret key. Carries the public half so the content secret is
/// derivable from the private keyfile alone.
#[derive(Clone)]
pub struct SecretKey {
    pub(crate) kem: mlkem1024::SecretKey,
    pub(crate) dh: x25519_dalek::StaticSecret,
    pub(crate) public: PublicKey,
}

impl SecretKey {
    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub fn keyfile_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SK_MAGIC.len() + SK_BODY_LEN);
        out.extend_from_slice(SK_MAGIC);
        out.extend_from_slice(self.kem.as_bytes());
        out.extend_from_slice(self.dh.as_bytes());
        out.extend_from_slice(&self.public.material());
        out
    }

    fn from_body(body: &[u8]) -> Result<Self> {
        if body.len() != SK_BODY_LEN {
            return Err(Error::Key(format!(
                "private keyfile body must be {SK_BODY_LEN} bytes, got {}",
                body.len()
            )));
        }
        let kem = mlkem1024::SecretKey::from_bytes(&body[..MLKEM_SK_LEN])
            .map_err(|_| Error::Key("malformed ML-KEM secret key".into()))?;
        let mut dh = [0u8; X25519_KEY_LEN];
        dh.copy_from_slice(&body[MLKEM_SK_LEN..MLKEM_SK_LEN + X25519_KEY_LEN]);
        let public = PublicKey::from_body(&body[MLKEM_SK_LEN + X25519_KEY_LEN..])?;
        Ok(SecretKey {
            kem,
            dh: x25519_dalek::StaticSecret::from(dh),
            public,
        })
    }
}

pub struct Keypair {
    pub public: PublicKey,
    pub secret: SecretKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let (kem_pk, kem_sk) = mlkem1024::keypair();
        let dh_sk = x25519_dalek::StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey {
            kem: kem_pk,
            dh: x25519_dalek::PublicKey::from(&dh_sk),
        };
        Keypair {
            secret: SecretKey {
                kem: kem_sk,
                dh: dh_sk,
                public: public.clone(),
            },
            public,
        }
    }
}

/// What a `--encrypt=`/`--decrypt=` argument resolved to.
pub enum KeyMaterial {
    /// A plain keyfile: one symmetric secret for everything.
    Symmetric(ContentSecret),
    /// A `cairn/pk1` keyfile: encrypt and index only.
    Public(PublicKey),
    /// A `cairn/sk1` keyfile: full access.
    Secret(SecretKey),
}

impl KeyMaterial {
    /// Sniff the keyfile format. Files that do not start with a cairn key
    /// magic are treated as raw symmetric keyfiles and digested whole.
    pub fn load(path: &Path) -> Result<KeyMaterial> {
        let mut file = std::fs::File::open(path).map_err(|e| Error::io(path, e))?;
        let mut head = [0u8; 10];
        let mut got = 0;
        while got < head.len() {
            let n = file
                .read(&mut head[got..])
                .map_err(|e| Error::io(path, e))?;
            if n == 0 {
                break;
            }
            got += n;
        }

        if got == head.len() && (head == *PK_MAGIC || head == *SK_MAGIC) {
            let mut body = Vec::new();
            file.read_to_end(&mut body).map_err(|e| Error::io(path, e))?;
            return if head == *PK_MAGIC {
                Ok(KeyMaterial::Public(PublicKey::from_body(&body)?))
            } else {
                Ok(KeyMaterial::Secret(SecretKey::from_body(&body)?))
            };
        }

        let secret = ContentSecret::digest_reader(file, &head[..got])
            .map_err(|e| Error::io(path, e))?;
        Ok(KeyMaterial::Symmetric(secret))
    }
}

/// The keys one invocation works with: the content secret, the index box it
/// keys, and the data box for chunks and the manifest body.
pub struct KeySet {
    pub secret: ContentSecret,
    pub index_box: SecretBox,
    pub data_box: DataBox,
}

impl KeySet {
    pub fn symmetric(secret: ContentSecret) -> Self {
        let index_box = SecretBox::new(secret.expose());
        let data_box = DataBox::Symmetric(SecretBox::new(secret.expose()));
        KeySet {
            secret,
            index_box,
            data_box,
        }
    }

    pub fn seal_only(pk: PublicKey) -> Self {
        let secret = ContentSecret::from_public_key(&pk);
        let index_box = SecretBox::new(secret.expose());
        KeySet {
            secret,
            index_box,
            data_box: DataBox::Seal(pk),
        }
    }

    pub fn open(sk: SecretKey) -> Self {
        let secret = ContentSecret::from_public_key(&sk.public);
        let index_box = SecretBox::new(secret.expose());
        KeySet {
            secret,
            index_box,
            data_box: DataBox::Open(sk),
        }
    }

    pub fn from_material(material: KeyMaterial) -> Self {
        match material {
            KeyMaterial::Symmetric(secret) => KeySet::symmetric(secret),
            KeyMaterial::Public(pk) => KeySet::seal_only(pk),
            KeyMaterial::Secret(sk) => KeySet::open(sk),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyfile_secret_matches_sha256() {
        let dir = tempfile::tempdir().unwrap();
        let keyfile = dir.path().join("key");
        std::fs::write(&keyfile, b"not a very good key").unwrap();

        let secret = ContentSecret::from_keyfile(&keyfile).unwrap();
        let expected: [u8; 32] = Sha256::digest(b"not a very good key").into();
        assert_eq!(secret.expose(), &expected);
    }

    #[test]
    fn keyfile_roundtrip_public_and_secret() {
        let pair = Keypair::generate();

        let pk_bytes = pair.public.keyfile_bytes();
        let sk_bytes = pair.secret.keyfile_bytes();
        assert_eq!(pk_bytes.len(), PK_MAGIC.len() + PK_BODY_LEN);
        assert_eq!(sk_bytes.len(), SK_MAGIC.len() + SK_BODY_LEN);

        let dir = tempfile::tempdir().unwrap();
        let pk_path = dir.path().join("pair.pub");
        let sk_path = dir.path().join("pair.key");
        std::fs::write(&pk_path, &pk_bytes).unwrap();
        std::fs::write(&sk_path, &sk_bytes).unwrap();

        match KeyMaterial::load(&pk_path).unwrap() {
            KeyMaterial::Public(pk) => assert_eq!(pk.material(), pair.public.material()),
            _ => panic!("expected public key material"),
        }
        match KeyMaterial::load(&sk_path).unwrap() {
            KeyMaterial::Secret(sk) => {
                assert_eq!(sk.public.material(), pair.public.material())
            }
            _ => panic!("expected secret key material"),
        }
    }

    #[test]
    fn truncated_keypair_file_is_rejected() {
        let pair = Keypair::generate();
        let mut bytes = pair.public.keyfile_bytes();
        bytes.truncate(bytes.len() - 1);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.pub");
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(KeyMaterial::load(&path), Err(Error::Key(_))));
    }

    #[test]
    fn short_symmetric_keyfile_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny");
        std::fs::write(&path, b"abc").unwrap();
        assert!(matches!(
            KeyMaterial::load(&path),
            Ok(KeyMaterial::Symmetric(_))
        ));
    }

    #[test]
    fn public_key_secret_is_stable_and_passphrase_sensitive() {
        let pair = Keypair::generate();
        let plain_a = ContentSecret::from_public_key_with(&pair.public, None);
        let plain_b = ContentSecret::from_public_key_with(&pair.public, None);
        let mixed = ContentSecret::from_public_key_with(&pair.public, Some("hunter2"));
        assert_eq!(plain_a.expose(), plain_b.expose());
        assert_ne!(plain_a.expose(), mixed.expose());
    }

    #[test]
    fn passphrase_kdf_is_deterministic() {
        let a = ContentSecret::from_passphrase("correct horse").unwrap();
        let b = ContentSecret::from_passphrase("correct horse").unwrap();
        assert_eq!(a.expose(), b.expose());
    }
}
