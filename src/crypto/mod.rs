/// Signing primitives.
///
/// Two key families live here: per-repo secp256k1 keys that sign commits and
/// service-auth JWTs, and the single server P-256 key that signs ES256 access
/// tokens and backs /oauth/jwks.
use crate::error::{PdsError, PdsResult};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use k256::ecdsa::signature::hazmat::PrehashVerifier;
use k256::ecdsa::signature::Signer;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::EncodePrivateKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Multicodec prefix for a secp256k1 public key in did:key
const MULTICODEC_SECP256K1: [u8; 2] = [0xe7, 0x01];

/// A secp256k1 keypair, as held per-repo and for PLC rotation
#[derive(Clone)]
pub struct K256Keypair {
    signing_key: k256::ecdsa::SigningKey,
}

impl K256Keypair {
    pub fn generate() -> Self {
        Self {
            signing_key: k256::ecdsa::SigningKey::random(&mut rand::thread_rng()),
        }
    }

    /// Load from the raw 32-byte private scalar
    pub fn from_bytes(bytes: &[u8]) -> PdsResult<Self> {
        let signing_key = k256::ecdsa::SigningKey::from_slice(bytes)
            .map_err(|e| PdsError::Internal(format!("invalid secp256k1 key: {}", e)))?;
        Ok(Self { signing_key })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.signing_key.to_bytes().to_vec()
    }

    /// SHA-256 the message and produce a low-S 64-byte R||S signature
    pub fn hash_and_sign(&self, msg: &[u8]) -> Vec<u8> {
        let sig: k256::ecdsa::Signature = self.signing_key.sign(msg);
        let sig = sig.normalize_s().unwrap_or(sig);
        sig.to_bytes().to_vec()
    }

    /// Verify a 64-byte R||S signature over SHA-256(msg)
    pub fn verify(&self, msg: &[u8], sig: &[u8]) -> bool {
        let Ok(signature) = k256::ecdsa::Signature::from_slice(sig) else {
            return false;
        };
        let digest = Sha256::digest(msg);
        self.signing_key
            .verifying_key()
            .verify_prehash(&digest, &signature)
            .or_else(|_| {
                // accept high-S signatures from older writers
                match signature.normalize_s() {
                    Some(normalized) => self
                        .signing_key
                        .verifying_key()
                        .verify_prehash(&digest, &normalized),
                    None => Err(k256::ecdsa::Error::new()),
                }
            })
            .is_ok()
    }

    /// did:key form of the public key (compressed point, base58btc)
    pub fn did_key(&self) -> String {
        let point = self.signing_key.verifying_key().to_encoded_point(true);
        let mut bytes = Vec::with_capacity(2 + point.as_bytes().len());
        bytes.extend_from_slice(&MULTICODEC_SECP256K1);
        bytes.extend_from_slice(point.as_bytes());
        format!("did:key:z{}", bs58::encode(bytes).into_string())
    }

    /// Sign a service-auth style JWT: header `{typ, alg: ES256K, crv}`,
    /// signature R||S base64url without padding.
    pub fn sign_jwt(&self, claims: &serde_json::Value) -> PdsResult<String> {
        let header = serde_json::json!({
            "typ": "JWT",
            "alg": "ES256K",
            "crv": "secp256k1",
        });
        let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).map_err(|e| {
            PdsError::Internal(format!("jwt header encoding failed: {}", e))
        })?);
        let claims_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).map_err(|e| {
            PdsError::Internal(format!("jwt claims encoding failed: {}", e))
        })?);

        let signing_input = format!("{}.{}", header_b64, claims_b64);
        let sig = self.hash_and_sign(signing_input.as_bytes());

        Ok(format!("{}.{}", signing_input, URL_SAFE_NO_PAD.encode(sig)))
    }
}

/// Server P-256 JWK on disk
#[derive(Debug, Serialize, Deserialize)]
struct StoredJwk {
    kty: String,
    crv: String,
    x: String,
    y: String,
    d: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

/// The server's P-256 key. Signs legacy session tokens and OAuth access
/// tokens (ES256); the public half is published at /oauth/jwks.
pub struct P256ServerKey {
    secret: p256::SecretKey,
    encoding_key: jsonwebtoken::EncodingKey,
    kid: String,
}

impl P256ServerKey {
    /// Load the JWK file, generating one on first boot.
    pub async fn load_or_generate(path: &Path) -> PdsResult<Self> {
        if tokio::fs::try_exists(path).await? {
            let bytes = tokio::fs::read(path).await?;
            let jwk: StoredJwk = serde_json::from_slice(&bytes)
                .map_err(|e| PdsError::Internal(format!("invalid server jwk: {}", e)))?;
            let d = URL_SAFE_NO_PAD
                .decode(&jwk.d)
                .map_err(|e| PdsError::Internal(format!("invalid server jwk d: {}", e)))?;
            let secret = p256::SecretKey::from_slice(&d)
                .map_err(|e| PdsError::Internal(format!("invalid server key: {}", e)))?;
            Self::from_secret(secret, jwk.kid)
        } else {
            let secret = p256::SecretKey::random(&mut rand::thread_rng());
            let key = Self::from_secret(secret, None)?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, serde_json::to_vec_pretty(&key.stored_jwk())?).await?;
            Ok(key)
        }
    }

    fn from_secret(secret: p256::SecretKey, kid: Option<String>) -> PdsResult<Self> {
        let pem = secret
            .to_pkcs8_pem(p256::pkcs8::LineEnding::LF)
            .map_err(|e| PdsError::Internal(format!("pkcs8 encoding failed: {}", e)))?;
        let encoding_key = jsonwebtoken::EncodingKey::from_ec_pem(pem.as_bytes())
            .map_err(|e| PdsError::Internal(format!("jwt key setup failed: {}", e)))?;

        let kid = kid.unwrap_or_else(|| {
            let (x, _) = public_coordinates(&secret);
            let digest = Sha256::digest(x.as_bytes());
            hex::encode(&digest[..8])
        });

        Ok(Self {
            secret,
            encoding_key,
            kid,
        })
    }

    fn stored_jwk(&self) -> serde_json::Value {
        let (x, y) = public_coordinates(&self.secret);
        serde_json::json!({
            "kty": "EC",
            "crv": "P-256",
            "x": x,
            "y": y,
            "d": URL_SAFE_NO_PAD.encode(self.secret.to_bytes()),
            "kid": self.kid,
        })
    }

    /// Sign claims as an ES256 JWT
    pub fn sign<T: Serialize>(&self, claims: &T) -> PdsResult<String> {
        let mut header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::ES256);
        header.kid = Some(self.kid.clone());
        jsonwebtoken::encode(&header, claims, &self.encoding_key)
            .map_err(|e| PdsError::Internal(format!("jwt signing failed: {}", e)))
    }

    /// Decoding key for verifying our own tokens
    pub fn decoding_key(&self) -> jsonwebtoken::DecodingKey {
        let (x, y) = public_coordinates(&self.secret);
        jsonwebtoken::DecodingKey::from_ec_components(&x, &y)
            .expect("server key coordinates are always valid")
    }

    /// Public key set for /oauth/jwks
    pub fn public_jwks(&self) -> serde_json::Value {
        let (x, y) = public_coordinates(&self.secret);
        serde_json::json!({
            "keys": [{
                "kty": "EC",
                "crv": "P-256",
                "x": x,
                "y": y,
                "use": "sig",
                "alg": "ES256",
                "kid": self.kid,
            }]
        })
    }
}

/// Affine x/y of the public point, each left-padded to 32 bytes, base64url
fn public_coordinates(secret: &p256::SecretKey) -> (String, String) {
    let point = secret.public_key().to_encoded_point(false);
    let x = left_pad_32(point.x().map(|x| x.to_vec()).unwrap_or_default());
    let y = left_pad_32(point.y().map(|y| y.to_vec()).unwrap_or_default());
    (URL_SAFE_NO_PAD.encode(x), URL_SAFE_NO_PAD.encode(y))
}

fn left_pad_32(bytes: Vec<u8>) -> [u8; 32] {
    let mut out = [0u8; 32];
    let offset = 32usize.saturating_sub(bytes.len());
    out[offset..].copy_from_slice(&bytes[bytes.len().saturating_sub(32)..]);
    out
}

/// Load a raw 32-byte hex secp256k1 key from disk, generating on first boot.
pub async fn load_or_generate_k256(path: &Path) -> PdsResult<K256Keypair> {
    if tokio::fs::try_exists(path).await? {
        let hex_str = tokio::fs::read_to_string(path).await?;
        let bytes = hex::decode(hex_str.trim())
            .map_err(|e| PdsError::Internal(format!("invalid rotation key hex: {}", e)))?;
        K256Keypair::from_bytes(&bytes)
    } else {
        let key = K256Keypair::generate();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, hex::encode(key.to_bytes())).await?;
        Ok(key)
    }
}
