use rand::rngs::OsRng;
use rand::RngCore;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};
use sha2::{Digest, Sha256};

use crate::constants::{SIGNATURE_SIZE, SIGNED_MESSAGE_PREFIX};
use crate::error::SignatureError;
use crate::types::Address;

/// A node's secp256k1 keypair. The compressed public key is the node
/// address.
#[derive(Clone)]
pub struct NodeKey {
    secret_key: SecretKey,
}

impl NodeKey {
    /// Generate a new random key
    pub fn generate() -> Self {
        loop {
            let mut bytes = [0u8; 32];
            OsRng.fill_bytes(&mut bytes);
            if let Ok(secret_key) = SecretKey::from_slice(&bytes) {
                return Self { secret_key };
            }
        }
    }

    /// Restore a key from secret bytes
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Result<Self, SignatureError> {
        let secret_key =
            SecretKey::from_slice(secret).map_err(|_| SignatureError::InvalidSecretKey)?;
        Ok(Self { secret_key })
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_secret_key(SECP256K1, &self.secret_key)
    }

    pub fn address(&self) -> Address {
        Address::from_pubkey_bytes(&self.public_key().serialize())
    }

    /// Sign a message, returning the 65-byte compact recoverable form.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let digest = Message::from_digest(signed_digest(message));
        let signature = SECP256K1.sign_ecdsa_recoverable(&digest, &self.secret_key);
        let (recovery_id, compact) = signature.serialize_compact();

        let mut out = Vec::with_capacity(SIGNATURE_SIZE);
        // 27 + recid, +4 for a compressed key
        out.push(31 + recovery_id.to_i32() as u8);
        out.extend_from_slice(&compact);
        out
    }
}

/// `sha256(sha256(prefix || message))`
pub fn signed_digest(message: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(SIGNED_MESSAGE_PREFIX);
    hasher.update(message);
    let first = hasher.finalize();
    Sha256::digest(first).into()
}

/// Recover the address that produced `signature` over `message`.
pub fn recover_address(message: &[u8], signature: &[u8]) -> Result<Address, SignatureError> {
    if signature.len() != SIGNATURE_SIZE {
        return Err(SignatureError::InvalidLength {
            expected: SIGNATURE_SIZE,
            got: signature.len(),
        });
    }

    let header = signature[0];
    let recid = match header {
        27..=30 => header - 27,
        31..=34 => header - 31,
        _ => return Err(SignatureError::InvalidHeader(header)),
    };
    let recovery_id = RecoveryId::from_i32(recid as i32)?;
    let recoverable = RecoverableSignature::from_compact(&signature[1..], recovery_id)?;

    let digest = Message::from_digest(signed_digest(message));
    let pubkey = SECP256K1.recover_ecdsa(&digest, &recoverable)?;
    Ok(Address::from_pubkey_bytes(&pubkey.serialize()))
}

/// Check that `signature` over `message` was produced by `sender`.
///
/// A missing sender or an empty signature is simply unverified.
pub fn verify(sender: Option<&Address>, signature: &[u8], message: &[u8]) -> bool {
    let Some(sender) = sender else {
        return false;
    };
    if signature.is_empty() {
        return false;
    }
    match recover_address(message, signature) {
        Ok(recovered) => &recovered == sender,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_then_recover() {
        let key = NodeKey::generate();
        let signature = key.sign(b"hello lightning");
        assert_eq!(signature.len(), SIGNATURE_SIZE);
        assert_eq!(recover_address(b"hello lightning", &signature).unwrap(), key.address());
    }

    #[test]
    fn test_verify() {
        let key = NodeKey::generate();
        let other = NodeKey::generate();
        let signature = key.sign(b"payload");

        assert!(verify(Some(&key.address()), &signature, b"payload"));
        assert!(!verify(Some(&other.address()), &signature, b"payload"));
        assert!(!verify(Some(&key.address()), &signature, b"tampered"));
        assert!(!verify(None, &signature, b"payload"));
        assert!(!verify(Some(&key.address()), &[], b"payload"));
    }

    #[test]
    fn test_bad_signature_shapes() {
        assert!(matches!(
            recover_address(b"m", &[0u8; 10]),
            Err(SignatureError::InvalidLength { .. })
        ));
        let mut sig = vec![0u8; SIGNATURE_SIZE];
        sig[0] = 99;
        assert!(matches!(
            recover_address(b"m", &sig),
            Err(SignatureError::InvalidHeader(99))
        ));
    }

    #[test]
    fn test_key_restore_is_deterministic() {
        let key = NodeKey::from_secret_bytes(&[7u8; 32]).unwrap();
        let again = NodeKey::from_secret_bytes(&[7u8; 32]).unwrap();
        assert_eq!(key.address(), again.address());
        assert!(NodeKey::from_secret_bytes(&[0u8; 32]).is_err());
    }
}
