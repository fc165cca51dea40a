use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha512};

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

pub fn hmac_sha256_hex(secret: &str, data: &str) -> String {
    // HMAC accepts keys of any length
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(data.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub fn hmac_sha512_hex(secret: &str, data: &str) -> String {
    let mut mac = HmacSha512::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(data.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of a hex signature.
pub fn verify_sha256_hex(secret: &str, data: &str, signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(data.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

pub fn verify_sha512_hex(secret: &str, data: &str, signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha512::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(data.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_roundtrip_and_tamper() {
        let sig = hmac_sha256_hex("secret", "amount=1000&orderId=A");
        assert_eq!(sig.len(), 64);
        assert!(verify_sha256_hex("secret", "amount=1000&orderId=A", &sig));
        assert!(verify_sha256_hex("secret", "amount=1000&orderId=A", &sig.to_uppercase()));
        assert!(!verify_sha256_hex("secret", "amount=9000&orderId=A", &sig));
        assert!(!verify_sha256_hex("secret", "amount=1000&orderId=A", "not-hex"));
    }

    #[test]
    fn test_sha512_known_length() {
        let sig = hmac_sha512_hex("key", "vnp_Amount=100");
        assert_eq!(sig.len(), 128);
        assert!(verify_sha512_hex("key", "vnp_Amount=100", &sig));
        assert!(!verify_sha512_hex("other", "vnp_Amount=100", &sig));
    }
}
