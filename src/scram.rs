//! Server-side SCRAM-SHA-256: verification of client proofs against stored
//! credentials, and derivation of stored credentials at CREATE USER time.

use base64::engine::general_purpose;
use base64::Engine;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac_array;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::errors::Error;

type HmacSha = Hmac<Sha256>;

pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";
pub const SCRAM_ITERATIONS: u32 = 4096;
const SERVER_NONCE_LEN: usize = 18;
const SALT_LEN: usize = 16;

/// Stored credentials in the canonical form
/// `SCRAM-SHA-256$<iterations>:<base64 salt>$<base64 stored>:<base64 server>`.
pub struct ServerSecret {
    pub iterations: u32,
    pub salt_base64: String,
    pub stored_key: Vec<u8>,
    pub server_key: Vec<u8>,
}

pub fn parse_server_secret(data: &str) -> Result<ServerSecret, Error> {
    let malformed = || Error::ScramError("password secret is not scram".to_string());

    let rest = match data.split_once('$') {
        Some((mechanism, rest)) if mechanism == SCRAM_SHA_256 => rest,
        _ => return Err(malformed()),
    };
    let (iterations, rest) = match rest.split_once(':') {
        Some((iter_str, rest)) => (iter_str.parse::<u32>().map_err(|_| malformed())?, rest),
        None => return Err(malformed()),
    };
    let (salt, keys) = rest.split_once('$').ok_or_else(malformed)?;
    general_purpose::STANDARD
        .decode(salt)
        .map_err(|_| malformed())?;
    let (stored_key, server_key) = keys.split_once(':').ok_or_else(malformed)?;

    Ok(ServerSecret {
        iterations,
        salt_base64: salt.to_string(),
        stored_key: general_purpose::STANDARD
            .decode(stored_key)
            .map_err(|_| malformed())?,
        server_key: general_purpose::STANDARD
            .decode(server_key)
            .map_err(|_| malformed())?,
    })
}

/// Derives stored credentials for a plaintext password: random salt, the
/// canonical iteration count, stored-key = H(HMAC(salted, "Client Key")),
/// server-key = HMAC(salted, "Server Key").
pub fn scram_sha256_hash(password: &str) -> String {
    let salt: [u8; SALT_LEN] = rand::rng().random();
    let salted = pbkdf2_hmac_array::<Sha256, 32>(password.as_bytes(), &salt, SCRAM_ITERATIONS);
    let client_key = hmac_sha256(&salted, b"Client Key");
    let stored_key = Sha256::digest(client_key);
    let server_key = hmac_sha256(&salted, b"Server Key");
    format!(
        "{}${}:{}${}:{}",
        SCRAM_SHA_256,
        SCRAM_ITERATIONS,
        general_purpose::STANDARD.encode(salt),
        general_purpose::STANDARD.encode(stored_key),
        general_purpose::STANDARD.encode(server_key),
    )
}

/// Splits the comma-separated `k=v` attribute form used throughout the
/// exchange. Malformed pairs are skipped.
pub fn parse_sasl_attributes(data: &[u8]) -> HashMap<String, String> {
    let mut attributes = HashMap::new();
    for pair in data.split(|&b| b == b',') {
        let Some(eq) = pair.iter().position(|&b| b == b'=') else {
            continue;
        };
        attributes.insert(
            String::from_utf8_lossy(&pair[..eq]).into_owned(),
            String::from_utf8_lossy(&pair[eq + 1..]).into_owned(),
        );
    }
    attributes
}

pub fn client_nonce(initial_data: &[u8]) -> Result<String, Error> {
    parse_sasl_attributes(initial_data)
        .remove("r")
        .ok_or_else(|| Error::ScramError("client nonce not found".to_string()))
}

/// Produces the combined nonce and the server-first message
/// `r=<combined>,s=<salt>,i=<iterations>`. The server contribution is 18
/// random bytes, base64 without padding.
pub fn server_first_message(
    client_nonce: &str,
    salt_base64: &str,
    iterations: u32,
) -> (String, String) {
    let server_nonce: [u8; SERVER_NONCE_LEN] = rand::rng().random();
    let combined = format!(
        "{client_nonce}{}",
        general_purpose::STANDARD_NO_PAD.encode(server_nonce)
    );
    let server_first = format!("r={combined},s={salt_base64},i={iterations}");
    (combined, server_first)
}

/// The auth message both sides sign:
/// `n=,r=<client nonce>,<server-first>,c=biws,r=<combined>`.
pub fn auth_message(client_nonce: &str, server_first: &str, combined_nonce: &str) -> String {
    format!("n=,r={client_nonce},{server_first},c=biws,r={combined_nonce}")
}

/// Verifies the client proof: client-signature = HMAC(stored-key, auth);
/// the candidate client key is proof XOR client-signature and must hash to
/// the stored key.
pub fn verify_client_proof(stored_key: &[u8], auth_message: &str, proof: &[u8]) -> bool {
    let client_signature = hmac_sha256(stored_key, auth_message.as_bytes());
    if proof.len() != client_signature.len() {
        return false;
    }
    let client_key: Vec<u8> = proof
        .iter()
        .zip(client_signature.iter())
        .map(|(p, s)| p ^ s)
        .collect();
    let computed = Sha256::digest(&client_key);
    // Constant-time comparison.
    if computed.len() != stored_key.len() {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in computed.iter().zip(stored_key.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}

/// `v=<base64 HMAC(server-key, auth-message)>`.
pub fn server_final_message(server_key: &[u8], auth_message: &str) -> String {
    format!(
        "v={}",
        general_purpose::STANDARD.encode(hmac_sha256(server_key, auth_message.as_bytes()))
    )
}

pub fn hmac_sha256(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn good_parse_server_secret() {
        let result = parse_server_secret(
            "SCRAM-SHA-256$4096:L6Nhfyy6pos5mpvTRXQOTQ==$RMoA1BGLjB/LmVJ2iP5N91E0ri/9siV5E3D5DEvfqXU=:/aRx7mRpU0txwFSzZ5lcj/u/FHCc503fUfGrF12nGx0=",
        )
        .unwrap();
        assert_eq!(4096, result.iterations);
        assert_eq!("L6Nhfyy6pos5mpvTRXQOTQ==", result.salt_base64);
        assert_eq!(32, result.stored_key.len());
        assert_eq!(32, result.server_key.len());
    }

    #[test]
    fn bad_parse_server_secret() {
        assert!(parse_server_secret("SCRAM-SHA-256$4096:").is_err());
        assert!(parse_server_secret("md5abcdef").is_err());
        assert!(parse_server_secret("").is_err());
    }

    #[test]
    fn hash_round_trips_through_parse() {
        let secret = scram_sha256_hash("secret");
        let parsed = parse_server_secret(&secret).unwrap();
        assert_eq!(parsed.iterations, SCRAM_ITERATIONS);
        assert_eq!(parsed.stored_key.len(), 32);
        assert_eq!(parsed.server_key.len(), 32);
    }

    #[test]
    fn attribute_parsing() {
        let attrs = parse_sasl_attributes(b"c=biws,r=abc,p=cHJvb2Y=");
        assert_eq!(attrs.get("r").unwrap(), "abc");
        assert_eq!(attrs.get("p").unwrap(), "cHJvb2Y=");
        assert_eq!(client_nonce(b"n=,r=nonce123").unwrap(), "nonce123");
        assert!(client_nonce(b"n=user").is_err());
    }

    /// Plays both roles of the exchange: the proof built from the right
    /// password verifies, any other password does not.
    #[test]
    fn scram_round_trip() {
        use pbkdf2::pbkdf2_hmac_array;
        use sha2::Sha256;

        let secret = parse_server_secret(&scram_sha256_hash("hunter2")).unwrap();
        let (combined, server_first) =
            server_first_message("clientnonce", &secret.salt_base64, secret.iterations);
        assert!(combined.starts_with("clientnonce"));
        assert!(server_first.starts_with(&format!("r={combined},s=")));

        let auth = auth_message("clientnonce", &server_first, &combined);

        let client_proof = |password: &str| -> Vec<u8> {
            let salt = base64::engine::general_purpose::STANDARD
                .decode(&secret.salt_base64)
                .unwrap();
            let salted =
                pbkdf2_hmac_array::<Sha256, 32>(password.as_bytes(), &salt, secret.iterations);
            let client_key = hmac_sha256(&salted, b"Client Key");
            let stored_key = Sha256::digest(&client_key);
            let signature = hmac_sha256(&stored_key, auth.as_bytes());
            client_key
                .iter()
                .zip(signature.iter())
                .map(|(k, s)| k ^ s)
                .collect()
        };

        assert!(verify_client_proof(
            &secret.stored_key,
            &auth,
            &client_proof("hunter2")
        ));
        assert!(!verify_client_proof(
            &secret.stored_key,
            &auth,
            &client_proof("hunter3")
        ));

        let fin = server_final_message(&secret.server_key, &auth);
        assert!(fin.starts_with("v="));
    }
}
