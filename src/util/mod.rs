//! Input transforms and auxiliary helpers.

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Number, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Coerce every top-level string property to a number when parseable,
/// leaving non-numeric values untouched. The named built-in tap used by
/// query-string routes whose schemas expect numbers.
pub fn try_parse_number_properties(value: Value) -> Value {
    let Value::Object(map) = value else {
        return value;
    };

    let coerced = map
        .into_iter()
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) => match parse_number(&s) {
                    Some(n) => Value::Number(n),
                    None => Value::String(s),
                },
                other => other,
            };
            (k, v)
        })
        .collect();

    Value::Object(coerced)
}

fn parse_number(s: &str) -> Option<Number> {
    if let Ok(i) = s.parse::<i64>() {
        return Some(Number::from(i));
    }
    s.parse::<f64>().ok().and_then(Number::from_f64)
}

/// A tap coercing only the named keys to floats when parseable.
pub fn number_parser(keys: &'static [&'static str]) -> crate::registry::Tap {
    crate::registry::Tap::func(move |mut value| {
        if let Value::Object(map) = &mut value {
            for key in keys {
                if let Some(Value::String(s)) = map.get(*key) {
                    if let Some(n) = s.parse::<f64>().ok().and_then(Number::from_f64) {
                        map.insert((*key).to_string(), Value::Number(n));
                    }
                }
            }
        }
        value
    })
}

/// HS256 JWT helper bound to the application's signing secret.
pub struct Jwt {
    encoding: jsonwebtoken::EncodingKey,
    decoding: jsonwebtoken::DecodingKey,
}

impl Jwt {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
            decoding: jsonwebtoken::DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn sign<T: Serialize>(&self, claims: &T) -> anyhow::Result<String> {
        Ok(jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            claims,
            &self.encoding,
        )?)
    }

    /// Decode and verify a token; any verification failure yields `None`.
    pub fn verify<T: DeserializeOwned>(&self, token: &str) -> Option<T> {
        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
        validation.required_spec_claims.clear();
        validation.validate_exp = false;
        jsonwebtoken::decode::<T>(token, &self.decoding, &validation)
            .ok()
            .map(|data| data.claims)
    }
}

/// A v4 UUID with an optional prefix.
pub fn uuid_with_prefix(prefix: &str) -> String {
    format!("{prefix}{}", Uuid::new_v4())
}

/// A random lowercase-hex string of the given length.
pub fn random_string(length: usize) -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| HEX[rng.gen_range(0..HEX.len())] as char)
        .collect()
}

/// Lowercase-hex SHA-256 digest.
pub fn sha256_hex(input: &[u8]) -> String {
    let digest = Sha256::digest(input);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
