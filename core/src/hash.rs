use crate::error::{Error, Result};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::marker::PhantomData;

/// SHA-256 over a byte string.
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

fn parse_hex(s: &str) -> Result<[u8; 32]> {
    if s.len() != 64 {
        return Err(Error::codec(format!("invalid hash length {}", s.len())));
    }
    if s.bytes().any(|b| b.is_ascii_uppercase()) {
        return Err(Error::codec("hash hex must be lowercase"));
    }
    let mut id = [0; 32];
    hex::decode_to_slice(s, &mut id).map_err(|err| Error::codec(format!("{}", err)))?;
    Ok(id)
}

/// Content hash of a canonically encoded object.
///
/// The phantom parameter records what the hash points at; it never
/// affects the byte representation.
pub struct Hash<T = ()>([u8; 32], PhantomData<fn() -> T>);

/// Hash over only the id-marked fields of a versioned object.
pub struct IdHash<T = ()>([u8; 32], PhantomData<fn() -> T>);

macro_rules! hash_impls {
    ($name:ident) => {
        impl<T> $name<T> {
            pub fn new(id: [u8; 32]) -> Self {
                Self(id, PhantomData)
            }

            /// Hashes the canonical encoding.
            pub fn digest(bytes: &[u8]) -> Self {
                Self::new(sha256(bytes))
            }

            pub fn from_hex(s: &str) -> Result<Self> {
                Ok(Self::new(parse_hex(s)?))
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Reinterprets the target type. The bytes are unchanged.
            pub fn cast<U>(self) -> $name<U> {
                $name(self.0, PhantomData)
            }

            /// Drops the target type.
            pub fn untyped(self) -> $name {
                self.cast()
            }
        }

        impl<T> Clone for $name<T> {
            fn clone(&self) -> Self {
                *self
            }
        }

        impl<T> Copy for $name<T> {}

        impl<T> PartialEq for $name<T> {
            fn eq(&self, other: &Self) -> bool {
                self.0 == other.0
            }
        }

        impl<T> Eq for $name<T> {}

        impl<T> PartialOrd for $name<T> {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        impl<T> Ord for $name<T> {
            fn cmp(&self, other: &Self) -> Ordering {
                self.0.cmp(&other.0)
            }
        }

        impl<T> std::hash::Hash for $name<T> {
            fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
                self.0.hash(state);
            }
        }

        impl<T> AsRef<[u8; 32]> for $name<T> {
            fn as_ref(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl<T> From<$name<T>> for [u8; 32] {
            fn from(h: $name<T>) -> Self {
                h.0
            }
        }

        impl<T> std::fmt::Debug for $name<T> {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(f, "{}", hex::encode(&self.0[0..2]))
            }
        }

        impl<T> std::fmt::Display for $name<T> {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl<T> std::str::FromStr for $name<T> {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Self::from_hex(s)
            }
        }

        impl<T> Serialize for $name<T> {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de, T> Deserialize<'de> for $name<T> {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(D::Error::custom)
            }
        }
    };
}

hash_impls!(Hash);
hash_impls!(IdHash);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let h = Hash::<()>::digest(b"hello");
        let s = h.to_hex();
        assert_eq!(s.len(), 64);
        assert_eq!(Hash::<()>::from_hex(&s).unwrap(), h);
    }

    #[test]
    fn rejects_uppercase_and_bad_length() {
        let h = Hash::<()>::digest(b"x").to_hex().to_uppercase();
        assert!(Hash::<()>::from_hex(&h).is_err());
        assert!(Hash::<()>::from_hex("abcd").is_err());
    }

    #[test]
    fn digest_is_sha256() {
        let h = Hash::<()>::digest(b"");
        assert_eq!(
            h.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
