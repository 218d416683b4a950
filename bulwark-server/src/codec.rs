use anyhow::{Result, anyhow};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Serialization format for cached values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    #[default]
    Json,
    MessagePack,
}

impl Codec {
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(match self {
            Codec::Json => serde_json::to_vec(value)?,
            // Named fields so entries survive struct field reordering
            Codec::MessagePack => rmp_serde::to_vec_named(value)?,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(match self {
            Codec::Json => serde_json::from_slice(bytes)?,
            Codec::MessagePack => rmp_serde::from_slice(bytes)?,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Codec::Json => "json",
            Codec::MessagePack => "msgpack",
        }
    }
}

impl std::str::FromStr for Codec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Codec::Json),
            "msgpack" | "messagepack" => Ok(Codec::MessagePack),
            _ => Err(anyhow!(
                "Invalid cache codec: {}. Valid options are: json, msgpack",
                s
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::str::FromStr;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Profile {
        id: u64,
        tags: Vec<String>,
    }

    #[test]
    fn test_codec_from_str() {
        assert_eq!(Codec::from_str("json").unwrap(), Codec::Json);
        assert_eq!(Codec::from_str("MSGPACK").unwrap(), Codec::MessagePack);
        assert!(Codec::from_str("xml").is_err());
    }

    #[test]
    fn test_msgpack_is_not_json() {
        let profile = Profile {
            id: 7,
            tags: vec!["a".into()],
        };
        let packed = Codec::MessagePack.encode(&profile).unwrap();
        assert!(Codec::Json.decode::<Profile>(&packed).is_err());
        assert_eq!(Codec::MessagePack.decode::<Profile>(&packed).unwrap(), profile);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(Codec::Json.decode::<Profile>(b"{not json").is_err());
    }
}
