//! Typed (de)serialization between application values and message payloads

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

use crate::error::{BrokerError, Result};

/// Turns values into payloads on the publishing side
pub trait Encoder<T>: Send + Sync + 'static {
    fn encode(&self, value: &T) -> Result<Bytes>;
}

/// Turns payloads back into values on the subscribing side
pub trait Decoder<T>: Send + Sync + 'static {
    fn decode(&self, payload: &[u8]) -> Result<T>;
}

/// serde_json codec, the default for publishers and subscribers
pub struct JsonCodec<T>(PhantomData<fn() -> T>);

impl<T> JsonCodec<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> Encoder<T> for JsonCodec<T>
where
    T: Serialize + 'static,
{
    fn encode(&self, value: &T) -> Result<Bytes> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| BrokerError::Codec(format!("Failed to encode payload: {e}")))
    }
}

impl<T> Decoder<T> for JsonCodec<T>
where
    T: DeserializeOwned + 'static,
{
    fn decode(&self, payload: &[u8]) -> Result<T> {
        serde_json::from_slice(payload)
            .map_err(|e| BrokerError::Codec(format!("Failed to decode payload: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct PolicyCreated {
        policy_id: String,
        premium: u32,
    }

    #[test]
    fn test_json_codec() {
        let codec = JsonCodec::<PolicyCreated>::new();
        let event = PolicyCreated {
            policy_id: "p-1".to_string(),
            premium: 120,
        };

        let bytes = codec.encode(&event).unwrap();
        assert_eq!(&bytes[..], br#"{"policy_id":"p-1","premium":120}"#);
        assert_eq!(codec.decode(&bytes).unwrap(), event);

        assert!(matches!(
            codec.decode(b"not json"),
            Err(BrokerError::Codec(_))
        ));
    }

    #[test]
    fn test_encode_only_type() {
        // Borrowed fields cannot be deserialized into an owned value
        #[derive(Serialize)]
        struct Outgoing<'a> {
            policy_id: &'a str,
        }

        let codec = JsonCodec::<Outgoing<'static>>::new();
        let bytes = codec.encode(&Outgoing { policy_id: "p-2" }).unwrap();
        assert_eq!(&bytes[..], br#"{"policy_id":"p-2"}"#);
    }
}
