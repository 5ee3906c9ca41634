use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// The answer map collected for one step: field name to coerced value
pub type AnswerMap = serde_json::Map<String, serde_json::Value>;

/// A structured payload exchanged with tools and external collaborators
///
/// Thin wrapper around a JSON value; keeps signatures honest about what is
/// opaque caller data versus typed engine state.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Payload {
    /// The inner JSON value
    pub value: serde_json::Value,
}

impl Payload {
    /// Create a payload from a JSON value
    #[inline]
    pub fn new(value: serde_json::Value) -> Self {
        Self { value }
    }

    /// A null payload
    #[inline]
    pub fn null() -> Self {
        Self {
            value: serde_json::Value::Null,
        }
    }

    /// Borrow the inner value
    #[inline]
    pub fn as_value(&self) -> &serde_json::Value {
        &self.value
    }

    /// Take ownership of the inner value
    #[inline]
    pub fn into_value(self) -> serde_json::Value {
        self.value
    }

    /// Whether the payload is null
    #[inline]
    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }

    /// Borrow the payload as an object map, if it is one
    #[inline]
    pub fn as_object(&self) -> Option<&AnswerMap> {
        self.value.as_object()
    }

    /// Deserialize the payload into a concrete type
    pub fn to<T>(&self) -> Result<T, serde_json::Error>
    where
        T: DeserializeOwned,
    {
        serde_json::from_value(self.value.clone())
    }

    /// Build a payload from any serializable value
    pub fn from<T>(value: &T) -> Result<Self, serde_json::Error>
    where
        T: Serialize,
    {
        Ok(Self::new(serde_json::to_value(value)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_round_trip() {
        let original = Payload::new(json!({"items": [{"addr": "192.168.1.40"}]}));
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: Payload = serde_json::from_str(&serialized).unwrap();
        assert_eq!(original, deserialized);
    }

    #[test]
    fn test_payload_null() {
        assert!(Payload::null().is_null());
        assert!(!Payload::new(json!(0)).is_null());
    }

    #[test]
    fn test_payload_to_typed() {
        #[derive(Deserialize)]
        struct Probe {
            model: String,
            port: u16,
        }

        let payload = Payload::new(json!({"model": "bulb-2", "port": 55443}));
        let probe: Probe = payload.to().unwrap();
        assert_eq!(probe.model, "bulb-2");
        assert_eq!(probe.port, 55443);
    }

    #[test]
    fn test_payload_as_object() {
        let payload = Payload::new(json!({"k": "v"}));
        assert_eq!(payload.as_object().unwrap().len(), 1);
        assert!(Payload::new(json!("scalar")).as_object().is_none());
    }
}
