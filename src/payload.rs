use crate::Error;

/// Typed body of a wire message.
#[derive(Clone, PartialEq, Eq)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Payload {
    Raw(Vec<u8>),
    Text(String),
    // TODO generate arbitrary json values
    Json(#[cfg_attr(test, proptest(value = "b\"{}\".to_vec()"))] Vec<u8>),
    /// Error text of a failed call, stream or nested reverse call
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum PayloadType {
    Raw = 0,
    Text = 1,
    Json = 2,
    Error = 3,
}

impl PayloadType {
    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Raw),
            1 => Some(Self::Text),
            2 => Some(Self::Json),
            3 => Some(Self::Error),
            _ => None,
        }
    }
}

impl Payload {
    /// Serialize `value` into a JSON payload.
    pub fn json(value: &impl serde::Serialize) -> Result<Self, Error> {
        Ok(Self::Json(serde_json::to_vec(value)?))
    }

    /// Deserialize the payload as JSON.
    ///
    /// Text payloads are accepted as well so that a handler may reply with either.
    pub fn decode_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, Error> {
        match self {
            Self::Json(data) | Self::Raw(data) => Ok(serde_json::from_slice(data)?),
            Self::Text(text) => Ok(serde_json::from_str(text)?),
            Self::Error(message) => Err(Error::Remote(message.clone())),
        }
    }

    /// Return the payload text for `Text` and `Json` payloads.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Json(data) => std::str::from_utf8(data).ok(),
            Self::Raw(_) | Self::Error(_) => None,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.build().1
    }

    /// Turn an `Error` payload into [Error::Remote].
    pub fn into_result(self) -> Result<Self, Error> {
        match self {
            Self::Error(message) => Err(Error::Remote(message)),
            payload => Ok(payload),
        }
    }

    pub(crate) fn parse(payload_type: PayloadType, data: Vec<u8>) -> Result<Self, crate::message::DecodeError> {
        Ok(match payload_type {
            PayloadType::Raw => Self::Raw(data),
            PayloadType::Text => Self::Text(
                String::from_utf8(data).map_err(|_| crate::message::DecodeError::InvalidUtf8)?,
            ),
            PayloadType::Json => Self::Json(data),
            PayloadType::Error => Self::Error(
                String::from_utf8(data).map_err(|_| crate::message::DecodeError::InvalidUtf8)?,
            ),
        })
    }

    pub(crate) fn build(self) -> (PayloadType, Vec<u8>) {
        match self {
            Self::Raw(data) => (PayloadType::Raw, data),
            Self::Text(text) => (PayloadType::Text, Vec::from(text)),
            Self::Json(data) => (PayloadType::Json, data),
            Self::Error(message) => (PayloadType::Error, Vec::from(message)),
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::Raw(Vec::new())
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Self::Raw(data)
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Raw(data) => fmt.debug_tuple("Raw").field(data).finish(),
            Self::Text(text) => fmt.debug_tuple("Text").field(text).finish(),
            Self::Json(data) => fmt
                .debug_tuple("Json")
                .field(&String::from_utf8_lossy(data))
                .finish(),
            Self::Error(message) => fmt.debug_tuple("Error").field(message).finish(),
        }
    }
}
