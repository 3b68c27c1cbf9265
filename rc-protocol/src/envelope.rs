use std::fmt;

pub const FIELD_SEPARATOR: char = '|';
pub const SERVER_SENDER: &str = "Servidor";

const TYPE_INT: &str = "int";
const TYPE_DOUBLE: &str = "double";
const TYPE_STRING: &str = "string";

/// Typed value carried in the last field of an envelope.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Int(i64),
    Double(f64),
    Text(String),
}

impl Payload {
    pub fn type_tag(&self) -> &'static str {
        match self {
            Payload::Int(_) => TYPE_INT,
            Payload::Double(_) => TYPE_DOUBLE,
            Payload::Text(_) => TYPE_STRING,
        }
    }

    /// Types a console input the way clients do: bare digits are `int`,
    /// signed decimals are `double`, anything else is `string`.
    pub fn infer(raw: &str) -> Self {
        if is_unsigned_digits(raw)
            && let Ok(value) = raw.parse::<i64>()
        {
            return Payload::Int(value);
        }
        if is_signed_decimal(raw)
            && let Ok(value) = raw.parse::<f64>()
        {
            return Payload::Double(value);
        }
        Payload::Text(raw.to_string())
    }

    /// The command phrase this payload stands for.
    pub fn as_phrase(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Int(value) => write!(f, "{value}"),
            Payload::Double(value) => write!(f, "{value}"),
            Payload::Text(value) => f.write_str(value),
        }
    }
}

/// Request envelope exchanged over the RPC channel, serialized as
/// `id|user|credential|type|value`.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub id: i64,
    pub user: String,
    pub credential: String,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    MissingField(&'static str),
    InvalidId(String),
    InvalidPayload { type_tag: String, value: String },
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvelopeError::MissingField(field) => write!(f, "missing envelope field: {field}"),
            EnvelopeError::InvalidId(raw) => write!(f, "envelope id is not an integer: {raw:?}"),
            EnvelopeError::InvalidPayload { type_tag, value } => {
                write!(f, "payload {value:?} is not a valid {type_tag}")
            }
        }
    }
}

impl std::error::Error for EnvelopeError {}

impl Message {
    pub fn new(
        id: i64,
        user: impl Into<String>,
        credential: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            id,
            user: user.into(),
            credential: credential.into(),
            payload,
        }
    }

    /// Reply envelope addressed from the server, used for reports.
    pub fn from_server(id: i64, text: impl Into<String>) -> Self {
        Self::new(id, SERVER_SENDER, "", Payload::Text(text.into()))
    }

    pub fn serialize(&self) -> String {
        format!(
            "{id}{sep}{user}{sep}{credential}{sep}{tag}{sep}{value}",
            id = self.id,
            user = self.user,
            credential = self.credential,
            tag = self.payload.type_tag(),
            value = self.payload,
            sep = FIELD_SEPARATOR,
        )
    }

    pub fn deserialize(raw: &str) -> Result<Self, EnvelopeError> {
        let mut fields = raw.splitn(5, FIELD_SEPARATOR);
        let id_field = fields.next().ok_or(EnvelopeError::MissingField("id"))?;
        let user = fields.next().ok_or(EnvelopeError::MissingField("user"))?;
        let credential = fields
            .next()
            .ok_or(EnvelopeError::MissingField("credential"))?;
        let type_tag = fields.next().ok_or(EnvelopeError::MissingField("type"))?;
        let value = fields.next().ok_or(EnvelopeError::MissingField("value"))?;

        let id = id_field
            .trim()
            .parse::<i64>()
            .map_err(|_| EnvelopeError::InvalidId(id_field.to_string()))?;

        let invalid = || EnvelopeError::InvalidPayload {
            type_tag: type_tag.to_string(),
            value: value.to_string(),
        };
        let payload = match type_tag {
            TYPE_INT => Payload::Int(value.trim().parse().map_err(|_| invalid())?),
            TYPE_DOUBLE => Payload::Double(value.trim().parse().map_err(|_| invalid())?),
            _ => Payload::Text(value.to_string()),
        };

        Ok(Self {
            id,
            user: user.to_string(),
            credential: credential.to_string(),
            payload,
        })
    }
}

fn is_unsigned_digits(raw: &str) -> bool {
    !raw.is_empty() && raw.bytes().all(|byte| byte.is_ascii_digit())
}

fn is_signed_decimal(raw: &str) -> bool {
    let unsigned = raw.strip_prefix('-').unwrap_or(raw);
    match unsigned.split_once('.') {
        Some((whole, fraction)) => is_unsigned_digits(whole) && is_unsigned_digits(fraction),
        None => is_unsigned_digits(unsigned),
    }
}
