use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Config;
use crate::error::DecodeError;

/// Version tag written by both codecs.
const RECORD_VERSION: u8 = 1;

/// Nesting ceiling for data values, to keep decoding of hostile payloads
/// bounded.
const MAX_VALUE_DEPTH: usize = 32;

/// The stored form of a session, as exchanged with the persistence layer.
///
/// A record never carries the session identifier (it is the storage key) and
/// never a full user object; a logged-in session stores only the user's
/// primary identifier, which is resolved back through
/// [`PersistenceLayer::load_user`](crate::PersistenceLayer::load_user) when
/// the session is loaded.
///
/// Two encodings are provided. The binary one ([`encode`](Self::encode) /
/// [`decode`](Self::decode)) is preferred and round-trips all fields
/// exactly. The textual one ([`to_json`](Self::to_json) /
/// [`from_json`](Self::from_json)) is human-readable but drops sub-second
/// timestamp precision.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    /// When the session was created. Reset when the identifier rotates.
    pub created: DateTime<Utc>,

    /// When the session was last observed by a request.
    pub last_access: DateTime<Utc>,

    /// The remote address (`ip:port`) of the last request.
    pub last_ip: String,

    /// Fingerprint of the last request's `User-Agent` header; 0 when the
    /// header was absent.
    pub user_agent_hash: u64,

    /// For a shadow session, the identifier of its successor.
    pub reference_id: Option<String>,

    /// The primary identifier of the logged-in user, if any.
    pub user_id: Option<String>,

    /// Custom data stored in the session.
    pub data: HashMap<String, Value>,
}

impl SessionRecord {
    /// Serializes the record into the versioned binary form: little-endian,
    /// length-prefixed strings, fields in a fixed order.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(64);
        buffer.push(RECORD_VERSION);
        put_i64(&mut buffer, self.created.timestamp_millis());
        put_i64(&mut buffer, self.last_access.timestamp_millis());
        put_str(&mut buffer, &self.last_ip);
        put_u64(&mut buffer, self.user_agent_hash);
        put_str(&mut buffer, self.reference_id.as_deref().unwrap_or(""));
        match &self.user_id {
            Some(user_id) => {
                buffer.push(1);
                put_str(&mut buffer, user_id);
            }
            None => buffer.push(0),
        }
        put_u32(&mut buffer, self.data.len() as u32);
        for (key, value) in &self.data {
            put_str(&mut buffer, key);
            put_value(&mut buffer, value);
        }
        buffer
    }

    /// Deserializes a record from its binary form.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(payload);
        let version = reader.u8()?;
        if version != RECORD_VERSION {
            return Err(DecodeError::Version(version));
        }
        let created = millis_to_datetime(reader.i64()?, "created")?;
        let last_access = millis_to_datetime(reader.i64()?, "last access")?;
        let last_ip = reader.string("remote address")?;
        let user_agent_hash = reader.u64()?;
        let reference = reader.string("reference id")?;
        let reference_id = (!reference.is_empty()).then_some(reference);
        let user_id = match reader.u8()? {
            0 => None,
            _ => Some(reader.string("user id")?),
        };
        let entries = reader.u32()? as usize;
        let mut data = HashMap::with_capacity(entries.min(1024));
        for _ in 0..entries {
            let key = reader.string("data key")?;
            let value = read_value(&mut reader, 0)?;
            data.insert(key, value);
        }
        Ok(Self {
            created,
            last_access,
            last_ip,
            user_agent_hash,
            reference_id,
            user_id,
            data,
        })
    }

    /// Serializes the record into its textual (JSON) form. Timestamps are
    /// RFC 3339 with second precision, the user-agent fingerprint is a
    /// Base36 string.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&WireRecord {
            v: RECORD_VERSION,
            cr: self.created.to_rfc3339_opts(SecondsFormat::Secs, true),
            la: self.last_access.to_rfc3339_opts(SecondsFormat::Secs, true),
            ip: self.last_ip.clone(),
            ua: base36(self.user_agent_hash),
            rf: self.reference_id.clone(),
            us: self.user_id.clone(),
            da: self.data.clone(),
        })
    }

    /// Deserializes a record from its textual form.
    pub fn from_json(text: &str) -> Result<Self, DecodeError> {
        let wire: WireRecord = serde_json::from_str(text).map_err(|error| DecodeError::Field {
            field: "payload",
            reason: error.to_string(),
        })?;
        if wire.v != RECORD_VERSION {
            return Err(DecodeError::Version(wire.v));
        }
        Ok(Self {
            created: rfc3339_to_datetime(&wire.cr, "created")?,
            last_access: rfc3339_to_datetime(&wire.la, "last access")?,
            last_ip: wire.ip,
            user_agent_hash: u64::from_str_radix(&wire.ua, 36).map_err(|error| {
                DecodeError::Field {
                    field: "user agent hash",
                    reason: error.to_string(),
                }
            })?,
            reference_id: wire.rf,
            user_id: wire.us,
            data: wire.da,
        })
    }

    /// Whether this record has expired under the given configuration. This
    /// is useful for periodic purge jobs that sweep the backing store: the
    /// crate itself only deletes expired sessions that are accessed.
    pub fn expired(&self, config: &Config) -> bool {
        self.expired_at(config, Utc::now())
    }

    pub(crate) fn expired_at(&self, config: &Config, now: DateTime<Utc>) -> bool {
        let idle = elapsed(self.last_access, now);
        let age = elapsed(self.created, now);
        self.reference_id.is_some() && idle >= config.grace_period
            || idle >= config.session_expiry
                && age
                    >= config
                        .id_rotation_interval
                        .saturating_add(config.grace_period)
    }
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> std::time::Duration {
    (now - since).to_std().unwrap_or_default()
}

/// Field layout of the textual encoding.
#[derive(Serialize, Deserialize)]
struct WireRecord {
    v: u8,
    cr: String,
    la: String,
    ip: String,
    ua: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rf: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    us: Option<String>,
    da: HashMap<String, Value>,
}

fn base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    digits.iter().rev().map(|&byte| byte as char).collect()
}

fn millis_to_datetime(millis: i64, field: &'static str) -> Result<DateTime<Utc>, DecodeError> {
    DateTime::from_timestamp_millis(millis).ok_or(DecodeError::Field {
        field,
        reason: format!("timestamp {millis} out of range"),
    })
}

fn rfc3339_to_datetime(text: &str, field: &'static str) -> Result<DateTime<Utc>, DecodeError> {
    DateTime::parse_from_rfc3339(text)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|error| DecodeError::Field {
            field,
            reason: error.to_string(),
        })
}

fn put_u32(buffer: &mut Vec<u8>, value: u32) {
    buffer.extend_from_slice(&value.to_le_bytes());
}

fn put_u64(buffer: &mut Vec<u8>, value: u64) {
    buffer.extend_from_slice(&value.to_le_bytes());
}

fn put_i64(buffer: &mut Vec<u8>, value: i64) {
    buffer.extend_from_slice(&value.to_le_bytes());
}

fn put_str(buffer: &mut Vec<u8>, text: &str) {
    put_u32(buffer, text.len() as u32);
    buffer.extend_from_slice(text.as_bytes());
}

fn put_value(buffer: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => buffer.push(0),
        Value::Bool(flag) => {
            buffer.push(1);
            buffer.push(u8::from(*flag));
        }
        Value::Number(number) => {
            if let Some(signed) = number.as_i64() {
                buffer.push(2);
                put_i64(buffer, signed);
            } else if let Some(unsigned) = number.as_u64() {
                buffer.push(3);
                put_u64(buffer, unsigned);
            } else {
                buffer.push(4);
                put_u64(buffer, number.as_f64().unwrap_or_default().to_bits());
            }
        }
        Value::String(text) => {
            buffer.push(5);
            put_str(buffer, text);
        }
        Value::Array(items) => {
            buffer.push(6);
            put_u32(buffer, items.len() as u32);
            for item in items {
                put_value(buffer, item);
            }
        }
        Value::Object(entries) => {
            buffer.push(7);
            put_u32(buffer, entries.len() as u32);
            for (key, entry) in entries {
                put_str(buffer, key);
                put_value(buffer, entry);
            }
        }
    }
}

fn read_value(reader: &mut Reader<'_>, depth: usize) -> Result<Value, DecodeError> {
    if depth > MAX_VALUE_DEPTH {
        return Err(DecodeError::Field {
            field: "data value",
            reason: "nesting too deep".to_string(),
        });
    }
    match reader.u8()? {
        0 => Ok(Value::Null),
        1 => Ok(Value::Bool(reader.u8()? != 0)),
        2 => Ok(Value::from(reader.i64()?)),
        3 => Ok(Value::from(reader.u64()?)),
        4 => {
            let float = f64::from_bits(reader.u64()?);
            serde_json::Number::from_f64(float)
                .map(Value::Number)
                .ok_or(DecodeError::Field {
                    field: "data value",
                    reason: "not a finite number".to_string(),
                })
        }
        5 => Ok(Value::String(reader.string("data value")?)),
        6 => {
            let items = reader.u32()? as usize;
            let mut array = Vec::with_capacity(items.min(1024));
            for _ in 0..items {
                array.push(read_value(reader, depth + 1)?);
            }
            Ok(Value::Array(array))
        }
        7 => {
            let entries = reader.u32()? as usize;
            let mut object = serde_json::Map::with_capacity(entries.min(1024));
            for _ in 0..entries {
                let key = reader.string("data key")?;
                object.insert(key, read_value(reader, depth + 1)?);
            }
            Ok(Value::Object(object))
        }
        tag => Err(DecodeError::Field {
            field: "data value",
            reason: format!("unknown tag {tag}"),
        }),
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], DecodeError> {
        if self.bytes.len() - self.position < count {
            return Err(DecodeError::Truncated);
        }
        let slice = &self.bytes[self.position..self.position + count];
        self.position += count;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.take(4)?.try_into().map_err(|_| DecodeError::Truncated)?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let bytes = self.take(8)?.try_into().map_err(|_| DecodeError::Truncated)?;
        Ok(u64::from_le_bytes(bytes))
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        let bytes = self.take(8)?.try_into().map_err(|_| DecodeError::Truncated)?;
        Ok(i64::from_le_bytes(bytes))
    }

    fn string(&mut self, field: &'static str) -> Result<String, DecodeError> {
        let length = self.u32()? as usize;
        let bytes = self.take(length)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::Field {
            field,
            reason: "invalid utf-8".to_string(),
        })
    }
}
