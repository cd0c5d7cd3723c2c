/// Wire messages between clients and a room
///
/// Messages on the socket are two-element JSON arrays, `[type, body]`.
use percent_encoding::percent_decode_str;
use serde::de::{self, Deserializer};
use serde::ser::{SerializeTuple, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ClientId, Cookie, Mutation, Poke, ReplicationError};

/// Parameters of the connect URL's query string.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRequest {
    pub client_id: ClientId,
    pub base_cookie: Cookie,
    /// Client clock at connect, milliseconds
    pub ts: f64,
}

impl ConnectRequest {
    pub fn new(client_id: impl Into<ClientId>, base_cookie: Cookie, ts: f64) -> Self {
        Self {
            client_id: client_id.into(),
            base_cookie,
            ts,
        }
    }

    /// Parse `clientID=..&baseCookie=..&ts=..`. An absent or empty
    /// `baseCookie` means the client has no data yet.
    pub fn from_query(query: &str) -> crate::Result<Self> {
        let mut client_id = None;
        let mut base_cookie = None;
        let mut ts = None;

        for pair in query.trim_start_matches('?').split('&') {
            if pair.is_empty() {
                continue;
            }
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            let value = decode_component(value)?;
            match name {
                "clientID" => client_id = Some(value),
                "baseCookie" => base_cookie = Some(value),
                "ts" => ts = Some(value),
                _ => {}
            }
        }

        let client_id = client_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| protocol_error("invalid querystring - missing clientID"))?;

        let base_cookie = match base_cookie.as_deref() {
            None | Some("") => None,
            Some(raw) => Some(raw.parse::<u64>().map_err(|_| {
                protocol_error("invalid querystring parameter baseCookie")
            })?),
        };

        let ts = ts
            .filter(|ts| !ts.is_empty())
            .ok_or_else(|| protocol_error("invalid querystring - missing ts"))?
            .parse::<i64>()
            .map_err(|_| protocol_error("invalid querystring parameter ts"))?;

        Ok(Self {
            client_id,
            base_cookie,
            ts: ts as f64,
        })
    }
}

fn decode_component(raw: &str) -> crate::Result<String> {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| protocol_error("querystring is not valid UTF-8"))
}

fn protocol_error(message: &str) -> ReplicationError {
    ReplicationError::Protocol(message.to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushBody {
    pub mutations: Vec<Mutation>,

    #[serde(rename = "pushVersion", default)]
    pub push_version: u64,

    #[serde(rename = "schemaVersion", default)]
    pub schema_version: String,

    #[serde(default)]
    pub timestamp: f64,
}

/// Client to server
#[derive(Debug, Clone, PartialEq)]
pub enum Upstream {
    Push(PushBody),
    Ping,
}

impl Upstream {
    pub fn from_text(text: &str) -> crate::Result<Self> {
        serde_json::from_str(text)
            .map_err(|err| ReplicationError::Protocol(format!("invalid message: {}", err)))
    }
}

/// Server to client
#[derive(Debug, Clone, PartialEq)]
pub enum Downstream {
    Connected,
    Poke(Poke),
    Error(String),
    Pong,
}

impl Downstream {
    pub fn to_text(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Serialize, Deserialize)]
struct Empty {}

fn serialize_message<S, B>(serializer: S, kind: &str, body: &B) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    B: Serialize + ?Sized,
{
    let mut message = serializer.serialize_tuple(2)?;
    message.serialize_element(kind)?;
    message.serialize_element(body)?;
    message.end()
}

fn body<T, E>(value: Value) -> Result<T, E>
where
    T: serde::de::DeserializeOwned,
    E: de::Error,
{
    serde_json::from_value(value).map_err(E::custom)
}

impl Serialize for Upstream {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Upstream::Push(push) => serialize_message(serializer, "push", push),
            Upstream::Ping => serialize_message(serializer, "ping", &Empty {}),
        }
    }
}

impl<'de> Deserialize<'de> for Upstream {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (kind, value): (String, Value) = Deserialize::deserialize(deserializer)?;
        match kind.as_str() {
            "push" => body(value).map(Upstream::Push),
            "ping" => Ok(Upstream::Ping),
            other => Err(de::Error::unknown_variant(other, &["push", "ping"])),
        }
    }
}

impl Serialize for Downstream {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Downstream::Connected => serialize_message(serializer, "connected", &Empty {}),
            Downstream::Poke(poke) => serialize_message(serializer, "poke", poke),
            Downstream::Error(message) => serialize_message(serializer, "error", message),
            Downstream::Pong => serialize_message(serializer, "pong", &Empty {}),
        }
    }
}

impl<'de> Deserialize<'de> for Downstream {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (kind, value): (String, Value) = Deserialize::deserialize(deserializer)?;
        match kind.as_str() {
            "connected" => Ok(Downstream::Connected),
            "poke" => body(value).map(Downstream::Poke),
            "error" => body(value).map(Downstream::Error),
            "pong" => Ok(Downstream::Pong),
            other => Err(de::Error::unknown_variant(
                other,
                &["connected", "poke", "error", "pong"],
            )),
        }
    }
}
