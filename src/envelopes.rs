use crate::{Event, Filter, ID};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("empty message")]
    EmptyMessage,

    #[error("invalid label")]
    InvalidLabel,

    #[error("invalid {0} envelope")]
    InvalidEnvelope(&'static str),

    #[error("unknown envelope label: {0}")]
    UnknownLabel(String),

    #[error("JSON parsing error")]
    Json(#[from] serde_json::Error),

    #[error("ID parsing error")]
    IdParsing(#[from] crate::types::IDError),
}

/// relay wire frames ("commands"), both directions
#[derive(Debug, Clone)]
pub enum Envelope {
    /// `["EVENT", <sub id>, <event>]`, inbound
    Event { subscription_id: String, event: Event },
    /// `["EVENT", <event>]`, outbound publish
    Publish { event: Event },
    /// `["REQ", <sub id>, <filter>]`
    Req { subscription_id: String, filter: Filter },
    /// `["CLOSE", <sub id>]`
    Close { subscription_id: String },
    /// `["CLOSED", <sub id>, <reason>]`, inbound
    Closed { subscription_id: String, reason: String },
    /// `["EOSE", <sub id>]`, inbound
    Eose { subscription_id: String },
    /// `["NOTICE", <text>]`, inbound
    Notice { message: String },
    /// `["OK", <event id>, <accepted>, <reason>]`, inbound
    Ok { event_id: ID, ok: bool, reason: String },
}

impl Envelope {
    pub fn label(&self) -> &'static str {
        match self {
            Envelope::Event { .. } | Envelope::Publish { .. } => "EVENT",
            Envelope::Req { .. } => "REQ",
            Envelope::Close { .. } => "CLOSE",
            Envelope::Closed { .. } => "CLOSED",
            Envelope::Eose { .. } => "EOSE",
            Envelope::Notice { .. } => "NOTICE",
            Envelope::Ok { .. } => "OK",
        }
    }

    /// encode as a JSON array frame
    pub fn to_json(&self) -> String {
        let value = match self {
            Envelope::Event {
                subscription_id,
                event,
            } => serde_json::json!(["EVENT", subscription_id, event]),
            Envelope::Publish { event } => serde_json::json!(["EVENT", event]),
            Envelope::Req {
                subscription_id,
                filter,
            } => serde_json::json!(["REQ", subscription_id, filter]),
            Envelope::Close { subscription_id } => serde_json::json!(["CLOSE", subscription_id]),
            Envelope::Closed {
                subscription_id,
                reason,
            } => serde_json::json!(["CLOSED", subscription_id, reason]),
            Envelope::Eose { subscription_id } => serde_json::json!(["EOSE", subscription_id]),
            Envelope::Notice { message } => serde_json::json!(["NOTICE", message]),
            Envelope::Ok {
                event_id,
                ok,
                reason,
            } => serde_json::json!(["OK", event_id, ok, reason]),
        };
        value.to_string()
    }
}

fn str_at<'a>(arr: &'a [Value], idx: usize, label: &'static str) -> Result<&'a str, EnvelopeError> {
    arr.get(idx)
        .and_then(|v| v.as_str())
        .ok_or(EnvelopeError::InvalidEnvelope(label))
}

/// parse a relay frame into an envelope
pub fn parse_message(message: &str) -> Result<Envelope, EnvelopeError> {
    let arr: Vec<Value> = serde_json::from_str(message)?;
    if arr.is_empty() {
        return Err(EnvelopeError::EmptyMessage);
    }

    let label = arr[0].as_str().ok_or(EnvelopeError::InvalidLabel)?;

    match label {
        "EVENT" => match arr.len() {
            2 => Ok(Envelope::Publish {
                event: serde_json::from_value(arr[1].clone())?,
            }),
            3 => Ok(Envelope::Event {
                subscription_id: str_at(&arr, 1, "EVENT")?.to_string(),
                event: serde_json::from_value(arr[2].clone())?,
            }),
            _ => Err(EnvelopeError::InvalidEnvelope("EVENT")),
        },
        "REQ" => {
            if arr.len() < 3 {
                return Err(EnvelopeError::InvalidEnvelope("REQ"));
            }
            Ok(Envelope::Req {
                subscription_id: str_at(&arr, 1, "REQ")?.to_string(),
                filter: serde_json::from_value(arr[2].clone())?,
            })
        }
        "CLOSE" => Ok(Envelope::Close {
            subscription_id: str_at(&arr, 1, "CLOSE")?.to_string(),
        }),
        "CLOSED" => Ok(Envelope::Closed {
            subscription_id: str_at(&arr, 1, "CLOSED")?.to_string(),
            reason: str_at(&arr, 2, "CLOSED")?.to_string(),
        }),
        "EOSE" => Ok(Envelope::Eose {
            subscription_id: str_at(&arr, 1, "EOSE")?.to_string(),
        }),
        "NOTICE" => Ok(Envelope::Notice {
            message: str_at(&arr, 1, "NOTICE")?.to_string(),
        }),
        "OK" => {
            if arr.len() < 4 {
                return Err(EnvelopeError::InvalidEnvelope("OK"));
            }
            Ok(Envelope::Ok {
                event_id: ID::from_hex(str_at(&arr, 1, "OK")?)?,
                ok: arr[2].as_bool().ok_or(EnvelopeError::InvalidEnvelope("OK"))?,
                reason: str_at(&arr, 3, "OK")?.to_string(),
            })
        }
        _ => Err(EnvelopeError::UnknownLabel(label.to_string())),
    }
}
