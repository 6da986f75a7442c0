//! Remote catalog API: identities, group memberships, schedules and message bodies.
//!
//! Responses come wrapped as `{"response": ..., "status": n}`; a bare payload is
//! accepted too. Schedule times arrive either as ISO strings or as Mongo-style
//! `{"$date": ...}` objects and are converted to local wall-clock minutes here,
//! so nothing past this module deals with remote time representations.

use crate::model::{truncate_to_minute, ScheduleTuple};
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("catalog unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("catalog returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed catalog payload: {0}")]
    Malformed(String),
}

impl CatalogError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CatalogError::NotFound(_))
    }
}

#[async_trait]
pub trait CatalogService: Send + Sync {
    async fn identity_exists(&self, identity: &str) -> Result<bool, CatalogError>;

    async fn register_identity(&self, identity: &str) -> Result<(), CatalogError>;

    async fn fetch_groups(&self, identity: &str) -> Result<Vec<String>, CatalogError>;

    /// Schedule tuples for one group, already in local minute precision.
    async fn fetch_schedule(&self, group: &str) -> Result<Vec<ScheduleTuple>, CatalogError>;

    /// Raw message body (with its `type` discriminator).
    async fn fetch_message(&self, id: i64) -> Result<Value, CatalogError>;
}

#[derive(Clone)]
pub struct CatalogClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for CatalogClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl CatalogClient {
    pub fn new(base_url: Url, token: String) -> Result<Self, CatalogError> {
        let http = Client::builder()
            .user_agent(concat!("popcast-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    /// Build `base_url/<segments...>`, percent-encoding each segment.
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url, CatalogError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| CatalogError::Malformed(format!("base url {} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub fn build_get(&self, url: Url) -> Result<reqwest::Request, CatalogError> {
        Ok(self.http.get(url).bearer_auth(&self.token).build()?)
    }

    async fn get_json(&self, url: Url) -> Result<Value, CatalogError> {
        let request = self.build_get(url)?;
        let path = request.url().path().to_string();
        debug!(%path, "catalog GET");
        let res = self.http.execute(request).await?;
        read_json(res, &path).await
    }
}

async fn read_json(res: reqwest::Response, path: &str) -> Result<Value, CatalogError> {
    let status = res.status();
    if status == StatusCode::NOT_FOUND {
        return Err(CatalogError::NotFound(path.to_string()));
    }
    if !status.is_success() {
        let body = res.text().await.unwrap_or_default();
        return Err(CatalogError::Status {
            status: status.as_u16(),
            body,
        });
    }
    let text = res.text().await?;
    serde_json::from_str(&text).map_err(|e| CatalogError::Malformed(format!("{}: {}", path, e)))
}

#[async_trait]
impl CatalogService for CatalogClient {
    async fn identity_exists(&self, identity: &str) -> Result<bool, CatalogError> {
        match self.get_json(self.endpoint(&["identities", identity])?).await {
            Ok(_) => Ok(true),
            Err(CatalogError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn register_identity(&self, identity: &str) -> Result<(), CatalogError> {
        let url = self.endpoint(&["identities"])?;
        let res = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&json!({ "email": identity }))
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(CatalogError::Status { status, body });
        }
        Ok(())
    }

    async fn fetch_groups(&self, identity: &str) -> Result<Vec<String>, CatalogError> {
        let value = self.get_json(self.endpoint(&["groups", identity])?).await?;
        decode_groups(value)
    }

    async fn fetch_schedule(&self, group: &str) -> Result<Vec<ScheduleTuple>, CatalogError> {
        let value = self.get_json(self.endpoint(&["schedules", group])?).await?;
        decode_schedule(value)
    }

    async fn fetch_message(&self, id: i64) -> Result<Value, CatalogError> {
        let value = self
            .get_json(self.endpoint(&["messages", &id.to_string()])?)
            .await?;
        let body = unwrap_envelope(value);
        if !body.is_object() {
            return Err(CatalogError::Malformed(format!("message {} is not an object", id)));
        }
        Ok(body)
    }
}

fn unwrap_envelope(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.contains_key("response") => {
            map.remove("response").unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn envelope_list(value: Value) -> Result<Vec<Value>, CatalogError> {
    match unwrap_envelope(value) {
        Value::Array(items) => Ok(items),
        other => Err(CatalogError::Malformed(format!("expected a list, got {}", other))),
    }
}

/// Group names from either `["a", ...]` or `[{"group": "a", ...}, ...]`.
pub fn decode_groups(value: Value) -> Result<Vec<String>, CatalogError> {
    let mut groups = Vec::new();
    for item in envelope_list(value)? {
        let name = match &item {
            Value::String(s) => Some(s.clone()),
            Value::Object(map) => map.get("group").and_then(Value::as_str).map(str::to_string),
            _ => None,
        };
        match name.filter(|n| !n.trim().is_empty()) {
            Some(name) if !groups.contains(&name) => groups.push(name),
            Some(_) => {}
            None => warn!(%item, "skipping malformed group item"),
        }
    }
    Ok(groups)
}

#[derive(Deserialize)]
struct RawScheduleItem {
    message_id: i64,
    #[serde(alias = "schedule")]
    scheduled_at: RemoteTime,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RemoteTime {
    Text(String),
    Wrapped {
        #[serde(rename = "$date")]
        date: RemoteDate,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RemoteDate {
    Text(String),
    Millis(i64),
}

/// Decode a schedule list; items that do not parse are logged and skipped.
pub fn decode_schedule(value: Value) -> Result<Vec<ScheduleTuple>, CatalogError> {
    let mut tuples = Vec::new();
    for item in envelope_list(value)? {
        match parse_schedule_item(&item) {
            Some(tuple) => tuples.push(tuple),
            None => warn!(%item, "skipping malformed schedule item"),
        }
    }
    Ok(tuples)
}

fn parse_schedule_item(item: &Value) -> Option<ScheduleTuple> {
    let raw: RawScheduleItem = serde_json::from_value(item.clone()).ok()?;
    let utc = match raw.scheduled_at {
        RemoteTime::Text(s) | RemoteTime::Wrapped { date: RemoteDate::Text(s) } => parse_remote_time(&s)?,
        RemoteTime::Wrapped { date: RemoteDate::Millis(ms) } => Utc.timestamp_millis_opt(ms).single()?,
    };
    Some(ScheduleTuple {
        message_id: raw.message_id,
        scheduled_at: to_local_minute(utc),
    })
}

/// RFC 3339 with offset, or a naive ISO timestamp taken as UTC.
fn parse_remote_time(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

pub fn to_local_minute(t: DateTime<Utc>) -> NaiveDateTime {
    truncate_to_minute(t.with_timezone(&Local).naive_local())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> CatalogClient {
        CatalogClient::new(Url::parse("http://catalog.local/api/").unwrap(), "token".into()).unwrap()
    }

    #[test]
    fn endpoint_encodes_segments() {
        let url = client().endpoint(&["schedules", "Tecnología y Soporte"]).unwrap();
        assert_eq!(url.path(), "/api/schedules/Tecnolog%C3%ADa%20y%20Soporte");
    }

    #[test]
    fn build_get_sets_bearer() {
        let c = client();
        let request = c.build_get(c.endpoint(&["groups", "luis"]).unwrap()).unwrap();
        assert_eq!(request.method(), reqwest::Method::GET);
        assert_eq!(
            request
                .headers()
                .get("Authorization")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "Bearer token"
        );
    }

    #[test]
    fn decode_groups_accepts_both_shapes() {
        let value = json!({
            "response": [
                { "group": "Soporte", "email": "luis" },
                "Tecnología",
                { "email": "no-group" },
                "Soporte"
            ],
            "status": 200
        });
        assert_eq!(
            decode_groups(value).unwrap(),
            vec!["Soporte".to_string(), "Tecnología".to_string()]
        );
        assert!(decode_groups(json!({ "response": "nope" })).is_err());
    }

    #[test]
    fn decode_schedule_handles_time_shapes() {
        let utc = Utc.with_ymd_and_hms(2026, 10, 18, 14, 0, 37).unwrap();
        let value = json!({
            "response": [
                { "message_id": 1, "schedule": { "$date": "2026-10-18T14:00:37Z" } },
                { "message_id": 2, "scheduled_at": "2026-10-18T14:00:37" },
                { "message_id": 3, "schedule": { "$date": utc.timestamp_millis() } },
                { "message_id": 4 },
                { "message_id": 5, "schedule": "yesterday-ish" }
            ]
        });
        let tuples = decode_schedule(value).unwrap();
        let expected = to_local_minute(utc);
        assert_eq!(tuples.len(), 3);
        for (tuple, id) in tuples.iter().zip([1, 2, 3]) {
            assert_eq!(tuple.message_id, id);
            assert_eq!(tuple.scheduled_at, expected);
        }
    }

    #[test]
    fn unwrap_envelope_passes_bare_payloads() {
        assert_eq!(unwrap_envelope(json!([1, 2])), json!([1, 2]));
        assert_eq!(unwrap_envelope(json!({ "response": { "a": 1 } })), json!({ "a": 1 }));
    }
}
