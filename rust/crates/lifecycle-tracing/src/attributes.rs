//! Assembly of the semantic attributes recorded on the root span.

use std::collections::BTreeMap;

use http::header::{GetAll, HeaderValue, CONTENT_LENGTH, USER_AGENT};
use opentelemetry::{KeyValue, Value};

use crate::fields::*;
use crate::lifecycle::{Payload, RequestHead, ResponseContext};
use crate::numeric::parse_numeric_string;

/// Attributes keyed by name, each key recorded at most once.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AttributeMap(BTreeMap<String, Value>);

impl AttributeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `value` under `key`, replacing any earlier value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Takes every attribute out of the map.
    pub fn drain(&mut self) -> Vec<KeyValue> {
        std::mem::take(&mut self.0)
            .into_iter()
            .map(|(key, value)| KeyValue::new(key, value))
            .collect()
    }
}

impl Extend<(String, Value)> for AttributeMap {
    fn extend<I: IntoIterator<Item = (String, Value)>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl IntoIterator for AttributeMap {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// The attributes identifying a request, known as soon as it arrives.
pub fn request_identity(head: &RequestHead) -> AttributeMap {
    let mut attributes = AttributeMap::new();
    attributes.insert(HTTP_REQUEST_ID, head.id.clone());
    attributes.insert(HTTP_REQUEST_METHOD, head.method.as_str().to_owned());
    attributes.insert(URL_PATH, head.path.clone());
    attributes.insert(URL_FULL, head.url.clone());

    if let Some(query) = head
        .query_index
        .and_then(|index| head.url.get(index + 1..))
    {
        attributes.insert(URL_QUERY, query.to_owned());
    }
    if let Some(separator) = head.url.find("://").filter(|&index| index > 0) {
        attributes.insert(URL_SCHEME, head.url[..separator].to_owned());
    }
    attributes
}

/// The attributes describing how a request was served.
pub fn response_attributes(head: &RequestHead, cx: &ResponseContext) -> AttributeMap {
    let mut attributes = AttributeMap::new();

    if let Some(route) = &cx.route {
        attributes.insert(HTTP_ROUTE, route.clone());
    }

    record_response_body(&mut attributes, cx.response_body.as_ref());

    let status = cx.status.as_ref().map_or(200, |status| status.code());
    attributes.insert(HTTP_RESPONSE_STATUS_CODE, i64::from(status));

    if let Some(length) = head
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_numeric_string)
    {
        attributes.insert(HTTP_REQUEST_CONTENT_LENGTH, length);
    }

    if let Some(user_agent) = head.headers.get(USER_AGENT) {
        attributes.insert(USER_AGENT_ORIGINAL, lossy(user_agent));
    }

    if let Some(server) = &cx.server {
        attributes.insert(SERVER_PORT, i64::from(server.port().unwrap_or(0)));
        attributes.insert(SERVER_ADDRESS, server.hostname());
    }

    for name in head.headers.keys() {
        if name == USER_AGENT {
            continue;
        }
        if let Some(value) = header_text(head.headers.get_all(name)) {
            attributes.insert(http_request_header(name.as_str()), value);
        }
    }

    for name in cx.response_headers.keys() {
        if let Some(value) = header_text(cx.response_headers.get_all(name)) {
            attributes.insert(http_response_header(name.as_str()), value);
        }
    }

    let client = cx.client_ip.or_else(|| {
        cx.server
            .as_ref()
            .and_then(|server| server.request_ip(head))
    });
    if let Some(client) = client {
        attributes.insert(CLIENT_ADDRESS, client.to_string());
    }

    if let Some(cookies) = &cx.cookies {
        let serialized: serde_json::Map<String, serde_json::Value> = cookies
            .iter()
            .map(|(name, value)| (name.clone(), value.to_string().into()))
            .collect();
        attributes.insert(
            HTTP_REQUEST_COOKIE,
            serde_json::Value::Object(serialized).to_string(),
        );
    }

    record_request_body(&mut attributes, cx.request_body.as_ref());

    attributes
}

fn record_response_body(attributes: &mut AttributeMap, body: Option<&Payload>) {
    match body {
        None | Some(Payload::Json(serde_json::Value::Null)) => {
            attributes.insert(HTTP_RESPONSE_BODY_SIZE, 0_i64);
        }
        Some(Payload::Bytes(bytes)) => {
            attributes.insert(HTTP_RESPONSE_BODY_SIZE, size(bytes.len()));
        }
        Some(Payload::Streaming { size: length }) => {
            if let Some(length) = length.and_then(|l| i64::try_from(l).ok()) {
                attributes.insert(HTTP_RESPONSE_BODY_SIZE, length);
            }
        }
        Some(Payload::Text(text) | Payload::Json(serde_json::Value::String(text))) => {
            attributes.insert(HTTP_RESPONSE_BODY_SIZE, size(text.len()));
            attributes.insert(HTTP_RESPONSE_BODY, text.clone());
        }
        Some(Payload::Json(value)) => {
            let text = value.to_string();
            attributes.insert(HTTP_RESPONSE_BODY_SIZE, size(text.len()));
            attributes.insert(HTTP_RESPONSE_BODY, text);
        }
    }
}

fn record_request_body(attributes: &mut AttributeMap, body: Option<&Payload>) {
    match body {
        None | Some(Payload::Json(serde_json::Value::Null)) => {}
        Some(Payload::Bytes(bytes)) => {
            attributes.insert(HTTP_REQUEST_BODY_SIZE, size(bytes.len()));
            attributes.insert(
                HTTP_REQUEST_BODY,
                String::from_utf8_lossy(bytes).into_owned(),
            );
        }
        Some(Payload::Streaming { size: length }) => {
            if let Some(length) = length.and_then(|l| i64::try_from(l).ok()) {
                attributes.insert(HTTP_REQUEST_BODY_SIZE, length);
            }
        }
        Some(Payload::Text(text) | Payload::Json(serde_json::Value::String(text))) => {
            attributes.insert(HTTP_REQUEST_BODY_SIZE, size(text.len()));
            attributes.insert(HTTP_REQUEST_BODY, text.clone());
        }
        Some(Payload::Json(value)) => {
            let text = value.to_string();
            attributes.insert(HTTP_REQUEST_BODY_SIZE, size(text.len()));
            attributes.insert(HTTP_REQUEST_BODY, text);
        }
    }
}

/// A single header value as-is, repeated headers as a JSON array.
fn header_text(values: GetAll<'_, HeaderValue>) -> Option<String> {
    let mut values: Vec<String> = values.iter().map(lossy).collect();
    match values.len() {
        0 => None,
        1 => values.pop(),
        _ => Some(serde_json::Value::from(values).to_string()),
    }
}

fn lossy(value: &HeaderValue) -> String {
    String::from_utf8_lossy(value.as_bytes()).into_owned()
}

fn size(length: usize) -> i64 {
    i64::try_from(length).unwrap_or(i64::MAX)
}
