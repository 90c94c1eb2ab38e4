//! A fake source for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;

use super::{HttpResponse, SourceClient, SourceConnector, SourceError, SourceRequest};
use crate::error::ServerResult;

/// A canned reply.
pub enum Reply {
    Response(HttpResponse),
    TransportError,
}

/// A source that replies from a script and records requests.
///
/// Replies for a request are consumed in order. The last reply
/// of a request is repeated once the others are used up.
#[derive(Default)]
pub struct FakeSource {
    replies: Mutex<HashMap<String, VecDeque<Arc<Reply>>>>,
    requests: Mutex<Vec<String>>,
}

impl Reply {
    pub fn json(status: u16, body: &str) -> Self {
        Self::with_headers(status, &[], Bytes::copy_from_slice(body.as_bytes()))
    }

    pub fn with_headers(status: u16, headers: &[(&str, &str)], body: Bytes) -> Self {
        let mut map = HeaderMap::new();
        for (k, v) in headers {
            map.insert(
                HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }

        Self::Response(HttpResponse {
            status: StatusCode::from_u16(status).unwrap(),
            headers: map,
            body,
        })
    }
}

impl FakeSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds a reply for a request, given in its display form.
    pub fn reply(&self, request: &str, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .entry(request.to_string())
            .or_default()
            .push_back(Arc::new(reply));
    }

    /// Returns all requests made so far.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    /// Returns how many times a request was made.
    pub fn count(&self, request: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| *r == request)
            .count()
    }
}

#[async_trait]
impl SourceClient for FakeSource {
    async fn get(&self, request: &SourceRequest) -> Result<HttpResponse, SourceError> {
        let key = request.to_string();
        self.requests.lock().unwrap().push(key.clone());

        let reply = {
            let mut replies = self.replies.lock().unwrap();
            match replies.get_mut(&key) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        match reply.as_deref() {
            Some(Reply::Response(response)) => Ok(response.clone()),
            Some(Reply::TransportError) => Err(SourceError::Transport(anyhow::anyhow!(
                "connection reset by peer"
            ))),
            None => Ok(HttpResponse {
                status: StatusCode::NOT_FOUND,
                headers: HeaderMap::new(),
                body: Bytes::from_static(br#"{"message":"404 Not Found"}"#),
            }),
        }
    }
}

/// Connects every job to the same fake source.
pub struct FakeConnector(pub Arc<FakeSource>);

#[async_trait]
impl SourceConnector for FakeConnector {
    async fn connect(&self, _job_id: i64) -> ServerResult<Arc<dyn SourceClient>> {
        Ok(self.0.clone())
    }
}
