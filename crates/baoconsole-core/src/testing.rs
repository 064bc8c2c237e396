//! Test doubles for the console's external seams.
//!
//! `MockTransport` answers requests from scripted replies keyed by method
//! and path, records every request, and can hold requests at a gate so tests
//! can interleave operations with an in-flight call.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{Notify, Semaphore};

use crate::api::{ApiError, ApiRequest, ApiResponse, Method, Transport};
use crate::notify::{Notification, Notifier};

#[derive(Debug, Clone)]
enum Reply {
    Status(u16, Value),
    Fail(String),
}

type Route = (Method, String);

/// Holds requests on one route until opened.
#[derive(Debug)]
pub struct Gate {
    entered: Notify,
    release: Semaphore,
}

impl Gate {
    fn new() -> Self {
        Self {
            entered: Notify::new(),
            release: Semaphore::new(0),
        }
    }

    /// Wait until a request has reached the gate.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let held requests through. The gate stays open afterwards.
    pub fn open(&self) {
        self.release.add_permits(1);
    }

    async fn pass(&self) {
        self.entered.notify_one();
        // Closed semaphores never happen here; the permit goes straight back.
        let _permit = self.release.acquire().await;
    }
}

/// Scripted transport. Unscripted routes answer 404.
///
/// Replies queued for a route are consumed in order; the last one repeats.
#[derive(Default)]
pub struct MockTransport {
    replies: Mutex<HashMap<Route, VecDeque<Reply>>>,
    gates: Mutex<HashMap<Route, Arc<Gate>>>,
    log: Mutex<Vec<ApiRequest>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, method: Method, path: &str, reply: Reply) {
        self.replies
            .lock()
            .entry((method, path.to_string()))
            .or_default()
            .push_back(reply);
    }

    pub fn respond(&self, method: Method, path: &str, status: u16, body: Value) {
        self.push(method, path, Reply::Status(status, body));
    }

    /// Fail the route at the network level.
    pub fn fail(&self, method: Method, path: &str, message: &str) {
        self.push(method, path, Reply::Fail(message.to_string()));
    }

    pub fn gate(&self, method: Method, path: &str) -> Arc<Gate> {
        Arc::clone(
            self.gates
                .lock()
                .entry((method, path.to_string()))
                .or_insert_with(|| Arc::new(Gate::new())),
        )
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.log.lock().clone()
    }

    pub fn count(&self, method: Method, path: &str) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .count()
    }

    fn next_reply(&self, route: &Route) -> Option<Reply> {
        let mut replies = self.replies.lock();
        let queue = replies.get_mut(route)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, _base_url: &str, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let route = (request.method, request.path.clone());
        self.log.lock().push(request);

        let gate = self.gates.lock().get(&route).cloned();
        if let Some(gate) = gate {
            gate.pass().await;
        }

        match self.next_reply(&route) {
            Some(Reply::Status(status, body)) => Ok(ApiResponse {
                status,
                body: body.to_string(),
            }),
            Some(Reply::Fail(message)) => Err(ApiError::Network(message)),
            None => Ok(ApiResponse {
                status: 404,
                body: json!({"errors": []}).to_string(),
            }),
        }
    }
}

/// Keeps every notification for inspection.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn notifications(&self) -> Vec<Notification> {
        self.seen.lock().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn emit(&self, notification: Notification) {
        self.seen.lock().push(notification);
    }
}
