//! In-memory pricing backend.
//!
//! Records every call and answers from canned responses. Used by tests
//! across the workspace and for running the engine without a REST service.

use crate::backend::{BoxFuture, PricingBackend, SyncAck, SyncRejection};
use crate::error::{RestError, RestResult};
use parking_lot::Mutex;
use pricesync_core::{EntityId, PendingEdit};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct MockInner {
    poll_calls: Vec<Vec<EntityId>>,
    push_calls: Vec<Vec<PendingEdit>>,
    poll_responses: VecDeque<RestResult<String>>,
    push_responses: VecDeque<RestResult<SyncAck>>,
}

/// Cloneable recording backend; clones share state.
#[derive(Clone, Default)]
pub struct MockPricingBackend {
    inner: Arc<Mutex<MockInner>>,
    reject_all: Arc<AtomicBool>,
}

impl MockPricingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a body to return from the next `poll`.
    pub fn push_poll_response(&self, body: impl Into<String>) {
        self.inner.lock().poll_responses.push_back(Ok(body.into()));
    }

    /// Queue a failure for the next `poll`.
    pub fn push_poll_error(&self, message: impl Into<String>) {
        self.inner
            .lock()
            .poll_responses
            .push_back(Err(RestError::HttpClient(message.into())));
    }

    /// Queue an explicit answer for the next `push_edits`.
    pub fn push_sync_response(&self, ack: RestResult<SyncAck>) {
        self.inner.lock().push_responses.push_back(ack);
    }

    /// Reject every pushed edit until turned off again.
    pub fn set_reject_all(&self, reject: bool) {
        self.reject_all.store(reject, Ordering::SeqCst);
    }

    pub fn poll_calls(&self) -> Vec<Vec<EntityId>> {
        self.inner.lock().poll_calls.clone()
    }

    pub fn push_calls(&self) -> Vec<Vec<PendingEdit>> {
        self.inner.lock().push_calls.clone()
    }

    fn answer_push(&self, edits: &[PendingEdit]) -> RestResult<SyncAck> {
        let mut inner = self.inner.lock();
        inner.push_calls.push(edits.to_vec());
        if let Some(canned) = inner.push_responses.pop_front() {
            return canned;
        }
        if self.reject_all.load(Ordering::SeqCst) {
            return Ok(SyncAck {
                accepted: Vec::new(),
                rejected: edits
                    .iter()
                    .map(|e| SyncRejection {
                        id: e.id.clone(),
                        client_seq: e.client_seq,
                        reason: "rejected".to_string(),
                    })
                    .collect(),
            });
        }
        Ok(SyncAck::accept_all(edits))
    }

    fn answer_poll(&self, ids: &[EntityId]) -> RestResult<String> {
        let mut inner = self.inner.lock();
        inner.poll_calls.push(ids.to_vec());
        inner
            .poll_responses
            .pop_front()
            .unwrap_or_else(|| Ok(r#"{"type":"batch","updates":[]}"#.to_string()))
    }
}

impl PricingBackend for MockPricingBackend {
    fn poll<'a>(&'a self, ids: &'a [EntityId]) -> BoxFuture<'a, RestResult<String>> {
        let result = self.answer_poll(ids);
        Box::pin(async move { result })
    }

    fn push_edits<'a>(&'a self, edits: &'a [PendingEdit]) -> BoxFuture<'a, RestResult<SyncAck>> {
        let result = self.answer_push(edits);
        Box::pin(async move { result })
    }
}
