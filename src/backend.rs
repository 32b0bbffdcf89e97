//! The Backend capability set and the data it exchanges with a session.
//!
//! The session core never touches storage, OT transformation or query
//! evaluation itself; it talks to a [`Backend`] and owns the push streams
//! the Backend hands back:
//!
//! ```text
//!              subscribe / fetch / submit / query*
//!   Agent ───────────────────────────────────────► Backend
//!     ▲                                               │
//!     │            DocStream (ops, per doc)           │
//!     ├───────────────────────────────────────────────┤
//!     │      QuerySubscription (diff/extra/op)        │
//!     └───────────────────────────────────────────────┘
//! ```
//!
//! Every stream carries a [`StreamHandle`] whose destroy hook releases the
//! Backend-side resources. Destroy is idempotent and also fires on drop, so
//! a stream that is cancelled mid-flight can never leak.

use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::agent::AgentContext;
use crate::protocol::WireError;

/// A document snapshot in Backend form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub v: u64,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// What an op does to its document. Exactly one of the three.
#[derive(Debug, Clone, PartialEq)]
pub enum OpContent {
    /// An edit in the document type's op language.
    Edit(Value),
    /// Document creation: the initial type and snapshot.
    Create(Value),
    /// Document deletion.
    Del,
}

/// An operational-transformation record in Backend form.
#[derive(Debug, Clone, PartialEq)]
pub struct Op {
    pub v: Option<u64>,
    pub src: String,
    pub seq: Option<u64>,
    pub content: OpContent,
    pub meta: Option<Value>,
    /// The collection the op was committed against.
    pub collection: Option<String>,
    /// The projection the op was ingested through, when it differs.
    pub source: Option<String>,
}

impl Op {
    /// The collection this op originated from, for own-op filtering:
    /// the projection when set, the commit collection otherwise.
    pub fn source_collection(&self) -> Option<&str> {
        self.source.as_deref().or(self.collection.as_deref())
    }
}

/// Outcome of a successful submit: the version the op was applied at and
/// the ops the client missed between its version and that one.
#[derive(Debug, Clone)]
pub struct SubmitResult {
    pub version: u64,
    pub ops: Vec<Op>,
}

/// One row of a query's result set.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub id: String,
    pub v: u64,
    pub doc_type: Option<String>,
    pub data: Value,
}

/// An incremental change to a live query's result list.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryDiff {
    Insert {
        index: usize,
        values: Vec<QueryResult>,
    },
    Remove {
        index: usize,
        how_many: usize,
    },
    Move {
        from: usize,
        to: usize,
        how_many: usize,
    },
}

/// Idempotent release hook for a Backend-side stream resource.
///
/// `destroy` runs the hook at most once; dropping an undestroyed handle
/// runs it too, so ownership transfers are leak-free by construction.
pub struct StreamHandle {
    on_destroy: Option<Box<dyn FnOnce() + Send>>,
}

impl StreamHandle {
    pub fn new(on_destroy: impl FnOnce() + Send + 'static) -> Self {
        Self {
            on_destroy: Some(Box::new(on_destroy)),
        }
    }

    /// A handle with nothing to release.
    pub fn noop() -> Self {
        Self { on_destroy: None }
    }

    pub fn destroy(&mut self) {
        if let Some(hook) = self.on_destroy.take() {
            hook();
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("armed", &self.on_destroy.is_some())
            .finish()
    }
}

/// An event pushed on a subscribed document's stream.
#[derive(Debug, Clone)]
pub enum DocEvent {
    Op(Op),
    /// An asynchronous stream error; logged by the session, never forwarded.
    Error(WireError),
}

/// The per-document push stream a subscribe returns.
#[derive(Debug)]
pub struct DocStream {
    events: mpsc::UnboundedReceiver<DocEvent>,
    handle: StreamHandle,
}

impl DocStream {
    pub fn new(events: mpsc::UnboundedReceiver<DocEvent>, handle: StreamHandle) -> Self {
        Self { events, handle }
    }

    /// Build a stream together with the sender the Backend pushes into.
    pub fn channel(handle: StreamHandle) -> (mpsc::UnboundedSender<DocEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self::new(rx, handle))
    }

    /// Release the Backend resources and stop accepting events.
    pub fn destroy(&mut self) {
        self.handle.destroy();
        self.events.close();
    }
}

impl Stream for DocStream {
    type Item = DocEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<DocEvent>> {
        self.events.poll_recv(cx)
    }
}

/// An event pushed by a live query.
#[derive(Debug, Clone)]
pub enum QueryEvent {
    /// Out-of-band query metadata changed.
    Extra(Value),
    /// The result list changed.
    Diff(Vec<QueryDiff>),
    /// An op on a document in the result set.
    Op { id: String, op: Op },
    /// An asynchronous query error; logged by the session, never forwarded.
    Error(WireError),
}

/// The push source a `querySubscribe` returns.
///
/// `index` is the Backend's identifier for the live query, used to
/// re-evaluate it on `qresub`.
#[derive(Debug)]
pub struct QuerySubscription {
    pub index: u64,
    events: mpsc::UnboundedReceiver<QueryEvent>,
    handle: StreamHandle,
}

impl QuerySubscription {
    pub fn new(
        index: u64,
        events: mpsc::UnboundedReceiver<QueryEvent>,
        handle: StreamHandle,
    ) -> Self {
        Self {
            index,
            events,
            handle,
        }
    }

    /// Build a subscription together with the sender the Backend pushes into.
    pub fn channel(index: u64, handle: StreamHandle) -> (mpsc::UnboundedSender<QueryEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self::new(index, rx, handle))
    }

    pub fn destroy(&mut self) {
        self.handle.destroy();
        self.events.close();
    }
}

impl Stream for QuerySubscription {
    type Item = QueryEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<QueryEvent>> {
        self.events.poll_recv(cx)
    }
}

/// Result of a bulk subscribe for one collection: a stream per doc plus
/// snapshots for the docs the caller had no version of.
#[derive(Debug, Default)]
pub struct BulkSubscription {
    pub streams: HashMap<String, DocStream>,
    pub snapshots: HashMap<String, Snapshot>,
}

/// Query options derived from the request (`vs`, `db`).
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Document versions the client already has. A `None` value means the
    /// client named the doc but holds no version of it.
    pub versions: Option<HashMap<String, Option<u64>>>,
    /// Which database/index the query should run against.
    pub db: Option<Value>,
}

/// The storage + OT + query façade the session core drives.
///
/// Implementations own persistence, transformation, projection and query
/// evaluation, and must be safe to share across concurrently running
/// agents. Every operation receives the calling agent's context.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Subscribe to a document. With no version this is an initial
    /// subscription and yields the current snapshot; with a version it is a
    /// catch-up and the missed ops are already queued on the stream.
    async fn subscribe(
        &self,
        agent: &AgentContext,
        collection: &str,
        id: &str,
        version: Option<u64>,
    ) -> Result<(DocStream, Option<Snapshot>), WireError>;

    /// Subscribe to many documents of one collection at once.
    async fn subscribe_bulk(
        &self,
        agent: &AgentContext,
        collection: &str,
        versions: HashMap<String, Option<u64>>,
    ) -> Result<BulkSubscription, WireError>;

    async fn fetch(
        &self,
        agent: &AgentContext,
        collection: &str,
        id: &str,
    ) -> Result<Snapshot, WireError>;

    /// Ops of one document from version `from` (inclusive) to `to`
    /// (exclusive), or to the current version when `to` is `None`.
    async fn get_ops(
        &self,
        agent: &AgentContext,
        collection: &str,
        id: &str,
        from: u64,
        to: Option<u64>,
    ) -> Result<Vec<Op>, WireError>;

    /// Ops of many documents of one collection, keyed by doc id.
    async fn get_ops_bulk(
        &self,
        agent: &AgentContext,
        collection: &str,
        from: HashMap<String, u64>,
        to: Option<HashMap<String, u64>>,
    ) -> Result<HashMap<String, Vec<Op>>, WireError>;

    /// Transform and commit an op. Code 4001 signals a resubmitted op the
    /// Backend already has; the session treats that as success.
    async fn submit(
        &self,
        agent: &AgentContext,
        collection: &str,
        id: &str,
        op: Op,
    ) -> Result<SubmitResult, WireError>;

    /// Run a query and keep it live. Returns the push source, the initial
    /// result set and optional out-of-band extra data.
    async fn query_subscribe(
        &self,
        agent: &AgentContext,
        collection: &str,
        query: Value,
        options: &QueryOptions,
    ) -> Result<(QuerySubscription, Vec<QueryResult>, Option<Value>), WireError>;

    /// Re-evaluate a live query identified by its Backend `index`; changes
    /// flow as diffs through the existing subscription.
    async fn query_resubscribe(
        &self,
        agent: &AgentContext,
        index: u64,
        query: Value,
        options: &QueryOptions,
    ) -> Result<(), WireError>;

    /// One-shot query.
    async fn query_fetch(
        &self,
        agent: &AgentContext,
        collection: &str,
        query: Value,
        options: &QueryOptions,
    ) -> Result<(Vec<QueryResult>, Option<Value>), WireError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_stream_handle_destroy_is_idempotent() {
        let count = Arc::new(AtomicUsize::new(0));
        let hook = count.clone();
        let mut handle = StreamHandle::new(move || {
            hook.fetch_add(1, Ordering::SeqCst);
        });
        handle.destroy();
        handle.destroy();
        drop(handle);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stream_handle_drop_destroys() {
        let count = Arc::new(AtomicUsize::new(0));
        let hook = count.clone();
        drop(StreamHandle::new(move || {
            hook.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_doc_stream_delivers_in_order() {
        let (tx, mut stream) = DocStream::channel(StreamHandle::noop());
        for v in 1..=3u64 {
            tx.send(DocEvent::Op(Op {
                v: Some(v),
                src: "s".into(),
                seq: Some(v),
                content: OpContent::Del,
                meta: None,
                collection: None,
                source: None,
            }))
            .unwrap();
        }
        for v in 1..=3u64 {
            match stream.next().await {
                Some(DocEvent::Op(op)) => assert_eq!(op.v, Some(v)),
                other => panic!("expected op, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_destroyed_doc_stream_rejects_sends() {
        let (tx, mut stream) = DocStream::channel(StreamHandle::noop());
        stream.destroy();
        assert!(tx
            .send(DocEvent::Error(WireError::new(500, "late")))
            .is_err());
    }

    #[test]
    fn test_op_source_collection_prefers_projection() {
        let mut op = Op {
            v: None,
            src: "s".into(),
            seq: None,
            content: OpContent::Del,
            meta: None,
            collection: Some("users".into()),
            source: Some("users_public".into()),
        };
        assert_eq!(op.source_collection(), Some("users_public"));
        op.source = None;
        assert_eq!(op.source_collection(), Some("users"));
        op.collection = None;
        assert_eq!(op.source_collection(), None);
    }

    #[test]
    fn test_snapshot_wire_shape() {
        let snapshot = Snapshot {
            v: 5,
            doc_type: None,
            data: Some(serde_json::json!("hi")),
        };
        assert_eq!(
            serde_json::to_value(&snapshot).unwrap(),
            serde_json::json!({"v": 5, "data": "hi"})
        );
    }
}
