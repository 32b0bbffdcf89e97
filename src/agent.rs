//! The per-connection session agent.
//!
//! One `Agent` is created for each connected client. It multiplexes every
//! push stream the client is subscribed to — one per document, one per
//! live query — onto the single ordered connection, while servicing
//! request/response traffic on the same connection:
//!
//! ```text
//!            ┌──────────────── Agent task ────────────────┐
//! client ──► │ pump ─ validate ─ dispatch ──► in-flight   │ ──► Backend
//!            │                                 requests    │
//! client ◄── │ replies ◄─ completions ◄────────┘           │
//!            │ op pushes ◄─ DocStreams ◄────────────────── │ ◄── Backend
//!            │ q pushes  ◄─ QuerySubscriptions ◄────────── │
//!            └────────────────────────────────────────────┘
//! ```
//!
//! All agent state lives on the agent's own task: requests run as futures
//! whose completions are applied back on the task, so replies are ordered
//! by Backend completion and no locks are needed. Per-document op order is
//! preserved end to end.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications,
//! Chapter 5 — Replication (leader-based change streams)

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::SystemTime;

use futures_util::future::{self, BoxFuture};
use futures_util::stream::FuturesUnordered;
use futures_util::{Stream, StreamExt};
use serde_json::{Map, Value};
use tokio_stream::StreamMap;
use uuid::Uuid;

use crate::backend::{
    Backend, BulkSubscription, DocEvent, DocStream, Op, QueryEvent, QueryOptions, QueryResult,
    QuerySubscription, Snapshot, SubmitResult,
};
use crate::protocol::{
    self, Command, ProtocolError, ReplyTo, Request, WireError, ERR_OP_ALREADY_SUBMITTED,
};
use crate::stream::{MessageStream, WireMessage};

/// Identity of one connected session, shared with the Backend on every call.
#[derive(Debug)]
pub struct AgentContext {
    /// Random opaque id, unique per connection. Default `src` for submitted
    /// ops and the key for own-op filtering.
    pub client_id: String,
    pub connect_time: SystemTime,
}

type DocKey = (String, String);

/// An installed live query: the Backend subscription plus the request
/// context needed to translate its events and resubscribe it.
struct QueryChannel {
    sub: QuerySubscription,
    collection: String,
    options: QueryOptions,
}

impl Stream for QueryChannel {
    type Item = QueryEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<QueryEvent>> {
        Pin::new(&mut self.sub).poll_next(cx)
    }
}

/// Result of an in-flight request, applied back on the agent task.
enum Completion {
    Subscribe {
        reply: ReplyTo,
        collection: String,
        id: String,
        result: Result<(DocStream, Option<Snapshot>), WireError>,
    },
    BulkSubscribe {
        reply: ReplyTo,
        result: Result<Vec<(String, BulkSubscription)>, WireError>,
    },
    FetchSnapshot {
        reply: ReplyTo,
        result: Result<Snapshot, WireError>,
    },
    FetchOps {
        reply: ReplyTo,
        collection: String,
        id: String,
        result: Result<Vec<Op>, WireError>,
    },
    Submit {
        reply: ReplyTo,
        collection: String,
        id: String,
        src: String,
        seq: Option<u64>,
        version: Option<u64>,
        result: Result<SubmitResult, WireError>,
    },
    QuerySubscribe {
        reply: ReplyTo,
        id: i64,
        collection: String,
        options: QueryOptions,
        result: Result<QueryOutcome, WireError>,
    },
    QueryFetch {
        reply: ReplyTo,
        id: i64,
        collection: String,
        options: QueryOptions,
        result: Result<QueryFetchOutcome, WireError>,
    },
    QueryResubscribe {
        reply: ReplyTo,
        result: Result<(), WireError>,
    },
}

struct QueryOutcome {
    sub: QuerySubscription,
    results: Vec<QueryResult>,
    extra: Option<Value>,
    catchup: Vec<(String, Vec<Op>)>,
}

struct QueryFetchOutcome {
    results: Vec<QueryResult>,
    extra: Option<Value>,
    catchup: Vec<(String, Vec<Op>)>,
}

/// The per-connection session core.
pub struct Agent {
    ctx: Arc<AgentContext>,
    backend: Arc<dyn Backend>,
    stream: Box<dyn MessageStream>,
    /// Live document subscriptions. At most one stream per (collection, id);
    /// streams that end on their own fall out of the map.
    docs: StreamMap<DocKey, DocStream>,
    /// Live queries by client-chosen query id.
    queries: StreamMap<i64, QueryChannel>,
    /// In-flight Backend requests; completions apply in completion order.
    pending: FuturesUnordered<BoxFuture<'static, Completion>>,
    closed: bool,
}

impl Agent {
    pub fn new(backend: Arc<dyn Backend>, stream: Box<dyn MessageStream>) -> Self {
        Self {
            ctx: Arc::new(AgentContext {
                client_id: Uuid::new_v4().simple().to_string(),
                connect_time: SystemTime::now(),
            }),
            backend,
            stream,
            docs: StreamMap::new(),
            queries: StreamMap::new(),
            pending: FuturesUnordered::new(),
            closed: false,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.ctx.client_id
    }

    /// Drive the session until the client disconnects or a fatal error
    /// occurs. Always runs cleanup: on return every subscription this agent
    /// ever installed has been destroyed.
    pub async fn run(mut self) -> Result<(), ProtocolError> {
        let result = self.run_inner().await;
        self.cleanup();
        result
    }

    async fn run_inner(&mut self) -> Result<(), ProtocolError> {
        let init = protocol::init_message(&self.ctx.client_id);
        self.send_value(init).await?;
        loop {
            tokio::select! {
                incoming = self.stream.recv() => match incoming {
                    Some(Ok(message)) => {
                        let record = match message {
                            WireMessage::Record(record) => record,
                            WireMessage::Text(text) => serde_json::from_str(&text)
                                .map_err(|e| ProtocolError::Parse(e.to_string()))?,
                        };
                        self.dispatch(record).await?;
                        // Unwind between messages so pushes and completions
                        // can interleave with a pipelining client.
                        tokio::task::yield_now().await;
                    }
                    Some(Err(err)) => return Err(err),
                    None => return Ok(()),
                },
                Some(completion) = self.pending.next() => {
                    self.complete(completion).await?;
                }
                Some((key, event)) = self.docs.next() => {
                    self.doc_event(key, event).await?;
                }
                Some((id, event)) = self.queries.next() => {
                    self.query_event(id, event).await?;
                }
            }
        }
    }

    /// Tear down every subscription. Runs exactly once; afterwards sends
    /// are no-ops and nothing new is installed.
    fn cleanup(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // Dropping in-flight requests destroys any stream they would have
        // handed back.
        self.pending = FuturesUnordered::new();
        let keys: Vec<DocKey> = self.docs.keys().cloned().collect();
        for key in keys {
            if let Some(mut stream) = self.docs.remove(&key) {
                stream.destroy();
            }
        }
        let ids: Vec<i64> = self.queries.keys().cloned().collect();
        for id in ids {
            if let Some(mut channel) = self.queries.remove(&id) {
                channel.sub.destroy();
            }
        }
    }

    async fn dispatch(&mut self, record: Value) -> Result<(), ProtocolError> {
        let request = match Request::from_record(record) {
            Ok(request) => request,
            Err(err) => {
                let reply = ReplyTo {
                    a: None,
                    c: None,
                    d: None,
                    id: None,
                };
                return self.send_reply(&reply, Err(err)).await;
            }
        };
        let reply = request.reply_to();
        match request.validate() {
            Ok(command) => self.command(reply, command).await,
            Err(err) => self.send_reply(&reply, Err(err)).await,
        }
    }

    async fn command(&mut self, reply: ReplyTo, command: Command) -> Result<(), ProtocolError> {
        match command {
            Command::Subscribe {
                collection,
                id,
                version,
            } => {
                let backend = Arc::clone(&self.backend);
                let ctx = Arc::clone(&self.ctx);
                self.pending.push(Box::pin(async move {
                    let result = backend.subscribe(&ctx, &collection, &id, version).await;
                    Completion::Subscribe {
                        reply,
                        collection,
                        id,
                        result,
                    }
                }));
            }
            Command::Unsubscribe { collection, id } => {
                if let Some(mut stream) = self.docs.remove(&(collection, id)) {
                    stream.destroy();
                }
                self.send_reply(&reply, Ok(Map::new())).await?;
            }
            Command::Fetch {
                collection,
                id,
                version,
            } => {
                let backend = Arc::clone(&self.backend);
                let ctx = Arc::clone(&self.ctx);
                match version {
                    None => self.pending.push(Box::pin(async move {
                        let result = backend.fetch(&ctx, &collection, &id).await;
                        Completion::FetchSnapshot { reply, result }
                    })),
                    // With a version, fetch means "replay the ops I missed".
                    Some(from) => self.pending.push(Box::pin(async move {
                        let result = backend.get_ops(&ctx, &collection, &id, from, None).await;
                        Completion::FetchOps {
                            reply,
                            collection,
                            id,
                            result,
                        }
                    })),
                }
            }
            Command::BulkSubscribe { collections } => {
                let backend = Arc::clone(&self.backend);
                let ctx = Arc::clone(&self.ctx);
                self.pending.push(Box::pin(async move {
                    let branches = collections.into_iter().map(|(collection, versions)| {
                        let backend = Arc::clone(&backend);
                        let ctx = Arc::clone(&ctx);
                        async move {
                            let result =
                                backend.subscribe_bulk(&ctx, &collection, versions).await;
                            (collection, result)
                        }
                    });
                    let outcomes = future::join_all(branches).await;
                    let mut installed = Vec::with_capacity(outcomes.len());
                    let mut first_error = None;
                    for (collection, outcome) in outcomes {
                        match outcome {
                            Ok(bulk) => installed.push((collection, bulk)),
                            Err(err) if first_error.is_none() => first_error = Some(err),
                            Err(_) => {}
                        }
                    }
                    let result = match first_error {
                        // Dropping the collected streams of the collections
                        // that did succeed destroys them, so a partial
                        // failure leaks nothing.
                        Some(err) => Err(err),
                        None => Ok(installed),
                    };
                    Completion::BulkSubscribe { reply, result }
                }));
            }
            Command::Submit { collection, id, op } => {
                let src = op
                    .src
                    .clone()
                    .unwrap_or_else(|| self.ctx.client_id.clone());
                let seq = op.seq;
                let version = op.version;
                let backend_op = Op {
                    v: op.version,
                    src: src.clone(),
                    seq: op.seq,
                    content: op.content,
                    meta: Some(Value::Object(Map::new())),
                    collection: None,
                    source: None,
                };
                let backend = Arc::clone(&self.backend);
                let ctx = Arc::clone(&self.ctx);
                self.pending.push(Box::pin(async move {
                    let result = backend.submit(&ctx, &collection, &id, backend_op).await;
                    Completion::Submit {
                        reply,
                        collection,
                        id,
                        src,
                        seq,
                        version,
                        result,
                    }
                }));
            }
            Command::QuerySubscribe {
                id,
                collection,
                query,
                options,
            } => {
                let backend = Arc::clone(&self.backend);
                let ctx = Arc::clone(&self.ctx);
                self.pending.push(Box::pin(async move {
                    let result = async {
                        let (sub, results, extra) = backend
                            .query_subscribe(&ctx, &collection, query, &options)
                            .await?;
                        let catchup =
                            query_catchup(&*backend, &ctx, &collection, &options, &results)
                                .await?;
                        Ok(QueryOutcome {
                            sub,
                            results,
                            extra,
                            catchup,
                        })
                    }
                    .await;
                    Completion::QuerySubscribe {
                        reply,
                        id,
                        collection,
                        options,
                        result,
                    }
                }));
            }
            Command::QueryFetch {
                id,
                collection,
                query,
                options,
            } => {
                let backend = Arc::clone(&self.backend);
                let ctx = Arc::clone(&self.ctx);
                self.pending.push(Box::pin(async move {
                    let result = async {
                        let (results, extra) = backend
                            .query_fetch(&ctx, &collection, query, &options)
                            .await?;
                        let catchup =
                            query_catchup(&*backend, &ctx, &collection, &options, &results)
                                .await?;
                        Ok(QueryFetchOutcome {
                            results,
                            extra,
                            catchup,
                        })
                    }
                    .await;
                    Completion::QueryFetch {
                        reply,
                        id,
                        collection,
                        options,
                        result,
                    }
                }));
            }
            Command::QueryUnsubscribe { id } => {
                if let Some(mut channel) = self.queries.remove(&id) {
                    channel.sub.destroy();
                }
                self.send_reply(&reply, Ok(Map::new())).await?;
            }
            Command::QueryResubscribe { id, query } => {
                let target = self
                    .queries
                    .iter()
                    .find(|(key, _)| *key == id)
                    .map(|(_, channel)| (channel.sub.index, channel.options.clone()));
                match target {
                    None => {
                        let err = WireError::malformed("Can not find query to resubscribe");
                        self.send_reply(&reply, Err(err)).await?;
                    }
                    Some((index, options)) => {
                        let backend = Arc::clone(&self.backend);
                        let ctx = Arc::clone(&self.ctx);
                        self.pending.push(Box::pin(async move {
                            let result = backend
                                .query_resubscribe(&ctx, index, query, &options)
                                .await;
                            Completion::QueryResubscribe { reply, result }
                        }));
                    }
                }
            }
        }
        Ok(())
    }

    async fn complete(&mut self, completion: Completion) -> Result<(), ProtocolError> {
        match completion {
            Completion::Subscribe {
                reply,
                collection,
                id,
                result,
            } => match result {
                Ok((stream, snapshot)) => {
                    self.install_doc(collection, id, stream);
                    let mut body = Map::new();
                    if let Some(snapshot) = snapshot {
                        body.insert(
                            "data".into(),
                            serde_json::to_value(snapshot).unwrap_or(Value::Null),
                        );
                    }
                    self.send_reply(&reply, Ok(body)).await?;
                }
                Err(err) => self.send_reply(&reply, Err(err)).await?,
            },
            Completion::BulkSubscribe { reply, result } => match result {
                Ok(branches) => {
                    let mut aggregate = Map::new();
                    for (collection, bulk) in branches {
                        let BulkSubscription {
                            streams,
                            mut snapshots,
                        } = bulk;
                        let mut inner = Map::new();
                        for (doc_id, stream) in streams {
                            let value = match snapshots.remove(&doc_id) {
                                Some(snapshot) => {
                                    serde_json::to_value(snapshot).unwrap_or(Value::Null)
                                }
                                // Subscribed, no snapshot to send.
                                None => Value::Bool(true),
                            };
                            inner.insert(doc_id.clone(), value);
                            self.install_doc(collection.clone(), doc_id, stream);
                        }
                        aggregate.insert(collection, Value::Object(inner));
                    }
                    let mut body = Map::new();
                    body.insert("s".into(), Value::Object(aggregate));
                    self.send_reply(&reply, Ok(body)).await?;
                }
                Err(err) => self.send_reply(&reply, Err(err)).await?,
            },
            Completion::FetchSnapshot { reply, result } => match result {
                Ok(snapshot) => {
                    let mut body = Map::new();
                    body.insert(
                        "data".into(),
                        serde_json::to_value(snapshot).unwrap_or(Value::Null),
                    );
                    self.send_reply(&reply, Ok(body)).await?;
                }
                Err(err) => self.send_reply(&reply, Err(err)).await?,
            },
            Completion::FetchOps {
                reply,
                collection,
                id,
                result,
            } => match result {
                Ok(ops) => {
                    for op in &ops {
                        self.send_op(&collection, &id, op).await?;
                    }
                    self.send_reply(&reply, Ok(Map::new())).await?;
                }
                Err(err) => self.send_reply(&reply, Err(err)).await?,
            },
            Completion::Submit {
                reply,
                collection,
                id,
                src,
                seq,
                version,
                result,
            } => {
                let ack = |v: Option<u64>| {
                    let mut body = Map::new();
                    body.insert("src".into(), Value::String(src.clone()));
                    if let Some(seq) = seq {
                        body.insert("seq".into(), Value::from(seq));
                    }
                    if let Some(v) = v {
                        body.insert("v".into(), Value::from(v));
                    }
                    body
                };
                match result {
                    Ok(outcome) => {
                        for op in &outcome.ops {
                            self.send_op(&collection, &id, op).await?;
                        }
                        self.send_reply(&reply, Ok(ack(Some(outcome.version)))).await?;
                    }
                    // A resubmitted op the Backend already has; the client
                    // just needs its ack again.
                    Err(err) if err.code == ERR_OP_ALREADY_SUBMITTED => {
                        self.send_reply(&reply, Ok(ack(version))).await?;
                    }
                    Err(err) => self.send_reply(&reply, Err(err)).await?,
                }
            }
            Completion::QuerySubscribe {
                reply,
                id,
                collection,
                options,
                result,
            } => match result {
                Ok(outcome) => {
                    let data = protocol::map_results(&outcome.results, options.versions.as_ref());
                    self.install_query(id, collection.clone(), options, outcome.sub);
                    for (doc_id, ops) in &outcome.catchup {
                        for op in ops {
                            self.send_op(&collection, doc_id, op).await?;
                        }
                    }
                    let message = protocol::query_results_message(id, data, outcome.extra);
                    self.send_value(message).await?;
                }
                Err(err) => self.send_reply(&reply, Err(err)).await?,
            },
            Completion::QueryFetch {
                reply,
                id,
                collection,
                options,
                result,
            } => match result {
                Ok(outcome) => {
                    let data = protocol::map_results(&outcome.results, options.versions.as_ref());
                    for (doc_id, ops) in &outcome.catchup {
                        for op in ops {
                            self.send_op(&collection, doc_id, op).await?;
                        }
                    }
                    let message = protocol::query_results_message(id, data, outcome.extra);
                    self.send_value(message).await?;
                }
                Err(err) => self.send_reply(&reply, Err(err)).await?,
            },
            Completion::QueryResubscribe { reply, result } => {
                let result = result.map(|()| Map::new());
                self.send_reply(&reply, result).await?;
            }
        }
        Ok(())
    }

    /// Install a document stream, displacing (and destroying) any prior
    /// stream for the same document. A stream arriving after close is
    /// destroyed on the spot.
    fn install_doc(&mut self, collection: String, id: String, mut stream: DocStream) {
        if self.closed {
            stream.destroy();
            return;
        }
        if let Some(mut old) = self.docs.insert((collection, id), stream) {
            old.destroy();
        }
    }

    fn install_query(
        &mut self,
        id: i64,
        collection: String,
        options: QueryOptions,
        sub: QuerySubscription,
    ) {
        let mut channel = QueryChannel {
            sub,
            collection,
            options,
        };
        if self.closed {
            channel.sub.destroy();
            return;
        }
        if let Some(mut old) = self.queries.insert(id, channel) {
            old.sub.destroy();
        }
    }

    async fn doc_event(&mut self, key: DocKey, event: DocEvent) -> Result<(), ProtocolError> {
        match event {
            DocEvent::Error(err) => {
                // Not attributable to a client request; absorb it.
                log::error!("doc stream error on {}/{}: {err}", key.0, key.1);
                Ok(())
            }
            DocEvent::Op(op) => {
                if self.is_own_op(&key.0, &op) {
                    return Ok(());
                }
                self.send_op(&key.0, &key.1, &op).await
            }
        }
    }

    async fn query_event(&mut self, id: i64, event: QueryEvent) -> Result<(), ProtocolError> {
        match event {
            QueryEvent::Extra(extra) => {
                self.send_value(protocol::query_extra_message(id, extra)).await
            }
            QueryEvent::Diff(diff) => {
                self.send_value(protocol::query_diff_message(id, &diff)).await
            }
            QueryEvent::Op { id: doc_id, op } => {
                let collection = self
                    .queries
                    .iter()
                    .find(|(key, _)| *key == id)
                    .map(|(_, channel)| channel.collection.clone());
                match collection {
                    Some(collection) if !self.is_own_op(&collection, &op) => {
                        self.send_op(&collection, &doc_id, &op).await
                    }
                    _ => Ok(()),
                }
            }
            QueryEvent::Error(err) => {
                log::error!("query {id} stream error: {err}");
                Ok(())
            }
        }
    }

    /// An op this client submitted itself, echoed back on a push stream.
    /// The submit ack is its only acknowledgement.
    fn is_own_op(&self, collection: &str, op: &Op) -> bool {
        op.src == self.ctx.client_id && op.source_collection() == Some(collection)
    }

    async fn send_op(
        &mut self,
        collection: &str,
        id: &str,
        op: &Op,
    ) -> Result<(), ProtocolError> {
        self.send_value(protocol::op_message(collection, id, op)).await
    }

    async fn send_reply(
        &mut self,
        reply: &ReplyTo,
        result: Result<Map<String, Value>, WireError>,
    ) -> Result<(), ProtocolError> {
        self.send_value(protocol::frame_reply(reply, result)).await
    }

    /// Write one record to the client; silently dropped once closed.
    async fn send_value(&mut self, record: Value) -> Result<(), ProtocolError> {
        if self.closed {
            return Ok(());
        }
        self.stream.send(record).await
    }
}

/// Compute the ops a query caller missed: for every result newer than the
/// version the caller holds, replay from the caller's version.
async fn query_catchup(
    backend: &dyn Backend,
    ctx: &AgentContext,
    collection: &str,
    options: &QueryOptions,
    results: &[QueryResult],
) -> Result<Vec<(String, Vec<Op>)>, WireError> {
    let Some(versions) = &options.versions else {
        return Ok(Vec::new());
    };
    let mut from = HashMap::new();
    for result in results {
        if let Some(Some(known)) = versions.get(&result.id) {
            if result.v > *known {
                from.insert(result.id.clone(), *known);
            }
        }
    }
    if from.is_empty() {
        return Ok(Vec::new());
    }
    let mut by_doc = backend.get_ops_bulk(ctx, collection, from, None).await?;
    // Deliver in result order so replay is deterministic.
    let mut ordered = Vec::new();
    for result in results {
        if let Some(ops) = by_doc.remove(&result.id) {
            ordered.push((result.id.clone(), ops));
        }
    }
    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::OpContent;
    use crate::stream::pipe;

    struct NoBackend;

    #[async_trait::async_trait]
    impl Backend for NoBackend {
        async fn subscribe(
            &self,
            _agent: &AgentContext,
            _collection: &str,
            _id: &str,
            _version: Option<u64>,
        ) -> Result<(DocStream, Option<Snapshot>), WireError> {
            Err(WireError::new(500, "unavailable"))
        }

        async fn subscribe_bulk(
            &self,
            _agent: &AgentContext,
            _collection: &str,
            _versions: HashMap<String, Option<u64>>,
        ) -> Result<BulkSubscription, WireError> {
            Err(WireError::new(500, "unavailable"))
        }

        async fn fetch(
            &self,
            _agent: &AgentContext,
            _collection: &str,
            _id: &str,
        ) -> Result<Snapshot, WireError> {
            Err(WireError::new(500, "unavailable"))
        }

        async fn get_ops(
            &self,
            _agent: &AgentContext,
            _collection: &str,
            _id: &str,
            _from: u64,
            _to: Option<u64>,
        ) -> Result<Vec<Op>, WireError> {
            Err(WireError::new(500, "unavailable"))
        }

        async fn get_ops_bulk(
            &self,
            _agent: &AgentContext,
            _collection: &str,
            _from: HashMap<String, u64>,
            _to: Option<HashMap<String, u64>>,
        ) -> Result<HashMap<String, Vec<Op>>, WireError> {
            Err(WireError::new(500, "unavailable"))
        }

        async fn submit(
            &self,
            _agent: &AgentContext,
            _collection: &str,
            _id: &str,
            _op: Op,
        ) -> Result<SubmitResult, WireError> {
            Err(WireError::new(500, "unavailable"))
        }

        async fn query_subscribe(
            &self,
            _agent: &AgentContext,
            _collection: &str,
            _query: Value,
            _options: &QueryOptions,
        ) -> Result<(QuerySubscription, Vec<QueryResult>, Option<Value>), WireError> {
            Err(WireError::new(500, "unavailable"))
        }

        async fn query_resubscribe(
            &self,
            _agent: &AgentContext,
            _index: u64,
            _query: Value,
            _options: &QueryOptions,
        ) -> Result<(), WireError> {
            Err(WireError::new(500, "unavailable"))
        }

        async fn query_fetch(
            &self,
            _agent: &AgentContext,
            _collection: &str,
            _query: Value,
            _options: &QueryOptions,
        ) -> Result<(Vec<QueryResult>, Option<Value>), WireError> {
            Err(WireError::new(500, "unavailable"))
        }
    }

    fn agent() -> Agent {
        let (server, _client) = pipe();
        Agent::new(Arc::new(NoBackend), Box::new(server))
    }

    #[test]
    fn test_client_ids_are_unique_and_nonempty() {
        let a = agent();
        let b = agent();
        assert!(!a.client_id().is_empty());
        assert_ne!(a.client_id(), b.client_id());
    }

    #[test]
    fn test_own_op_matches_on_src_and_source_collection() {
        let agent = agent();
        let op = |src: &str, collection: Option<&str>, source: Option<&str>| Op {
            v: Some(1),
            src: src.into(),
            seq: Some(1),
            content: OpContent::Del,
            meta: None,
            collection: collection.map(Into::into),
            source: source.map(Into::into),
        };
        let own = agent.client_id().to_string();

        assert!(agent.is_own_op("users", &op(&own, Some("users"), None)));
        // Same client, but the op came through a different projection.
        assert!(!agent.is_own_op("users", &op(&own, Some("accounts"), None)));
        assert!(agent.is_own_op("users_public", &op(&own, Some("users"), Some("users_public"))));
        // Someone else's op is never filtered.
        assert!(!agent.is_own_op("users", &op("other", Some("users"), None)));
    }
}
