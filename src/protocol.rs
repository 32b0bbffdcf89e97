//! JSON wire protocol between clients and the session core.
//!
//! Every message is a JSON record tagged with an action field `a`:
//! ```text
//! C→S  {"a":"sub",  "c":"users", "d":"fred"}
//! S→C  {"a":"sub",  "c":"users", "d":"fred", "data":{"v":5,"data":"hi"}}
//! C→S  {"a":"op",   "c":"users", "d":"fred", "v":5, "seq":1, "op":[...]}
//! S→C  {"a":"op",   "c":"users", "d":"fred", "src":"...", "seq":1, "v":5}
//! ```
//! Incoming records are first captured loosely ([`Request`]) so that a
//! malformed request can still be answered with its `c`/`d`/`id` fields
//! echoed back, then validated into a typed [`Command`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::backend::{Op, OpContent, QueryDiff, QueryOptions, QueryResult};

/// Protocol version advertised in the `init` message.
pub const PROTOCOL_VERSION: u64 = 0;

/// Error code for a request that failed validation.
pub const ERR_MESSAGE_BADLY_FORMED: u64 = 4000;
/// Error code the Backend uses for a resubmitted op; treated as success.
pub const ERR_OP_ALREADY_SUBMITTED: u64 = 4001;

/// A request-scoped error in its wire shape.
///
/// Used both for errors the core raises itself (validation, code 4000) and
/// for errors surfaced from the Backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: u64,
    pub message: String,
}

impl WireError {
    pub fn new(code: u64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// A code-4000 validation error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ERR_MESSAGE_BADLY_FORMED, message)
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl std::error::Error for WireError {}

/// Fatal session errors. Any of these tears the connection down.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    /// A text frame failed to parse as JSON.
    Parse(String),
    /// An outbound record failed to serialize.
    Serialize(String),
    /// The transport reported an error.
    Transport(String),
    ConnectionClosed,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(e) => write!(f, "message parse error: {e}"),
            Self::Serialize(e) => write!(f, "message serialize error: {e}"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// A client request, captured loosely before validation.
///
/// All fields are optional at this stage; [`Request::validate`] enforces the
/// per-action requirements. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Request {
    pub a: Option<String>,
    pub c: Option<Value>,
    pub d: Option<Value>,
    pub v: Option<Value>,
    pub id: Option<Value>,
    pub s: Option<Value>,
    pub q: Option<Value>,
    pub vs: Option<Value>,
    pub db: Option<Value>,
    pub src: Option<Value>,
    pub seq: Option<Value>,
    pub op: Option<Value>,
    pub create: Option<Value>,
    pub del: Option<Value>,
}

/// The fields of a request a reply is framed against.
#[derive(Debug, Clone)]
pub struct ReplyTo {
    pub a: Option<String>,
    pub c: Option<Value>,
    pub d: Option<Value>,
    pub id: Option<Value>,
}

/// A validated client request.
#[derive(Debug, Clone)]
pub enum Command {
    Subscribe {
        collection: String,
        id: String,
        version: Option<u64>,
    },
    Unsubscribe {
        collection: String,
        id: String,
    },
    Fetch {
        collection: String,
        id: String,
        version: Option<u64>,
    },
    /// Collection → (doc id → catch-up version). Ordered so that the
    /// first-error rule of a partial failure is deterministic.
    BulkSubscribe {
        collections: BTreeMap<String, HashMap<String, Option<u64>>>,
    },
    Submit {
        collection: String,
        id: String,
        op: SubmitOp,
    },
    QuerySubscribe {
        id: i64,
        collection: String,
        query: Value,
        options: QueryOptions,
    },
    QueryFetch {
        id: i64,
        collection: String,
        query: Value,
        options: QueryOptions,
    },
    QueryUnsubscribe {
        id: i64,
    },
    QueryResubscribe {
        id: i64,
        query: Value,
    },
}

/// The op-shaped part of a validated `op` request.
#[derive(Debug, Clone)]
pub struct SubmitOp {
    pub version: Option<u64>,
    pub src: Option<String>,
    pub seq: Option<u64>,
    pub content: OpContent,
}

impl Request {
    /// Capture a parsed record.
    pub fn from_record(record: Value) -> Result<Self, WireError> {
        if !record.is_object() {
            return Err(WireError::malformed("message must be an object"));
        }
        serde_json::from_value(record)
            .map_err(|e| WireError::malformed(format!("malformed message: {e}")))
    }

    /// The request fields echoed into the reply.
    pub fn reply_to(&self) -> ReplyTo {
        ReplyTo {
            a: self.a.clone(),
            c: self.c.clone(),
            d: self.d.clone(),
            id: self.id.clone(),
        }
    }

    /// Validate into a typed [`Command`], or a code-4000 error.
    pub fn validate(&self) -> Result<Command, WireError> {
        match self.a.as_deref() {
            Some("sub") => Ok(Command::Subscribe {
                collection: require_string(&self.c, "c")?,
                id: require_string(&self.d, "d")?,
                version: optional_version(&self.v, "v")?,
            }),
            Some("unsub") => Ok(Command::Unsubscribe {
                collection: require_string(&self.c, "c")?,
                id: require_string(&self.d, "d")?,
            }),
            Some("fetch") => Ok(Command::Fetch {
                collection: require_string(&self.c, "c")?,
                id: require_string(&self.d, "d")?,
                version: optional_version(&self.v, "v")?,
            }),
            Some("bs") => {
                let s = self
                    .s
                    .clone()
                    .ok_or_else(|| WireError::malformed("s must be an object"))?;
                let collections = serde_json::from_value(s).map_err(|_| {
                    WireError::malformed("s must map collections to document versions")
                })?;
                Ok(Command::BulkSubscribe { collections })
            }
            Some("op") => Ok(Command::Submit {
                collection: require_string(&self.c, "c")?,
                id: require_string(&self.d, "d")?,
                op: self.submit_op()?,
            }),
            Some("qsub") => Ok(Command::QuerySubscribe {
                id: require_query_id(&self.id)?,
                collection: require_string(&self.c, "c")?,
                query: self.q.clone().unwrap_or(Value::Null),
                options: self.query_options()?,
            }),
            Some("qfetch") => Ok(Command::QueryFetch {
                id: require_query_id(&self.id)?,
                collection: require_string(&self.c, "c")?,
                query: self.q.clone().unwrap_or(Value::Null),
                options: self.query_options()?,
            }),
            Some("qunsub") => Ok(Command::QueryUnsubscribe {
                id: require_query_id(&self.id)?,
            }),
            Some("qresub") => Ok(Command::QueryResubscribe {
                id: require_query_id(&self.id)?,
                query: self.q.clone().unwrap_or(Value::Null),
            }),
            _ => Err(WireError::malformed("invalid or unknown message")),
        }
    }

    fn submit_op(&self) -> Result<SubmitOp, WireError> {
        let src = match &self.src {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => return Err(WireError::malformed("src must be a string")),
        };
        let has_del = self.del.as_ref().map(is_truthy).unwrap_or(false);
        let content = match (&self.op, &self.create, has_del) {
            (Some(op), None, false) => OpContent::Edit(op.clone()),
            (None, Some(create), false) => OpContent::Create(create.clone()),
            (None, None, true) => OpContent::Del,
            _ => {
                return Err(WireError::malformed(
                    "op must contain exactly one of op, create or del",
                ))
            }
        };
        Ok(SubmitOp {
            version: optional_version(&self.v, "v")?,
            src,
            seq: optional_version(&self.seq, "seq")?,
            content,
        })
    }

    fn query_options(&self) -> Result<QueryOptions, WireError> {
        let versions = match &self.vs {
            None | Some(Value::Null) => None,
            Some(vs) => Some(serde_json::from_value(vs.clone()).map_err(|_| {
                WireError::malformed("vs must map document ids to versions")
            })?),
        };
        Ok(QueryOptions {
            versions,
            db: self.db.clone(),
        })
    }
}

fn require_string(field: &Option<Value>, name: &str) -> Result<String, WireError> {
    match field {
        Some(Value::String(s)) => Ok(s.clone()),
        _ => Err(WireError::malformed(format!("{name} must be a string"))),
    }
}

fn optional_version(field: &Option<Value>, name: &str) -> Result<Option<u64>, WireError> {
    match field {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_u64().map(Some).ok_or_else(|| {
            WireError::malformed(format!("{name} must be a non-negative integer"))
        }),
    }
}

fn require_query_id(field: &Option<Value>) -> Result<i64, WireError> {
    field
        .as_ref()
        .and_then(Value::as_i64)
        .ok_or_else(|| WireError::malformed("id must be a number"))
}

/// JSON truthiness, used when echoing request fields into replies.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Frame a reply to a request: the error or body, overlaid with the
/// request's `a` and its truthy `c`, `d` and `id` fields.
pub fn frame_reply(reply: &ReplyTo, result: Result<Map<String, Value>, WireError>) -> Value {
    let mut record = match result {
        Ok(body) => body,
        Err(err) => {
            let mut body = Map::new();
            body.insert(
                "error".into(),
                serde_json::to_value(err).unwrap_or(Value::Null),
            );
            body
        }
    };
    if let Some(a) = &reply.a {
        record.insert("a".into(), Value::String(a.clone()));
    }
    for (name, field) in [("c", &reply.c), ("d", &reply.d), ("id", &reply.id)] {
        if let Some(value) = field {
            if is_truthy(value) {
                record.insert(name.into(), value.clone());
            }
        }
    }
    Value::Object(record)
}

/// The one server-initiated message sent on connect.
pub fn init_message(client_id: &str) -> Value {
    serde_json::json!({"a": "init", "protocol": PROTOCOL_VERSION, "id": client_id})
}

/// Translate a Backend op into an `op` push message for one document.
///
/// Only `v`, `src`, `seq` and the op content cross the wire; metadata and
/// the op's own collection fields do not propagate.
pub fn op_message(collection: &str, id: &str, op: &Op) -> Value {
    let mut record = Map::new();
    record.insert("a".into(), Value::String("op".into()));
    record.insert("c".into(), Value::String(collection.into()));
    record.insert("d".into(), Value::String(id.into()));
    if let Some(v) = op.v {
        record.insert("v".into(), Value::from(v));
    }
    record.insert("src".into(), Value::String(op.src.clone()));
    if let Some(seq) = op.seq {
        record.insert("seq".into(), Value::from(seq));
    }
    match &op.content {
        OpContent::Edit(edit) => {
            record.insert("op".into(), edit.clone());
        }
        OpContent::Create(create) => {
            record.insert("create".into(), create.clone());
        }
        OpContent::Del => {
            record.insert("del".into(), Value::Bool(true));
        }
    }
    Value::Object(record)
}

/// Translate query results into their wire form.
///
/// `data` is included only for results the caller has no prior version of,
/// and `type` is run-length compressed: present only when it differs from
/// the previous result's type.
pub fn map_results(
    results: &[QueryResult],
    versions: Option<&HashMap<String, Option<u64>>>,
) -> Vec<Value> {
    let mut mapped = Vec::with_capacity(results.len());
    let mut prev_type: Option<&str> = None;
    for result in results {
        let mut item = Map::new();
        item.insert("d".into(), Value::String(result.id.clone()));
        item.insert("v".into(), Value::from(result.v));
        let known = versions
            .and_then(|m| m.get(&result.id))
            .map(Option::is_some)
            .unwrap_or(false);
        if !known {
            item.insert("data".into(), result.data.clone());
        }
        if result.doc_type.as_deref() != prev_type {
            if let Some(doc_type) = &result.doc_type {
                item.insert("type".into(), Value::String(doc_type.clone()));
            }
        }
        prev_type = result.doc_type.as_deref();
        mapped.push(Value::Object(item));
    }
    mapped
}

/// A query's result-set message: the reply to `qsub` and `qfetch`.
pub fn query_results_message(id: i64, data: Vec<Value>, extra: Option<Value>) -> Value {
    let mut record = Map::new();
    record.insert("a".into(), Value::String("q".into()));
    record.insert("id".into(), Value::from(id));
    record.insert("data".into(), Value::Array(data));
    if let Some(extra) = extra {
        record.insert("extra".into(), extra);
    }
    Value::Object(record)
}

/// A live query's `extra` push message.
pub fn query_extra_message(id: i64, extra: Value) -> Value {
    serde_json::json!({"a": "q", "id": id, "extra": extra})
}

/// A live query's `diff` push message. Inserted values are translated the
/// same way as initial query results.
pub fn query_diff_message(id: i64, diff: &[QueryDiff]) -> Value {
    let items: Vec<Value> = diff
        .iter()
        .map(|entry| match entry {
            QueryDiff::Insert { index, values } => serde_json::json!({
                "type": "insert",
                "index": index,
                "values": map_results(values, None),
            }),
            QueryDiff::Remove { index, how_many } => serde_json::json!({
                "type": "remove",
                "index": index,
                "howMany": how_many,
            }),
            QueryDiff::Move { from, to, how_many } => serde_json::json!({
                "type": "move",
                "from": from,
                "to": to,
                "howMany": how_many,
            }),
        })
        .collect();
    serde_json::json!({"a": "q", "id": id, "diff": items})
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(record: Value) -> Request {
        Request::from_record(record).unwrap()
    }

    #[test]
    fn test_from_record_rejects_non_object() {
        assert!(Request::from_record(json!([1, 2])).is_err());
        assert!(Request::from_record(json!("sub")).is_err());
    }

    #[test]
    fn test_validate_subscribe() {
        let cmd = request(json!({"a": "sub", "c": "users", "d": "fred", "v": 3}))
            .validate()
            .unwrap();
        match cmd {
            Command::Subscribe {
                collection,
                id,
                version,
            } => {
                assert_eq!(collection, "users");
                assert_eq!(id, "fred");
                assert_eq!(version, Some(3));
            }
            other => panic!("expected Subscribe, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_rejects_unknown_action() {
        let err = request(json!({"a": "dance"})).validate().unwrap_err();
        assert_eq!(err.code, ERR_MESSAGE_BADLY_FORMED);
    }

    #[test]
    fn test_validate_rejects_missing_action() {
        let err = request(json!({"c": "users"})).validate().unwrap_err();
        assert_eq!(err.code, ERR_MESSAGE_BADLY_FORMED);
    }

    #[test]
    fn test_validate_rejects_non_string_collection() {
        let err = request(json!({"a": "sub", "c": 7, "d": "fred"}))
            .validate()
            .unwrap_err();
        assert_eq!(err.code, ERR_MESSAGE_BADLY_FORMED);
        assert!(err.message.contains("c"));
    }

    #[test]
    fn test_validate_rejects_negative_version() {
        let err = request(json!({"a": "op", "c": "users", "d": "fred", "v": -1, "op": []}))
            .validate()
            .unwrap_err();
        assert_eq!(err.code, ERR_MESSAGE_BADLY_FORMED);
    }

    #[test]
    fn test_validate_rejects_non_numeric_query_id() {
        let err = request(json!({"a": "qsub", "id": "seven", "c": "users", "q": {}}))
            .validate()
            .unwrap_err();
        assert_eq!(err.code, ERR_MESSAGE_BADLY_FORMED);
    }

    #[test]
    fn test_validate_bulk_subscribe_shape() {
        let cmd = request(json!({"a": "bs", "s": {"users": {"fred": 2, "sue": null}}}))
            .validate()
            .unwrap();
        match cmd {
            Command::BulkSubscribe { collections } => {
                let users = &collections["users"];
                assert_eq!(users["fred"], Some(2));
                assert_eq!(users["sue"], None);
            }
            other => panic!("expected BulkSubscribe, got {other:?}"),
        }
        let err = request(json!({"a": "bs", "s": [1, 2]})).validate().unwrap_err();
        assert_eq!(err.code, ERR_MESSAGE_BADLY_FORMED);
    }

    #[test]
    fn test_submit_requires_exactly_one_payload() {
        let base = json!({"a": "op", "c": "users", "d": "fred", "v": 1, "seq": 1});
        let mut both = base.clone();
        both["op"] = json!([]);
        both["create"] = json!({"type": "text"});
        assert!(request(both).validate().is_err());

        let mut neither = base.clone();
        neither["del"] = json!(false);
        assert!(request(neither).validate().is_err());

        let mut del = base;
        del["del"] = json!(true);
        match request(del).validate().unwrap() {
            Command::Submit { op, .. } => assert!(matches!(op.content, OpContent::Del)),
            other => panic!("expected Submit, got {other:?}"),
        }
    }

    #[test]
    fn test_frame_reply_copies_truthy_fields() {
        let req = request(json!({"a": "sub", "c": "users", "d": "fred"}));
        let framed = frame_reply(&req.reply_to(), Ok(Map::new()));
        assert_eq!(framed, json!({"a": "sub", "c": "users", "d": "fred"}));
    }

    #[test]
    fn test_frame_reply_skips_falsy_fields() {
        // A zero query id is falsy and is not echoed; the body keeps its own.
        let req = request(json!({"a": "qunsub", "id": 0}));
        let framed = frame_reply(&req.reply_to(), Ok(Map::new()));
        assert_eq!(framed, json!({"a": "qunsub"}));
    }

    #[test]
    fn test_frame_reply_error_shape() {
        let req = request(json!({"a": "sub", "c": "users", "d": "fred"}));
        let framed = frame_reply(&req.reply_to(), Err(WireError::malformed("nope")));
        assert_eq!(
            framed,
            json!({
                "a": "sub", "c": "users", "d": "fred",
                "error": {"code": 4000, "message": "nope"},
            })
        );
    }

    #[test]
    fn test_op_message_carries_only_wire_fields() {
        let op = Op {
            v: Some(5),
            src: "abc".into(),
            seq: Some(2),
            content: OpContent::Edit(json!([{"p": 0, "si": "x"}])),
            meta: Some(json!({"ts": 12345})),
            collection: Some("users".into()),
            source: Some("users_public".into()),
        };
        let msg = op_message("users_public", "fred", &op);
        assert_eq!(
            msg,
            json!({
                "a": "op", "c": "users_public", "d": "fred",
                "v": 5, "src": "abc", "seq": 2,
                "op": [{"p": 0, "si": "x"}],
            })
        );
    }

    #[test]
    fn test_op_message_delete() {
        let op = Op {
            v: Some(9),
            src: "abc".into(),
            seq: Some(4),
            content: OpContent::Del,
            meta: None,
            collection: None,
            source: None,
        };
        let msg = op_message("users", "fred", &op);
        assert_eq!(msg["del"], json!(true));
        assert!(msg.get("op").is_none());
    }

    #[test]
    fn test_map_results_elides_known_data() {
        let results = vec![
            QueryResult {
                id: "a".into(),
                v: 3,
                doc_type: Some("text".into()),
                data: json!("hello"),
            },
            QueryResult {
                id: "b".into(),
                v: 2,
                doc_type: Some("text".into()),
                data: json!("world"),
            },
        ];
        let mut versions = HashMap::new();
        versions.insert("a".to_string(), Some(1));
        versions.insert("b".to_string(), Some(2));
        let mapped = map_results(&results, Some(&versions));
        assert_eq!(
            mapped,
            vec![
                json!({"d": "a", "v": 3, "type": "text"}),
                json!({"d": "b", "v": 2}),
            ]
        );
    }

    #[test]
    fn test_map_results_includes_data_for_unknown_docs() {
        let results = vec![QueryResult {
            id: "a".into(),
            v: 1,
            doc_type: Some("text".into()),
            data: json!("hello"),
        }];
        // No versions at all, and a null version: both mean "send data".
        let mapped = map_results(&results, None);
        assert_eq!(mapped[0]["data"], json!("hello"));

        let mut versions = HashMap::new();
        versions.insert("a".to_string(), None);
        let mapped = map_results(&results, Some(&versions));
        assert_eq!(mapped[0]["data"], json!("hello"));
    }

    #[test]
    fn test_map_results_type_run_length() {
        let mk = |id: &str, doc_type: Option<&str>| QueryResult {
            id: id.into(),
            v: 1,
            doc_type: doc_type.map(Into::into),
            data: json!(null),
        };
        let results = vec![
            mk("a", Some("text")),
            mk("b", Some("text")),
            mk("c", Some("json0")),
            mk("d", Some("text")),
        ];
        let mapped = map_results(&results, None);
        assert_eq!(mapped[0]["type"], json!("text"));
        assert!(mapped[1].get("type").is_none());
        assert_eq!(mapped[2]["type"], json!("json0"));
        assert_eq!(mapped[3]["type"], json!("text"));
    }

    #[test]
    fn test_query_diff_message() {
        let diff = vec![
            QueryDiff::Insert {
                index: 0,
                values: vec![QueryResult {
                    id: "a".into(),
                    v: 1,
                    doc_type: Some("text".into()),
                    data: json!("hi"),
                }],
            },
            QueryDiff::Remove {
                index: 3,
                how_many: 2,
            },
        ];
        let msg = query_diff_message(7, &diff);
        assert_eq!(
            msg,
            json!({
                "a": "q", "id": 7,
                "diff": [
                    {"type": "insert", "index": 0,
                     "values": [{"d": "a", "v": 1, "type": "text", "data": "hi"}]},
                    {"type": "remove", "index": 3, "howMany": 2},
                ],
            })
        );
    }

    #[test]
    fn test_init_message() {
        assert_eq!(
            init_message("abc"),
            json!({"a": "init", "protocol": 0, "id": "abc"})
        );
    }
}
