//! Redis Streams-backed transacted broker (durable, at-least-once delivery).
//!
//! ## Layout
//!
//! - **Request streams**: one per media type, `<queue>:<MEDIA_TYPE>`
//!   (e.g. `MPF.DETECTION_FACE_REQUEST:VIDEO`). A session's media-type filter
//!   selects which of these streams it reads.
//! - **Reply streams**: the reply-to destination name is used as the stream
//!   key as is.
//! - **Consumer group**: every executor consuming the same queue joins one
//!   group, so each request goes to exactly one executor.
//! - **Dead-letter stream**: `DLQ`, for requests rolled back too many times.
//!
//! ## Transactions
//!
//! A received entry stays in the group's pending list until the session
//! commits. `commit` appends staged responses and acknowledges consumed
//! requests in one `MULTI`/`EXEC`. `rollback` keeps the entries pending and
//! hands them out again on the next `receive`; entries still pending when a
//! session opens (left over from a crashed executor with the same consumer
//! name) are redelivered first.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use redis::Value;
use tracing::{debug, info, instrument, warn};

use batchexec_core::{DataType, MessageId};
use batchexec_messaging::{
    BrokerConnection, BrokerConnector, BrokerError, BrokerMessage, DEAD_LETTER_QUEUE,
    DEFAULT_PRIORITY, Destination, MEDIA_TYPE_PROPERTY, MediaTypeFilter, MessageBody,
    PropertyValue, TransactedSession,
};

/// Default consumer group.
const DEFAULT_GROUP: &str = "batchexec";

/// Redeliveries allowed before dead-lettering.
const DEFAULT_MAX_REDELIVERIES: u32 = 6;

/// How long one blocking read waits before re-checking for close.
const DEFAULT_BLOCK_MS: u64 = 1000;

const FIELD_BODY: &str = "body";
const FIELD_KIND: &str = "kind";
const FIELD_MESSAGE_ID: &str = "message_id";
const FIELD_PRIORITY: &str = "priority";
const FIELD_REPLY_TO: &str = "reply_to";
const FIELD_REDELIVERY: &str = "redelivery";
const PROPERTY_FIELD_PREFIX: &str = "p:";

fn command_error(command: &str, e: redis::RedisError) -> BrokerError {
    BrokerError::Transport(format!("{command} failed: {e}"))
}

fn connection_error(e: redis::RedisError) -> BrokerError {
    BrokerError::Connection(e.to_string())
}

/// Stream holding requests of `data_type` for `queue`.
pub fn request_stream(queue: &str, data_type: DataType) -> String {
    format!("{queue}:{}", data_type.name())
}

/// Streams read by a session consuming `queue` through `filter`.
pub fn request_streams(queue: &str, filter: &MediaTypeFilter) -> Vec<String> {
    let types: &[DataType] = if filter.is_empty() {
        &DataType::ALL
    } else {
        filter.media_types()
    };
    types.iter().map(|t| request_stream(queue, *t)).collect()
}

#[derive(Debug, Clone)]
pub struct RedisStreamsBroker {
    client: Arc<redis::Client>,
    group: String,
    consumer: String,
    max_redeliveries: u32,
    block_ms: u64,
}

impl RedisStreamsBroker {
    /// `consumer` must be unique per executor process and stable across
    /// restarts for pending entries to be recovered.
    pub fn new(redis_url: impl AsRef<str>, consumer: impl Into<String>) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(connection_error)?;
        Ok(Self {
            client: Arc::new(client),
            group: DEFAULT_GROUP.to_string(),
            consumer: consumer.into(),
            max_redeliveries: DEFAULT_MAX_REDELIVERIES,
            block_ms: DEFAULT_BLOCK_MS,
        })
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_max_redeliveries(mut self, max_redeliveries: u32) -> Self {
        self.max_redeliveries = max_redeliveries;
        self
    }

    /// Append a request, routed to the stream of its `MediaType` property.
    pub fn publish_request(&self, queue: &str, message: &BrokerMessage) -> Result<String, BrokerError> {
        let data_type = message
            .string_property(MEDIA_TYPE_PROPERTY)
            .and_then(|t| DataType::parse(&t))
            .unwrap_or(DataType::Unknown);
        let mut conn = self.client.get_connection().map_err(connection_error)?;
        xadd(&mut conn, &request_stream(queue, data_type), message)
    }
}

impl BrokerConnector for RedisStreamsBroker {
    type Connection = RedisStreamsConnection;

    fn connect(&self) -> Result<RedisStreamsConnection, BrokerError> {
        // Fail fast on an unreachable server.
        let mut conn = self.client.get_connection().map_err(connection_error)?;
        let _: String = redis::cmd("PING")
            .query(&mut conn)
            .map_err(connection_error)?;
        Ok(RedisStreamsConnection {
            broker: self.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}

#[derive(Debug)]
pub struct RedisStreamsConnection {
    broker: RedisStreamsBroker,
    closed: Arc<AtomicBool>,
}

impl RedisStreamsConnection {
    fn check_open(&self) -> Result<(), BrokerError> {
        if self.is_closed() {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }
}

impl BrokerConnection for RedisStreamsConnection {
    type Session = RedisStreamsSession;

    #[instrument(skip(self, filter), fields(group = %self.broker.group, consumer = %self.broker.consumer), err)]
    fn open_session(
        &self,
        request_queue: &str,
        filter: &MediaTypeFilter,
    ) -> Result<RedisStreamsSession, BrokerError> {
        self.check_open()?;
        let mut conn = self.broker.client.get_connection().map_err(connection_error)?;
        let streams = request_streams(request_queue, filter);

        for stream in &streams {
            // XGROUP CREATE with MKSTREAM creates the stream if needed. An
            // existing group (BUSYGROUP) is fine.
            let created: redis::RedisResult<String> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(stream)
                .arg(&self.broker.group)
                .arg("0")
                .arg("MKSTREAM")
                .query(&mut conn);
            if let Err(e) = created {
                if e.code() != Some("BUSYGROUP") {
                    return Err(command_error("XGROUP CREATE", e));
                }
            }
        }

        let mut session = RedisStreamsSession {
            conn,
            closed: self.closed.clone(),
            group: self.broker.group.clone(),
            consumer: self.broker.consumer.clone(),
            streams,
            max_redeliveries: self.broker.max_redeliveries,
            block_ms: self.broker.block_ms,
            redeliver: VecDeque::new(),
            consumed: Vec::new(),
            staged: Vec::new(),
        };
        session.recover_pending()?;
        Ok(session)
    }

    #[instrument(skip(self, message), err)]
    fn request_reply(
        &self,
        queue: &str,
        message: BrokerMessage,
        timeout: Option<Duration>,
    ) -> Result<BrokerMessage, BrokerError> {
        self.check_open()?;
        let mut conn = self.broker.client.get_connection().map_err(connection_error)?;
        let reply_stream = format!("temp-queue:{}", uuid::Uuid::now_v7());
        let message = message.with_reply_to(Destination::queue(reply_stream.clone()));
        xadd(&mut conn, queue, &message)?;

        let deadline = timeout.map(|t| Instant::now() + t);
        let result = loop {
            if self.is_closed() {
                break Err(BrokerError::Closed);
            }
            let block_ms = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        break Err(BrokerError::Timeout(Destination::queue(reply_stream.clone())));
                    }
                    (left.as_millis() as u64).clamp(1, self.broker.block_ms)
                }
                None => self.broker.block_ms,
            };
            let reply: Value = redis::cmd("XREAD")
                .arg("COUNT")
                .arg(1)
                .arg("BLOCK")
                .arg(block_ms)
                .arg("STREAMS")
                .arg(&reply_stream)
                .arg("0")
                .query(&mut conn)
                .map_err(|e| command_error("XREAD", e))?;
            let reply = parse_read_reply(reply)?.into_iter().find_map(|entry| entry.fields);
            if let Some(fields) = reply {
                break decode_message(&fields);
            }
        };

        let _: redis::RedisResult<i64> = redis::cmd("DEL").arg(&reply_stream).query(&mut conn);
        result
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// A consumed request awaiting commit or rollback.
#[derive(Debug, Clone)]
struct InFlight {
    stream: String,
    entry_id: String,
    message: BrokerMessage,
}

pub struct RedisStreamsSession {
    conn: redis::Connection,
    closed: Arc<AtomicBool>,
    group: String,
    consumer: String,
    streams: Vec<String>,
    max_redeliveries: u32,
    block_ms: u64,
    /// Rolled-back entries, still pending in Redis, handed out first.
    redeliver: VecDeque<InFlight>,
    consumed: Vec<InFlight>,
    staged: Vec<(Destination, BrokerMessage)>,
}

impl RedisStreamsSession {
    /// Queue entries left pending for this consumer by an earlier process.
    fn recover_pending(&mut self) -> Result<(), BrokerError> {
        for entry in self.read_group("0", None)? {
            if let Some(mut in_flight) = self.settle(entry)? {
                in_flight.message.redelivery_count += 1;
                warn!(
                    stream = %in_flight.stream,
                    entry_id = %in_flight.entry_id,
                    "redelivering pending entry"
                );
                self.redeliver.push_back(in_flight);
            }
        }
        Ok(())
    }

    /// Turn a read entry into a deliverable message. Entries that can never
    /// be delivered are acknowledged here so they leave the pending list.
    fn settle(&mut self, entry: StreamEntry) -> Result<Option<InFlight>, BrokerError> {
        match classify(entry) {
            Delivery::Message(in_flight) => Ok(Some(in_flight)),
            Delivery::Deleted { stream, entry_id } => {
                warn!(stream = %stream, entry_id = %entry_id, "acknowledging deleted entry");
                let _: i64 = redis::cmd("XACK")
                    .arg(&stream)
                    .arg(&self.group)
                    .arg(&entry_id)
                    .query(&mut self.conn)
                    .map_err(|e| command_error("XACK", e))?;
                Ok(None)
            }
            Delivery::Undecodable {
                stream,
                entry_id,
                fields,
                reason,
            } => {
                let mut pipe = redis::pipe();
                pipe.atomic();
                pipe.add_command(raw_xadd_cmd(
                    DEAD_LETTER_QUEUE,
                    dead_letter_fields(fields, &stream, &entry_id, &reason),
                ))
                .ignore();
                pipe.cmd("XACK")
                    .arg(&stream)
                    .arg(&self.group)
                    .arg(&entry_id)
                    .ignore();
                pipe.query::<()>(&mut self.conn)
                    .map_err(|e| command_error("dead-letter MULTI", e))?;
                warn!(
                    stream = %stream,
                    entry_id = %entry_id,
                    reason = %reason,
                    "undecodable entry sent to dead-letter queue"
                );
                Ok(None)
            }
        }
    }

    /// XREADGROUP over every request stream starting at `id` (`>` for new
    /// entries, `0` for this consumer's pending ones).
    fn read_group(&mut self, id: &str, block_ms: Option<u64>) -> Result<Vec<StreamEntry>, BrokerError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(&self.group).arg(&self.consumer);
        match block_ms {
            Some(ms) => cmd.arg("COUNT").arg(1).arg("BLOCK").arg(ms),
            None => cmd.arg("COUNT").arg(100),
        };
        cmd.arg("STREAMS").arg(&self.streams);
        for _ in &self.streams {
            cmd.arg(id);
        }
        let reply: Value = cmd
            .query(&mut self.conn)
            .map_err(|e| command_error("XREADGROUP", e))?;
        parse_read_reply(reply)
    }

    fn dead_letter(&mut self, entry: &InFlight) -> Result<(), BrokerError> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.add_command(xadd_cmd(DEAD_LETTER_QUEUE, &entry.message)).ignore();
        pipe.cmd("XACK")
            .arg(&entry.stream)
            .arg(&self.group)
            .arg(&entry.entry_id)
            .ignore();
        pipe.query::<()>(&mut self.conn)
            .map_err(|e| command_error("dead-letter MULTI", e))?;
        warn!(
            entry_id = %entry.entry_id,
            redelivery_count = entry.message.redelivery_count,
            "message sent to dead-letter queue"
        );
        Ok(())
    }
}

impl TransactedSession for RedisStreamsSession {
    fn receive(&mut self) -> Result<Option<BrokerMessage>, BrokerError> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            if let Some(entry) = self.redeliver.pop_front() {
                let message = entry.message.clone();
                self.consumed.push(entry);
                return Ok(Some(message));
            }

            let block_ms = self.block_ms;
            for entry in self.read_group(">", Some(block_ms))? {
                if let Some(in_flight) = self.settle(entry)? {
                    debug!(stream = %in_flight.stream, entry_id = %in_flight.entry_id, "received entry");
                    let message = in_flight.message.clone();
                    self.consumed.push(in_flight);
                    return Ok(Some(message));
                }
            }
        }
    }

    fn send(&mut self, destination: &Destination, message: BrokerMessage) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        self.staged.push((destination.clone(), message));
        Ok(())
    }

    fn commit(&mut self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (destination, message) in &self.staged {
            pipe.add_command(xadd_cmd(destination.name(), message)).ignore();
        }
        for entry in &self.consumed {
            pipe.cmd("XACK")
                .arg(&entry.stream)
                .arg(&self.group)
                .arg(&entry.entry_id)
                .ignore();
        }
        pipe.query::<()>(&mut self.conn)
            .map_err(|e| command_error("commit MULTI", e))?;

        self.staged.clear();
        self.consumed.clear();
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), BrokerError> {
        self.staged.clear();
        // Reverse so the oldest consumed entry ends up first in line.
        let consumed: Vec<InFlight> = self.consumed.drain(..).rev().collect();
        for mut entry in consumed {
            entry.message.redelivery_count += 1;
            if entry.message.redelivery_count > self.max_redeliveries {
                self.dead_letter(&entry)?;
            } else {
                self.redeliver.push_front(entry);
            }
        }
        Ok(())
    }
}

impl Drop for RedisStreamsSession {
    fn drop(&mut self) {
        if !self.consumed.is_empty() || !self.redeliver.is_empty() {
            info!(
                pending = self.consumed.len() + self.redeliver.len(),
                "session closed with pending entries; they will be redelivered"
            );
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct StreamEntry {
    stream: String,
    entry_id: String,
    /// `None` for an entry deleted from the stream while still pending.
    fields: Option<HashMap<String, Vec<u8>>>,
}

/// What a read entry turns into.
#[derive(Debug)]
enum Delivery {
    Message(InFlight),
    /// Gone from the stream; only the pending entry is left to acknowledge.
    Deleted { stream: String, entry_id: String },
    /// Moved to the dead-letter stream as is.
    Undecodable {
        stream: String,
        entry_id: String,
        fields: HashMap<String, Vec<u8>>,
        reason: String,
    },
}

fn classify(entry: StreamEntry) -> Delivery {
    let StreamEntry {
        stream,
        entry_id,
        fields,
    } = entry;
    let Some(fields) = fields else {
        return Delivery::Deleted { stream, entry_id };
    };
    match decode_message(&fields) {
        Ok(message) => Delivery::Message(InFlight {
            stream,
            entry_id,
            message,
        }),
        Err(e) => Delivery::Undecodable {
            stream,
            entry_id,
            fields,
            reason: e.to_string(),
        },
    }
}

const FIELD_DEAD_LETTER_REASON: &str = "dead_letter_reason";
const FIELD_ORIGINAL_STREAM: &str = "original_stream";
const FIELD_ORIGINAL_ID: &str = "original_id";

/// Raw fields of an undecodable entry plus where it came from and why it
/// was dropped.
fn dead_letter_fields(
    fields: HashMap<String, Vec<u8>>,
    stream: &str,
    entry_id: &str,
    reason: &str,
) -> Vec<(String, Vec<u8>)> {
    let mut out: Vec<(String, Vec<u8>)> = fields.into_iter().collect();
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out.push((FIELD_ORIGINAL_STREAM.to_string(), stream.as_bytes().to_vec()));
    out.push((FIELD_ORIGINAL_ID.to_string(), entry_id.as_bytes().to_vec()));
    out.push((FIELD_DEAD_LETTER_REASON.to_string(), reason.as_bytes().to_vec()));
    out
}

fn raw_xadd_cmd(stream: &str, fields: Vec<(String, Vec<u8>)>) -> redis::Cmd {
    let mut cmd = redis::cmd("XADD");
    cmd.arg(stream).arg("*");
    for (field, value) in fields {
        cmd.arg(field).arg(value);
    }
    cmd
}

fn xadd_cmd(stream: &str, message: &BrokerMessage) -> redis::Cmd {
    raw_xadd_cmd(stream, encode_message(message))
}

fn xadd(conn: &mut redis::Connection, stream: &str, message: &BrokerMessage) -> Result<String, BrokerError> {
    xadd_cmd(stream, message)
        .query(conn)
        .map_err(|e| command_error("XADD", e))
}

fn encode_message(message: &BrokerMessage) -> Vec<(String, Vec<u8>)> {
    let (kind, body) = match &message.body {
        MessageBody::Bytes(b) => ("bytes", b.to_vec()),
        MessageBody::Text(t) => ("text", t.as_bytes().to_vec()),
    };
    let mut fields = vec![
        (FIELD_MESSAGE_ID.to_string(), message.id.to_string().into_bytes()),
        (FIELD_KIND.to_string(), kind.as_bytes().to_vec()),
        (FIELD_BODY.to_string(), body),
        (FIELD_PRIORITY.to_string(), message.priority.to_string().into_bytes()),
        (
            FIELD_REDELIVERY.to_string(),
            message.redelivery_count.to_string().into_bytes(),
        ),
    ];
    if let Some(reply_to) = &message.reply_to {
        fields.push((FIELD_REPLY_TO.to_string(), reply_to.name().as_bytes().to_vec()));
    }
    for (name, value) in &message.properties {
        fields.push((
            format!("{PROPERTY_FIELD_PREFIX}{name}"),
            value.encode().into_bytes(),
        ));
    }
    fields
}

fn decode_message(fields: &HashMap<String, Vec<u8>>) -> Result<BrokerMessage, BrokerError> {
    let text = |name: &str| fields.get(name).map(|v| String::from_utf8_lossy(v).into_owned());

    let body = fields
        .get(FIELD_BODY)
        .cloned()
        .ok_or_else(|| BrokerError::Transport("stream entry has no body".to_string()))?;
    let mut message = match text(FIELD_KIND).as_deref() {
        Some("text") => BrokerMessage::text(String::from_utf8_lossy(&body).into_owned()),
        _ => BrokerMessage::bytes(Bytes::from(body)),
    };

    if let Some(id) = text(FIELD_MESSAGE_ID).and_then(|id| uuid::Uuid::parse_str(&id).ok()) {
        message.id = MessageId::from(id);
    }
    message.priority = text(FIELD_PRIORITY)
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PRIORITY);
    message.redelivery_count = text(FIELD_REDELIVERY)
        .and_then(|r| r.parse().ok())
        .unwrap_or(0);
    message.reply_to = text(FIELD_REPLY_TO).map(Destination::queue);

    for (field, value) in fields {
        if let Some(name) = field.strip_prefix(PROPERTY_FIELD_PREFIX) {
            match PropertyValue::decode(&String::from_utf8_lossy(value)) {
                Some(value) => {
                    message.properties.insert(name.to_string(), value);
                }
                None => warn!(property = %name, "skipping undecodable message property"),
            }
        }
    }
    Ok(message)
}

fn malformed(what: &str) -> BrokerError {
    BrokerError::Transport(format!("unexpected stream reply: {what}"))
}

fn data(value: &Value) -> Option<&[u8]> {
    match value {
        Value::Data(d) => Some(d.as_slice()),
        Value::Status(s) => Some(s.as_bytes()),
        _ => None,
    }
}

/// Parse an XREAD/XREADGROUP reply:
/// `[[stream, [[id, [field, value, ...]], ...]], ...]`, or nil on timeout.
fn parse_read_reply(reply: Value) -> Result<Vec<StreamEntry>, BrokerError> {
    let streams = match reply {
        Value::Nil => return Ok(Vec::new()),
        Value::Bulk(streams) => streams,
        _ => return Err(malformed("expected an array of streams")),
    };

    let mut entries = Vec::new();
    for stream in streams {
        let Value::Bulk(pair) = stream else {
            return Err(malformed("expected [stream, entries]"));
        };
        let [key, stream_entries] = pair.as_slice() else {
            return Err(malformed("expected [stream, entries]"));
        };
        let stream_key = data(key)
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .ok_or_else(|| malformed("stream key"))?;
        let Value::Bulk(stream_entries) = stream_entries else {
            return Err(malformed("expected an array of entries"));
        };

        for entry in stream_entries {
            let Value::Bulk(entry) = entry else {
                return Err(malformed("expected [id, fields]"));
            };
            let [id, raw_fields] = entry.as_slice() else {
                return Err(malformed("expected [id, fields]"));
            };
            let entry_id = data(id)
                .map(|i| String::from_utf8_lossy(i).into_owned())
                .ok_or_else(|| malformed("entry id"))?;
            // Deleted entries still pending show up with nil fields.
            let fields = match raw_fields {
                Value::Bulk(raw_fields) => {
                    let mut fields = HashMap::new();
                    for chunk in raw_fields.chunks(2) {
                        if let [name, value] = chunk {
                            if let (Some(name), Some(value)) = (data(name), data(value)) {
                                fields.insert(String::from_utf8_lossy(name).into_owned(), value.to_vec());
                            }
                        }
                    }
                    Some(fields)
                }
                _ => None,
            };
            entries.push(StreamEntry {
                stream: stream_key.clone(),
                entry_id,
                fields,
            });
        }
    }
    Ok(entries)
}
