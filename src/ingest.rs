// Ingest orchestrator. Composes permission, dedupe, sequencing, storage and
// the broker into the send pipeline:
//
//   permission → dedupe → tx { insert(sending) + dedupe mark } → commit
//     → broker send (retried) → status sent/failed → async fan-out
//
// All outcomes collapse into SendResult; nothing propagates past the
// request boundary.

use crate::broker::{self, BrokerAck, BrokerSend, BrokerTransport, CHANNEL_GROUP, CHANNEL_PERSON};
use crate::config::CoreConfig;
use crate::db::Db;
use crate::dedupe::DedupeEngine;
use crate::error::SendError;
use crate::events::{CoreEvent, EventBus};
use crate::models::{ChatKind, Message, MessageContent, MessageStatus, SendRequest, SendResult};
use crate::permission;
use crate::seq::SequenceService;
use crate::store;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub struct Pipeline {
    db: Arc<Db>,
    pub seq: SequenceService,
    pub dedupe: DedupeEngine,
    pub broker: Arc<dyn BrokerTransport>,
    events: EventBus,
    pub config: CoreConfig,
    send_permits: Arc<Semaphore>,
    queued: AtomicI64,
}

/// Where a send is addressed.
enum Target {
    User(String),
    Group(String),
}

impl Pipeline {
    pub fn new(
        db: Arc<Db>,
        broker: Arc<dyn BrokerTransport>,
        events: EventBus,
        config: CoreConfig,
    ) -> Self {
        let seq = SequenceService::new(Duration::from_secs(config.seq_ttl_days * 24 * 3600));
        let dedupe = DedupeEngine::new(
            config.dedupe_filter_bits,
            config.dedupe_hash_count,
            Duration::from_secs(config.dedupe_ttl_hours * 3600),
            Duration::from_secs(config.dedupe_tx_ttl_secs),
            config.dedupe_fpr_threshold,
        );
        let send_permits = Arc::new(Semaphore::new(config.send_concurrency.max(1)));
        Pipeline {
            db,
            seq,
            dedupe,
            broker,
            events,
            config,
            send_permits,
            queued: AtomicI64::new(0),
        }
    }

    // --- Single send ---

    pub async fn send(&self, req: SendRequest) -> SendResult {
        match self.send_inner(req).await {
            Ok(result) => result,
            Err(e) => SendResult::failure(&e),
        }
    }

    async fn send_inner(&self, req: SendRequest) -> Result<SendResult, SendError> {
        let (content, target) = self.validate(&req)?;

        // Policy first: a denied send must not touch the store, the
        // sequence counter, or the broker.
        self.check_permission(&req.from_user_id, &content, &target)?;

        if let Some(client_seq) = req.client_seq
            && self.dedupe.is_duplicate(&req.from_user_id, client_seq)
        {
            let existing = {
                let conn = self.db.conn();
                store::find_by_client_seq(&conn, &req.from_user_id, client_seq)
            };
            return Ok(SendResult::duplicate(existing));
        }

        let _permit = self.acquire_send_slot().await?;

        let msg = self.persist_message(&req, content, &target)?;
        self.dispatch(msg).await
    }

    /// Broker send, status transition and fan-out scheduling for an already
    /// persisted `sending` row.
    async fn dispatch(&self, msg: Message) -> Result<SendResult, SendError> {
        match self.broker_send_with_retry(&msg).await {
            Ok(_ack) => {
                {
                    let conn = self.db.conn();
                    store::cas_status(&conn, &msg.id, MessageStatus::Sent)?;
                }
                let mut sent = msg;
                sent.status = MessageStatus::Sent;
                // Fan-out is fire-and-forget: the worker picks this up off
                // the acknowledgement path.
                self.events.publish(CoreEvent::MessageSent(sent.clone()));
                Ok(SendResult::ok(sent))
            }
            Err(e) => {
                let conn = self.db.conn();
                store::cas_status(&conn, &msg.id, MessageStatus::Failed)?;
                store::bump_retry_count(&conn, &msg.id);
                Err(e)
            }
        }
    }

    /// Sequence assignment, then one transaction: insert(status=sending)
    /// plus the transactional dedupe mark, committed or rolled back as one.
    fn persist_message(
        &self,
        req: &SendRequest,
        content: MessageContent,
        target: &Target,
    ) -> Result<Message, SendError> {
        let (conv_key, kind, peer) = match target {
            Target::User(to) => (
                broker::personal_channel_id(&req.from_user_id, to),
                ChatKind::Single,
                to.clone(),
            ),
            Target::Group(gid) => (gid.clone(), ChatKind::Group, gid.clone()),
        };

        let db = Arc::clone(&self.db);
        let sender = req.from_user_id.clone();
        let seq = self.seq.next(&conv_key, move || {
            let conn = db.conn();
            store::max_seq_for(&conn, &sender, &peer, kind)
        });

        let mut extra = req.extra.clone().unwrap_or_else(|| serde_json::json!({}));
        if let Some(ref uuid) = req.uuid
            && let Some(map) = extra.as_object_mut()
        {
            map.insert(
                "client_uuid".to_string(),
                serde_json::Value::String(uuid.clone()),
            );
        }

        let msg = Message {
            id: uuid::Uuid::new_v4().to_string(),
            client_seq: req.client_seq,
            seq: Some(seq),
            content,
            sender: req.from_user_id.clone(),
            recipient: match target {
                Target::User(to) => Some(to.clone()),
                Target::Group(_) => None,
            },
            group_id: match target {
                Target::Group(gid) => Some(gid.clone()),
                Target::User(_) => None,
            },
            reply_to: req.reply_to_id.clone(),
            forward_from: req.forward_from_id.clone(),
            status: MessageStatus::Sending,
            retry_count: 0,
            need_read_receipt: req.need_read_receipt,
            recalled_at: None,
            edited_at: None,
            created_at: chrono::Utc::now().to_rfc3339(),
            extra,
        };

        let tx_id = uuid::Uuid::new_v4().to_string();
        let mut conn = self.db.conn();
        let tx = conn
            .transaction()
            .map_err(|e| SendError::Store(e.to_string()))?;
        if let Err(e) = store::insert_message(&tx, &msg) {
            drop(tx);
            return Err(SendError::Store(e.to_string()));
        }
        let marked = if let Some(client_seq) = msg.client_seq {
            self.dedupe.mark_processed_tx(&msg.sender, client_seq, &tx_id);
            true
        } else {
            false
        };
        match tx.commit() {
            Ok(()) => {
                if marked {
                    self.dedupe.commit_tx(&tx_id);
                }
                Ok(msg)
            }
            Err(e) => {
                if marked {
                    self.dedupe.rollback_tx(&tx_id);
                }
                Err(SendError::Store(e.to_string()))
            }
        }
    }

    // --- Batch send ---

    pub async fn send_batch(self: Arc<Self>, reqs: Vec<SendRequest>) -> Vec<SendResult> {
        let mut results: Vec<Option<SendResult>> = Vec::with_capacity(reqs.len());
        results.resize_with(reqs.len(), || None);

        let chunk_size = self.config.max_batch_size.max(1);
        let mut start = 0;
        while start < reqs.len() {
            let end = (start + chunk_size).min(reqs.len());
            Self::send_chunk(&self, &reqs[start..end], start, &mut results).await;
            start = end;
        }

        results
            .into_iter()
            .map(|r| {
                r.unwrap_or_else(|| {
                    SendResult::failure(&SendError::Store("batch item lost".to_string()))
                })
            })
            .collect()
    }

    async fn send_chunk(
        this: &Arc<Self>,
        chunk: &[SendRequest],
        offset: usize,
        results: &mut [Option<SendResult>],
    ) {
        // Stage 1: validation, policy and dedupe per item. Duplicates within
        // the chunk itself collapse onto the first occurrence.
        let mut admitted: Vec<(usize, SendRequest, MessageContent, Target)> = Vec::new();
        let mut seen: HashSet<(String, i64)> = HashSet::new();
        for (i, req) in chunk.iter().enumerate() {
            let idx = offset + i;
            let (content, target) = match this.validate(req) {
                Ok(v) => v,
                Err(e) => {
                    results[idx] = Some(SendResult::failure(&e));
                    continue;
                }
            };
            if let Err(e) = this.check_permission(&req.from_user_id, &content, &target) {
                results[idx] = Some(SendResult::failure(&e));
                continue;
            }
            if let Some(client_seq) = req.client_seq {
                let key = (req.from_user_id.clone(), client_seq);
                if seen.contains(&key) || this.dedupe.is_duplicate(&req.from_user_id, client_seq) {
                    let existing = {
                        let conn = this.db.conn();
                        store::find_by_client_seq(&conn, &req.from_user_id, client_seq)
                    };
                    results[idx] = Some(SendResult::duplicate(existing));
                    continue;
                }
                seen.insert(key);
            }
            admitted.push((idx, req.clone(), content, target));
        }

        // Stage 2: persist every admitted item. Each insert runs the shared
        // transactional path (insert + dedupe mark, committed together).
        let mut pending: Vec<(usize, Message)> = Vec::new();
        for (idx, req, content, target) in admitted {
            match this.persist_message(&req, content, &target) {
                Ok(msg) => pending.push((idx, msg)),
                Err(e) => results[idx] = Some(SendResult::failure(&e)),
            }
        }

        // Stage 3: broker sends in parallel, per-item status updates.
        let mut handles = Vec::with_capacity(pending.len());
        for (idx, msg) in pending {
            let pipeline = Arc::clone(this);
            handles.push(tokio::spawn(async move {
                let result = match pipeline.acquire_send_slot().await {
                    Ok(_permit) => match pipeline.dispatch(msg).await {
                        Ok(r) => r,
                        Err(e) => SendResult::failure(&e),
                    },
                    Err(e) => SendResult::failure(&e),
                };
                (idx, result)
            }));
        }
        for handle in handles {
            if let Ok((idx, result)) = handle.await {
                results[idx] = Some(result);
            }
        }
    }

    // --- Recall ---

    pub async fn recall(&self, message_id: &str, operator_id: &str) -> Result<Message, SendError> {
        let msg = {
            let conn = self.db.conn();
            store::get_message(&conn, message_id)
        }
        .ok_or_else(|| SendError::Validation("message not found".to_string()))?;

        if msg.sender != operator_id {
            return Err(SendError::Permission(
                "only the sender can recall a message".to_string(),
            ));
        }

        let created = chrono::DateTime::parse_from_rfc3339(&msg.created_at)
            .map_err(|e| SendError::Store(format!("bad created_at on message: {e}")))?;
        let age = chrono::Utc::now().signed_duration_since(created.with_timezone(&chrono::Utc));
        if age.num_seconds() > self.config.recall_window_secs {
            return Err(SendError::Validation("recall-window-exceeded".to_string()));
        }

        let now = chrono::Utc::now().to_rfc3339();
        let recalled = {
            let conn = self.db.conn();
            store::mark_recalled(&conn, message_id, &now)?
        };
        if !recalled {
            return Err(SendError::Validation(
                "message cannot be recalled in its current state".to_string(),
            ));
        }

        // Tell subscribers on the same channel. The recall itself is already
        // durable; a lost notice is repaired by the next sync.
        let (channel_id, channel_type) = channel_for(&msg);
        let notice = BrokerSend {
            channel_id,
            channel_type,
            from_uid: msg.sender.clone(),
            payload: broker::encode_payload(&MessageContent::System {
                text: "message recalled".to_string(),
            }),
            client_msg_no: format!("recall-{message_id}"),
        };
        if let Err(e) = self.broker.send_message(&notice).await {
            eprintln!("⚠️ Recall notice for {message_id} not delivered: {e}");
        }

        let mut updated = msg;
        updated.status = MessageStatus::Recalled;
        updated.recalled_at = Some(now);
        self.events
            .publish(CoreEvent::MessageRecalled(updated.clone()));
        Ok(updated)
    }

    // --- Forward ---

    /// Server-side re-send of an existing message's content to new targets.
    /// Every forward is a fresh message with a derived client_seq.
    pub async fn forward(
        &self,
        message_id: &str,
        from_user_id: &str,
        to_user_ids: &[String],
        to_group_ids: &[String],
    ) -> Result<Vec<SendResult>, SendError> {
        let original = {
            let conn = self.db.conn();
            store::get_message(&conn, message_id)
        }
        .ok_or_else(|| SendError::Validation("message not found".to_string()))?;

        if original.status == MessageStatus::Recalled {
            return Err(SendError::Validation(
                "recalled messages cannot be forwarded".to_string(),
            ));
        }

        let mut content_value =
            serde_json::to_value(&original.content).unwrap_or(serde_json::json!({}));
        let msg_type = original.content.type_name().to_string();
        if let Some(map) = content_value.as_object_mut() {
            map.remove("type");
        }

        let mut results = Vec::new();
        for to in to_user_ids {
            let req = SendRequest {
                uuid: None,
                msg_type: msg_type.clone(),
                content: content_value.clone(),
                from_user_id: from_user_id.to_string(),
                to_user_id: Some(to.clone()),
                group_id: None,
                reply_to_id: None,
                forward_from_id: Some(message_id.to_string()),
                client_seq: Some(derived_client_seq()),
                extra: None,
                need_read_receipt: false,
            };
            results.push(self.send(req).await);
        }
        for gid in to_group_ids {
            let req = SendRequest {
                uuid: None,
                msg_type: msg_type.clone(),
                content: content_value.clone(),
                from_user_id: from_user_id.to_string(),
                to_user_id: None,
                group_id: Some(gid.clone()),
                reply_to_id: None,
                forward_from_id: Some(message_id.to_string()),
                client_seq: Some(derived_client_seq()),
                extra: None,
                need_read_receipt: false,
            };
            results.push(self.send(req).await);
        }
        Ok(results)
    }

    // --- Retry failed ---

    /// failed → sending → broker send under the normal retry policy. The
    /// conversation rows are untouched on success; they were already linked
    /// when the message first went out, and the repair sweep covers the case
    /// where it never did.
    pub async fn retry_failed(&self, message_id: &str) -> Result<SendResult, SendError> {
        let msg = {
            let conn = self.db.conn();
            store::get_message(&conn, message_id)
        }
        .ok_or_else(|| SendError::Validation("message not found".to_string()))?;

        let moved = {
            let conn = self.db.conn();
            store::cas_status(&conn, &msg.id, MessageStatus::Sending)?
        };
        if !moved {
            return Err(SendError::Validation(
                "only failed messages can be retried".to_string(),
            ));
        }

        let _permit = self.acquire_send_slot().await?;
        match self.broker_send_with_retry(&msg).await {
            Ok(_ack) => {
                let conn = self.db.conn();
                store::cas_status(&conn, &msg.id, MessageStatus::Sent)?;
                drop(conn);
                let mut sent = msg;
                sent.status = MessageStatus::Sent;
                Ok(SendResult::ok(sent))
            }
            Err(e) => {
                let conn = self.db.conn();
                store::cas_status(&conn, &msg.id, MessageStatus::Failed)?;
                store::bump_retry_count(&conn, &msg.id);
                Err(e)
            }
        }
    }

    // --- Internals ---

    fn validate(&self, req: &SendRequest) -> Result<(MessageContent, Target), SendError> {
        let from = req.from_user_id.trim();
        if from.is_empty() || from.len() > 100 {
            return Err(SendError::Validation(
                "from_user_id must be 1-100 characters".to_string(),
            ));
        }

        let to = req
            .to_user_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let group = req
            .group_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());

        let target = match (to, group) {
            (Some(to), None) => {
                if to == from {
                    return Err(SendError::Validation(
                        "cannot send a message to yourself".to_string(),
                    ));
                }
                Target::User(to.to_string())
            }
            (None, Some(gid)) => Target::Group(gid.to_string()),
            _ => {
                return Err(SendError::Validation(
                    "exactly one of to_user_id or group_id is required".to_string(),
                ));
            }
        };

        let content = MessageContent::from_typed(&req.msg_type, &req.content)
            .map_err(SendError::Validation)?;

        if let Some(ref reply_to) = req.reply_to_id {
            let conn = self.db.conn();
            if store::get_message(&conn, reply_to).is_none() {
                return Err(SendError::Validation(
                    "reply_to_id references an unknown message".to_string(),
                ));
            }
        }

        Ok((content, target))
    }

    fn check_permission(
        &self,
        from: &str,
        content: &MessageContent,
        target: &Target,
    ) -> Result<(), SendError> {
        // System messages bypass send-time policy
        if matches!(content, MessageContent::System { .. }) {
            return Ok(());
        }
        let conn = self.db.conn();
        let decision = match target {
            Target::User(to) => {
                permission::check_single(&conn, from, to, self.config.require_friendship)
            }
            Target::Group(gid) => permission::check_group(&conn, from, gid),
        };
        if decision.allowed {
            Ok(())
        } else {
            Err(SendError::Permission(
                decision.reason.unwrap_or_else(|| "denied".to_string()),
            ))
        }
    }

    async fn acquire_send_slot(&self) -> Result<OwnedSemaphorePermit, SendError> {
        match Arc::clone(&self.send_permits).try_acquire_owned() {
            Ok(permit) => Ok(permit),
            Err(_) => {
                let waiting = self.queued.fetch_add(1, Ordering::SeqCst);
                if waiting >= self.config.send_queue_depth {
                    self.queued.fetch_sub(1, Ordering::SeqCst);
                    return Err(SendError::Backpressure);
                }
                let permit = Arc::clone(&self.send_permits).acquire_owned().await;
                self.queued.fetch_sub(1, Ordering::SeqCst);
                permit.map_err(|_| SendError::Backpressure)
            }
        }
    }

    /// Exponential backoff with full jitter; permanent broker rejections
    /// stop immediately.
    async fn broker_send_with_retry(&self, msg: &Message) -> Result<BrokerAck, SendError> {
        let (channel_id, channel_type) = channel_for(msg);
        let send = BrokerSend {
            channel_id,
            channel_type,
            from_uid: msg.sender.clone(),
            payload: broker::encode_payload(&msg.content),
            client_msg_no: client_msg_no(msg),
        };

        let attempts = self.config.send_retry_attempts.max(1);
        let mut last_err: Option<String> = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                let backoff = self
                    .config
                    .send_retry_initial_ms
                    .saturating_mul(1u64 << (attempt - 1));
                let jitter: u64 = rand::rng().random_range(0..1000);
                tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
            }
            match self.broker.send_message(&send).await {
                Ok(ack) => return Ok(ack),
                Err(e) if e.is_retriable() => last_err = Some(e.to_string()),
                Err(e) => return Err(SendError::BrokerPermanent(e.to_string())),
            }
        }
        Err(SendError::BrokerTransient(
            last_err.unwrap_or_else(|| "exhausted retries".to_string()),
        ))
    }
}

fn channel_for(msg: &Message) -> (String, u8) {
    match msg.group_id {
        Some(ref gid) => (gid.clone(), CHANNEL_GROUP),
        None => (
            broker::personal_channel_id(&msg.sender, msg.recipient.as_deref().unwrap_or("")),
            CHANNEL_PERSON,
        ),
    }
}

fn client_msg_no(msg: &Message) -> String {
    msg.extra
        .get("client_uuid")
        .and_then(|v| v.as_str())
        .map(String::from)
        .unwrap_or_else(|| msg.id.clone())
}

/// Forwards need a client_seq of their own so retried forwards still dedupe.
fn derived_client_seq() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_else(|| {
        chrono::Utc::now().timestamp_millis()
    })
}

/// Periodic engine upkeep: expire dedupe state, rebuild the filter when it
/// degrades, and drop idle sequence counters.
pub fn spawn_maintenance(pipeline: Arc<Pipeline>, interval_secs: u64) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(interval_secs.max(1))).await;
            pipeline.dedupe.sweep();
            pipeline.seq.purge_expired();
        }
    });
}
