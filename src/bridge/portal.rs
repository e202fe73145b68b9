use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};

use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::echo::EchoGate;
use super::event::{
    BridgeEvent, ChatAttachment, ChatMessage, EventKind, MatrixMessage, Membership,
    MessagePayload, Network,
};
use super::logic::{
    build_reaction_mapping, chat_delete_redaction_requests, should_forward_receipt,
    should_forward_typing, typing_diff,
};
use super::pending::PendingQueue;
use super::puppet::MatrixSender;
use super::retry::{RetryPolicy, send_with_retry};
use super::translator::{
    ChatOutbound, ChatToMatrixRefs, EditStrategy, MatrixToChatRefs, ReactionTranslation,
    SenderStyle, chat_edit_to_matrix, chat_reaction_to_matrix, chat_to_matrix_message,
    edit_strategy, matrix_reaction_to_chat, matrix_to_chat_message, reaction_note,
};
use super::{BridgeContext, BridgeError, PortalRef, SendError};
use crate::db::{MessageMapping, Portal as PortalRecord, PortalState};
use crate::googlechat::ChatSender;
use crate::matrix::RoomCreation;
use crate::parsers::{MentionTarget, mentioned_user_ids};
use crate::utils::formatting::preview_text;
use crate::web::metrics::Metrics;

/// Work items for a portal worker, processed strictly one at a time.
#[derive(Debug)]
pub enum PortalCommand {
    Event(BridgeEvent),
    SyncMetadata,
    /// Bind the portal to a Matrix room, creating one when `room_id` is `None`.
    Initialize {
        room_id: Option<String>,
        reply: Option<oneshot::Sender<Result<String, BridgeError>>>,
    },
    /// Acknowledged once every command queued before it has been handled.
    Barrier(oneshot::Sender<()>),
}

/// Single-writer owner of one conversation pairing and its message mappings.
pub struct Portal {
    ctx: BridgeContext,
    record: PortalRecord,
    policy: RetryPolicy,
    echoes: EchoGate,
    /// Outbound edits, keyed by the edited message as the receiving side names it.
    edit_echoes: EchoGate,
    pending: PendingQueue,
    typing: HashSet<String>,
    /// Remote messages this portal deleted itself while redacting and resending.
    retired: HashSet<String>,
    ready: VecDeque<BridgeEvent>,
}

impl Portal {
    pub async fn load(ctx: BridgeContext, handle: &PortalRef) -> Result<Self, BridgeError> {
        let record = ctx.identity.load_portal(handle.id).await?.ok_or_else(|| {
            BridgeError::PermanentRejection(format!("portal {} vanished from storage", handle.id))
        })?;
        let limits = &ctx.config.limits;
        Ok(Self {
            policy: RetryPolicy::from_limits(limits),
            echoes: EchoGate::new(limits.echo_ttl()),
            edit_echoes: EchoGate::new(limits.echo_ttl()),
            pending: PendingQueue::new(limits.pending_timeout()),
            ctx,
            record,
            typing: HashSet::new(),
            retired: HashSet::new(),
            ready: VecDeque::new(),
        })
    }

    pub fn id(&self) -> i64 {
        self.record.id
    }

    pub fn state(&self) -> PortalState {
        self.record.state
    }

    pub fn record(&self) -> &PortalRecord {
        &self.record
    }

    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PortalCommand>) {
        debug!("portal worker started");
        loop {
            let deadline = self.pending.next_deadline();
            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.expire_pending(Instant::now());
                }
            }
        }
        debug!("portal worker stopped pending={}", self.pending.len());
    }

    pub async fn handle_command(&mut self, command: PortalCommand) {
        match command {
            PortalCommand::Event(event) => self.ready.push_back(event),
            PortalCommand::SyncMetadata => {
                if let Err(err) = self.sync_metadata().await {
                    self.report("sync_metadata", "-", &err);
                }
            }
            PortalCommand::Initialize { room_id, reply } => {
                let result = self.initialize(room_id).await;
                if let Err(err) = &result {
                    self.report("initialize", "-", err);
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            PortalCommand::Barrier(done) => {
                let _ = done.send(());
            }
        }
        self.drain_ready().await;
    }

    /// Handles one event and everything it released from the pending queue.
    pub async fn process(&mut self, event: BridgeEvent) {
        self.handle_command(PortalCommand::Event(event)).await;
    }

    async fn drain_ready(&mut self) {
        while let Some(event) = self.ready.pop_front() {
            let kind = event.kind_name();
            let event_id = event.event_id.clone();
            if let Err(err) = self.dispatch(event).await {
                self.report(kind, &event_id, &err);
            }
        }
    }

    fn report(&self, operation: &str, event_id: &str, err: &BridgeError) {
        match err {
            BridgeError::UnresolvedReference { .. } => {
                Metrics::unresolved_reference();
                warn!("dropping {} event_id={}: {}", operation, event_id, err);
            }
            BridgeError::TransientNetwork(_) => {
                Metrics::send_failed(true);
                warn!("{} failed event_id={}: {}", operation, event_id, err);
            }
            BridgeError::PermanentRejection(_) => {
                Metrics::send_failed(false);
                warn!("{} rejected event_id={}: {}", operation, event_id, err);
            }
            BridgeError::TranslationUnsupported(_) => {
                debug!("{} not bridged event_id={}: {}", operation, event_id, err);
            }
            BridgeError::Storage(_) => {
                error!("{} storage failure event_id={}: {}", operation, event_id, err);
            }
            BridgeError::InvalidTransition { .. } => {
                warn!("{} ignored event_id={}: {}", operation, event_id, err);
            }
        }
    }

    async fn dispatch(&mut self, event: BridgeEvent) -> Result<(), BridgeError> {
        let is_membership = matches!(event.kind, EventKind::Membership { .. });
        match self.record.state {
            PortalState::Uninitialized if is_membership => {}
            PortalState::Uninitialized if event.source == Network::GoogleChat => {
                self.initialize(None).await?;
                // Backfilled history was queued first and stays ahead of this event.
                self.ready.push_back(event);
                return Ok(());
            }
            PortalState::Uninitialized => {
                debug!(
                    "dropping {} for uninitialized portal event_id={}",
                    event.kind_name(),
                    event.event_id
                );
                return Ok(());
            }
            PortalState::Inactive if !is_membership => {
                debug!(
                    "dropping {} for inactive portal event_id={}",
                    event.kind_name(),
                    event.event_id
                );
                return Ok(());
            }
            _ => {}
        }

        match &event.kind {
            EventKind::Message(_) => self.handle_inbound_message(event).await,
            EventKind::Edit { .. } => self.handle_inbound_edit(event).await,
            EventKind::Reaction { .. } | EventKind::ReactionRemoved { .. } => {
                self.handle_inbound_reaction(event).await
            }
            EventKind::Redaction { .. } => self.handle_inbound_redaction(event).await,
            EventKind::ReadReceipt { .. } => self.handle_read_receipt(event).await,
            EventKind::Typing { .. } => self.handle_typing_notification(event).await,
            EventKind::Membership { .. } => self.handle_membership(event).await,
            EventKind::MetadataChange { .. } => self.handle_metadata_change(event).await,
        }
    }

    pub async fn handle_inbound_message(&mut self, event: BridgeEvent) -> Result<(), BridgeError> {
        let portal_id = self.record.id;
        match (&event.kind, event.source) {
            (EventKind::Message(MessagePayload::Matrix(message)), Network::Matrix) => {
                if self
                    .ctx
                    .identity
                    .lookup_by_local(portal_id, &event.event_id)
                    .await?
                    .is_some()
                {
                    debug!("matrix echo recognized by id event_id={}", event.event_id);
                    Metrics::echo_suppressed();
                    return Ok(());
                }
                if let Some(hit) = self.echoes.take_match(portal_id, &message.body, &event.sender) {
                    if let Some(remote) = hit.source_event_id {
                        self.backfill_echo(&event.event_id, &remote, None).await?;
                    }
                    Metrics::echo_suppressed();
                    return Ok(());
                }
                if self.ctx.is_bridge_output(Network::Matrix, &event.sender) {
                    debug!("ignoring bridge output sender={}", event.sender);
                    return Ok(());
                }
                self.relay_matrix_message(&event, message).await
            }
            (EventKind::Message(MessagePayload::Chat(message)), Network::GoogleChat) => {
                if self
                    .ctx
                    .identity
                    .lookup_by_remote(portal_id, &message.name)
                    .await?
                    .is_some()
                {
                    debug!("google chat echo recognized by id name={}", message.name);
                    Metrics::echo_suppressed();
                    return Ok(());
                }
                if let Some(hit) = self.echoes.take_match(portal_id, &message.text, &event.sender) {
                    if let Some(local) = hit.source_event_id {
                        self.backfill_echo(&local, &message.name, message.thread_name.clone())
                            .await?;
                    }
                    Metrics::echo_suppressed();
                    return Ok(());
                }
                if self.ctx.is_bridge_output(Network::GoogleChat, &event.sender) {
                    debug!("ignoring bridge output sender={}", event.sender);
                    return Ok(());
                }
                self.relay_chat_message(message).await
            }
            _ => Err(BridgeError::TranslationUnsupported(format!(
                "{} payload on the wrong network",
                event.kind_name()
            ))),
        }
    }

    /// Records the mapping for a send whose result was lost but whose echo arrived.
    async fn backfill_echo(
        &mut self,
        local_event_id: &str,
        remote_message_id: &str,
        thread: Option<String>,
    ) -> Result<(), BridgeError> {
        let mut mapping = MessageMapping::new(self.record.id, local_event_id, remote_message_id);
        mapping.thread_root_remote_id = thread;
        if self.ctx.identity.record_message(&mapping).await? {
            info!(
                "backfilled mapping from echo local={} remote={}",
                local_event_id, remote_message_id
            );
            self.release_pending(&[local_event_id.to_string()], remote_message_id);
        }
        Ok(())
    }

    async fn relay_matrix_message(
        &mut self,
        event: &BridgeEvent,
        message: &MatrixMessage,
    ) -> Result<(), BridgeError> {
        let portal_id = self.record.id;
        let space = self.record.remote_conversation_id.clone();
        let config = self.ctx.config.clone();
        let puppets = self.ctx.puppets.clone();

        let chat_sender = puppets.chat_sender_for(&event.sender).await?;
        let relay_name = puppets.relay_display_name(&event.sender);
        let thread_name = self.chat_thread_for(message.thread_root.as_deref()).await?;
        let quoted = match &message.reply_to {
            Some(reply) => self
                .ctx
                .identity
                .lookup_by_local(portal_id, reply)
                .await?
                .filter(|mapping| !mapping.deleted)
                .map(|mapping| mapping.remote_message_id),
            None => None,
        };

        let resolver = puppets.clone();
        let resolve_user = move |mxid: &str| resolver.remote_user_for_ghost(mxid);
        let refs = MatrixToChatRefs {
            sender: if chat_sender.is_relay() {
                SenderStyle::Relayed {
                    display_name: &relay_name,
                    format: &config.bridge.relay_format,
                }
            } else {
                SenderStyle::Native
            },
            thread_name: thread_name.as_deref(),
            quoted_message: quoted.as_deref(),
            resolve_user: &resolve_user,
        };
        let mut outbound = match matrix_to_chat_message(message, &refs) {
            Ok(outbound) => outbound,
            Err(BridgeError::TranslationUnsupported(reason)) if !message.body.trim().is_empty() => {
                debug!("degrading to plain text event_id={}: {}", event.event_id, reason);
                matrix_to_chat_message(&MatrixMessage::text(message.body.clone()), &refs)?
            }
            Err(err) => return Err(err),
        };

        let attachment_ref = match &outbound.attachment {
            Some(media) => match self
                .ctx
                .media
                .matrix_media_to_chat(&space, media, &chat_sender)
                .await
            {
                Ok(attachment_ref) => Some(attachment_ref),
                Err(err) => {
                    warn!(
                        "failed to upload attachment event_id={} file={}: {}",
                        event.event_id, media.filename, err
                    );
                    if outbound.text.is_empty() {
                        outbound.text = media.filename.clone();
                    }
                    None
                }
            },
            None => None,
        };

        let sent = self
            .send_to_chat(&outbound, attachment_ref.as_ref(), &chat_sender, &event.event_id)
            .await?;
        info!(
            "relayed matrix message event_id={} remote={} preview={:?}",
            event.event_id,
            sent.name,
            preview_text(&outbound.text)
        );

        let mut mapping = MessageMapping::new(portal_id, &event.event_id, &sent.name);
        mapping.thread_root_remote_id = sent.thread_name.clone();
        if !self.ctx.identity.record_message(&mapping).await? {
            warn!(
                "mapping conflict, relayed without recording event_id={} remote={}",
                event.event_id, sent.name
            );
        }
        if let Some(thread) = &sent.thread_name {
            let root = message.thread_root.as_deref().unwrap_or(&event.event_id);
            self.ctx
                .identity
                .record_thread(portal_id, thread, root)
                .await?;
        }
        Metrics::message_relayed(Network::GoogleChat);
        self.acknowledge(&event.event_id).await;

        self.record.last_processed_local_event_id = Some(event.event_id.clone());
        self.record.last_processed_remote_event_id = Some(sent.name.clone());
        self.ctx.identity.save_portal(&self.record).await?;
        self.release_pending(&[event.event_id.clone()], &sent.name);
        Ok(())
    }

    /// Sends with the echo fingerprint held for as long as the outcome is unknown.
    async fn send_to_chat(
        &mut self,
        outbound: &ChatOutbound,
        attachment_ref: Option<&Value>,
        sender: &ChatSender,
        source_event_id: &str,
    ) -> Result<crate::googlechat::SentMessage, BridgeError> {
        let portal_id = self.record.id;
        let space = self.record.remote_conversation_id.clone();
        let echo_sender = self.chat_identity(sender);
        let request_id = request_id_for(source_event_id);

        self.echoes
            .expect(portal_id, &outbound.text, &echo_sender, Some(source_event_id));
        let chat = self.ctx.chat.clone();
        let result = send_with_retry(self.policy, "google chat send", || {
            chat.send_message(&space, outbound, attachment_ref, sender, &request_id)
        })
        .await;

        if !matches!(&result, Err(err) if err.is_transient()) {
            self.echoes.forget(portal_id, &outbound.text, &echo_sender);
        }
        Ok(result?)
    }

    fn chat_identity(&self, sender: &ChatSender) -> String {
        match sender {
            ChatSender::Relay => self.ctx.chat.bot_user_id().to_string(),
            ChatSender::User { google_user_id, .. } => google_user_id.clone(),
        }
    }

    /// Delivery confirmation for the origin: the bot marks the relayed event read.
    async fn acknowledge(&self, event_id: &str) {
        if self.ctx.config.bridge.disable_read_receipts {
            return;
        }
        let Some(room_id) = &self.record.local_room_id else {
            return;
        };
        let bot = self.ctx.matrix.bot_user_id().to_string();
        if let Err(err) = self
            .ctx
            .matrix
            .send_read_receipt(&bot, room_id, event_id)
            .await
        {
            debug!("delivery receipt failed event_id={}: {}", event_id, err);
        }
    }

    async fn chat_thread_for(&self, root: Option<&str>) -> Result<Option<String>, BridgeError> {
        let Some(root) = root else {
            return Ok(None);
        };
        if let Some(thread) = self
            .ctx
            .identity
            .thread_by_local_root(self.record.id, root)
            .await?
        {
            return Ok(Some(thread.remote_thread_id));
        }
        Ok(self
            .ctx
            .identity
            .lookup_by_local(self.record.id, root)
            .await?
            .and_then(|mapping| mapping.thread_root_remote_id))
    }

    async fn relay_chat_message(&mut self, message: &ChatMessage) -> Result<(), BridgeError> {
        let portal_id = self.record.id;
        let room_id = self.room_id()?;
        let puppets = self.ctx.puppets.clone();

        let puppet = puppets
            .ensure_ghost(
                &message.sender.name,
                message.sender.display_name.as_deref(),
                message.sender.avatar_url.as_deref(),
            )
            .await?;
        let sender = puppets.matrix_sender_for(&puppet);

        let thread_root = match (&message.thread_name, message.thread_reply) {
            (Some(thread), true) => self
                .ctx
                .identity
                .thread_by_remote(portal_id, thread)
                .await?
                .map(|thread| thread.local_root_event_id),
            _ => None,
        };
        let reply_to = match &message.quoted_message {
            Some(quoted) => self
                .ctx
                .identity
                .lookup_by_remote(portal_id, quoted)
                .await?
                .filter(|mapping| !mapping.deleted)
                .map(|mapping| mapping.local_event_id),
            None => None,
        };
        let refs = ChatToMatrixRefs {
            room_id: &room_id,
            thread_root: thread_root.as_deref(),
            reply_to: reply_to.as_deref(),
            mentions: self.mentions_for(&message.text).await?,
        };
        let parts = match chat_to_matrix_message(message, &refs) {
            Ok(parts) => parts,
            Err(BridgeError::TranslationUnsupported(reason)) => {
                debug!("nothing to relay name={}: {}", message.name, reason);
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let echo_body = parts
            .first()
            .and_then(|part| part.content.get("body"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.echoes
            .expect(portal_id, &echo_body, sender.user_id(), Some(&message.name));

        let mut event_ids = Vec::new();
        let mut failure: Option<SendError> = None;
        for part in parts {
            let mut content = part.content;
            if let Some(attachment) = &part.media {
                match self.ctx.media.chat_attachment_to_matrix(attachment).await {
                    Ok(mxc) => content["url"] = json!(mxc),
                    Err(err) => {
                        warn!(
                            "failed to copy attachment name={} file={}: {}",
                            message.name, attachment.content_name, err
                        );
                        content = attachment_fallback(attachment);
                    }
                }
            }
            match puppets
                .send_as(&sender, &room_id, "m.room.message", &content)
                .await
            {
                Ok(event_id) => event_ids.push(event_id),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        let outcome_unknown =
            event_ids.is_empty() && failure.as_ref().is_some_and(SendError::is_transient);
        if !outcome_unknown {
            self.echoes.forget(portal_id, &echo_body, sender.user_id());
        }
        let Some((primary, extra)) = event_ids.split_first() else {
            return Err(failure
                .map(BridgeError::from)
                .unwrap_or_else(|| BridgeError::TranslationUnsupported("no parts sent".into())));
        };

        let mut mapping = MessageMapping::new(portal_id, primary, &message.name);
        mapping.extra_local_event_ids = extra.to_vec();
        mapping.thread_root_remote_id = message.thread_name.clone();
        mapping.sender_puppet_id = Some(puppet.id);
        mapping.sent_by_bridge = false;
        if !self.ctx.identity.record_message(&mapping).await? {
            warn!(
                "mapping conflict, relayed without recording name={} event_id={}",
                message.name, primary
            );
        }
        if let (Some(thread), None) = (&message.thread_name, &thread_root) {
            self.ctx
                .identity
                .record_thread(portal_id, thread, primary)
                .await?;
        }
        info!(
            "relayed google chat message name={} event_id={} parts={} preview={:?}",
            message.name,
            primary,
            event_ids.len(),
            preview_text(&message.text)
        );
        Metrics::message_relayed(Network::Matrix);

        self.record.last_processed_local_event_id = Some(primary.clone());
        self.record.last_processed_remote_event_id = Some(message.name.clone());
        self.ctx.identity.save_portal(&self.record).await?;
        self.release_pending(&event_ids, &message.name);

        match failure {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    async fn mentions_for(&self, text: &str) -> Result<HashMap<String, MentionTarget>, BridgeError> {
        let mut mentions = HashMap::new();
        for remote_user_id in mentioned_user_ids(text) {
            let target = match self.ctx.identity.puppet(&remote_user_id).await? {
                Some(puppet) => MentionTarget {
                    user_id: self.ctx.puppets.matrix_sender_for(&puppet).user_id().to_string(),
                    display_name: puppet
                        .display_name
                        .clone()
                        .unwrap_or_else(|| remote_user_id.clone()),
                },
                None => MentionTarget {
                    user_id: self.ctx.puppets.ghost_user_id(&remote_user_id),
                    display_name: remote_user_id.clone(),
                },
            };
            mentions.insert(remote_user_id, target);
        }
        Ok(mentions)
    }

    pub async fn handle_inbound_edit(&mut self, event: BridgeEvent) -> Result<(), BridgeError> {
        let portal_id = self.record.id;
        let EventKind::Edit { target, payload } = &event.kind else {
            return Ok(());
        };
        match (payload, event.source) {
            (MessagePayload::Matrix(message), Network::Matrix) => {
                if self.ctx.is_bridge_output(Network::Matrix, &event.sender) {
                    return Ok(());
                }
                if self
                    .edit_echoes
                    .take_match(portal_id, &edit_echo_key(target, &message.body), &event.sender)
                    .is_some()
                {
                    debug!("matrix edit echo absorbed target={}", target);
                    Metrics::echo_suppressed();
                    return Ok(());
                }
                let Some(mut mapping) = self.ctx.identity.lookup_by_local(portal_id, target).await?
                else {
                    let target = target.clone();
                    self.defer(event, &target);
                    return Ok(());
                };
                if mapping.deleted {
                    debug!("dropping edit of deleted message target={}", target);
                    return Ok(());
                }

                let chat_sender = self.ctx.puppets.chat_sender_for(&event.sender).await?;
                let relay_name = self.ctx.puppets.relay_display_name(&event.sender);
                let config = self.ctx.config.clone();
                let resolver = self.ctx.puppets.clone();
                let resolve_user = move |mxid: &str| resolver.remote_user_for_ghost(mxid);
                let outbound = matrix_to_chat_message(
                    message,
                    &MatrixToChatRefs {
                        sender: if chat_sender.is_relay() {
                            SenderStyle::Relayed {
                                display_name: &relay_name,
                                format: &config.bridge.relay_format,
                            }
                        } else {
                            SenderStyle::Native
                        },
                        thread_name: mapping.thread_root_remote_id.as_deref(),
                        quoted_message: None,
                        resolve_user: &resolve_user,
                    },
                )?;

                match edit_strategy(self.ctx.chat.supports_edits()) {
                    EditStrategy::InPlace => {
                        // Kept after success: the update event carries no id of its own.
                        let echo_sender = self.chat_identity(&chat_sender);
                        let echo_key = edit_echo_key(&mapping.remote_message_id, &outbound.text);
                        self.edit_echoes
                            .expect(portal_id, &echo_key, &echo_sender, Some(target));
                        let chat = self.ctx.chat.clone();
                        let result = send_with_retry(self.policy, "google chat edit", || {
                            chat.edit_message(&mapping.remote_message_id, &outbound.text, &chat_sender)
                        })
                        .await;
                        if matches!(&result, Err(err) if !err.is_transient()) {
                            self.edit_echoes.forget(portal_id, &echo_key, &echo_sender);
                        }
                        result?;
                    }
                    EditStrategy::RedactAndResend => {
                        let chat = self.ctx.chat.clone();
                        let previous = mapping.remote_message_id.clone();
                        send_with_retry(self.policy, "google chat delete", || {
                            chat.delete_message(&previous, &chat_sender)
                        })
                        .await?;
                        self.retired.insert(previous);
                        let sent = self
                            .send_to_chat(&outbound, None, &chat_sender, &event.event_id)
                            .await?;
                        mapping.remote_message_id = sent.name;
                    }
                }
                mapping.edit_count += 1;
                self.ctx.identity.update_message(&mapping).await?;
                info!(
                    "relayed matrix edit target={} remote={} edits={}",
                    target, mapping.remote_message_id, mapping.edit_count
                );
                Ok(())
            }
            (MessagePayload::Chat(message), Network::GoogleChat) => {
                if self.ctx.is_bridge_output(Network::GoogleChat, &event.sender) {
                    return Ok(());
                }
                if self
                    .edit_echoes
                    .take_match(portal_id, &edit_echo_key(target, &message.text), &event.sender)
                    .is_some()
                {
                    debug!("google chat edit echo absorbed target={}", target);
                    Metrics::echo_suppressed();
                    return Ok(());
                }
                let Some(mut mapping) = self.ctx.identity.lookup_by_remote(portal_id, target).await?
                else {
                    let target = target.clone();
                    self.defer(event, &target);
                    return Ok(());
                };
                if mapping.deleted {
                    debug!("dropping edit of deleted message target={}", target);
                    return Ok(());
                }

                let room_id = self.room_id()?;
                let puppet = self
                    .ctx
                    .puppets
                    .ensure_ghost(
                        &message.sender.name,
                        message.sender.display_name.as_deref(),
                        message.sender.avatar_url.as_deref(),
                    )
                    .await?;
                let sender = self.ctx.puppets.matrix_sender_for(&puppet);
                let mentions = self.mentions_for(&message.text).await?;
                let content = chat_edit_to_matrix(message, &mapping.local_event_id, &mentions);

                // Matrix always accepts m.replace, so only the in-place path applies here.
                // Receivers read the replacement body, not the starred fallback.
                let body = content["m.new_content"]["body"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                let echo_key = edit_echo_key(&mapping.local_event_id, &body);
                self.edit_echoes
                    .expect(portal_id, &echo_key, sender.user_id(), Some(target));
                let result = self
                    .ctx
                    .puppets
                    .send_as(&sender, &room_id, "m.room.message", &content)
                    .await;
                if matches!(&result, Err(err) if !err.is_transient()) {
                    self.edit_echoes.forget(portal_id, &echo_key, sender.user_id());
                }
                result?;
                mapping.edit_count += 1;
                self.ctx.identity.update_message(&mapping).await?;
                info!(
                    "relayed google chat edit target={} event_id={} edits={}",
                    target, mapping.local_event_id, mapping.edit_count
                );
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub async fn handle_inbound_reaction(&mut self, event: BridgeEvent) -> Result<(), BridgeError> {
        let portal_id = self.record.id;
        match (&event.kind, event.source) {
            (EventKind::Reaction { target, key }, Network::Matrix) => {
                if self.ctx.is_bridge_output(Network::Matrix, &event.sender) {
                    return Ok(());
                }
                let Some(mapping) = self.ctx.identity.lookup_by_local(portal_id, target).await?
                else {
                    let target = target.clone();
                    self.defer(event, &target);
                    return Ok(());
                };
                if mapping.deleted {
                    debug!("dropping stale reaction target={}", target);
                    return Ok(());
                }
                if self
                    .ctx
                    .identity
                    .reaction_by_local(portal_id, &event.event_id)
                    .await?
                    .is_some()
                {
                    return Ok(());
                }

                let chat_sender = self.ctx.puppets.chat_sender_for(&event.sender).await?;
                let display = self.ctx.puppets.relay_display_name(&event.sender);
                let translation = if chat_sender.is_relay() {
                    ReactionTranslation::Note(reaction_note(&display, key))
                } else {
                    matrix_reaction_to_chat(key, &display)
                };

                let chat = self.ctx.chat.clone();
                let (remote_reaction_id, is_note) = match translation {
                    ReactionTranslation::Native(emoji) => {
                        let name = send_with_retry(self.policy, "google chat reaction", || {
                            chat.add_reaction(&mapping.remote_message_id, &emoji, &chat_sender)
                        })
                        .await?;
                        (name, false)
                    }
                    ReactionTranslation::Note(text) => {
                        let note = ChatOutbound {
                            text,
                            thread_name: mapping.thread_root_remote_id.clone(),
                            ..Default::default()
                        };
                        let sent = self
                            .send_to_chat(&note, None, &ChatSender::Relay, &event.event_id)
                            .await?;
                        (sent.name, true)
                    }
                };
                self.ctx
                    .identity
                    .record_reaction(&build_reaction_mapping(
                        &mapping,
                        &event.event_id,
                        &remote_reaction_id,
                        key,
                        &event.sender,
                        is_note,
                    ))
                    .await?;
                debug!(
                    "relayed matrix reaction event_id={} remote={} note={}",
                    event.event_id, remote_reaction_id, is_note
                );
                Ok(())
            }
            (EventKind::Reaction { target, key }, Network::GoogleChat) => {
                if self.ctx.is_bridge_output(Network::GoogleChat, &event.sender)
                    || self
                        .ctx
                        .identity
                        .reaction_by_remote(portal_id, &event.event_id)
                        .await?
                        .is_some()
                {
                    return Ok(());
                }
                let Some(mapping) = self.ctx.identity.lookup_by_remote(portal_id, target).await?
                else {
                    let target = target.clone();
                    self.defer(event, &target);
                    return Ok(());
                };
                if mapping.deleted {
                    debug!("dropping stale reaction target={}", target);
                    return Ok(());
                }

                let room_id = self.room_id()?;
                let puppet = self
                    .ctx
                    .puppets
                    .ensure_ghost(&event.sender, None, None)
                    .await?;
                let sender = self.ctx.puppets.matrix_sender_for(&puppet);
                let content = chat_reaction_to_matrix(&mapping.local_event_id, key);
                let event_id = self
                    .ctx
                    .puppets
                    .send_as(&sender, &room_id, "m.reaction", &content)
                    .await?;
                self.ctx
                    .identity
                    .record_reaction(&build_reaction_mapping(
                        &mapping,
                        &event_id,
                        &event.event_id,
                        key,
                        &event.sender,
                        false,
                    ))
                    .await?;
                debug!(
                    "relayed google chat reaction name={} event_id={}",
                    event.event_id, event_id
                );
                Ok(())
            }
            (EventKind::ReactionRemoved { reaction_id }, Network::GoogleChat) => {
                let Some(reaction) = self
                    .ctx
                    .identity
                    .reaction_by_remote(portal_id, reaction_id)
                    .await?
                else {
                    debug!("reaction removal for unknown reaction={}", reaction_id);
                    return Ok(());
                };
                let room_id = self.room_id()?;
                let sender = match self.ctx.identity.puppet(&reaction.sender).await? {
                    Some(puppet) => self.ctx.puppets.matrix_sender_for(&puppet),
                    None => MatrixSender::Ghost(self.ctx.puppets.ghost_user_id(&reaction.sender)),
                };
                self.ctx
                    .puppets
                    .redact_as(&sender, &room_id, &reaction.local_event_id, None)
                    .await?;
                self.ctx.identity.remove_reaction(reaction.id).await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub async fn handle_inbound_redaction(&mut self, event: BridgeEvent) -> Result<(), BridgeError> {
        let portal_id = self.record.id;
        let EventKind::Redaction { target } = &event.kind else {
            return Ok(());
        };
        match event.source {
            Network::Matrix => {
                if self.ctx.is_bridge_output(Network::Matrix, &event.sender) {
                    return Ok(());
                }
                let chat_sender = self.ctx.puppets.chat_sender_for(&event.sender).await?;
                if let Some(reaction) = self.ctx.identity.reaction_by_local(portal_id, target).await? {
                    let chat = self.ctx.chat.clone();
                    let remote = reaction.remote_reaction_id.clone();
                    if reaction.is_fallback_note {
                        send_with_retry(self.policy, "google chat delete", || {
                            chat.delete_message(&remote, &ChatSender::Relay)
                        })
                        .await?;
                    } else {
                        send_with_retry(self.policy, "google chat reaction delete", || {
                            chat.delete_reaction(&remote, &chat_sender)
                        })
                        .await?;
                    }
                    self.ctx.identity.remove_reaction(reaction.id).await?;
                    return Ok(());
                }

                let Some(mapping) = self.ctx.identity.lookup_by_local(portal_id, target).await?
                else {
                    let target = target.clone();
                    self.defer(event, &target);
                    return Ok(());
                };
                if mapping.deleted {
                    return Ok(());
                }
                if self.ctx.config.bridge.disable_deletion_forwarding {
                    debug!("deletion forwarding disabled target={}", target);
                    return Ok(());
                }

                let chat = self.ctx.chat.clone();
                let result = send_with_retry(self.policy, "google chat delete", || {
                    chat.delete_message(&mapping.remote_message_id, &chat_sender)
                })
                .await;
                // The Matrix side is gone either way; later references must see the tombstone.
                self.ctx.identity.tombstone_message(&mapping).await?;
                result?;
                info!(
                    "relayed matrix redaction target={} remote={}",
                    target, mapping.remote_message_id
                );
                Ok(())
            }
            Network::GoogleChat => {
                if self.retired.remove(target) {
                    return Ok(());
                }
                let Some(mapping) = self.ctx.identity.lookup_by_remote(portal_id, target).await?
                else {
                    let target = target.clone();
                    self.defer(event, &target);
                    return Ok(());
                };
                if mapping.deleted {
                    return Ok(());
                }
                if self.ctx.config.bridge.disable_deletion_forwarding {
                    debug!("deletion forwarding disabled target={}", target);
                    return Ok(());
                }

                let room_id = self.room_id()?;
                let bot = MatrixSender::Ghost(self.ctx.matrix.bot_user_id().to_string());
                for request in chat_delete_redaction_requests(&room_id, &mapping) {
                    self.ctx
                        .puppets
                        .redact_as(&bot, &request.room_id, &request.event_id, Some(request.reason))
                        .await?;
                }
                self.ctx.identity.tombstone_message(&mapping).await?;
                info!(
                    "relayed google chat deletion remote={} event_id={}",
                    target, mapping.local_event_id
                );
                Ok(())
            }
        }
    }

    pub async fn handle_read_receipt(&mut self, event: BridgeEvent) -> Result<(), BridgeError> {
        if !should_forward_receipt(
            self.ctx.config.bridge.disable_read_receipts,
            self.record.state == PortalState::Active,
        ) || self.ctx.is_bridge_output(event.source, &event.sender)
        {
            return Ok(());
        }
        match event.source {
            Network::Matrix => {
                let sender = self.ctx.puppets.chat_sender_for(&event.sender).await?;
                if sender.is_relay() {
                    // Read state belongs to real accounts; the bot has none to move.
                    return Ok(());
                }
                self.ctx
                    .chat
                    .mark_read(&self.record.remote_conversation_id, &sender, event.timestamp)
                    .await?;
                Ok(())
            }
            Network::GoogleChat => {
                let Some(target) = self.record.last_processed_local_event_id.clone() else {
                    return Ok(());
                };
                let room_id = self.room_id()?;
                let puppet = self
                    .ctx
                    .puppets
                    .ensure_ghost(&event.sender, None, None)
                    .await?;
                let sender = self.ctx.puppets.matrix_sender_for(&puppet);
                self.ctx
                    .puppets
                    .ensure_joined(sender.user_id(), &room_id)
                    .await?;
                self.ctx
                    .matrix
                    .send_read_receipt(sender.user_id(), &room_id, &target)
                    .await?;
                Ok(())
            }
        }
    }

    /// Matrix to Google Chat only; fire and forget.
    pub async fn handle_typing_notification(&mut self, event: BridgeEvent) -> Result<(), BridgeError> {
        let EventKind::Typing { user_ids } = &event.kind else {
            return Ok(());
        };
        if event.source != Network::Matrix
            || !should_forward_typing(
                self.ctx.config.bridge.disable_typing_notifications,
                self.record.state == PortalState::Active,
            )
        {
            return Ok(());
        }

        let current: Vec<String> = user_ids
            .iter()
            .filter(|user| !self.ctx.is_bridge_output(Network::Matrix, user))
            .cloned()
            .collect();
        let change = typing_diff(&self.typing, &current);
        self.typing = current.into_iter().collect();

        let space = self.record.remote_conversation_id.clone();
        let updates = change
            .started
            .iter()
            .map(|user| (user, true))
            .chain(change.stopped.iter().map(|user| (user, false)));
        for (user, typing) in updates {
            let sender = self.ctx.puppets.chat_sender_for(user).await?;
            if let Err(err) = self.ctx.chat.set_typing(&space, &sender, typing).await {
                debug!("typing update failed user={}: {}", user, err);
            }
        }
        Ok(())
    }

    pub async fn handle_membership(&mut self, event: BridgeEvent) -> Result<(), BridgeError> {
        let EventKind::Membership { user, membership } = &event.kind else {
            return Ok(());
        };
        let is_bot = match event.source {
            Network::Matrix => user == self.ctx.matrix.bot_user_id(),
            Network::GoogleChat => user == self.ctx.chat.bot_user_id(),
        };

        if !is_bot {
            if event.source == Network::GoogleChat
                && *membership == Membership::Join
                && self.record.state == PortalState::Active
            {
                let room_id = self.room_id()?;
                let puppet = self.ctx.puppets.ensure_ghost(user, None, None).await?;
                let sender = self.ctx.puppets.matrix_sender_for(&puppet);
                self.ctx
                    .puppets
                    .ensure_joined(sender.user_id(), &room_id)
                    .await?;
            }
            return Ok(());
        }

        match (membership, self.record.state) {
            (Membership::Join | Membership::Invite, PortalState::Uninitialized)
                if event.source == Network::GoogleChat =>
            {
                self.initialize(None).await?;
            }
            (Membership::Join | Membership::Invite, PortalState::Inactive) => {
                self.transition(PortalState::Active)?;
                if let Some(room_id) = &self.record.local_room_id {
                    let bot = self.ctx.matrix.bot_user_id().to_string();
                    if let Err(err) = self.ctx.matrix.join_room(&bot, room_id).await {
                        warn!("bot failed to rejoin room_id={}: {}", room_id, err);
                    }
                }
                self.ctx.identity.save_portal(&self.record).await?;
            }
            (Membership::Leave | Membership::Ban, PortalState::Active) => {
                self.transition(PortalState::Inactive)?;
                self.ctx.identity.save_portal(&self.record).await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn handle_metadata_change(&mut self, event: BridgeEvent) -> Result<(), BridgeError> {
        let EventKind::MetadataChange { name, topic } = &event.kind else {
            return Ok(());
        };
        let name = name.as_deref().filter(|n| self.record.name.as_deref() != Some(*n));
        let topic = topic
            .as_deref()
            .filter(|t| self.record.topic.as_deref() != Some(*t));
        if name.is_none() && topic.is_none() {
            return Ok(());
        }

        match event.source {
            Network::GoogleChat => {
                let room_id = self.room_id()?;
                if let Some(name) = name {
                    self.ctx.matrix.set_room_name(&room_id, name).await?;
                }
                if let Some(topic) = topic {
                    self.ctx.matrix.set_room_topic(&room_id, topic).await?;
                }
            }
            Network::Matrix => {
                if self.ctx.is_bridge_output(Network::Matrix, &event.sender) {
                    return Ok(());
                }
                self.ctx
                    .chat
                    .update_conversation(&self.record.remote_conversation_id, name, topic)
                    .await?;
            }
        }
        if let Some(name) = name {
            self.record.name = Some(name.to_string());
        }
        if let Some(topic) = topic {
            self.record.topic = Some(topic.to_string());
        }
        self.ctx.identity.save_portal(&self.record).await?;
        info!(
            "relayed metadata change from {} name={:?} topic={:?}",
            event.source.as_str(),
            name,
            topic
        );
        Ok(())
    }

    /// Google Chat is authoritative for the conversation title and description.
    pub async fn sync_metadata(&mut self) -> Result<(), BridgeError> {
        if self.record.state != PortalState::Active {
            return Ok(());
        }
        let room_id = self.room_id()?;
        let info = self
            .ctx
            .chat
            .get_conversation(&self.record.remote_conversation_id)
            .await?;
        let mut changed = false;
        if let Some(name) = info.display_name.filter(|n| self.record.name.as_ref() != Some(n)) {
            self.ctx.matrix.set_room_name(&room_id, &name).await?;
            self.record.name = Some(name);
            changed = true;
        }
        if let Some(topic) = info
            .description
            .filter(|t| self.record.topic.as_ref() != Some(t))
        {
            self.ctx.matrix.set_room_topic(&room_id, &topic).await?;
            self.record.topic = Some(topic);
            changed = true;
        }
        if changed {
            self.ctx.identity.save_portal(&self.record).await?;
            info!("synced portal metadata name={:?}", self.record.name);
        }
        Ok(())
    }

    /// Binds the portal to a room and queues the configured backfill. Returns the room id.
    pub async fn initialize(&mut self, room_id: Option<String>) -> Result<String, BridgeError> {
        if let (PortalState::Active, Some(existing)) =
            (self.record.state, &self.record.local_room_id)
        {
            return Ok(existing.clone());
        }
        let space = self.record.remote_conversation_id.clone();
        let info = match self.ctx.chat.get_conversation(&space).await {
            Ok(info) => info,
            Err(err) => {
                warn!("failed to fetch conversation space={}: {}", space, err);
                Default::default()
            }
        };

        let room_id = match (room_id, self.record.local_room_id.clone()) {
            (Some(room_id), _) | (None, Some(room_id)) => {
                let bot = self.ctx.matrix.bot_user_id().to_string();
                if let Err(err) = self.ctx.matrix.join_room(&bot, &room_id).await {
                    warn!("bot failed to join room_id={}: {}", room_id, err);
                }
                room_id
            }
            (None, None) => {
                let limit = self.ctx.config.limits.room_count;
                if limit >= 0 && self.active_portal_count().await? >= limit as usize {
                    return Err(BridgeError::PermanentRejection(format!(
                        "room limit {limit} reached"
                    )));
                }
                let creation = RoomCreation {
                    alias_localpart: Some(format!(
                        "{}{}",
                        self.ctx.config.room.room_alias_prefix,
                        space.trim_start_matches("spaces/").to_lowercase()
                    )),
                    name: info.display_name.clone(),
                    topic: info.description.clone(),
                    is_direct: info.is_direct || self.record.is_direct,
                    invite: self.ctx.config.bridge.admin_mxid.iter().cloned().collect(),
                };
                self.ctx.matrix.create_room(&creation).await?
            }
        };

        self.record.local_room_id = Some(room_id.clone());
        self.record.name = info.display_name.or(self.record.name.take());
        self.record.topic = info.description.or(self.record.topic.take());
        self.record.is_direct = self.record.is_direct || info.is_direct;
        self.transition(PortalState::Active)?;
        self.ctx.identity.save_portal(&self.record).await?;
        info!("portal initialized room_id={} space={}", room_id, space);

        self.queue_backfill().await;
        Ok(room_id)
    }

    async fn active_portal_count(&self) -> Result<usize, BridgeError> {
        let total = self.ctx.identity.count_portals().await?;
        let portals = self.ctx.identity.list_portals(total.max(1), 0).await?;
        Ok(portals
            .iter()
            .filter(|portal| portal.state == PortalState::Active)
            .count())
    }

    async fn queue_backfill(&mut self) {
        let limit = self.ctx.config.backfill.initial_limit;
        if limit == 0 {
            return;
        }
        let space = self.record.remote_conversation_id.clone();
        match self.ctx.chat.list_messages(&space, limit).await {
            Ok(history) => {
                info!("backfilling messages={} space={}", history.len(), space);
                for message in history {
                    self.ready.push_back(BridgeEvent {
                        source: Network::GoogleChat,
                        conversation: space.clone(),
                        sender: message.sender.name.clone(),
                        event_id: message.name.clone(),
                        timestamp: message.create_time,
                        kind: EventKind::Message(MessagePayload::Chat(message)),
                    });
                }
            }
            Err(err) => warn!("backfill failed space={}: {}", space, err),
        }
    }

    pub fn transition(&mut self, next: PortalState) -> Result<(), BridgeError> {
        let from = self.record.state;
        if !from.can_transition_to(next) {
            return Err(BridgeError::InvalidTransition { from, to: next });
        }
        self.record.state = next;
        info!("portal state {} -> {}", from.as_str(), next.as_str());
        Ok(())
    }

    fn defer(&mut self, event: BridgeEvent, target: &str) {
        debug!(
            "deferring {} event_id={} until target={} is mapped",
            event.kind_name(),
            event.event_id,
            target
        );
        self.pending.defer(event.source, target, event);
    }

    fn release_pending(&mut self, local_event_ids: &[String], remote_message_id: &str) {
        for local in local_event_ids {
            self.ready
                .extend(self.pending.take_for(Network::Matrix, local));
        }
        self.ready
            .extend(self.pending.take_for(Network::GoogleChat, remote_message_id));
    }

    /// Drops deferred events whose target never got mapped within the window.
    pub fn expire_pending(&mut self, now: Instant) {
        for event in self.pending.expire(now) {
            let err = BridgeError::UnresolvedReference {
                portal_id: self.record.id,
                target: reference_target(&event.kind).unwrap_or_default().to_string(),
            };
            self.report(event.kind_name(), &event.event_id, &err);
        }
        self.echoes.purge(now);
        self.edit_echoes.purge(now);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn room_id(&self) -> Result<String, BridgeError> {
        self.record.local_room_id.clone().ok_or_else(|| {
            BridgeError::PermanentRejection(format!(
                "portal {} has no matrix room",
                self.record.id
            ))
        })
    }
}

fn reference_target(kind: &EventKind) -> Option<&str> {
    match kind {
        EventKind::Edit { target, .. }
        | EventKind::Reaction { target, .. }
        | EventKind::Redaction { target } => Some(target),
        EventKind::ReactionRemoved { reaction_id } => Some(reaction_id),
        _ => None,
    }
}

/// Google Chat deduplicates sends carrying the same request id, which keeps a
/// retried send from posting twice.
fn request_id_for(source_event_id: &str) -> String {
    let mut hasher = DefaultHasher::new();
    source_event_id.hash(&mut hasher);
    format!("mx-{:016x}", hasher.finish())
}

fn edit_echo_key(target: &str, text: &str) -> String {
    format!("{target}\n{text}")
}

fn attachment_fallback(attachment: &ChatAttachment) -> Value {
    json!({
        "msgtype": "m.notice",
        "body": format!("{} (attachment could not be bridged)", attachment.content_name),
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use test_case::test_case;
    use tokio::time::Instant;

    use super::Portal;
    use crate::bridge::BridgeError;
    use crate::bridge::SendError;
    use crate::bridge::event::{
        AttachmentSource, ChatAttachment, ChatMessage, ChatUser, EventKind, MatrixMessage,
        Membership, MessagePayload,
    };
    use crate::bridge::testing::{
        ChatCall, Harness, MatrixCall, chat_event, chat_message_event, chat_text, harness,
        harness_with, matrix_event, matrix_text,
    };
    use crate::db::{MessageMapping, PortalState};
    use crate::googlechat::ConversationInfo;

    const SPACE: &str = "spaces/AAA";
    const ROOM: &str = "!room:example.org";

    async fn active(h: &Harness) -> Portal {
        let handle = h.active_portal(SPACE, ROOM).await;
        Portal::load(h.ctx.clone(), &handle).await.expect("load portal")
    }

    #[tokio::test]
    async fn matrix_message_is_relayed_once_and_its_echo_is_absorbed() {
        let h = harness().await;
        let mut portal = active(&h).await;

        let mut message = MatrixMessage::text("hello **world**");
        message.formatted_body = Some("hello <strong>world</strong>".to_string());
        portal
            .process(matrix_event(
                ROOM,
                "$m1",
                "@alice:example.org",
                EventKind::Message(MessagePayload::Matrix(message)),
            ))
            .await;

        let sent = h.chat.sent();
        assert_eq!(sent.len(), 1);
        let (space, outbound, sender, name) = &sent[0];
        assert_eq!(space, SPACE);
        assert_eq!(sender, "relay");
        assert_eq!(outbound.text, "alice: hello *world*");

        portal
            .process(chat_text(SPACE, name, "users/100", &outbound.text))
            .await;

        assert_eq!(h.chat.sent().len(), 1);
        assert!(h.matrix.messages().is_empty());
        let mapping = h
            .ctx
            .identity
            .lookup_by_local(portal.id(), "$m1")
            .await
            .expect("lookup")
            .expect("mapped");
        assert_eq!(&mapping.remote_message_id, name);
        assert!(mapping.sent_by_bridge);
    }

    #[tokio::test]
    async fn linked_users_send_natively() {
        let h = harness().await;
        h.ctx
            .puppets
            .link_user("@alice:example.org", "users/1", "token")
            .await
            .expect("link");
        let mut portal = active(&h).await;

        portal
            .process(matrix_text(ROOM, "$m1", "@alice:example.org", "hi there"))
            .await;

        let sent = h.chat.sent();
        assert_eq!(sent[0].1.text, "hi there");
        assert_eq!(sent[0].2, "users/1");
    }

    #[tokio::test]
    async fn conflicting_mapping_is_kept_when_a_relay_lands_on_a_known_remote_id() {
        let h = harness().await;
        let mut portal = active(&h).await;
        let stale = MessageMapping::new(portal.id(), "$stale", "spaces/AAA/messages/b1");
        assert!(h.ctx.identity.record_message(&stale).await.expect("record"));

        portal
            .process(matrix_text(ROOM, "$m1", "@alice:example.org", "hi"))
            .await;

        assert_eq!(h.chat.sent()[0].3, "spaces/AAA/messages/b1");
        let kept = h
            .ctx
            .identity
            .lookup_by_remote(portal.id(), "spaces/AAA/messages/b1")
            .await
            .expect("lookup")
            .expect("mapped");
        assert_eq!(kept.local_event_id, "$stale");
        assert!(
            h.ctx
                .identity
                .lookup_by_local(portal.id(), "$m1")
                .await
                .expect("lookup")
                .is_none()
        );
        assert_eq!(
            portal.record().last_processed_remote_event_id.as_deref(),
            Some("spaces/AAA/messages/b1")
        );
    }

    #[tokio::test]
    async fn chat_message_is_sent_by_the_ghost() {
        let h = harness().await;
        let mut portal = active(&h).await;

        portal
            .process(chat_text(SPACE, "spaces/AAA/messages/m1", "users/1", "hey *you*"))
            .await;

        let sent = h.matrix.sent();
        let messages: Vec<_> = sent
            .iter()
            .filter(|(_, _, event_type, _, _)| event_type == "m.room.message")
            .collect();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, "@googlechat_1:example.org");
        assert_eq!(messages[0].3["formatted_body"], "hey <strong>you</strong>");

        let mapping = h
            .ctx
            .identity
            .lookup_by_remote(portal.id(), "spaces/AAA/messages/m1")
            .await
            .expect("lookup")
            .expect("mapped");
        assert!(!mapping.sent_by_bridge);
        assert_eq!(mapping.local_event_id, messages[0].4);
    }

    #[tokio::test]
    async fn double_puppeted_chat_users_post_as_themselves() {
        let h = harness().await;
        h.ctx
            .puppets
            .link_user("@alice:example.org", "users/1", "token")
            .await
            .expect("link");
        let mut portal = active(&h).await;

        portal
            .process(chat_text(SPACE, "spaces/AAA/messages/m1", "users/1", "from chat"))
            .await;

        let senders: Vec<_> = h
            .matrix
            .sent()
            .into_iter()
            .map(|(as_user, ..)| as_user)
            .collect();
        assert_eq!(senders, vec!["@alice:example.org".to_string()]);

        // The homeserver later reports the event back from the real user.
        let event_id = h.matrix.sent()[0].4.clone();
        portal
            .process(matrix_text(ROOM, &event_id, "@alice:example.org", "from chat"))
            .await;
        assert!(h.chat.sent().is_empty());
    }

    #[tokio::test]
    async fn chat_reaction_on_mapped_message_produces_one_annotation() {
        let h = harness().await;
        let mut portal = active(&h).await;
        h.ctx
            .identity
            .record_message(&MessageMapping::new(
                portal.id(),
                "$orig",
                "spaces/AAA/messages/m1",
            ))
            .await
            .expect("record");

        portal
            .process(chat_event(
                SPACE,
                "spaces/AAA/messages/m1/reactions/r1",
                "users/2",
                EventKind::Reaction {
                    target: "spaces/AAA/messages/m1".to_string(),
                    key: "👍".to_string(),
                },
            ))
            .await;

        let reactions: Vec<_> = h
            .matrix
            .sent()
            .into_iter()
            .filter(|(_, _, event_type, _, _)| event_type == "m.reaction")
            .collect();
        assert_eq!(reactions.len(), 1);
        assert_eq!(reactions[0].3["m.relates_to"]["event_id"], "$orig");
        assert_eq!(reactions[0].3["m.relates_to"]["key"], "👍");
    }

    #[tokio::test]
    async fn matrix_redaction_deletes_and_later_reactions_are_stale() {
        let h = harness().await;
        let mut portal = active(&h).await;
        portal
            .process(matrix_text(ROOM, "$m1", "@alice:example.org", "to be removed"))
            .await;
        let remote = h.chat.sent()[0].3.clone();

        portal
            .process(matrix_event(
                ROOM,
                "$redact",
                "@alice:example.org",
                EventKind::Redaction {
                    target: "$m1".to_string(),
                },
            ))
            .await;

        assert!(h.chat.calls().iter().any(|call| matches!(
            call,
            ChatCall::Delete { name, .. } if *name == remote
        )));
        let mapping = h
            .ctx
            .identity
            .lookup_by_remote(portal.id(), &remote)
            .await
            .expect("lookup")
            .expect("kept");
        assert!(mapping.deleted);

        portal
            .process(chat_event(
                SPACE,
                &format!("{remote}/reactions/r1"),
                "users/2",
                EventKind::Reaction {
                    target: remote.clone(),
                    key: "👍".to_string(),
                },
            ))
            .await;
        assert!(
            h.matrix
                .sent()
                .iter()
                .all(|(_, _, event_type, _, _)| event_type != "m.reaction")
        );
        assert_eq!(portal.pending_len(), 0);
    }

    #[tokio::test]
    async fn edit_arriving_first_is_applied_once_the_message_is_mapped() {
        let h = harness().await;
        let mut portal = active(&h).await;

        let mut edited = ChatMessage {
            name: "spaces/AAA/messages/m1".to_string(),
            text: "fixed".to_string(),
            sender: ChatUser {
                name: "users/1".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        portal
            .process(chat_event(
                SPACE,
                "spaces/AAA/messages/m1",
                "users/1",
                EventKind::Edit {
                    target: "spaces/AAA/messages/m1".to_string(),
                    payload: MessagePayload::Chat(edited.clone()),
                },
            ))
            .await;
        assert_eq!(portal.pending_len(), 1);
        assert!(h.matrix.messages().is_empty());

        edited.text = "typo".to_string();
        portal.process(chat_message_event(SPACE, edited)).await;

        let messages = h.matrix.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["body"], "typo");
        assert_eq!(messages[1]["m.new_content"]["body"], "fixed");
        assert_eq!(portal.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unresolved_references_expire_after_the_window() {
        let h = harness().await;
        let mut portal = active(&h).await;

        portal
            .process(matrix_event(
                ROOM,
                "$edit",
                "@alice:example.org",
                EventKind::Edit {
                    target: "$late".to_string(),
                    payload: MessagePayload::Matrix(MatrixMessage::text("new")),
                },
            ))
            .await;
        assert_eq!(portal.pending_len(), 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        portal.expire_pending(Instant::now());
        assert_eq!(portal.pending_len(), 0);

        portal
            .process(matrix_text(ROOM, "$late", "@alice:example.org", "old"))
            .await;
        assert_eq!(h.chat.sent().len(), 1);
        assert!(
            !h.chat
                .calls()
                .iter()
                .any(|call| matches!(call, ChatCall::Edit { .. }))
        );
    }

    #[tokio::test]
    async fn echo_of_a_lost_send_backfills_the_mapping() {
        let h = harness().await;
        let mut portal = active(&h).await;
        h.chat.fail_next_send(SendError::Transient("timeout".into()));
        h.chat.fail_next_send(SendError::Transient("timeout".into()));

        portal
            .process(matrix_text(ROOM, "$m1", "@alice:example.org", "are you there"))
            .await;
        assert!(h.chat.sent().is_empty());

        portal
            .process(chat_text(
                SPACE,
                "spaces/AAA/messages/landed",
                "users/100",
                "alice: are you there",
            ))
            .await;

        assert!(h.matrix.messages().is_empty());
        let mapping = h
            .ctx
            .identity
            .lookup_by_local(portal.id(), "$m1")
            .await
            .expect("lookup")
            .expect("backfilled");
        assert_eq!(mapping.remote_message_id, "spaces/AAA/messages/landed");
    }

    #[tokio::test]
    async fn edits_redact_and_resend_without_in_place_support() {
        let h = harness().await;
        h.chat.set_supports_edits(false);
        let mut portal = active(&h).await;
        portal
            .process(matrix_text(ROOM, "$m1", "@alice:example.org", "first"))
            .await;
        let original = h.chat.sent()[0].3.clone();

        portal
            .process(matrix_event(
                ROOM,
                "$m2",
                "@alice:example.org",
                EventKind::Edit {
                    target: "$m1".to_string(),
                    payload: MessagePayload::Matrix(MatrixMessage::text("second")),
                },
            ))
            .await;

        let sent = h.chat.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].1.text, "alice: second");
        let mapping = h
            .ctx
            .identity
            .lookup_by_local(portal.id(), "$m1")
            .await
            .expect("lookup")
            .expect("mapped");
        assert_eq!(mapping.remote_message_id, sent[1].3);
        assert_eq!(mapping.edit_count, 1);

        // The deletion of the replaced message echoes back and is ignored.
        portal
            .process(chat_event(
                SPACE,
                &original,
                "",
                EventKind::Redaction {
                    target: original.clone(),
                },
            ))
            .await;
        assert!(h.matrix.redactions().is_empty());
        assert_eq!(portal.pending_len(), 0);
    }

    #[test_case(true ; "in place edits")]
    #[test_case(false ; "redact and resend")]
    #[tokio::test]
    async fn chat_edits_by_linked_users_are_not_bounced_back(supports_edits: bool) {
        let h = harness().await;
        h.chat.set_supports_edits(supports_edits);
        h.ctx
            .puppets
            .link_user("@alice:example.org", "users/1", "token")
            .await
            .expect("link");
        let mut portal = active(&h).await;
        let name = "spaces/AAA/messages/m1";

        portal.process(chat_text(SPACE, name, "users/1", "helo")).await;
        let local = h.matrix.sent()[0].4.clone();
        portal
            .process(chat_event(
                SPACE,
                name,
                "users/1",
                EventKind::Edit {
                    target: name.to_string(),
                    payload: MessagePayload::Chat(ChatMessage {
                        name: name.to_string(),
                        text: "hello".to_string(),
                        sender: ChatUser {
                            name: "users/1".to_string(),
                            ..Default::default()
                        },
                        ..Default::default()
                    }),
                },
            ))
            .await;
        let sent = h.matrix.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].3["m.new_content"]["body"], "hello");

        // The homeserver reports the edit back from the real user.
        portal
            .process(matrix_event(
                ROOM,
                &sent[1].4,
                "@alice:example.org",
                EventKind::Edit {
                    target: local,
                    payload: MessagePayload::Matrix(MatrixMessage::text("hello")),
                },
            ))
            .await;

        assert!(h.chat.calls().iter().all(|call| !matches!(
            call,
            ChatCall::Edit { .. } | ChatCall::Delete { .. } | ChatCall::Send { .. }
        )));
    }

    #[tokio::test]
    async fn an_edit_does_not_swallow_a_later_message_with_the_same_text() {
        let h = harness().await;
        h.ctx
            .puppets
            .link_user("@alice:example.org", "users/1", "token")
            .await
            .expect("link");
        let mut portal = active(&h).await;

        portal
            .process(matrix_text(ROOM, "$m1", "@alice:example.org", "draft"))
            .await;
        let remote = h.chat.sent()[0].3.clone();
        portal
            .process(matrix_event(
                ROOM,
                "$m2",
                "@alice:example.org",
                EventKind::Edit {
                    target: "$m1".to_string(),
                    payload: MessagePayload::Matrix(MatrixMessage::text("ok")),
                },
            ))
            .await;
        assert!(
            h.chat
                .calls()
                .iter()
                .any(|call| matches!(call, ChatCall::Edit { text, .. } if text == "ok"))
        );

        portal
            .process(chat_text(SPACE, "spaces/AAA/messages/fresh", "users/1", "ok"))
            .await;
        assert_eq!(h.matrix.messages().len(), 1);
        assert_eq!(h.matrix.messages()[0]["body"], "ok");

        // The update event for the edit itself is still recognized.
        portal
            .process(chat_event(
                SPACE,
                &remote,
                "users/1",
                EventKind::Edit {
                    target: remote.clone(),
                    payload: MessagePayload::Chat(ChatMessage {
                        name: remote.clone(),
                        text: "ok".to_string(),
                        sender: ChatUser {
                            name: "users/1".to_string(),
                            ..Default::default()
                        },
                        ..Default::default()
                    }),
                },
            ))
            .await;
        assert_eq!(h.matrix.messages().len(), 1);
    }

    #[tokio::test]
    async fn thread_replies_follow_the_thread_root() {
        let h = harness().await;
        let mut portal = active(&h).await;
        let thread = "spaces/AAA/threads/t1".to_string();

        portal
            .process(chat_message_event(
                SPACE,
                ChatMessage {
                    name: "spaces/AAA/messages/root".to_string(),
                    text: "root".to_string(),
                    sender: ChatUser {
                        name: "users/1".to_string(),
                        ..Default::default()
                    },
                    thread_name: Some(thread.clone()),
                    ..Default::default()
                },
            ))
            .await;
        portal
            .process(chat_message_event(
                SPACE,
                ChatMessage {
                    name: "spaces/AAA/messages/reply".to_string(),
                    text: "reply".to_string(),
                    sender: ChatUser {
                        name: "users/2".to_string(),
                        ..Default::default()
                    },
                    thread_name: Some(thread),
                    thread_reply: true,
                    ..Default::default()
                },
            ))
            .await;

        let sent = h.matrix.sent();
        let messages: Vec<_> = sent
            .iter()
            .filter(|(_, _, event_type, _, _)| event_type == "m.room.message")
            .collect();
        assert_eq!(messages.len(), 2);
        let root_event = &messages[0].4;
        assert_eq!(messages[1].3["m.relates_to"]["rel_type"], "m.thread");
        assert_eq!(messages[1].3["m.relates_to"]["event_id"], json!(root_event));
    }

    #[tokio::test]
    async fn multi_part_messages_are_deleted_part_by_part() {
        let h = harness().await;
        let mut portal = active(&h).await;
        portal
            .process(chat_message_event(
                SPACE,
                ChatMessage {
                    name: "spaces/AAA/messages/m1".to_string(),
                    text: "look".to_string(),
                    sender: ChatUser {
                        name: "users/1".to_string(),
                        ..Default::default()
                    },
                    attachments: vec![ChatAttachment {
                        name: "spaces/AAA/messages/m1/attachments/a1".to_string(),
                        content_name: "cat.png".to_string(),
                        content_type: "image/png".to_string(),
                        source: AttachmentSource::Uploaded {
                            resource_name: "res-1".to_string(),
                        },
                    }],
                    ..Default::default()
                },
            ))
            .await;
        let messages = h.matrix.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1]["url"], "mxc://example.org/cat.png");

        portal
            .process(chat_event(
                SPACE,
                "spaces/AAA/messages/m1",
                "",
                EventKind::Redaction {
                    target: "spaces/AAA/messages/m1".to_string(),
                },
            ))
            .await;
        assert_eq!(h.matrix.redactions().len(), 2);
    }

    #[tokio::test]
    async fn attachment_parts_can_be_reacted_to_and_redacted_from_matrix() {
        let h = harness().await;
        h.ctx
            .puppets
            .link_user("@alice:example.org", "users/9", "token")
            .await
            .expect("link");
        let mut portal = active(&h).await;
        portal
            .process(chat_message_event(
                SPACE,
                ChatMessage {
                    name: "spaces/AAA/messages/m1".to_string(),
                    text: "look".to_string(),
                    sender: ChatUser {
                        name: "users/1".to_string(),
                        ..Default::default()
                    },
                    attachments: vec![ChatAttachment {
                        name: "spaces/AAA/messages/m1/attachments/a1".to_string(),
                        content_name: "cat.png".to_string(),
                        content_type: "image/png".to_string(),
                        source: AttachmentSource::Uploaded {
                            resource_name: "res-1".to_string(),
                        },
                    }],
                    ..Default::default()
                },
            ))
            .await;
        let image_event = h
            .matrix
            .sent()
            .into_iter()
            .filter(|(_, _, event_type, _, _)| event_type == "m.room.message")
            .nth(1)
            .map(|(_, _, _, _, event_id)| event_id)
            .expect("image part sent");

        portal
            .process(matrix_event(
                ROOM,
                "$r1",
                "@alice:example.org",
                EventKind::Reaction {
                    target: image_event.clone(),
                    key: "👍".to_string(),
                },
            ))
            .await;
        portal
            .process(matrix_event(
                ROOM,
                "$x1",
                "@alice:example.org",
                EventKind::Redaction {
                    target: image_event,
                },
            ))
            .await;

        assert_eq!(portal.pending_len(), 0);
        let calls = h.chat.calls();
        assert!(calls.iter().any(|call| matches!(
            call,
            ChatCall::AddReaction { message, .. } if message == "spaces/AAA/messages/m1"
        )));
        assert!(calls.iter().any(|call| matches!(
            call,
            ChatCall::Delete { name, .. } if name == "spaces/AAA/messages/m1"
        )));
    }

    #[tokio::test]
    async fn relayed_reactions_degrade_to_notes() {
        let h = harness().await;
        let mut portal = active(&h).await;
        portal
            .process(matrix_text(ROOM, "$m1", "@alice:example.org", "react to me"))
            .await;

        portal
            .process(matrix_event(
                ROOM,
                "$r1",
                "@bob:example.org",
                EventKind::Reaction {
                    target: "$m1".to_string(),
                    key: "👍".to_string(),
                },
            ))
            .await;

        let sent = h.chat.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].1.text, "bob reacted with 👍");
        let reaction = h
            .ctx
            .identity
            .reaction_by_local(portal.id(), "$r1")
            .await
            .expect("lookup")
            .expect("recorded");
        assert!(reaction.is_fallback_note);
    }

    #[tokio::test]
    async fn typing_is_forwarded_only_on_change() {
        let h = harness().await;
        let mut portal = active(&h).await;
        let typing = |users: &[&str]| {
            matrix_event(
                ROOM,
                "typing",
                "",
                EventKind::Typing {
                    user_ids: users.iter().map(|u| u.to_string()).collect(),
                },
            )
        };

        portal.process(typing(&["@alice:example.org"])).await;
        portal.process(typing(&["@alice:example.org"])).await;
        portal.process(typing(&[])).await;

        let updates: Vec<_> = h
            .chat
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                ChatCall::Typing { typing, .. } => Some(typing),
                _ => None,
            })
            .collect();
        assert_eq!(updates, vec![true, false]);
    }

    #[tokio::test]
    async fn typing_is_suppressed_when_disabled() {
        let h = harness_with(|config| config.bridge.disable_typing_notifications = true).await;
        let mut portal = active(&h).await;
        portal
            .process(matrix_event(
                ROOM,
                "typing",
                "",
                EventKind::Typing {
                    user_ids: vec!["@alice:example.org".to_string()],
                },
            ))
            .await;
        assert!(h.chat.calls().is_empty());
    }

    #[tokio::test]
    async fn first_chat_event_creates_the_room_and_backfills() {
        let h = harness_with(|config| config.backfill.initial_limit = 10).await;
        h.chat.set_conversation(ConversationInfo {
            display_name: Some("Team".to_string()),
            ..Default::default()
        });
        let older = ChatMessage {
            name: "spaces/BBB/messages/old".to_string(),
            text: "older".to_string(),
            sender: ChatUser {
                name: "users/1".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let newest = ChatMessage {
            name: "spaces/BBB/messages/new".to_string(),
            text: "newest".to_string(),
            ..older.clone()
        };
        h.chat.set_history(vec![older, newest.clone()]);

        let handle = h
            .ctx
            .identity
            .resolve_portal("spaces/BBB", false)
            .await
            .expect("resolve");
        let mut portal = Portal::load(h.ctx.clone(), &handle).await.expect("load");
        assert_eq!(portal.state(), PortalState::Uninitialized);

        portal.process(chat_message_event("spaces/BBB", newest)).await;

        assert_eq!(portal.state(), PortalState::Active);
        assert!(h.matrix.calls().iter().any(|call| matches!(
            call,
            MatrixCall::CreateRoom(creation)
                if creation.name.as_deref() == Some("Team")
                    && creation.alias_localpart.as_deref() == Some("googlechat_bbb")
        )));
        let bodies: Vec<_> = h
            .matrix
            .messages()
            .iter()
            .map(|content| content["body"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(bodies, vec!["older".to_string(), "newest".to_string()]);
    }

    #[tokio::test]
    async fn removal_and_readdition_toggle_the_portal() {
        let h = harness().await;
        let mut portal = active(&h).await;
        let bot_membership = |membership| {
            chat_event(
                SPACE,
                "membership",
                "users/1",
                EventKind::Membership {
                    user: "users/100".to_string(),
                    membership,
                },
            )
        };

        portal.process(bot_membership(Membership::Leave)).await;
        assert_eq!(portal.state(), PortalState::Inactive);

        portal
            .process(chat_text(SPACE, "spaces/AAA/messages/m1", "users/1", "ignored"))
            .await;
        assert!(h.matrix.messages().is_empty());

        portal.process(bot_membership(Membership::Join)).await;
        assert_eq!(portal.state(), PortalState::Active);
        assert_eq!(
            h.ctx
                .identity
                .load_portal(portal.id())
                .await
                .expect("load")
                .expect("exists")
                .state,
            PortalState::Active
        );
    }

    #[tokio::test]
    async fn transitions_outside_the_lifecycle_are_rejected() {
        let h = harness().await;
        let mut portal = active(&h).await;
        assert!(matches!(
            portal.transition(PortalState::Active),
            Err(BridgeError::InvalidTransition { .. })
        ));
        assert!(matches!(
            portal.transition(PortalState::Uninitialized),
            Err(BridgeError::InvalidTransition { .. })
        ));
        tokio_test::assert_ok!(portal.transition(PortalState::Inactive));
        tokio_test::assert_ok!(portal.transition(PortalState::Active));
    }

    #[tokio::test]
    async fn sync_metadata_treats_chat_as_authoritative() {
        let h = harness().await;
        h.chat.set_conversation(ConversationInfo {
            display_name: Some("Renamed".to_string()),
            description: Some("About".to_string()),
            is_direct: false,
        });
        let mut portal = active(&h).await;

        portal.sync_metadata().await.expect("sync");
        portal.sync_metadata().await.expect("sync again");

        let renames = h
            .matrix
            .calls()
            .into_iter()
            .filter(|call| matches!(call, MatrixCall::RoomName { .. }))
            .count();
        assert_eq!(renames, 1);
        assert_eq!(portal.record().topic.as_deref(), Some("About"));
    }

    #[tokio::test]
    async fn matrix_rename_is_pushed_to_chat() {
        let h = harness().await;
        let mut portal = active(&h).await;
        portal
            .process(matrix_event(
                ROOM,
                "$name",
                "@alice:example.org",
                EventKind::MetadataChange {
                    name: Some("New name".to_string()),
                    topic: None,
                },
            ))
            .await;
        assert!(h.chat.calls().contains(&ChatCall::UpdateConversation {
            space: SPACE.to_string(),
            display_name: Some("New name".to_string()),
            description: None,
        }));
    }

    #[tokio::test]
    async fn chat_read_state_marks_the_latest_event_read() {
        let h = harness().await;
        let mut portal = active(&h).await;
        portal
            .process(chat_text(SPACE, "spaces/AAA/messages/m1", "users/1", "hello"))
            .await;
        let latest = h.matrix.messages().len();
        assert_eq!(latest, 1);

        portal
            .process(chat_event(
                SPACE,
                "read",
                "users/2",
                EventKind::ReadReceipt { up_to: None },
            ))
            .await;
        assert!(h.matrix.calls().iter().any(|call| matches!(
            call,
            MatrixCall::Receipt { as_user, .. } if as_user == "@googlechat_2:example.org"
        )));
    }
}
