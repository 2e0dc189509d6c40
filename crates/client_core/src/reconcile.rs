use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationKey, DeliveryState, LocalId, MessageId, UserId},
    protocol::{ChatMessage, DirectMessage},
};

use tokio::sync::Notify;

use crate::config::ClientSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerSettings {
    pub dedup_capacity: usize,
    pub dedup_ttl: Duration,
    pub match_window: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self::from(&ClientSettings::default())
    }
}

impl From<&ClientSettings> for ReconcilerSettings {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            dedup_capacity: settings.dedup_capacity.max(1),
            dedup_ttl: settings.dedup_ttl(),
            match_window: settings.optimistic_match_window(),
        }
    }
}

/// A server-sourced message, normalized from either the channel or the DM
/// wire shape.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub server_id: Option<MessageId>,
    pub sender_id: UserId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub client_id: Option<LocalId>,
}

impl InboundMessage {
    /// Messages without a server timestamp are stamped with `received_at`.
    pub fn from_chat(message: ChatMessage, received_at: DateTime<Utc>) -> Self {
        Self {
            server_id: message.message_id,
            sender_id: message.sender_id,
            content: message.content,
            timestamp: message.timestamp.unwrap_or(received_at),
            client_id: message.client_id,
        }
    }

    pub fn from_direct(message: DirectMessage) -> Self {
        Self {
            server_id: Some(message.id),
            sender_id: message.sender_id,
            content: message.content,
            timestamp: message.timestamp,
            client_id: message.client_id,
        }
    }
}

/// The DM thread a direct message belongs to, keyed by the other participant.
pub fn direct_conversation(local_user: &UserId, message: &DirectMessage) -> ConversationKey {
    if &message.sender_id == local_user {
        ConversationKey::Direct(message.receiver_id.clone())
    } else {
        ConversationKey::Direct(message.sender_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    /// Set for entries that started as a local optimistic send.
    pub local_id: Option<LocalId>,
    pub server_id: Option<MessageId>,
    pub sender_id: UserId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub state: DeliveryState,
    /// True once the server's own copy has been folded in.
    pub authoritative: bool,
    /// Server ids of extra copies of the same send, such as a retry the
    /// server stored twice.
    pub folded_ids: Vec<MessageId>,
}

impl TimelineEntry {
    fn optimistic(
        local_id: LocalId,
        sender_id: UserId,
        content: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            local_id: Some(local_id),
            server_id: None,
            sender_id,
            content,
            timestamp: created_at,
            state: DeliveryState::Pending,
            authoritative: false,
            folded_ids: Vec::new(),
        }
    }

    fn from_server(message: InboundMessage) -> Self {
        Self {
            local_id: None,
            server_id: message.server_id,
            sender_id: message.sender_id,
            content: message.content,
            timestamp: message.timestamp,
            state: DeliveryState::Acknowledged,
            authoritative: true,
            folded_ids: Vec::new(),
        }
    }

    fn absorb(&mut self, message: InboundMessage) {
        if let Some(id) = message.server_id {
            if self.server_id.is_none() {
                self.server_id = Some(id);
            } else if !self.has_server_id(&id) {
                self.folded_ids.push(id);
            }
        }
        self.content = message.content;
        self.timestamp = message.timestamp;
        self.authoritative = true;
        // terminal states stay put
        if self.state == DeliveryState::Pending {
            self.state = DeliveryState::Acknowledged;
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state == DeliveryState::Pending
    }

    fn has_server_id(&self, id: &MessageId) -> bool {
        self.server_id.as_ref() == Some(id) || self.folded_ids.contains(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A new message was added to the timeline.
    Appended,
    /// The server copy replaced the optimistic entry for this send.
    Reconciled(LocalId),
    /// An entry with the same server id was refreshed in place.
    Updated,
    /// The event was seen recently and was dropped.
    Duplicate,
}

impl ApplyOutcome {
    pub fn changed_timeline(&self) -> bool {
        !matches!(self, ApplyOutcome::Duplicate)
    }
}

/// Recently processed server ids. Entries expire after `ttl` and the oldest
/// are evicted once `capacity` is reached.
#[derive(Debug)]
pub struct SeenEvents {
    ttl: chrono::Duration,
    capacity: usize,
    order: VecDeque<(MessageId, DateTime<Utc>)>,
    ids: HashSet<MessageId>,
}

impl SeenEvents {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            capacity: capacity.max(1),
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    pub fn contains(&mut self, id: &MessageId, now: DateTime<Utc>) -> bool {
        self.evict_expired(now);
        self.ids.contains(id)
    }

    /// Records `id`. Returns false if it was already present.
    pub fn insert(&mut self, id: MessageId, now: DateTime<Utc>) -> bool {
        self.evict_expired(now);
        if !self.ids.insert(id.clone()) {
            return false;
        }
        self.order.push_back((id, now));
        while self.order.len() > self.capacity {
            if let Some((oldest, _)) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn evict_expired(&mut self, now: DateTime<Utc>) {
        while let Some((id, seen_at)) = self.order.front() {
            let expired = seen_at
                .checked_add_signed(self.ttl)
                .is_some_and(|expires_at| expires_at <= now);
            if !expired {
                break;
            }
            self.ids.remove(id);
            self.order.pop_front();
        }
    }
}

/// Merges server events and history into per-conversation timelines,
/// replacing optimistic entries with their authoritative copies.
#[derive(Debug)]
pub struct InboundReconciler {
    match_window: chrono::Duration,
    seen: SeenEvents,
    timelines: HashMap<ConversationKey, Vec<TimelineEntry>>,
    confirmations: Arc<Notify>,
}

impl InboundReconciler {
    pub fn new(settings: ReconcilerSettings) -> Self {
        Self {
            match_window: chrono::Duration::from_std(settings.match_window)
                .unwrap_or(chrono::Duration::MAX),
            seen: SeenEvents::new(settings.dedup_capacity, settings.dedup_ttl),
            timelines: HashMap::new(),
            confirmations: Arc::new(Notify::new()),
        }
    }

    /// Woken whenever a server copy confirms a local send.
    pub fn confirmations(&self) -> Arc<Notify> {
        self.confirmations.clone()
    }

    pub fn timeline(&self, key: &ConversationKey) -> &[TimelineEntry] {
        self.timelines.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn conversations(&self) -> impl Iterator<Item = &ConversationKey> {
        self.timelines.keys()
    }

    pub fn seen_events(&self) -> &SeenEvents {
        &self.seen
    }

    pub fn insert_optimistic(
        &mut self,
        key: ConversationKey,
        local_id: LocalId,
        sender_id: UserId,
        content: String,
        created_at: DateTime<Utc>,
    ) {
        let timeline = self.timelines.entry(key).or_default();
        timeline.push(TimelineEntry::optimistic(
            local_id, sender_id, content, created_at,
        ));
        sort_timeline(timeline);
    }

    /// Folds one server event into the timeline of `key`.
    pub fn apply(
        &mut self,
        key: ConversationKey,
        message: InboundMessage,
        now: DateTime<Utc>,
    ) -> ApplyOutcome {
        if let Some(id) = &message.server_id {
            if self.seen.contains(id, now) {
                return ApplyOutcome::Duplicate;
            }
        }
        let server_id = message.server_id.clone();
        let timeline = self.timelines.entry(key).or_default();

        let matched = server_id
            .as_ref()
            .and_then(|id| timeline.iter().position(|entry| entry.has_server_id(id)))
            .or_else(|| find_optimistic(timeline, &message, now, self.match_window))
            .or_else(|| find_unidentified(timeline, &message, self.match_window));

        let outcome = match matched {
            Some(index) => {
                let entry = &mut timeline[index];
                let reconciled = (!entry.authoritative).then_some(entry.local_id).flatten();
                entry.absorb(message);
                reconciled.map_or(ApplyOutcome::Updated, ApplyOutcome::Reconciled)
            }
            None => {
                timeline.push(TimelineEntry::from_server(message));
                ApplyOutcome::Appended
            }
        };

        if let Some(id) = server_id {
            self.seen.insert(id, now);
        }
        sort_timeline(timeline);
        if matches!(outcome, ApplyOutcome::Reconciled(_)) {
            self.confirmations.notify_waiters();
        }
        outcome
    }

    /// Merges a history page. Returns how many entries changed.
    pub fn apply_history(
        &mut self,
        key: &ConversationKey,
        messages: impl IntoIterator<Item = InboundMessage>,
        now: DateTime<Utc>,
    ) -> usize {
        messages
            .into_iter()
            .map(|message| self.apply(key.clone(), message, now))
            .filter(ApplyOutcome::changed_timeline)
            .count()
    }

    /// Records the server ack for a pending send. The server id is kept for
    /// matching the later echo; it is not marked as seen.
    pub fn mark_acknowledged(
        &mut self,
        key: &ConversationKey,
        local_id: LocalId,
        server_id: Option<MessageId>,
        server_timestamp: Option<DateTime<Utc>>,
    ) -> bool {
        let Some(timeline) = self.timelines.get_mut(key) else {
            return false;
        };
        let Some(entry) = timeline
            .iter_mut()
            .find(|entry| entry.local_id == Some(local_id))
        else {
            return false;
        };
        if entry.server_id.is_none() {
            entry.server_id = server_id;
        }
        if !entry.authoritative {
            if let Some(timestamp) = server_timestamp {
                entry.timestamp = timestamp;
            }
        }
        let promoted = entry.state == DeliveryState::Pending;
        if promoted {
            entry.state = DeliveryState::Acknowledged;
        }
        sort_timeline(timeline);
        promoted
    }

    pub fn mark_failed(&mut self, key: &ConversationKey, local_id: LocalId) -> bool {
        match self.entry_mut(key, local_id) {
            Some(entry) if entry.is_pending() => {
                entry.state = DeliveryState::Failed;
                true
            }
            _ => false,
        }
    }

    pub fn delivery_state(&self, key: &ConversationKey, local_id: LocalId) -> Option<DeliveryState> {
        self.timeline(key)
            .iter()
            .find(|entry| entry.local_id == Some(local_id))
            .map(|entry| entry.state)
    }

    fn entry_mut(&mut self, key: &ConversationKey, local_id: LocalId) -> Option<&mut TimelineEntry> {
        self.timelines
            .get_mut(key)?
            .iter_mut()
            .find(|entry| entry.local_id == Some(local_id))
    }
}

/// Finds the local send a server message confirms. A message carrying a
/// client id only matches that exact send, even after an earlier copy was
/// folded in; otherwise the same sender and content within `window` counts
/// as a match for a still optimistic entry.
fn find_optimistic(
    timeline: &[TimelineEntry],
    message: &InboundMessage,
    now: DateTime<Utc>,
    window: chrono::Duration,
) -> Option<usize> {
    if let Some(client_id) = message.client_id {
        return timeline
            .iter()
            .position(|entry| entry.local_id == Some(client_id));
    }
    timeline.iter().position(|entry| {
        !entry.authoritative
            && entry.local_id.is_some()
            && entry.sender_id == message.sender_id
            && entry.content == message.content
            && now.signed_duration_since(entry.timestamp) < window
    })
}

/// Finds a server copy that arrived without an id, so a later copy that
/// carries one (usually a history row) claims it instead of duplicating it.
/// The closest timestamp within `window` wins.
fn find_unidentified(
    timeline: &[TimelineEntry],
    message: &InboundMessage,
    window: chrono::Duration,
) -> Option<usize> {
    message.server_id.as_ref()?;
    timeline
        .iter()
        .enumerate()
        .filter(|(_, entry)| {
            entry.authoritative
                && entry.server_id.is_none()
                && entry.sender_id == message.sender_id
                && entry.content == message.content
        })
        .map(|(index, entry)| {
            let gap = message.timestamp.signed_duration_since(entry.timestamp).abs();
            (index, gap)
        })
        .filter(|(_, gap)| *gap < window)
        .min_by_key(|(_, gap)| *gap)
        .map(|(index, _)| index)
}

fn sort_timeline(timeline: &mut [TimelineEntry]) {
    timeline.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
}

#[cfg(test)]
#[path = "tests/reconcile_tests.rs"]
mod tests;
