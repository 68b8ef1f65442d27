//! Last-writer-wins reconciliation over whole-collection updates.
//!
//! One mirror of the document, one watermark. Every applied remote
//! mutation and every transmitted local mutation raises the watermark;
//! anything stamped at or below it is already reflected locally and gets
//! discarded. Entity and link updates share the watermark, so the two
//! collections cannot leapfrog each other after a partition heals.
//!
//! Conflicts resolve by stamp alone: the newer whole collection replaces
//! the older one, and a concurrent edit on the losing side is dropped,
//! not merged. Within the same millisecond, whichever update applied
//! first wins (the other is discarded as stale), which keeps replay and
//! reordering idempotent.
//!
//! Reference: Kleppmann, Chapter 5 — Leaderless Replication, LWW

use uuid::Uuid;

use tablero_core::{Document, Entity, Link};

/// Why an inbound mutation was applied or dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Replaced the mirror collection and raised the watermark.
    Applied,
    /// Frame carried our own peer id (relay echo).
    OwnEcho,
    /// Stamped at or below the watermark.
    Stale,
}

/// Reconciliation engine for one document.
pub struct Reconciler {
    local_peer: Uuid,
    doc: Document,
    /// Highest stamp applied or published so far.
    watermark_ms: u64,
}

impl Reconciler {
    pub fn new(local_peer: Uuid) -> Self {
        Self {
            local_peer,
            doc: Document::new(),
            watermark_ms: 0,
        }
    }

    // ─── Local mutations ────────────────────────────────────────────

    /// Mirror locally edited entities.
    ///
    /// Runs on every local edit, connected or not: the mirror is what
    /// handshake requesters receive, and offline edits must survive a
    /// reconnect.
    pub fn cache_entities(&mut self, entities: Vec<Entity>) {
        self.doc.entities = entities;
    }

    /// Mirror locally edited links.
    pub fn cache_links(&mut self, links: Vec<Link>) {
        self.doc.links = links;
    }

    /// Record that a local mutation went out with this stamp.
    pub fn mark_published(&mut self, timestamp_ms: u64) {
        if timestamp_ms > self.watermark_ms {
            self.watermark_ms = timestamp_ms;
        }
    }

    // ─── Remote mutations ───────────────────────────────────────────

    /// Apply a remote entity collection replacement.
    pub fn apply_entity_update(
        &mut self,
        from: Uuid,
        timestamp_ms: u64,
        entities: Vec<Entity>,
    ) -> ApplyOutcome {
        if from == self.local_peer {
            return ApplyOutcome::OwnEcho;
        }
        if timestamp_ms <= self.watermark_ms {
            return ApplyOutcome::Stale;
        }
        self.doc.entities = entities;
        self.watermark_ms = timestamp_ms;
        ApplyOutcome::Applied
    }

    /// Apply a remote link collection replacement.
    pub fn apply_link_update(
        &mut self,
        from: Uuid,
        timestamp_ms: u64,
        links: Vec<Link>,
    ) -> ApplyOutcome {
        if from == self.local_peer {
            return ApplyOutcome::OwnEcho;
        }
        if timestamp_ms <= self.watermark_ms {
            return ApplyOutcome::Stale;
        }
        self.doc.links = links;
        self.watermark_ms = timestamp_ms;
        ApplyOutcome::Applied
    }

    // ─── Join handshake ─────────────────────────────────────────────

    /// Answer a state request with a copy of the mirror.
    ///
    /// Only a non-empty mirror answers (an empty reply would beat a real
    /// one to a new peer and freeze it on nothing), and never our own
    /// request looping back through the relay.
    pub fn answer_request(&self, requester: Uuid) -> Option<(Vec<Entity>, Vec<Link>)> {
        if requester == self.local_peer || self.doc.is_empty() {
            return None;
        }
        Some((self.doc.entities.clone(), self.doc.links.clone()))
    }

    /// Accept a handshake reply.
    ///
    /// Guarded twice: the reply must be addressed to us, and the mirror
    /// must still be completely empty. The first accepted reply fills the
    /// mirror, so every later reply fails the emptiness test. Local edits
    /// made before the reply arrives count as content and also block
    /// adoption.
    pub fn accept_initial_state(
        &mut self,
        to_peer: Uuid,
        entities: Vec<Entity>,
        links: Vec<Link>,
        now_ms: u64,
    ) -> bool {
        if to_peer != self.local_peer || !self.doc.is_empty() {
            return false;
        }
        self.doc.entities = entities;
        self.doc.links = links;
        self.mark_published(now_ms);
        true
    }

    /// Seed the mirror from a persisted snapshot. Same emptiness guard
    /// as the handshake, and an empty snapshot is never adopted.
    pub fn seed(&mut self, doc: Document, now_ms: u64) -> bool {
        if !self.doc.is_empty() || doc.is_empty() {
            return false;
        }
        self.doc = doc;
        self.mark_published(now_ms);
        true
    }

    // ─── Accessors ──────────────────────────────────────────────────

    pub fn document(&self) -> &Document {
        &self.doc
    }

    /// Owned copy of the mirror, for persistence.
    pub fn snapshot(&self) -> Document {
        self.doc.clone()
    }

    pub fn watermark_ms(&self) -> u64 {
        self.watermark_ms
    }

    pub fn is_empty(&self) -> bool {
        self.doc.is_empty()
    }

    pub fn local_peer(&self) -> Uuid {
        self.local_peer
    }
}
