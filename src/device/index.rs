//! Session index table
//!
//! Process-wide map from 32-bit session index to the peer state it selects:
//! an in-flight handshake or a derived key-pair. Indices are random,
//! never zero, and unique for the life of their referent; entries hold
//! non-owning references, and the owner drives removal.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use rand::Rng;

use crate::device::peer::Peer;
use crate::device::session::Session;

enum IndexEntry {
    Handshake(Weak<Peer>),
    Session(Weak<Peer>, Weak<Session>),
}

/// A resolved index lookup
pub enum IndexLookup {
    Handshake(Arc<Peer>),
    Session(Arc<Peer>, Arc<Session>),
}

#[derive(Default)]
pub struct IndexTable {
    entries: RwLock<HashMap<u32, IndexEntry>>,
}

impl IndexTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert_free(&self, entry: IndexEntry) -> u32 {
        let mut rng = rand::thread_rng();
        let mut entries = self.entries.write();
        loop {
            let index: u32 = rng.gen();
            if index == 0 || entries.contains_key(&index) {
                continue;
            }
            entries.insert(index, entry);
            return index;
        }
    }

    /// Allocate an index for an in-flight handshake
    pub fn register_handshake(&self, peer: &Arc<Peer>) -> u32 {
        self.insert_free(IndexEntry::Handshake(Arc::downgrade(peer)))
    }

    /// Allocate an index directly for a key-pair (responder path)
    pub fn register_session(&self, peer: &Arc<Peer>, session: &Arc<Session>) -> u32 {
        self.insert_free(IndexEntry::Session(
            Arc::downgrade(peer),
            Arc::downgrade(session),
        ))
    }

    /// Re-point a handshake's index at the key-pair derived from it
    pub fn promote_to_session(&self, index: u32, peer: &Arc<Peer>, session: &Arc<Session>) {
        let _prior = self.entries.write().insert(
            index,
            IndexEntry::Session(Arc::downgrade(peer), Arc::downgrade(session)),
        );
        debug_assert!(
            _prior.is_some(),
            "promoted an index that was never registered"
        );
    }

    /// Remove an index; idempotent
    pub fn unregister(&self, index: u32) {
        self.entries.write().remove(&index);
    }

    /// Resolve an index from an incoming packet
    ///
    /// Unknown indices and entries whose referent already died yield None.
    pub fn lookup(&self, index: u32) -> Option<IndexLookup> {
        let entries = self.entries.read();
        match entries.get(&index)? {
            IndexEntry::Handshake(peer) => peer.upgrade().map(IndexLookup::Handshake),
            IndexEntry::Session(peer, session) => match (peer.upgrade(), session.upgrade()) {
                (Some(peer), Some(session)) => Some(IndexLookup::Session(peer, session)),
                _ => None,
            },
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
