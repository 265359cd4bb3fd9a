//! Replicated document holding every [`Link`] and [`Group`].
//!
//! Architecture:
//! ```text
//! caller ── mutation ──► yrs write txn ──► commit
//!                                         ├── update observer ──► DocUpdate  (sync, persistence)
//!                                         └── map observers   ──► ChangeEvent (UI)
//! ```
//! A yrs write transaction is exclusive, so each mutation (including the
//! duplicate check that precedes an insert) is serialized against every other
//! writer. Observers run inside the commit and only push onto channels.

use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use tokio::sync::broadcast;
use yrs::types::map::MapEvent;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Doc, Map, MapRef, Observable, Origin, Out, ReadTxn, StateVector, Subscription, Transact,
    TransactionMut, Update,
};

use crate::entity::{
    decode_record, encode_record, AddOutcome, Group, GroupColor, GroupPatch, Link,
    LinkPatch,
};
use crate::error::{Result, StoreError};
use crate::url::canonicalize;

const LINKS: &str = "links";
const GROUPS: &str = "groups";

/// Default capacity of the change and update channels.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Where a committed transaction came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateOrigin {
    /// A mutation made through this store.
    Local,
    /// A delta received from a peer.
    Sync,
    /// State replayed from durable storage.
    Persistence,
    /// A snapshot import.
    Import,
}

impl UpdateOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateOrigin::Local => "local",
            UpdateOrigin::Sync => "sync",
            UpdateOrigin::Persistence => "persistence",
            UpdateOrigin::Import => "import",
        }
    }

    fn from_txn(txn: &TransactionMut) -> Self {
        match txn.origin().map(|o| o.as_ref()) {
            Some(b"sync") => UpdateOrigin::Sync,
            Some(b"persistence") => UpdateOrigin::Persistence,
            Some(b"import") => UpdateOrigin::Import,
            _ => UpdateOrigin::Local,
        }
    }

    /// Whether a delta with this origin should be sent to peers.
    pub fn is_broadcast(self) -> bool {
        matches!(self, UpdateOrigin::Local | UpdateOrigin::Import)
    }
}

impl From<UpdateOrigin> for Origin {
    fn from(origin: UpdateOrigin) -> Self {
        Origin::from(origin.as_str())
    }
}

/// Binary delta of one committed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocUpdate {
    pub update: Vec<u8>,
    pub origin: UpdateOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Links,
    Groups,
}

/// Notification that a collection changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub collection: Collection,
    /// `None` when earlier notifications were dropped and this event stands
    /// in for all of them.
    pub origin: Option<UpdateOrigin>,
    /// Ids touched by the transaction. Empty when notifications were dropped.
    pub keys: Vec<String>,
}

/// Change notifications for one collection. Dropping it unsubscribes.
pub struct Changes {
    collection: Collection,
    rx: broadcast::Receiver<ChangeEvent>,
}

impl Changes {
    /// Wait for the next change. Returns `None` once the store is gone.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.collection == self.collection => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::debug!("{:?} listener lagged by {n} events", self.collection);
                    return Some(self.coalesced());
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next pending change, if one is already queued.
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if event.collection == self.collection => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => return Some(self.coalesced()),
                Err(_) => return None,
            }
        }
    }

    fn coalesced(&self) -> ChangeEvent {
        ChangeEvent {
            collection: self.collection,
            origin: None,
            keys: Vec::new(),
        }
    }
}

/// The replicated link collection.
pub struct LinkStore {
    doc: Doc,
    links: MapRef,
    groups: MapRef,
    changes: broadcast::Sender<ChangeEvent>,
    updates: broadcast::Sender<DocUpdate>,
    _subscriptions: Vec<Subscription>,
}

impl LinkStore {
    pub fn new() -> Result<Self> {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a store whose notification channels buffer `capacity` events.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let doc = Doc::new();
        let links = doc.get_or_insert_map(LINKS);
        let groups = doc.get_or_insert_map(GROUPS);
        let (changes, _) = broadcast::channel(capacity.max(1));
        let (updates, _) = broadcast::channel(capacity.max(1));

        let update_tx = updates.clone();
        let on_update = doc
            .observe_update_v1(move |txn, event| {
                // No receivers is fine: nobody is listening yet.
                let _ = update_tx.send(DocUpdate {
                    update: event.update.clone(),
                    origin: UpdateOrigin::from_txn(txn),
                });
            })
            .map_err(|e| StoreError::Observer(e.to_string()))?;

        let on_links = observe_collection(&links, Collection::Links, changes.clone());
        let on_groups = observe_collection(&groups, Collection::Groups, changes.clone());

        Ok(Self {
            doc,
            links,
            groups,
            changes,
            updates,
            _subscriptions: vec![on_update, on_links, on_groups],
        })
    }

    // ── Links ──────────────────────────────────────────────────────────

    /// Insert a link unless a live link with the same canonical URL exists.
    ///
    /// Only the metadata fields of `metadata` are used; `url` and `deleted`
    /// are ignored.
    pub fn add_link(&self, url: &str, metadata: LinkPatch) -> Result<AddOutcome<Link>> {
        let canonical = canonicalize(url);
        let mut txn = self.doc.transact_mut();

        if let Some(existing) = live_links(read_all(&self.links, &txn))
            .into_iter()
            .find(|l| l.canonical_url == canonical)
        {
            log::debug!("Rejected duplicate link {canonical}");
            return Ok(AddOutcome::Duplicate(existing));
        }

        let mut link = Link::new(url);
        link.apply(LinkPatch {
            url: None,
            deleted: None,
            ..metadata
        });
        link.updated_at = link.created_at;

        self.links
            .insert(&mut txn, link.id.clone(), encode_record(&link)?);
        Ok(AddOutcome::Added(link))
    }

    /// Merge `patch` into the link `id`. Unknown or unreadable ids are a no-op.
    pub fn update_link(&self, id: &str, patch: LinkPatch) -> Result<Option<Link>> {
        let mut txn = self.doc.transact_mut();
        let Some(mut link) = read::<Link>(&self.links, &txn, id) else {
            return Ok(None);
        };
        link.apply(patch);
        self.links
            .insert(&mut txn, link.id.clone(), encode_record(&link)?);
        Ok(Some(link))
    }

    /// Tombstone link `id` and every other live link sharing its canonical
    /// URL, so a concurrent duplicate cannot resurface in [`Self::links`].
    pub fn delete_link(&self, id: &str) -> Result<Option<Link>> {
        let mut txn = self.doc.transact_mut();
        let Some(mut link) = read::<Link>(&self.links, &txn, id) else {
            return Ok(None);
        };
        let twins: Vec<Link> = read_all::<Link>(&self.links, &txn)
            .into_iter()
            .filter(|l| !l.deleted && l.id != link.id && l.canonical_url == link.canonical_url)
            .collect();

        for mut twin in twins {
            twin.apply(LinkPatch::default().deleted(true));
            log::debug!("Tombstoning concurrent duplicate {}", twin.id);
            self.links
                .insert(&mut txn, twin.id.clone(), encode_record(&twin)?);
        }
        link.apply(LinkPatch::default().deleted(true));
        self.links
            .insert(&mut txn, link.id.clone(), encode_record(&link)?);
        Ok(Some(link))
    }

    /// Live links newest first. When concurrent adds left several live links
    /// with one canonical URL, only the most recently updated one is returned.
    ///
    /// A link whose group has been deleted is returned ungrouped, even if a
    /// concurrent edit re-stored the old reference after the cascade ran.
    pub fn links(&self) -> Vec<Link> {
        let txn = self.doc.transact();
        let deleted_groups: HashSet<String> = read_all::<Group>(&self.groups, &txn)
            .into_iter()
            .filter(|g| g.deleted)
            .map(|g| g.id)
            .collect();

        let mut links = live_links(read_all(&self.links, &txn));
        for link in &mut links {
            if link
                .group_id
                .as_ref()
                .is_some_and(|g| deleted_groups.contains(g))
            {
                link.group_id = None;
            }
        }
        links
    }

    /// Stored link `id`, tombstoned or not.
    pub fn link(&self, id: &str) -> Option<Link> {
        let txn = self.doc.transact();
        read(&self.links, &txn, id)
    }

    pub fn link_count(&self) -> usize {
        self.links().len()
    }

    // ── Groups ─────────────────────────────────────────────────────────

    /// Create a group unless a live group already uses `name` (ignoring case).
    pub fn add_group(&self, name: &str, color: GroupColor) -> Result<AddOutcome<Group>> {
        let name = name.trim();
        let mut txn = self.doc.transact_mut();

        if let Some(existing) = read_all::<Group>(&self.groups, &txn)
            .into_iter()
            .find(|g| !g.deleted && g.name.to_lowercase() == name.to_lowercase())
        {
            return Ok(AddOutcome::Duplicate(existing));
        }

        let group = Group::new(name, color);
        self.groups
            .insert(&mut txn, group.id.clone(), encode_record(&group)?);
        Ok(AddOutcome::Added(group))
    }

    pub fn update_group(&self, id: &str, patch: GroupPatch) -> Result<Option<Group>> {
        let mut txn = self.doc.transact_mut();
        let Some(mut group) = read::<Group>(&self.groups, &txn, id) else {
            return Ok(None);
        };
        group.apply(patch);
        self.groups
            .insert(&mut txn, group.id.clone(), encode_record(&group)?);
        Ok(Some(group))
    }

    /// Tombstone group `id`, then detach every live link that referenced it.
    ///
    /// Each detached link is its own transaction, so a peer may observe the
    /// group gone while some links still point at it. Returns the number of
    /// links detached.
    pub fn delete_group(&self, id: &str) -> Result<usize> {
        self.update_group(id, GroupPatch::default().deleted(true))?;

        let members: Vec<String> = {
            let txn = self.doc.transact();
            read_all::<Link>(&self.links, &txn)
                .into_iter()
                .filter(|l| !l.deleted && l.group_id.as_deref() == Some(id))
                .map(|l| l.id)
                .collect()
        };

        let mut cleared = 0;
        for link_id in members {
            if self
                .update_link(&link_id, LinkPatch::default().ungroup())?
                .is_some()
            {
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    /// Live groups oldest first.
    pub fn groups(&self) -> Vec<Group> {
        let txn = self.doc.transact();
        let mut groups: Vec<Group> = read_all::<Group>(&self.groups, &txn)
            .into_iter()
            .filter(|g| !g.deleted)
            .collect();
        groups.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        groups
    }

    /// Stored group `id`, tombstoned or not.
    pub fn group(&self, id: &str) -> Option<Group> {
        let txn = self.doc.transact();
        read(&self.groups, &txn, id)
    }

    pub fn group_count(&self) -> usize {
        self.groups().len()
    }

    // ── Notifications ──────────────────────────────────────────────────

    pub fn subscribe(&self, collection: Collection) -> Changes {
        Changes {
            collection,
            rx: self.changes.subscribe(),
        }
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<DocUpdate> {
        self.updates.subscribe()
    }

    // ── State exchange ─────────────────────────────────────────────────

    /// Encoded state vector of this replica.
    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Everything this replica has that `remote_sv` does not cover.
    pub fn encode_diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_sv).map_err(StoreError::decode_state_vector)?;
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }

    /// Full document state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    /// Merge a remote update. Undecodable input leaves the document untouched.
    pub fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<()> {
        let update = Update::decode_v1(update).map_err(StoreError::decode_update)?;
        let mut txn = self.doc.transact_mut_with(Origin::from(origin));
        txn.apply_update(update).map_err(StoreError::apply_update)
    }
}

fn observe_collection(
    map: &MapRef,
    collection: Collection,
    tx: broadcast::Sender<ChangeEvent>,
) -> Subscription {
    map.observe(move |txn, event: &MapEvent| {
        let keys = event.keys(txn).keys().map(|k| k.to_string()).collect();
        let _ = tx.send(ChangeEvent {
            collection,
            origin: Some(UpdateOrigin::from_txn(txn)),
            keys,
        });
    })
}

fn read<T: DeserializeOwned>(map: &MapRef, txn: &impl ReadTxn, id: &str) -> Option<T> {
    match map.get(txn, id)? {
        Out::Any(Any::String(raw)) => decode_record(&raw),
        _ => {
            log::debug!("Skipping non-string value at {id}");
            None
        }
    }
}

fn read_all<T: DeserializeOwned>(map: &MapRef, txn: &impl ReadTxn) -> Vec<T> {
    map.iter(txn)
        .filter_map(|(_, value)| match value {
            Out::Any(Any::String(raw)) => decode_record(&raw),
            _ => None,
        })
        .collect()
}

/// Drop tombstones, collapse canonical duplicates, newest first.
fn live_links(all: Vec<Link>) -> Vec<Link> {
    let mut by_canonical: HashMap<String, Link> = HashMap::new();
    for link in all.into_iter().filter(|l| !l.deleted) {
        match by_canonical.get(&link.canonical_url) {
            Some(kept) if (kept.updated_at, &kept.id) >= (link.updated_at, &link.id) => {}
            _ => {
                by_canonical.insert(link.canonical_url.clone(), link);
            }
        }
    }
    let mut links: Vec<Link> = by_canonical.into_values().collect();
    links.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
    links
}
