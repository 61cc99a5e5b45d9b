//! Live-peer directory: `PeerId -> link`, with partner bookkeeping for
//! departure notifications.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use signal_proto::{PeerId, SignalEnvelope};
use tokio::sync::mpsc;
use uuid::Uuid;

/// What happens when a second link claims an already-registered PeerId.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    RejectNew,
    DisplaceOld,
}

/// One authenticated link. The writer task drains `tx`; `partner` is the
/// peer this one asked to join.
pub struct PeerLink {
    pub link_id: Uuid,
    pub tx: mpsc::UnboundedSender<SignalEnvelope>,
    pub partner: Mutex<Option<PeerId>>,
}

impl PeerLink {
    fn new(tx: mpsc::UnboundedSender<SignalEnvelope>) -> Arc<Self> {
        Arc::new(Self {
            link_id: Uuid::new_v4(),
            tx,
            partner: Mutex::new(None),
        })
    }

    pub fn deliver(&self, envelope: SignalEnvelope) {
        if self.tx.send(envelope).is_err() {
            tracing::debug!(target: "relay", "dropping envelope for closing link");
        }
    }
}

pub enum RegisterOutcome {
    Registered(Arc<PeerLink>),
    /// Registered, and this previously held link was displaced.
    Displaced(Arc<PeerLink>, Arc<PeerLink>),
    /// Policy is reject-new and the id is taken.
    Occupied,
}

pub struct Directory {
    peers: DashMap<PeerId, Arc<PeerLink>>,
    policy: DuplicatePolicy,
}

impl Directory {
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self {
            peers: DashMap::new(),
            policy,
        }
    }

    pub fn register(
        &self,
        id: PeerId,
        tx: mpsc::UnboundedSender<SignalEnvelope>,
    ) -> RegisterOutcome {
        let link = PeerLink::new(tx);
        match self.peers.entry(id) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(link.clone());
                RegisterOutcome::Registered(link)
            }
            dashmap::mapref::entry::Entry::Occupied(mut slot) => match self.policy {
                DuplicatePolicy::RejectNew => RegisterOutcome::Occupied,
                DuplicatePolicy::DisplaceOld => {
                    let old = slot.insert(link.clone());
                    RegisterOutcome::Displaced(link, old)
                }
            },
        }
    }

    pub fn get(&self, id: &PeerId) -> Option<Arc<PeerLink>> {
        self.peers.get(id).map(|entry| entry.clone())
    }

    /// Remove `id`, but only when `link_id` still owns the slot. A displaced
    /// link's cleanup must not evict its replacement.
    pub fn remove(&self, id: &PeerId, link_id: Uuid) -> bool {
        self.peers
            .remove_if(id, |_, link| link.link_id == link_id)
            .is_some()
    }

    /// Collect every peer whose partner is `id`, clearing their partner.
    pub fn partners_of(&self, id: &PeerId) -> Vec<(PeerId, Arc<PeerLink>)> {
        let mut partners = Vec::new();
        for entry in self.peers.iter() {
            let link = entry.value();
            let mut partner = link.partner.lock().unwrap();
            if partner.as_ref() == Some(id) {
                *partner = None;
                partners.push((entry.key().clone(), link.clone()));
            }
        }
        partners
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> mpsc::UnboundedSender<SignalEnvelope> {
        mpsc::unbounded_channel().0
    }

    #[test]
    fn reject_new_keeps_first_registration() {
        let dir = Directory::new(DuplicatePolicy::RejectNew);
        let first = match dir.register(PeerId::from("v"), sender()) {
            RegisterOutcome::Registered(link) => link,
            _ => panic!("first registration must succeed"),
        };
        assert!(matches!(
            dir.register(PeerId::from("v"), sender()),
            RegisterOutcome::Occupied
        ));
        assert_eq!(
            dir.get(&PeerId::from("v")).unwrap().link_id,
            first.link_id
        );
    }

    #[test]
    fn displace_old_swaps_the_link() {
        let dir = Directory::new(DuplicatePolicy::DisplaceOld);
        let first = match dir.register(PeerId::from("v"), sender()) {
            RegisterOutcome::Registered(link) => link,
            _ => panic!("first registration must succeed"),
        };
        let (second, displaced) = match dir.register(PeerId::from("v"), sender()) {
            RegisterOutcome::Displaced(new, old) => (new, old),
            _ => panic!("second registration must displace"),
        };
        assert_eq!(displaced.link_id, first.link_id);
        assert_eq!(dir.get(&PeerId::from("v")).unwrap().link_id, second.link_id);
    }

    #[test]
    fn remove_is_guarded_by_link_identity() {
        let dir = Directory::new(DuplicatePolicy::DisplaceOld);
        let first = match dir.register(PeerId::from("v"), sender()) {
            RegisterOutcome::Registered(link) => link,
            _ => panic!(),
        };
        let (second, _) = match dir.register(PeerId::from("v"), sender()) {
            RegisterOutcome::Displaced(new, old) => (new, old),
            _ => panic!(),
        };
        // Stale cleanup from the displaced link is a no-op.
        assert!(!dir.remove(&PeerId::from("v"), first.link_id));
        assert_eq!(dir.len(), 1);
        assert!(dir.remove(&PeerId::from("v"), second.link_id));
        assert_eq!(dir.len(), 0);
    }

    #[test]
    fn partners_of_clears_and_returns_dependents() {
        let dir = Directory::new(DuplicatePolicy::RejectNew);
        let cockpit = match dir.register(PeerId::from("c"), sender()) {
            RegisterOutcome::Registered(link) => link,
            _ => panic!(),
        };
        *cockpit.partner.lock().unwrap() = Some(PeerId::from("v"));

        let partners = dir.partners_of(&PeerId::from("v"));
        assert_eq!(partners.len(), 1);
        assert_eq!(partners[0].0, PeerId::from("c"));
        assert!(cockpit.partner.lock().unwrap().is_none());
        assert!(dir.partners_of(&PeerId::from("v")).is_empty());
    }
}
