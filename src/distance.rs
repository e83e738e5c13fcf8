//! Capacity-bounded list of peers sorted by XOR distance to a fixed origin.

use crate::identity::{Distance, KadId, PeerId, PeerInfo};

#[derive(Debug, Clone)]
pub struct PeerDistanceList {
    origin: KadId,
    capacity: usize,
    peers: Vec<(PeerInfo, Distance)>,
}

impl PeerDistanceList {
    pub fn new(origin: KadId, capacity: usize) -> Self {
        Self {
            origin,
            capacity,
            peers: Vec::with_capacity(capacity),
        }
    }

    pub fn origin(&self) -> &KadId {
        &self.origin
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert keeping ascending order. Peers at equal distance rank after the
    /// ones already present. Once at capacity the farthest entry is dropped.
    /// Returns false if the peer was already present or did not make the cut.
    pub fn add(&mut self, peer: PeerInfo) -> bool {
        if self.capacity == 0 || self.contains(&peer.id) {
            return false;
        }
        let dist = self.origin.distance(&peer.id.kad_id());
        let pos = self.peers.partition_point(|(_, d)| *d <= dist);
        if pos >= self.capacity {
            return false;
        }
        self.peers.insert(pos, (peer, dist));
        self.peers.truncate(self.capacity);
        true
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.iter().any(|(p, _)| &p.id == id)
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.iter().map(|(p, _)| p.clone()).collect()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.iter().map(|(p, _)| p.id.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(PeerInfo, Distance)> {
        self.peers.iter()
    }

    /// True if `peer` is closer to the origin than the farthest held peer,
    /// or the list still has room.
    pub fn is_closer(&self, peer: &PeerId) -> bool {
        if self.peers.len() < self.capacity {
            return true;
        }
        match self.peers.last() {
            Some((_, farthest)) => self.origin.distance(&peer.kad_id()) < *farthest,
            None => self.capacity > 0,
        }
    }

    pub fn any_closer<'a>(&self, peers: impl IntoIterator<Item = &'a PeerId>) -> bool {
        peers.into_iter().any(|p| self.is_closer(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted_by_distance(origin: &KadId, count: usize) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = (0..count)
            .map(|_| PeerInfo::without_addrs(PeerId::random()))
            .collect();
        peers.sort_by_key(|p| origin.distance(&p.id.kad_id()));
        peers
    }

    #[test]
    fn keeps_ascending_order_and_capacity() {
        let origin = KadId::from_key(b"origin");
        let peers = sorted_by_distance(&origin, 6);
        let mut list = PeerDistanceList::new(origin, 3);

        for p in peers.iter().rev() {
            list.add(p.clone());
        }

        assert_eq!(list.len(), 3);
        let held: Vec<_> = list.peer_ids();
        let expected: Vec<_> = peers[..3].iter().map(|p| p.id.clone()).collect();
        assert_eq!(held, expected);

        let dists: Vec<_> = list.iter().map(|(_, d)| *d).collect();
        assert!(dists.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn ignores_duplicates() {
        let origin = KadId::from_key(b"origin");
        let peer = PeerInfo::without_addrs(PeerId::random());
        let mut list = PeerDistanceList::new(origin, 5);
        assert!(list.add(peer.clone()));
        assert!(!list.add(peer));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn rejects_farther_peer_when_full() {
        let origin = KadId::from_key(b"origin");
        let peers = sorted_by_distance(&origin, 3);
        let mut list = PeerDistanceList::new(origin, 2);
        list.add(peers[0].clone());
        list.add(peers[1].clone());

        assert!(!list.is_closer(&peers[2].id));
        assert!(!list.add(peers[2].clone()));
        assert!(list.is_closer(&peers[0].id));
        assert!(list.any_closer([&peers[2].id, &peers[0].id]));
        assert!(!list.any_closer([&peers[2].id]));
    }

    #[test]
    fn closer_peer_evicts_farthest() {
        let origin = KadId::from_key(b"origin");
        let peers = sorted_by_distance(&origin, 3);
        let mut list = PeerDistanceList::new(origin, 2);
        list.add(peers[1].clone());
        list.add(peers[2].clone());
        assert!(list.add(peers[0].clone()));
        assert_eq!(list.peer_ids(), vec![peers[0].id.clone(), peers[1].id.clone()]);
    }
}
