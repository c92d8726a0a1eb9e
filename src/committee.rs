//! Reference-committee controller: groups peers once at init, forms
//! committees from free groups on demand, and tracks free/busy bookkeeping
//! plus the global ledger.

use std::collections::{HashMap, VecDeque};

use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::errors::ConfigError;
use crate::packet::MessageId;
use crate::peer::PeerId;
use crate::sharded::{CommitteeId, GroupId, ShardedPbftPeer};

struct PendingRequest {
    submitted_round: u64,
    security_level: Option<u32>,
}

/// Request queue, free/busy group lists, and the committee/sequence-number
/// counters. Deliberately not `Clone`: the source's copy constructor
/// re-seeds its RNG from the wall clock on every copy, which would either
/// silently duplicate a live trial's randomness or break its determinism —
/// neither of which this simulator wants, so cloning is simply not offered.
pub struct ReferenceCommittee {
    groups: Vec<Vec<PeerId>>,
    free_groups: Vec<GroupId>,
    busy_groups: Vec<GroupId>,
    committee_of_group: HashMap<GroupId, CommitteeId>,
    current_committees: Vec<CommitteeId>,
    next_committee_id: CommitteeId,
    next_sequence_number: u64,
    request_queue: VecDeque<PendingRequest>,
    /// `[L1, L2, L3, L4, L5]`, `L4 == L5` at construction.
    level: [u32; 5],
    level_min: u32,
    level_max: u32,
}

impl ReferenceCommittee {
    pub fn new(peer_count: usize, group_size: usize) -> Result<Self, ConfigError> {
        if group_size == 0 || group_size > peer_count {
            return Err(ConfigError::GroupSizeExceedsPeers {
                group_size,
                peers: peer_count,
            });
        }
        let groups: Vec<Vec<PeerId>> = (0..peer_count)
            .collect::<Vec<_>>()
            .chunks(group_size)
            .map(|c| c.to_vec())
            .collect();
        let free_groups: Vec<GroupId> = (0..groups.len()).collect();
        let l5 = (peer_count / group_size).max(1) as u32;

        Ok(ReferenceCommittee {
            groups,
            free_groups,
            busy_groups: Vec::new(),
            committee_of_group: HashMap::new(),
            current_committees: Vec::new(),
            next_committee_id: 1,
            next_sequence_number: 1,
            request_queue: VecDeque::new(),
            level: Self::derive_levels(l5),
            level_min: 1,
            level_max: l5,
        })
    }

    fn derive_levels(l5: u32) -> [u32; 5] {
        let l5 = l5.max(1);
        let l4 = l5;
        let l3 = (l4 / 2).max(1);
        let l2 = (l3 / 2).max(1);
        let l1 = (l2 / 2).max(1);
        [l1, l2, l3, l4, l5]
    }

    pub fn groups(&self) -> &[Vec<PeerId>] {
        &self.groups
    }

    pub fn free_group_count(&self) -> usize {
        self.free_groups.len()
    }

    pub fn busy_group_count(&self) -> usize {
        self.busy_groups.len()
    }

    pub fn queue_len(&self) -> usize {
        self.request_queue.len()
    }

    pub fn current_committees(&self) -> &[CommitteeId] {
        &self.current_committees
    }

    /// Clamps all five level constants, low end.
    pub fn set_min_security_level(&mut self, min: u32) {
        self.level_min = min;
        for l in self.level.iter_mut() {
            if *l < min {
                *l = min;
            }
        }
    }

    /// Clamps all five level constants, high end.
    pub fn set_max_security_level(&mut self, max: u32) {
        self.level_max = max;
        for l in self.level.iter_mut() {
            if *l > max {
                *l = max;
            }
        }
    }

    /// Flip a fair coin until it comes up heads; `k` tails before that
    /// selects `L[k+1]`, saturating at `L5`. `Pr[Li] = 2^-i`, with the tail
    /// of the distribution rolled into `L5`.
    pub fn pick_security_level(&self, rng: &mut ChaCha8Rng) -> u32 {
        let mut k = 0usize;
        while k < 4 {
            if rng.gen_bool(0.5) {
                break;
            }
            k += 1;
        }
        self.level[k]
    }

    pub fn submit_request(&mut self, round: u64) {
        self.request_queue.push_back(PendingRequest {
            submitted_round: round,
            security_level: None,
        });
    }

    /// For each busy group, checks whether any member still reports a
    /// committee id; groups with none return to `free_groups`.
    /// `current_committees` becomes the sorted unique set of ids still alive.
    fn update_busy(&mut self, peers: &[ShardedPbftPeer]) {
        let mut still_busy = Vec::new();
        let mut alive = Vec::new();
        for &gid in &self.busy_groups {
            let has_live_member = self.groups[gid].iter().any(|&p| peers[p].committee().is_some());
            if has_live_member {
                still_busy.push(gid);
                if let Some(&cid) = self.committee_of_group.get(&gid) {
                    alive.push(cid);
                }
            } else {
                log::debug!("group {} released back to the free pool", gid);
                self.free_groups.push(gid);
                self.committee_of_group.remove(&gid);
            }
        }
        self.busy_groups = still_busy;
        alive.sort_unstable();
        alive.dedup();
        self.current_committees = alive;
    }

    /// Generates a request if the queue is empty, samples (or reuses) its
    /// security level, reclaims groups from finished committees, and — if
    /// enough groups are free — forms a new committee and returns
    /// `(primary, sequence_number)` for the caller to hand to that peer's
    /// `make_request`. Returns `None` when the request stays queued (not
    /// enough free groups yet).
    pub fn make_request(
        &mut self,
        round: u64,
        rng: &mut ChaCha8Rng,
        peers: &mut [ShardedPbftPeer],
    ) -> Option<(PeerId, u64)> {
        if self.request_queue.is_empty() {
            self.submit_request(round);
        }

        let level = {
            let sampled = self.pick_security_level(rng);
            let front = self
                .request_queue
                .front_mut()
                .expect("queue is non-empty: just ensured above");
            if front.security_level.is_none() {
                front.security_level = Some(sampled);
            }
            front.security_level.unwrap()
        };

        self.update_busy(peers);

        let needed = level as usize;
        if self.free_groups.len() < needed {
            log::trace!(
                "request needs {} groups, only {} free; staying queued",
                needed,
                self.free_groups.len()
            );
            return None;
        }
        self.request_queue.pop_front();

        let cid = self.next_committee_id;
        self.next_committee_id += 1;

        let mut chosen = Vec::with_capacity(needed);
        for _ in 0..needed {
            chosen.push(
                self.free_groups
                    .pop()
                    .expect("checked free_groups.len() >= needed"),
            );
        }
        self.busy_groups.extend(chosen.iter().copied());
        for &gid in &chosen {
            self.committee_of_group.insert(gid, cid);
        }

        let all_members: Vec<PeerId> = chosen
            .iter()
            .flat_map(|&gid| self.groups[gid].iter().copied())
            .collect();

        for &member in &all_members {
            peers[member].clear_committee();
            peers[member].set_committee(cid);
            for &other in &all_members {
                if other != member {
                    peers[member].add_committee_member(other);
                }
            }
        }
        for &gid in &chosen {
            for &member in &self.groups[gid] {
                peers[member].init_primary();
            }
        }

        self.current_committees.push(cid);
        self.current_committees.sort_unstable();
        self.current_committees.dedup();
        log::info!(
            "formed committee {} from groups {:?} (security level {})",
            cid,
            chosen,
            level
        );

        let first_group = chosen[0];
        let primary = self.groups[first_group]
            .iter()
            .copied()
            .find(|&p| peers[p].is_primary())?;
        let seq = self.next_sequence_number;
        self.next_sequence_number += 1;
        Some((primary, seq))
    }

    /// Union of per-peer ledgers, de-duplicated by message-id.
    pub fn global_ledger(peers: &[ShardedPbftPeer]) -> HashMap<MessageId, u64> {
        let mut merged = HashMap::new();
        for peer in peers {
            for (id, round) in peer.ledger() {
                merged.entry(id.clone()).or_insert(*round);
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::seeded_rng;

    fn peers(n: usize) -> Vec<ShardedPbftPeer> {
        let mut v: Vec<ShardedPbftPeer> = (0..n).map(|id| ShardedPbftPeer::new(id, 0.0)).collect();
        for (gid, chunk) in (0..n).collect::<Vec<_>>().chunks(4).enumerate() {
            for &id in chunk {
                v[id].set_group(gid);
                for &other in chunk {
                    v[id].add_group_member(other);
                }
            }
        }
        v
    }

    #[test]
    fn groups_partition_free_and_busy_disjointly() {
        let committee = ReferenceCommittee::new(16, 4).unwrap();
        assert_eq!(committee.free_group_count(), 4);
        assert_eq!(committee.busy_group_count(), 0);
    }

    #[test]
    fn rejects_group_size_larger_than_peers() {
        assert!(ReferenceCommittee::new(4, 8).is_err());
    }

    #[test]
    fn make_request_waits_until_enough_groups_are_free() {
        let mut committee = ReferenceCommittee::new(16, 4).unwrap();
        committee.set_min_security_level(1);
        committee.set_max_security_level(1);
        let mut rng = seeded_rng(9);
        let mut peer_set = peers(16);

        // Security level is forced to 1 (a single group), so the first
        // request always succeeds regardless of the coin-flip outcome.
        let result = committee.make_request(0, &mut rng, &mut peer_set);
        assert!(result.is_some());
        assert_eq!(committee.free_group_count(), 3);
        assert_eq!(committee.busy_group_count(), 1);
    }

    #[test]
    fn global_ledger_merges_decided_entries_across_committee_members() {
        use crate::network::{DelayModel, Network};

        let mut committee = ReferenceCommittee::new(4, 4).unwrap();
        committee.set_min_security_level(1);
        committee.set_max_security_level(1);
        let mut rng = seeded_rng(11);

        let peer_set: Vec<ShardedPbftPeer> = (0..4).map(|id| ShardedPbftPeer::new(id, 0.0)).collect();
        let mut net = Network::new(peer_set, 11);
        net.init_fully_connected(DelayModel::Constant);
        for (gid, group) in committee.groups().iter().enumerate() {
            for &pid in group {
                let peer = &mut net.peers_mut()[pid];
                peer.set_group(gid);
                for &other in group {
                    peer.add_group_member(other);
                }
                peer.derive_max_wait();
            }
        }

        let (primary, seq) = {
            let (peers, _) = net.peers_and_rng_mut();
            committee.make_request(0, &mut rng, peers).unwrap()
        };
        net.with_peer_ctx(primary, |peer, ctx| peer.make_request(ctx, seq));

        for _ in 0..10 {
            net.tick_and_receive();
            net.perform_computation_all();
        }

        let merged = ReferenceCommittee::global_ledger(net.peers());
        assert!(!merged.is_empty(), "expected at least one decided entry");
        for peer in net.peers() {
            for (id, round) in peer.ledger() {
                assert_eq!(merged.get(id), Some(round));
            }
        }
    }

    #[test]
    fn busy_group_is_reclaimed_once_its_committee_actually_decides() {
        use crate::network::{DelayModel, Network};

        let mut committee = ReferenceCommittee::new(8, 4).unwrap();
        committee.set_min_security_level(1);
        committee.set_max_security_level(1);
        let mut rng = seeded_rng(5);

        let peer_set: Vec<ShardedPbftPeer> = (0..8).map(|id| ShardedPbftPeer::new(id, 0.0)).collect();
        let mut net = Network::new(peer_set, 5);
        net.init_fully_connected(DelayModel::Constant);
        for (gid, group) in committee.groups().iter().enumerate() {
            for &pid in group {
                let peer = &mut net.peers_mut()[pid];
                peer.set_group(gid);
                for &other in group {
                    peer.add_group_member(other);
                }
                peer.derive_max_wait();
            }
        }

        let (primary, seq) = {
            let (peers, _) = net.peers_and_rng_mut();
            committee.make_request(0, &mut rng, peers).unwrap()
        };
        assert_eq!(committee.busy_group_count(), 1);
        assert_eq!(committee.free_group_count(), 1);
        net.with_peer_ctx(primary, |peer, ctx| peer.make_request(ctx, seq));

        for _ in 0..10 {
            net.tick_and_receive();
            net.perform_computation_all();
        }

        {
            let (peers, _) = net.peers_and_rng_mut();
            assert!(
                peers.iter().all(|p| p.committee().is_none()),
                "every member should have self-cleared once its request decided"
            );
        }

        // Nothing manually released the group: make_request's own update_busy
        // call must notice the committee is gone and return it to the pool.
        let second = {
            let (peers, _) = net.peers_and_rng_mut();
            committee.make_request(11, &mut rng, peers)
        };
        assert!(second.is_some(), "the reclaimed group should be enough to form a new committee");
        assert_eq!(committee.busy_group_count(), 1);
        assert_eq!(committee.free_group_count(), 1);
    }
}
