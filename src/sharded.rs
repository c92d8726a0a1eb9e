//! Sharded PBFT peer: the same preprepare/prepare/commit/reply state
//! machine as the flat quorum, but the quorum is a dynamically assigned
//! committee rather than the whole network.

use std::collections::{HashMap, HashSet};

use crate::network_interface::{NetworkInterface, RoundCtx};
use crate::packet::MessageId;
use crate::peer::{send_message, BehaviorSlots, PeerId, ProtocolPeer};
use crate::pbft::{MessageType, PbftMessage, Phase};

pub type GroupId = usize;
pub type CommitteeId = u64;

#[derive(Default)]
struct RequestState {
    prepare_sent: bool,
    commit_sent: bool,
    reply_sent: bool,
    prepare_count: u32,
    commit_count: u32,
    reply_count: u32,
}

pub struct ShardedPbftPeer {
    iface: NetworkInterface<PbftMessage>,
    behavior: BehaviorSlots<Self>,
    is_byzantine: bool,
    is_primary: bool,
    group: Option<GroupId>,
    /// Every member of the peer's own group, primary election's tie-break pool.
    group_members: Vec<PeerId>,
    committee: Option<CommitteeId>,
    committee_members: HashSet<PeerId>,
    view: u64,
    vote_change: bool,
    view_counter: u32,
    max_wait: u32,
    fault_tolerance: f64,
    local_round: u64,
    phase: Phase,
    requests: HashMap<MessageId, RequestState>,
    ledger: HashMap<MessageId, u64>,
}

impl ShardedPbftPeer {
    pub fn new(id: PeerId, fault_tolerance: f64) -> Self {
        ShardedPbftPeer {
            iface: NetworkInterface::new(id),
            behavior: BehaviorSlots::default(),
            is_byzantine: false,
            is_primary: false,
            group: None,
            group_members: Vec::new(),
            committee: None,
            committee_members: HashSet::new(),
            view: 0,
            vote_change: false,
            view_counter: 0,
            max_wait: 1,
            fault_tolerance,
            local_round: 0,
            phase: Phase::Idle,
            requests: HashMap::new(),
            ledger: HashMap::new(),
        }
    }

    pub fn id(&self) -> PeerId {
        self.iface.id()
    }

    pub fn derive_max_wait(&mut self) {
        self.max_wait = self.iface.max_neighbor_delay() + 1;
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn vote_change(&self) -> bool {
        self.vote_change
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary
    }

    pub fn ledger_len(&self) -> usize {
        self.ledger.len()
    }

    pub fn ledger(&self) -> &HashMap<MessageId, u64> {
        &self.ledger
    }

    pub fn group(&self) -> Option<GroupId> {
        self.group
    }

    pub fn committee(&self) -> Option<CommitteeId> {
        self.committee
    }

    /// One-shot at network init.
    pub fn set_group(&mut self, gid: GroupId) {
        self.group = Some(gid);
    }

    pub fn add_group_member(&mut self, peer: PeerId) {
        if !self.group_members.contains(&peer) {
            self.group_members.push(peer);
        }
    }

    pub fn set_committee(&mut self, cid: CommitteeId) {
        self.committee = Some(cid);
    }

    pub fn add_committee_member(&mut self, peer: PeerId) {
        self.committee_members.insert(peer);
    }

    /// Clears this peer out of its committee, resetting per-committee
    /// protocol counters. A peer belongs to at most one committee at a
    /// time; called both by the controller on newly chosen members and by
    /// the peer itself once its own request is decided, so a committee's
    /// groups actually return to the free pool.
    pub fn clear_committee(&mut self) {
        if self.committee.is_some() {
            log::debug!("peer {} clearing committee {:?}", self.id(), self.committee);
        }
        self.committee = None;
        self.committee_members.clear();
        self.is_primary = false;
        self.requests.clear();
        self.phase = Phase::Idle;
        self.view_counter = 0;
        self.vote_change = false;
    }

    /// Elects the lowest peer-id among `group_members` as primary
    /// (deterministic tie-break).
    pub fn init_primary(&mut self) {
        let lowest = self.group_members.iter().copied().min();
        self.is_primary = lowest == Some(self.id());
    }

    fn quorum_size(&self) -> u32 {
        self.committee_members.len() as u32 + 1
    }

    fn prepare_commit_threshold(&self) -> f64 {
        2.0 * self.fault_tolerance * f64::from(self.quorum_size()) + 1.0
    }

    fn reply_threshold(&self) -> f64 {
        2.0 * self.fault_tolerance * f64::from(self.quorum_size())
    }

    fn emit_preprepare(&mut self, ctx: &mut RoundCtx<'_, PbftMessage>, msg_id: MessageId) {
        log::debug!(
            "peer {} (committee {:?}) emitting preprepare for {}",
            self.id(),
            self.committee,
            msg_id
        );
        let msg = PbftMessage {
            client_id: self.id(),
            creator_id: self.id(),
            view: self.view,
            msg_type: MessageType::PrePrepare,
            operation: "request".to_string(),
            operands: Vec::new(),
            result: None,
        };
        self.requests.entry(msg_id.clone()).or_default();
        self.phase = Phase::PrePrepared;
        send_message(self, ctx, msg_id, msg);
    }

    /// Primary-only: emits a fresh preprepare using the controller-supplied
    /// sequence number as the message-id suffix.
    pub fn make_request(&mut self, ctx: &mut RoundCtx<'_, PbftMessage>, seq: u64) {
        if !self.is_primary {
            return;
        }
        let msg_id = format!("{}{}", self.id(), seq);
        self.emit_preprepare(ctx, msg_id);
    }

    fn filter_byzantine_inbound(&mut self) {
        let mut kept = std::collections::VecDeque::new();
        while let Some(packet) = self.iface.pop_inbound() {
            if packet.body.msg_type == MessageType::Reply {
                kept.push_back(packet);
            }
        }
        while let Some(packet) = kept.pop_back() {
            self.iface.push_inbound_front(packet);
        }
    }

    fn on_preprepare(
        &mut self,
        ctx: &mut RoundCtx<'_, PbftMessage>,
        msg_id: MessageId,
        msg: PbftMessage,
    ) -> bool {
        let already = self
            .requests
            .get(&msg_id)
            .map_or(false, |s| s.prepare_sent);
        if already {
            return false;
        }
        {
            let state = self.requests.entry(msg_id.clone()).or_default();
            state.prepare_sent = true;
        }
        self.phase = Phase::Prepared;
        let prepare_msg = PbftMessage {
            msg_type: MessageType::Prepare,
            creator_id: self.id(),
            ..msg
        };
        send_message(self, ctx, msg_id.clone(), prepare_msg.clone());
        self.iface.send_self(msg_id, prepare_msg, 1);
        true
    }

    fn on_prepare(
        &mut self,
        ctx: &mut RoundCtx<'_, PbftMessage>,
        msg_id: MessageId,
        msg: PbftMessage,
    ) -> bool {
        let threshold = self.prepare_commit_threshold();
        let crossed;
        {
            let state = self.requests.entry(msg_id.clone()).or_default();
            if state.commit_sent {
                return false;
            }
            state.prepare_count += 1;
            crossed = f64::from(state.prepare_count) > threshold;
            if crossed {
                state.commit_sent = true;
            }
        }
        if !crossed {
            return false;
        }
        self.phase = Phase::Committed;
        let commit_msg = PbftMessage {
            msg_type: MessageType::Commit,
            creator_id: self.id(),
            ..msg
        };
        send_message(self, ctx, msg_id, commit_msg);
        true
    }

    fn on_commit(
        &mut self,
        ctx: &mut RoundCtx<'_, PbftMessage>,
        msg_id: MessageId,
        msg: PbftMessage,
    ) -> bool {
        let threshold = self.prepare_commit_threshold();
        let crossed;
        {
            let state = self.requests.entry(msg_id.clone()).or_default();
            if state.reply_sent {
                return false;
            }
            state.commit_count += 1;
            crossed = f64::from(state.commit_count) > threshold;
            if crossed {
                state.reply_sent = true;
            }
        }
        if !crossed {
            return false;
        }
        self.phase = Phase::Replied;
        let reply_msg = PbftMessage {
            msg_type: MessageType::Reply,
            creator_id: self.id(),
            result: Some(msg.operation.clone()),
            ..msg
        };
        send_message(self, ctx, msg_id.clone(), reply_msg.clone());
        self.iface.send_self(msg_id, reply_msg, 1);
        true
    }

    fn on_reply(&mut self, msg_id: MessageId, _msg: PbftMessage) -> bool {
        if self.ledger.contains_key(&msg_id) {
            return false;
        }
        let threshold = self.reply_threshold();
        let crossed;
        {
            let state = self.requests.entry(msg_id.clone()).or_default();
            state.reply_count += 1;
            crossed = f64::from(state.reply_count) > threshold;
        }
        if crossed {
            let round = self.local_round;
            log::info!(
                "peer {} (committee {:?}) decided {} at round {}",
                self.id(),
                self.committee,
                msg_id,
                round
            );
            self.ledger.insert(msg_id, round);
            self.clear_committee();
        }
        false
    }

    fn handle_packet(
        &mut self,
        ctx: &mut RoundCtx<'_, PbftMessage>,
        packet: crate::packet::Packet<PbftMessage>,
    ) -> bool {
        let msg_id = packet.id;
        let msg = packet.body;
        match msg.msg_type {
            MessageType::PrePrepare => self.on_preprepare(ctx, msg_id, msg),
            MessageType::Prepare => self.on_prepare(ctx, msg_id, msg),
            MessageType::Commit => self.on_commit(ctx, msg_id, msg),
            MessageType::Reply => self.on_reply(msg_id, msg),
            MessageType::ViewChange => false,
        }
    }
}

impl std::fmt::Display for ShardedPbftPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "peer {} group={:?} committee={:?} phase={:?} ledger={} voteChange={}",
            self.id(),
            self.group,
            self.committee,
            self.phase,
            self.ledger.len(),
            self.vote_change
        )
    }
}

impl ProtocolPeer for ShardedPbftPeer {
    type Message = PbftMessage;

    fn interface_mut(&mut self) -> &mut NetworkInterface<PbftMessage> {
        &mut self.iface
    }

    fn behavior_mut(&mut self) -> &mut BehaviorSlots<Self> {
        &mut self.behavior
    }

    fn is_byzantine(&self) -> bool {
        self.is_byzantine
    }

    fn set_byzantine(&mut self, byzantine: bool) {
        self.is_byzantine = byzantine;
    }

    fn default_computation(&mut self, ctx: &mut RoundCtx<'_, PbftMessage>) {
        self.local_round += 1;

        // Unlike the flat peer, a sharded primary never self-schedules a
        // request: the controller calls `make_request` explicitly once it
        // has formed a committee.
        if self.committee.is_none() {
            return;
        }

        if self.is_byzantine {
            self.filter_byzantine_inbound();
        }

        let mut received_any = false;
        loop {
            let packet = match self.iface.pop_inbound() {
                Some(p) => p,
                None => break,
            };
            received_any = true;
            if self.handle_packet(ctx, packet) {
                break;
            }
        }

        if !self.is_byzantine {
            if received_any {
                self.view_counter = 0;
            } else {
                self.view_counter += 1;
                if self.view_counter >= self.max_wait {
                    self.vote_change = true;
                }
            }
        }
    }

    fn default_submit_transaction(&mut self, _ctx: &mut RoundCtx<'_, PbftMessage>, _tx_id: u64) {
        // The reference-committee controller is the only source of requests
        // for sharded peers; direct client submission is not supported here.
    }

    fn default_send_message(
        &mut self,
        _ctx: &mut RoundCtx<'_, PbftMessage>,
        msg_id: MessageId,
        body: PbftMessage,
    ) {
        self.iface.broadcast(msg_id, body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{DelayModel, Network};

    fn wire_committee(net: &mut Network<ShardedPbftPeer>, members: &[PeerId], cid: CommitteeId) {
        for &m in members {
            net.peers_mut()[m].set_committee(cid);
            for &other in members {
                if other != m {
                    net.peers_mut()[m].add_committee_member(other);
                }
            }
        }
        for &m in members {
            net.peers_mut()[m].group_members = members.to_vec();
            net.peers_mut()[m].init_primary();
        }
    }

    #[test]
    fn committee_scoped_quorum_reaches_agreement() {
        let peers: Vec<ShardedPbftPeer> = (0..8).map(|id| ShardedPbftPeer::new(id, 0.0)).collect();
        let mut net = Network::new(peers, 3);
        net.init_fully_connected(DelayModel::Constant);
        for peer in net.peers_mut() {
            peer.derive_max_wait();
        }
        let members = [0usize, 1, 2, 3];
        wire_committee(&mut net, &members, 1);

        let primary = members
            .iter()
            .copied()
            .find(|&m| net.peers()[m].is_primary())
            .unwrap();
        net.with_peer_ctx(primary, |peer, ctx| peer.make_request(ctx, 1));

        for _ in 0..10 {
            net.tick_and_receive();
            net.perform_computation_all();
        }

        for &m in &members {
            assert!(net.peers()[m].ledger_len() > 0, "committee member {} never decided", m);
        }
        for peer in net.peers() {
            if !members.contains(&peer.id()) {
                assert_eq!(peer.ledger_len(), 0, "non-member {} should never decide", peer.id());
            }
        }
    }
}
