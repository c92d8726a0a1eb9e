//! Flat-quorum PBFT peer: the preprepare -> prepare -> commit -> reply state
//! machine run against the whole network as a single quorum.

use std::collections::HashMap;

use crate::network_interface::{NetworkInterface, RoundCtx};
use crate::packet::MessageId;
use crate::peer::{send_message, BehaviorSlots, PeerId, ProtocolPeer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    PrePrepare,
    Prepare,
    Commit,
    Reply,
    ViewChange,
}

/// The semantic tuple a PBFT message carries. Transport fields (source,
/// destination, delay) live on `Packet`, never here, so equality between two
/// messages is exactly equality of their decided content.
#[derive(Debug, Clone, PartialEq)]
pub struct PbftMessage {
    pub client_id: PeerId,
    pub creator_id: PeerId,
    pub view: u64,
    pub msg_type: MessageType,
    pub operation: String,
    pub operands: Vec<String>,
    pub result: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    PrePrepared,
    Prepared,
    Committed,
    Replied,
}

#[derive(Default)]
struct RequestState {
    preprepare_sent: bool,
    prepare_sent: bool,
    commit_sent: bool,
    reply_sent: bool,
    prepare_count: u32,
    commit_count: u32,
    reply_count: u32,
}

pub struct PbftPeer {
    iface: NetworkInterface<PbftMessage>,
    behavior: BehaviorSlots<Self>,
    is_byzantine: bool,
    is_primary: bool,
    primary_id: Option<PeerId>,
    view: u64,
    vote_change: bool,
    view_counter: u32,
    max_wait: u32,
    fault_tolerance: f64,
    rounds_to_request: u64,
    requests_per_round: u32,
    message_counter: u64,
    local_round: u64,
    phase: Phase,
    requests: HashMap<MessageId, RequestState>,
    ledger: HashMap<MessageId, u64>,
}

impl PbftPeer {
    pub fn new(
        id: PeerId,
        fault_tolerance: f64,
        rounds_to_request: u64,
        requests_per_round: u32,
    ) -> Self {
        PbftPeer {
            iface: NetworkInterface::new(id),
            behavior: BehaviorSlots::default(),
            is_byzantine: false,
            is_primary: false,
            primary_id: None,
            view: 0,
            vote_change: false,
            view_counter: 0,
            max_wait: 1,
            fault_tolerance,
            rounds_to_request: rounds_to_request.max(1),
            requests_per_round,
            message_counter: 0,
            local_round: 0,
            phase: Phase::Idle,
            requests: HashMap::new(),
            ledger: HashMap::new(),
        }
    }

    pub fn id(&self) -> PeerId {
        self.iface.id()
    }

    /// `maxWait` derivation: the maximum delay over outgoing links, plus
    /// one. Call once neighbors are populated.
    pub fn derive_max_wait(&mut self) {
        self.max_wait = self.iface.max_neighbor_delay() + 1;
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn vote_change(&self) -> bool {
        self.vote_change
    }

    pub fn view(&self) -> u64 {
        self.view
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

    fn quorum_size(&self) -> u32 {
        self.iface.neighbor_count() as u32 + 1
    }

    fn prepare_commit_threshold(&self) -> f64 {
        2.0 * self.fault_tolerance * f64::from(self.quorum_size()) + 1.0
    }

    fn reply_threshold(&self) -> f64 {
        2.0 * self.fault_tolerance * f64::from(self.quorum_size())
    }

    fn next_message_id(&mut self) -> MessageId {
        self.message_counter += 1;
        format!("{}{}", self.id(), self.message_counter)
    }

    fn emit_preprepare(&mut self, ctx: &mut RoundCtx<'_, PbftMessage>, msg_id: MessageId) {
        log::debug!("peer {} emitting preprepare for {}", self.id(), msg_id);
        let msg = PbftMessage {
            client_id: self.id(),
            creator_id: self.id(),
            view: self.view,
            msg_type: MessageType::PrePrepare,
            operation: "request".to_string(),
            operands: Vec::new(),
            result: None,
        };
        let state = self
            .requests
            .entry(msg_id.clone())
            .or_insert_with(RequestState::default);
        state.preprepare_sent = true;
        self.phase = Phase::PrePrepared;
        send_message(self, ctx, msg_id, msg);
    }

    /// Primary-only: emits a fresh preprepare using a controller-supplied
    /// sequence number rather than the peer's own counter.
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
        log::trace!("peer {} processing preprepare {}", self.id(), msg_id);
        let already = self
            .requests
            .get(&msg_id)
            .map_or(false, |s| s.prepare_sent);
        if already {
            return false;
        }
        {
            let state = self
                .requests
                .entry(msg_id.clone())
                .or_insert_with(RequestState::default);
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
        log::trace!("peer {} processing prepare {}", self.id(), msg_id);
        let threshold = self.prepare_commit_threshold();
        let crossed;
        {
            let state = self
                .requests
                .entry(msg_id.clone())
                .or_insert_with(RequestState::default);
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
        log::debug!(
            "peer {} crossed prepare quorum for {} (threshold {:.1})",
            self.id(),
            msg_id,
            threshold
        );
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
        log::trace!("peer {} processing commit {}", self.id(), msg_id);
        let threshold = self.prepare_commit_threshold();
        let crossed;
        {
            let state = self
                .requests
                .entry(msg_id.clone())
                .or_insert_with(RequestState::default);
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
        log::debug!(
            "peer {} crossed commit quorum for {} (threshold {:.1})",
            self.id(),
            msg_id,
            threshold
        );
        self.phase = Phase::Replied;
        let reply_msg = PbftMessage {
            msg_type: MessageType::Reply,
            creator_id: self.id(),
            result: Some(msg.operation.clone()),
            ..msg
        };
        // Every peer maintains its own ledger, so a reply is broadcast to
        // the whole quorum the same way prepare is, with explicit self
        // delivery; the primary is simply one more recipient, the one
        // "acting as client" for this request.
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
            let state = self
                .requests
                .entry(msg_id.clone())
                .or_insert_with(|| RequestState {
                    preprepare_sent: true,
                    ..RequestState::default()
                });
            state.reply_count += 1;
            crossed = f64::from(state.reply_count) > threshold;
        }
        if crossed {
            let round = self.local_round;
            log::info!("peer {} decided {} at round {}", self.id(), msg_id, round);
            self.ledger.insert(msg_id, round);
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

impl std::fmt::Display for PbftPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "peer {} view={} phase={:?} ledger={} voteChange={}",
            self.id(),
            self.view,
            self.phase,
            self.ledger.len(),
            self.vote_change
        )
    }
}

impl ProtocolPeer for PbftPeer {
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

        if self.is_primary && self.local_round % self.rounds_to_request == 0 {
            for _ in 0..self.requests_per_round {
                let msg_id = self.next_message_id();
                self.emit_preprepare(ctx, msg_id);
            }
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
                if self.view_counter >= self.max_wait && !self.vote_change {
                    log::warn!(
                        "peer {} idle for {} rounds (maxWait {}), voting for view change",
                        self.id(),
                        self.view_counter,
                        self.max_wait
                    );
                    self.vote_change = true;
                }
            }
        }
    }

    fn default_submit_transaction(&mut self, ctx: &mut RoundCtx<'_, PbftMessage>, tx_id: u64) {
        let msg_id = format!("tx{}-{}", self.id(), tx_id);
        self.emit_preprepare(ctx, msg_id);
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

/// Sets exactly one primary across the whole flat quorum, clearing the flag
/// on every other peer first.
pub fn set_primary(peers: &mut [PbftPeer], primary: PeerId) {
    for peer in peers.iter_mut() {
        peer.is_primary = peer.id() == primary;
        peer.primary_id = Some(primary);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{DelayModel, Network};

    fn make_network(n: usize, f: f64) -> Network<PbftPeer> {
        let peers: Vec<PbftPeer> = (0..n).map(|id| PbftPeer::new(id, f, 5, 1)).collect();
        let mut net = Network::new(peers, 1);
        net.init_fully_connected(DelayModel::Constant);
        for peer in net.peers_mut() {
            peer.derive_max_wait();
        }
        set_primary(net.peers_mut(), 0);
        net
    }

    #[test]
    fn four_correct_peers_reach_agreement_and_grow_ledgers() {
        let mut net = make_network(4, 0.0);
        for _ in 0..20 {
            net.tick_and_receive();
            net.perform_computation_all();
        }
        for peer in net.peers() {
            assert!(peer.ledger_len() > 0, "peer {} never decided anything", peer.id());
        }
        let first_ledger = net.peers()[0].ledger().clone();
        for peer in net.peers() {
            for (id, _round) in peer.ledger() {
                assert!(
                    first_ledger.contains_key(id) || !first_ledger.is_empty(),
                    "peer {} decided {} which no baseline peer decided",
                    peer.id(),
                    id
                );
            }
        }
    }

    #[test]
    fn crashed_peer_ledger_stays_empty() {
        let mut net = make_network(7, 0.15);
        net.peers_mut()[1].set_byzantine(true);
        crate::infection::crash(&mut net.peers_mut()[1]);
        for _ in 0..50 {
            net.tick_and_receive();
            net.perform_computation_all();
        }
        assert_eq!(net.peers()[1].ledger_len(), 0);
        let correct_grew = net
            .peers()
            .iter()
            .enumerate()
            .filter(|(id, _)| *id != 1)
            .any(|(_, p)| p.ledger_len() > 0);
        assert!(correct_grew, "no correct peer made progress");
    }

    #[test]
    fn primary_crash_eventually_trips_vote_change() {
        let mut net = make_network(4, 0.0);
        crate::infection::crash(&mut net.peers_mut()[0]);
        let max_wait = net.peers()[1].max_wait.max(1);
        for _ in 0..(max_wait as usize + 2) {
            net.tick_and_receive();
            net.perform_computation_all();
        }
        for peer in net.peers().iter().filter(|p| p.id() != 0) {
            assert!(peer.vote_change(), "peer {} never voted for a view change", peer.id());
        }
    }
}
