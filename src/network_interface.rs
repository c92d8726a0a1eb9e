//! Per-peer mailbox: inbound/outbound packet buffers, the neighbor table,
//! and the broadcast/multicast/random-multicast send primitives.

use std::collections::{BTreeMap, VecDeque};

use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::packet::{Channel, MessageId, Packet};
use crate::peer::PeerId;

/// Transient, round-scoped handle into the network's shared in-flight
/// channel store and RNG. Borrowed by `Network` into each peer's
/// `perform_computation` call; never stored on the peer itself, so peers
/// never end up owning each other or the network (see Design Notes on
/// cyclic peer references).
pub struct RoundCtx<'a, M> {
    pub round: u64,
    channels: &'a mut BTreeMap<(PeerId, PeerId), Channel<M>>,
    pub rng: &'a mut ChaCha8Rng,
}

impl<'a, M> RoundCtx<'a, M> {
    pub fn new(
        round: u64,
        channels: &'a mut BTreeMap<(PeerId, PeerId), Channel<M>>,
        rng: &'a mut ChaCha8Rng,
    ) -> Self {
        RoundCtx {
            round,
            channels,
            rng,
        }
    }

    fn route(&mut self, packet: Packet<M>) {
        self.channels
            .entry((packet.source, packet.destination))
            .or_insert_with(Channel::new)
            .send(packet);
    }
}

#[derive(Debug)]
pub struct NetworkInterface<M> {
    id: PeerId,
    neighbor_delay: BTreeMap<PeerId, u32>,
    inbound: VecDeque<Packet<M>>,
    outbound: Vec<Packet<M>>,
}

impl<M: Clone> NetworkInterface<M> {
    pub fn new(id: PeerId) -> Self {
        NetworkInterface {
            id,
            neighbor_delay: BTreeMap::new(),
            inbound: VecDeque::new(),
            outbound: Vec::new(),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn add_neighbor(&mut self, neighbor: PeerId, delay: u32) {
        self.neighbor_delay.insert(neighbor, delay.max(1));
    }

    pub fn neighbors(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.neighbor_delay.keys().copied()
    }

    pub fn neighbor_count(&self) -> usize {
        self.neighbor_delay.len()
    }

    /// Delay to a neighbor (>= 1). `None` if `id` is not a neighbor.
    pub fn neighbor_delay(&self, id: PeerId) -> Option<u32> {
        self.neighbor_delay.get(&id).copied()
    }

    pub fn max_neighbor_delay(&self) -> u32 {
        self.neighbor_delay.values().copied().max().unwrap_or(0)
    }

    /// Enqueue one outbound packet to every neighbor.
    pub fn broadcast(&mut self, msg_id: MessageId, body: M) {
        for (&neighbor, &delay) in &self.neighbor_delay {
            self.outbound
                .push(Packet::new(msg_id.clone(), self.id, neighbor, delay, body.clone()));
        }
    }

    /// Enqueue one outbound packet to a caller-specified subset of neighbors.
    pub fn multicast(&mut self, msg_id: MessageId, body: M, subset: &[PeerId]) {
        for &neighbor in subset {
            if let Some(&delay) = self.neighbor_delay.get(&neighbor) {
                self.outbound
                    .push(Packet::new(msg_id.clone(), self.id, neighbor, delay, body.clone()));
            }
        }
    }

    /// Enqueue one outbound packet to each neighbor independently with
    /// probability `p`. When `p` is `None`, a fresh `p ~ Uniform[0,1]` is
    /// drawn once per call from the network's shared RNG — never memoized,
    /// never a thread-local generator.
    pub fn random_multicast(&mut self, msg_id: MessageId, body: M, p: Option<f64>, rng: &mut ChaCha8Rng) {
        let p = p.unwrap_or_else(|| rng.gen_range(0.0..=1.0));
        for (&neighbor, &delay) in &self.neighbor_delay {
            if rng.gen_bool(p.clamp(0.0, 1.0)) {
                self.outbound
                    .push(Packet::new(msg_id.clone(), self.id, neighbor, delay, body.clone()));
            }
        }
    }

    /// A peer may target itself; `delay` is caller-chosen (the flat/sharded
    /// PBFT peers use 1, to defer processing by exactly one round).
    pub fn send_self(&mut self, msg_id: MessageId, body: M, delay: u32) {
        self.outbound
            .push(Packet::new(msg_id, self.id, self.id, delay.max(1), body));
    }

    /// Flush staged outbound packets into the network's in-flight channels.
    /// Idempotent on an empty outbound queue.
    pub fn transmit(&mut self, ctx: &mut RoundCtx<'_, M>) {
        for packet in self.outbound.drain(..) {
            ctx.route(packet);
        }
    }

    /// Pull matured packets (handed to us by `Network::tick`) into the
    /// inbound queue, preserving arrival order.
    pub fn receive(&mut self, arrived: &mut VecDeque<Packet<M>>) {
        self.inbound.append(arrived);
    }

    pub fn inbound_is_empty(&self) -> bool {
        self.inbound.is_empty()
    }

    pub fn pop_inbound(&mut self) -> Option<Packet<M>> {
        self.inbound.pop_front()
    }

    pub fn push_inbound_front(&mut self, packet: Packet<M>) {
        self.inbound.push_front(packet);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn ctx<'a>(
        round: u64,
        channels: &'a mut BTreeMap<(PeerId, PeerId), Channel<u32>>,
        rng: &'a mut ChaCha8Rng,
    ) -> RoundCtx<'a, u32> {
        RoundCtx::new(round, channels, rng)
    }

    #[test]
    fn broadcast_reaches_every_neighbor_with_its_own_delay() {
        let mut iface: NetworkInterface<u32> = NetworkInterface::new(0);
        iface.add_neighbor(1, 2);
        iface.add_neighbor(2, 5);
        iface.broadcast("m1".into(), 42);

        let mut channels = BTreeMap::new();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut c = ctx(0, &mut channels, &mut rng);
        iface.transmit(&mut c);

        assert!(channels.contains_key(&(0, 1)));
        assert!(channels.contains_key(&(0, 2)));
    }

    #[test]
    fn transmit_is_idempotent_on_empty_outbound() {
        let mut iface: NetworkInterface<u32> = NetworkInterface::new(0);
        iface.add_neighbor(1, 1);
        let mut channels = BTreeMap::new();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut c = ctx(0, &mut channels, &mut rng);
        iface.transmit(&mut c);
        iface.transmit(&mut c);
        assert!(channels.is_empty());
    }
}
