//! `Network` plus a correct/byzantine classification and the ability to
//! reshuffle which peers are byzantine mid-trial.

use std::collections::HashSet;

use rand::seq::index::sample;

use crate::errors::ConfigError;
use crate::network::{DelayModel, Network};
use crate::peer::{PeerId, ProtocolPeer};

pub struct ByzantineNetwork<P: ProtocolPeer> {
    network: Network<P>,
    byzantine: HashSet<PeerId>,
}

impl<P: ProtocolPeer + 'static> ByzantineNetwork<P> {
    pub fn new(peers: Vec<P>, seed: u64) -> Self {
        ByzantineNetwork {
            network: Network::new(peers, seed),
            byzantine: HashSet::new(),
        }
    }

    pub fn init_fully_connected(&mut self, model: DelayModel) {
        self.network.init_fully_connected(model);
    }

    pub fn network(&self) -> &Network<P> {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut Network<P> {
        &mut self.network
    }

    pub fn is_byzantine(&self, id: PeerId) -> bool {
        self.byzantine.contains(&id)
    }

    pub fn byzantine_peers(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.byzantine.iter().copied()
    }

    pub fn correct_peers(&self) -> impl Iterator<Item = PeerId> + '_ {
        (0..self.network.len()).filter(|id| !self.byzantine.contains(id))
    }

    /// Marks `k` distinct, currently-correct peers byzantine (just the flag
    /// gating — no named infection is required to flip it). Returns the
    /// peer ids chosen.
    pub fn make_byzantines(&mut self, k: usize) -> Result<Vec<PeerId>, ConfigError> {
        let candidates: Vec<PeerId> = self.correct_peers().collect();
        if k > candidates.len() {
            return Err(ConfigError::TooManyByzantines(k, self.network.len()));
        }
        let chosen = self.pick(&candidates, k);
        for &id in &chosen {
            self.network.peers_mut()[id].set_byzantine(true);
            self.byzantine.insert(id);
        }
        log::info!("marked {:?} byzantine", chosen);
        Ok(chosen)
    }

    /// Reverses `make_byzantines` for `k` distinct, currently-byzantine
    /// peers.
    pub fn make_correct(&mut self, k: usize) -> Result<Vec<PeerId>, ConfigError> {
        let candidates: Vec<PeerId> = self.byzantine_peers().collect();
        if k > candidates.len() {
            return Err(ConfigError::TooManyByzantines(k, self.network.len()));
        }
        let chosen = self.pick(&candidates, k);
        for &id in &chosen {
            self.network.peers_mut()[id].set_byzantine(false);
            self.byzantine.remove(&id);
        }
        Ok(chosen)
    }

    /// Performs `n` swap operations, each unmarking one byzantine peer and
    /// marking one correct peer, keeping the total byzantine count fixed.
    pub fn shuffle_byzantines(&mut self, n: usize) -> Result<(), ConfigError> {
        for _ in 0..n {
            if self.byzantine.is_empty() || self.byzantine.len() == self.network.len() {
                break;
            }
            self.make_correct(1)?;
            self.make_byzantines(1)?;
        }
        Ok(())
    }

    fn pick(&mut self, candidates: &[PeerId], k: usize) -> Vec<PeerId> {
        if k == candidates.len() {
            return candidates.to_vec();
        }
        sample(self.network.rng_mut(), candidates.len(), k)
            .into_iter()
            .map(|i| candidates[i])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network_interface::{NetworkInterface, RoundCtx};
    use crate::peer::BehaviorSlots;

    struct DummyPeer {
        iface: NetworkInterface<u32>,
        behavior: BehaviorSlots<DummyPeer>,
        byzantine: bool,
    }

    impl DummyPeer {
        fn new(id: PeerId) -> Self {
            DummyPeer {
                iface: NetworkInterface::new(id),
                behavior: BehaviorSlots::default(),
                byzantine: false,
            }
        }
    }

    impl ProtocolPeer for DummyPeer {
        type Message = u32;
        fn interface_mut(&mut self) -> &mut NetworkInterface<u32> {
            &mut self.iface
        }
        fn behavior_mut(&mut self) -> &mut BehaviorSlots<Self> {
            &mut self.behavior
        }
        fn is_byzantine(&self) -> bool {
            self.byzantine
        }
        fn set_byzantine(&mut self, byzantine: bool) {
            self.byzantine = byzantine;
        }
        fn default_computation(&mut self, _ctx: &mut RoundCtx<'_, u32>) {}
        fn default_submit_transaction(&mut self, _ctx: &mut RoundCtx<'_, u32>, _tx_id: u64) {}
        fn default_send_message(&mut self, _ctx: &mut RoundCtx<'_, u32>, _id: crate::packet::MessageId, _body: u32) {
        }
    }

    fn network(n: usize) -> ByzantineNetwork<DummyPeer> {
        let peers = (0..n).map(DummyPeer::new).collect();
        ByzantineNetwork::new(peers, 42)
    }

    #[test]
    fn make_byzantines_and_make_correct_round_trip() {
        let mut net = network(7);
        let chosen = net.make_byzantines(3).unwrap();
        assert_eq!(chosen.len(), 3);
        assert_eq!(net.byzantine_peers().count(), 3);
        assert_eq!(net.correct_peers().count(), 4);

        net.make_correct(3).unwrap();
        assert_eq!(net.byzantine_peers().count(), 0);
    }

    #[test]
    fn make_byzantines_rejects_too_many() {
        let mut net = network(4);
        assert!(net.make_byzantines(5).is_err());
    }

    #[test]
    fn shuffle_preserves_byzantine_count() {
        let mut net = network(10);
        net.make_byzantines(3).unwrap();
        net.shuffle_byzantines(5).unwrap();
        assert_eq!(net.byzantine_peers().count(), 3);
    }
}
