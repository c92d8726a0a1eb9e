//! Network topology: peer vector, fully connected delay model, and the
//! per-round tick/receive orchestration shared by every protocol variant.

use std::collections::{BTreeMap, HashMap, VecDeque};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Poisson};

use crate::errors::ConfigError;
use crate::packet::Channel;
use crate::peer::{perform_computation, PeerId, ProtocolPeer};
use crate::network_interface::RoundCtx;

/// One of the three delay models `init_network` can populate a topology
/// with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DelayModel {
    /// Every link has delay 1.
    Constant,
    /// Delay drawn uniformly from `[min, max]` per directed link.
    Random { min: u32, max: u32 },
    /// Delay drawn from a Poisson distribution with the given mean,
    /// floored at 1: a zero-delay link would make "deliverable no earlier
    /// than round s+d" meaningless.
    Poisson { avg: f64 },
}

impl DelayModel {
    pub fn sample(&self, rng: &mut ChaCha8Rng) -> u32 {
        match *self {
            DelayModel::Constant => 1,
            DelayModel::Random { min, max } => rng.gen_range(min..=max),
            DelayModel::Poisson { avg } => {
                let dist = Poisson::new(avg.max(0.01)).expect("poisson mean must be positive");
                (dist.sample(rng).round() as u32).max(1)
            }
        }
    }

    pub fn parse(name: &str, min: u32, max: u32, avg: f64) -> Result<Self, ConfigError> {
        match name {
            "one" => Ok(DelayModel::Constant),
            "random" => {
                if min > max {
                    return Err(ConfigError::DelayRangeInverted { min, max });
                }
                Ok(DelayModel::Random { min, max })
            }
            "poisson" => Ok(DelayModel::Poisson { avg }),
            other => Err(ConfigError::UnknownDelayModel(other.to_string())),
        }
    }
}

/// Seeds a `ChaCha8Rng` from a scenario's integer seed, the way a trial's
/// RNG is derived so that `scenario + seed` is fully reproducible.
pub fn seeded_rng(seed: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed)
}

/// Owns the peer vector and the in-flight channel store, and drives the
/// per-round tick/receive/compute pipeline.
pub struct Network<P: ProtocolPeer> {
    peers: Vec<P>,
    channels: BTreeMap<(PeerId, PeerId), Channel<P::Message>>,
    rng: ChaCha8Rng,
    round: u64,
}

impl<P: ProtocolPeer + 'static> Network<P> {
    pub fn new(peers: Vec<P>, seed: u64) -> Self {
        Network {
            peers,
            channels: BTreeMap::new(),
            rng: seeded_rng(seed),
            round: 0,
        }
    }

    /// Connects every ordered pair of distinct peers, sampling delay
    /// per-directed-link from `model`.
    pub fn init_fully_connected(&mut self, model: DelayModel) {
        let n = self.peers.len();
        let mut delays = vec![vec![0u32; n]; n];
        for i in 0..n {
            for j in 0..n {
                if i != j {
                    delays[i][j] = model.sample(&mut self.rng);
                }
            }
        }
        for i in 0..n {
            for j in 0..n {
                if i != j {
                    self.peers[i].interface_mut().add_neighbor(j, delays[i][j]);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn peers(&self) -> &[P] {
        &self.peers
    }

    pub fn peers_mut(&mut self) -> &mut [P] {
        &mut self.peers
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn rng_mut(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    /// Disjoint mutable borrows of the peer vector and the RNG, for callers
    /// (the reference-committee controller) that need both at once without
    /// going through a `RoundCtx`.
    pub fn peers_and_rng_mut(&mut self) -> (&mut [P], &mut ChaCha8Rng) {
        (&mut self.peers, &mut self.rng)
    }

    /// Hands one peer a `RoundCtx` over the shared channel store and RNG,
    /// outside the normal `performComputation` sweep, flushing its outbound
    /// queue afterwards. Used for controller-initiated sends ahead of
    /// `performComputation`, such as the reference committee asking a
    /// freshly elected primary to emit a preprepare.
    pub fn with_peer_ctx<F>(&mut self, peer_id: PeerId, f: F)
    where
        F: FnOnce(&mut P, &mut RoundCtx<'_, P::Message>),
    {
        let round = self.round;
        let channels = &mut self.channels;
        let rng = &mut self.rng;
        let mut ctx = RoundCtx::new(round, channels, rng);
        let peer = &mut self.peers[peer_id];
        f(peer, &mut ctx);
        peer.interface_mut().transmit(&mut ctx);
    }

    /// Ticks every in-flight channel, moving matured packets into their
    /// destination's inbound queue. Channels are keyed by `(source,
    /// destination)` in a `BTreeMap` and iterated in that order, so a
    /// destination's queue always sees its matured packets in a fixed order
    /// across runs of the same seed, regardless of the source peer-id — the
    /// simulation's determinism would otherwise depend on a `HashMap`'s
    /// per-process iteration order.
    pub fn tick_and_receive(&mut self) {
        let mut arrived: HashMap<PeerId, VecDeque<_>> = HashMap::new();
        for (&(_, dst), channel) in self.channels.iter_mut() {
            let matured = channel.tick();
            if !matured.is_empty() {
                arrived.entry(dst).or_insert_with(VecDeque::new).extend(matured);
            }
        }
        for peer in &mut self.peers {
            let id = peer.interface_mut().id();
            if let Some(mut q) = arrived.remove(&id) {
                peer.interface_mut().receive(&mut q);
            }
        }
    }

    /// Invokes `performComputation` on every peer, in ascending peer-id
    /// order, handing each one a transient `RoundCtx` over the shared
    /// channel store and RNG.
    pub fn perform_computation_all(&mut self) {
        self.round += 1;
        let round = self.round;
        let channels = &mut self.channels;
        let rng = &mut self.rng;
        for peer in &mut self.peers {
            let mut ctx = RoundCtx::new(round, channels, rng);
            perform_computation(peer, &mut ctx);
            peer.interface_mut().transmit(&mut ctx);
        }
    }
}
