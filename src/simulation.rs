//! Round scheduler: for each round, ticks channels, lets the reference
//! committee do its per-round controller work, invokes `performComputation`
//! on every peer, and emits one JSON log record.
//!
//! Flat and sharded scenarios share the same round shape but differ in
//! whether there is a controller, so two entry points are exposed rather
//! than one generic driver threaded through a trait.

use serde_derive::Serialize;

use crate::byzantine::ByzantineNetwork;
use crate::committee::ReferenceCommittee;
use crate::config::Scenario;
use crate::errors::{ConfigError, SimError};
use crate::infection;
use crate::pbft::{self, PbftPeer};
use crate::peer::PeerId;
use crate::sharded::ShardedPbftPeer;

#[derive(Debug, Serialize)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub ledger_size: usize,
    pub phase: String,
    pub vote_change: bool,
}

#[derive(Debug, Serialize)]
pub struct ControllerRecord {
    pub free_groups: usize,
    pub busy_groups: usize,
    pub queue_len: usize,
    pub current_committees: Vec<u64>,
}

#[derive(Debug, Serialize)]
pub struct LogRecord {
    pub trial: usize,
    pub round: u64,
    pub peers: Vec<PeerRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controller: Option<ControllerRecord>,
    pub view_change_event: bool,
}

/// Applies the scenario's `byzantine` section to a freshly built network:
/// marks the configured count byzantine and applies the named infection to
/// each one chosen. Correct peers are never touched.
fn apply_byzantine_config<P: crate::peer::ProtocolPeer + 'static>(
    net: &mut ByzantineNetwork<P>,
    scenario: &Scenario,
) -> Result<(), ConfigError> {
    if let Some(byz) = &scenario.byzantine {
        if byz.count > 0 {
            let chosen = net.make_byzantines(byz.count)?;
            if !byz.infection.is_empty() {
                for id in chosen {
                    infection::apply_by_name(&byz.infection, &mut net.network_mut().peers_mut()[id])?;
                }
            }
        }
    }
    Ok(())
}

fn shuffle_if_configured<P: crate::peer::ProtocolPeer + 'static>(
    net: &mut ByzantineNetwork<P>,
    scenario: &Scenario,
) -> Result<(), ConfigError> {
    if let Some(byz) = &scenario.byzantine {
        if byz.shuffle_per_round > 0 {
            net.shuffle_byzantines(byz.shuffle_per_round)?;
        }
    }
    Ok(())
}

/// Runs one trial of the flat (whole-network-quorum) PBFT protocol.
pub fn run_flat_trial(scenario: &Scenario, trial_idx: usize) -> Result<Vec<LogRecord>, SimError> {
    let seed = scenario.trial.seed.wrapping_add(trial_idx as u64);
    let n = scenario.topology.peers;
    let f = scenario.protocol.fault_tolerance;

    let peers: Vec<PbftPeer> = (0..n)
        .map(|id| {
            PbftPeer::new(
                id,
                f,
                scenario.protocol.rounds_to_request,
                scenario.protocol.requests_per_round,
            )
        })
        .collect();
    let mut net = ByzantineNetwork::new(peers, seed);
    net.init_fully_connected(scenario.delay_model()?);
    for peer in net.network_mut().peers_mut() {
        peer.derive_max_wait();
    }
    pbft::set_primary(net.network_mut().peers_mut(), 0);
    apply_byzantine_config(&mut net, scenario)?;

    log::info!(
        "starting flat pbft trial {} (peers={}, seed={})",
        trial_idx,
        n,
        seed
    );

    let mut records = Vec::with_capacity(scenario.trial.rounds as usize);
    for _ in 0..scenario.trial.rounds {
        net.network_mut().tick_and_receive();
        net.network_mut().perform_computation_all();
        shuffle_if_configured(&mut net, scenario)?;

        let round = net.network().round();
        let correct: Vec<PeerId> = net.correct_peers().collect();
        let peer_records: Vec<PeerRecord> = correct
            .iter()
            .map(|&id| {
                let p = &net.network().peers()[id];
                PeerRecord {
                    peer_id: id,
                    ledger_size: p.ledger_len(),
                    phase: format!("{:?}", p.phase()),
                    vote_change: p.vote_change(),
                }
            })
            .collect();
        let view_change_event = !correct.is_empty()
            && correct
                .iter()
                .all(|&id| net.network().peers()[id].vote_change());
        if view_change_event {
            log::warn!("round {}: every correct peer voted for a view change", round);
        }

        records.push(LogRecord {
            trial: trial_idx,
            round,
            peers: peer_records,
            controller: None,
            view_change_event,
        });
    }
    Ok(records)
}

/// Runs one trial of the reference-committee sharded PBFT protocol.
pub fn run_sharded_trial(scenario: &Scenario, trial_idx: usize) -> Result<Vec<LogRecord>, SimError> {
    let seed = scenario.trial.seed.wrapping_add(trial_idx as u64);
    let n = scenario.topology.peers;
    let f = scenario.protocol.fault_tolerance;
    let committee_cfg = scenario
        .committee
        .as_ref()
        .ok_or(ConfigError::MissingCommitteeSection)?;

    let peers: Vec<ShardedPbftPeer> = (0..n).map(|id| ShardedPbftPeer::new(id, f)).collect();
    let mut net = ByzantineNetwork::new(peers, seed);
    net.init_fully_connected(scenario.delay_model()?);

    let mut controller = ReferenceCommittee::new(n, committee_cfg.group_size)?;
    controller.set_min_security_level(committee_cfg.security_min);
    controller.set_max_security_level(committee_cfg.security_max);

    for (gid, group) in controller.groups().iter().enumerate() {
        for &pid in group {
            let peer = &mut net.network_mut().peers_mut()[pid];
            peer.set_group(gid);
            for &other in group {
                peer.add_group_member(other);
            }
            peer.derive_max_wait();
        }
    }
    apply_byzantine_config(&mut net, scenario)?;

    log::info!(
        "starting sharded pbft trial {} (peers={}, group_size={}, seed={})",
        trial_idx,
        n,
        committee_cfg.group_size,
        seed
    );

    let mut records = Vec::with_capacity(scenario.trial.rounds as usize);
    for _ in 0..scenario.trial.rounds {
        net.network_mut().tick_and_receive();

        let round = net.network().round() + 1;
        let (peers, rng) = net.network_mut().peers_and_rng_mut();
        let request = controller.make_request(round, rng, peers);
        if let Some((primary, seq)) = request {
            net.network_mut()
                .with_peer_ctx(primary, |peer, ctx| peer.make_request(ctx, seq));
        }

        net.network_mut().perform_computation_all();
        shuffle_if_configured(&mut net, scenario)?;

        let round = net.network().round();
        let correct: Vec<PeerId> = net.correct_peers().collect();
        let peer_records: Vec<PeerRecord> = correct
            .iter()
            .map(|&id| {
                let p = &net.network().peers()[id];
                PeerRecord {
                    peer_id: id,
                    ledger_size: p.ledger_len(),
                    phase: format!("{:?}", p.phase()),
                    vote_change: p.vote_change(),
                }
            })
            .collect();
        let committee_members: Vec<PeerId> = correct
            .iter()
            .copied()
            .filter(|&id| net.network().peers()[id].committee().is_some())
            .collect();
        let view_change_event = !committee_members.is_empty()
            && committee_members
                .iter()
                .all(|&id| net.network().peers()[id].vote_change());
        if view_change_event {
            log::warn!("round {}: every committee-bound correct peer voted for a view change", round);
        }

        records.push(LogRecord {
            trial: trial_idx,
            round,
            peers: peer_records,
            controller: Some(ControllerRecord {
                free_groups: controller.free_group_count(),
                busy_groups: controller.busy_group_count(),
                queue_len: controller.queue_len(),
                current_committees: controller.current_committees().to_vec(),
            }),
            view_change_event,
        });
    }
    Ok(records)
}

/// Dispatches on `scenario.protocol.name`, already validated by
/// `Scenario::validate`.
pub fn run_trial(scenario: &Scenario, trial_idx: usize) -> Result<Vec<LogRecord>, SimError> {
    match scenario.protocol.name.as_str() {
        "pbft" => run_flat_trial(scenario, trial_idx),
        "pbft-sharded" => run_sharded_trial(scenario, trial_idx),
        other => Err(SimError::Config(ConfigError::UnknownProtocol(other.to_string()))),
    }
}

/// Runs `trials` independent trials, each with its own seed, in parallel:
/// no mutable state crosses trial threads, and results are joined back
/// before being handed to the caller for flushing, so log lines from
/// different trials never interleave.
pub fn run_trials(scenario: &Scenario, trials: usize) -> Result<Vec<Vec<LogRecord>>, SimError> {
    let trials = trials.max(1);
    std::thread::scope(|s| {
        let handles: Vec<_> = (0..trials)
            .map(|idx| s.spawn(move || run_trial(scenario, idx)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("trial thread panicked"))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ByzantineConfig, CommitteeConfig, ProtocolConfig, Scenario, TopologyConfig, TrialConfig};

    fn flat_scenario() -> Scenario {
        Scenario {
            topology: TopologyConfig {
                peers: 4,
                delay_model: "one".to_string(),
                min_delay: 1,
                max_delay: 1,
                avg_delay: 1.0,
            },
            trial: TrialConfig {
                rounds: 20,
                source_pool_size: 0,
                seed: 1,
            },
            protocol: ProtocolConfig {
                name: "pbft".to_string(),
                fault_tolerance: 0.0,
                rounds_to_request: 5,
                requests_per_round: 1,
            },
            committee: None,
            byzantine: None,
        }
    }

    #[test]
    fn flat_trial_grows_every_ledger() {
        let records = run_flat_trial(&flat_scenario(), 0).unwrap();
        let last = records.last().unwrap();
        assert!(last.peers.iter().all(|p| p.ledger_size > 0));
        assert!(last.controller.is_none());
    }

    #[test]
    fn flat_trial_with_crash_infection_keeps_peer_ledger_empty() {
        let mut scenario = flat_scenario();
        scenario.protocol.fault_tolerance = 0.15;
        scenario.topology.peers = 7;
        scenario.byzantine = Some(ByzantineConfig {
            count: 1,
            infection: "crash".to_string(),
            shuffle_per_round: 0,
        });
        scenario.trial.rounds = 50;
        let records = run_flat_trial(&scenario, 0).unwrap();
        // The crashed peer is byzantine and excluded from the per-round
        // correct-peer records; the stronger "its ledger stays empty"
        // property is already covered directly in pbft.rs::tests. This test
        // only checks the driver doesn't choke on a byzantine config.
        assert_eq!(records.len(), 50);
        assert!(records.last().unwrap().peers.len() == 6);
    }

    fn sharded_scenario() -> Scenario {
        Scenario {
            topology: TopologyConfig {
                peers: 16,
                delay_model: "one".to_string(),
                min_delay: 1,
                max_delay: 1,
                avg_delay: 1.0,
            },
            trial: TrialConfig {
                rounds: 30,
                source_pool_size: 0,
                seed: 3,
            },
            protocol: ProtocolConfig {
                name: "pbft-sharded".to_string(),
                fault_tolerance: 0.0,
                rounds_to_request: 5,
                requests_per_round: 1,
            },
            committee: Some(CommitteeConfig {
                group_size: 4,
                security_min: 2,
                security_max: 2,
            }),
            byzantine: None,
        }
    }

    #[test]
    fn sharded_trial_forms_at_least_one_committee() {
        let records = run_sharded_trial(&sharded_scenario(), 0).unwrap();
        let grew = records
            .iter()
            .any(|r| r.controller.as_ref().unwrap().current_committees.len() >= 1);
        assert!(grew, "expected at least one committee to form within the trial");
    }

    #[test]
    fn run_trial_rejects_unknown_protocol() {
        let mut scenario = flat_scenario();
        scenario.protocol.name = "paxos".to_string();
        assert!(run_trial(&scenario, 0).is_err());
    }

    #[test]
    fn run_trials_is_deterministic_per_seed() {
        let scenario = flat_scenario();
        let a = run_trials(&scenario, 2).unwrap();
        let b = run_trials(&scenario, 2).unwrap();
        for (ra, rb) in a.iter().zip(b.iter()) {
            let la = ra.last().unwrap();
            let lb = rb.last().unwrap();
            assert_eq!(
                la.peers.iter().map(|p| p.ledger_size).collect::<Vec<_>>(),
                lb.peers.iter().map(|p| p.ledger_size).collect::<Vec<_>>()
            );
        }
    }
}
