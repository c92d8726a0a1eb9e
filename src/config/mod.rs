//! Scenario configuration: the JSON/TOML object describing one trial.

use std::path::Path;

use serde_derive::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::network::DelayModel;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Scenario {
    pub topology: TopologyConfig,
    pub trial: TrialConfig,
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub committee: Option<CommitteeConfig>,
    #[serde(default)]
    pub byzantine: Option<ByzantineConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TopologyConfig {
    pub peers: usize,
    pub delay_model: String,
    #[serde(default)]
    pub min_delay: u32,
    #[serde(default)]
    pub max_delay: u32,
    #[serde(default)]
    pub avg_delay: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TrialConfig {
    pub rounds: u64,
    #[serde(default)]
    pub source_pool_size: usize,
    pub seed: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProtocolConfig {
    pub name: String,
    pub fault_tolerance: f64,
    pub rounds_to_request: u64,
    pub requests_per_round: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CommitteeConfig {
    pub group_size: usize,
    pub security_min: u32,
    pub security_max: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ByzantineConfig {
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub infection: String,
    #[serde(default)]
    pub shuffle_per_round: usize,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Scenario, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileDoesNotExist(path.display().to_string()));
        }
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        let format = match ext {
            "json" => config::FileFormat::Json,
            "toml" => config::FileFormat::Toml,
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };
        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(format))
            .build()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        let scenario: Scenario = settings
            .try_deserialize()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topology.peers == 0 {
            return Err(ConfigError::TooFewPeers(self.topology.peers));
        }
        if !(0.0..1.0 / 3.0).contains(&self.protocol.fault_tolerance) {
            return Err(ConfigError::FaultToleranceOutOfRange(
                self.protocol.fault_tolerance,
            ));
        }
        DelayModel::parse(
            &self.topology.delay_model,
            self.topology.min_delay,
            self.topology.max_delay,
            self.topology.avg_delay,
        )?;
        match self.protocol.name.as_str() {
            "pbft" => {}
            "pbft-sharded" => {
                let committee = self
                    .committee
                    .as_ref()
                    .ok_or(ConfigError::MissingCommitteeSection)?;
                if committee.group_size == 0 || committee.group_size > self.topology.peers {
                    return Err(ConfigError::GroupSizeExceedsPeers {
                        group_size: committee.group_size,
                        peers: self.topology.peers,
                    });
                }
            }
            other => return Err(ConfigError::UnknownProtocol(other.to_string())),
        }
        if let Some(byz) = &self.byzantine {
            if byz.count > self.topology.peers {
                return Err(ConfigError::TooManyByzantines(byz.count, self.topology.peers));
            }
            if byz.count > 0 && !byz.infection.is_empty() {
                crate::infection::apply_by_name(
                    &byz.infection,
                    &mut crate::pbft::PbftPeer::new(0, 0.0, 1, 1),
                )?;
            }
        }
        Ok(())
    }

    pub fn delay_model(&self) -> Result<DelayModel, ConfigError> {
        DelayModel::parse(
            &self.topology.delay_model,
            self.topology.min_delay,
            self.topology.max_delay,
            self.topology.avg_delay,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_scenario() -> Scenario {
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
                fault_tolerance: 0.25,
                rounds_to_request: 5,
                requests_per_round: 1,
            },
            committee: None,
            byzantine: None,
        }
    }

    #[test]
    fn valid_flat_scenario_passes() {
        assert!(base_scenario().validate().is_ok());
    }

    #[test]
    fn sharded_without_committee_section_is_rejected() {
        use assert_matches::assert_matches;

        let mut s = base_scenario();
        s.protocol.name = "pbft-sharded".to_string();
        assert_matches!(s.validate(), Err(ConfigError::MissingCommitteeSection));
    }

    #[test]
    fn fault_tolerance_must_be_below_one_third() {
        let mut s = base_scenario();
        s.protocol.fault_tolerance = 0.4;
        assert!(s.validate().is_err());
    }

    #[test]
    fn group_size_exceeding_peers_is_rejected() {
        let mut s = base_scenario();
        s.protocol.name = "pbft-sharded".to_string();
        s.committee = Some(CommitteeConfig {
            group_size: 99,
            security_min: 1,
            security_max: 4,
        });
        assert!(s.validate().is_err());
    }
}
