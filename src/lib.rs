//! # quantas-sim
//!
//! A discrete-event simulator for PBFT-family Byzantine fault tolerant
//! consensus protocols, run either as a single flat quorum or as a
//! reference-committee arrangement that composes several sub-quorums
//! ("groups") into a larger committee sized to a per-request security
//! level.
//!
//! The simulator advances in integer rounds. Every round, each peer
//! consumes whatever messages have arrived, runs one step of its local
//! consensus state machine, and emits outgoing messages with per-link
//! delivery delays; a configurable fraction of peers may be infected
//! (byzantine), replacing their local behavior to drop, censor, or
//! equivocate on outgoing messages.
//!
//! This crate is not a production consensus node: it speaks no real wire
//! protocol, signs nothing, and persists no state across runs. It exists
//! to let scenario files drive reproducible, inspectable trials of the
//! protocol's safety and liveness properties.

pub mod byzantine;
pub mod cli;
pub mod committee;
pub mod config;
pub mod errors;
pub mod infection;
pub mod logging;
pub mod network;
pub mod network_interface;
pub mod packet;
pub mod pbft;
pub mod peer;
pub mod sharded;
pub mod simulation;
