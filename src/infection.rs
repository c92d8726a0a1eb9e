//! Named infections: transformations applied to a peer's behavior slots to
//! model Byzantine fault strategies. Never applied to a correct peer.

use crate::errors::ConfigError;
use crate::peer::ProtocolPeer;

/// Replaces compute-step with a no-op. The peer stops making protocol
/// progress; its ledger stays empty for the rest of the trial.
pub fn crash<P: ProtocolPeer + 'static>(peer: &mut P) {
    peer.behavior_mut().set_compute_step(Box::new(|_peer, _ctx| {}));
}

/// Replaces submit-transaction with a no-op.
pub fn censor<P: ProtocolPeer + 'static>(peer: &mut P) {
    peer.behavior_mut()
        .set_submit_transaction(Box::new(|_peer, _ctx, _tx_id| {}));
}

/// Replaces send with `random_multicast(m, p)`. `p = None` draws a fresh
/// probability per send from the network's shared RNG (the bare
/// `equivocate` name); `p = Some(x)` pins it (the `equivocate[NN]` names,
/// `x = NN / 100`).
pub fn equivocate<P: ProtocolPeer + 'static>(peer: &mut P, p: Option<f64>) {
    peer.behavior_mut()
        .set_send_message(Box::new(move |peer, ctx, msg_id, body| {
            peer.interface_mut().random_multicast(msg_id, body, p, ctx.rng);
        }));
}

/// Parses and applies an infection by name: `crash`, `censor`, bare
/// `equivocate`, or `equivocateNN` for any two-or-three digit `NN` up to
/// 100 (the suffix is parsed, not matched against an enforced enum).
pub fn apply_by_name<P: ProtocolPeer + 'static>(name: &str, peer: &mut P) -> Result<(), ConfigError> {
    match name {
        "crash" => {
            crash(peer);
            Ok(())
        }
        "censor" => {
            censor(peer);
            Ok(())
        }
        "equivocate" => {
            equivocate(peer, None);
            Ok(())
        }
        other => {
            if let Some(suffix) = other.strip_prefix("equivocate") {
                let nn: u32 = suffix
                    .parse()
                    .map_err(|_| ConfigError::UnknownInfection(other.to_string()))?;
                if nn > 100 {
                    return Err(ConfigError::UnknownInfection(other.to_string()));
                }
                equivocate(peer, Some(f64::from(nn) / 100.0));
                Ok(())
            } else {
                Err(ConfigError::UnknownInfection(other.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_equivocate_suffix() {
        // Name parsing alone doesn't need a live peer; exercised end to end
        // in pbft::tests and sharded::tests.
        assert!("equivocate00".strip_prefix("equivocate").unwrap() == "00");
        assert!("equivocate100".strip_prefix("equivocate").unwrap() == "100");
    }
}
