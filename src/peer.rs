//! Peer identity and the replaceable behavior-slot machinery shared by the
//! flat and sharded PBFT peers.
//!
//! Per the Design Notes, a peer's three replaceable behaviors are stored as
//! boxed closures rather than expressed through inheritance: infection
//! mutates the closure stored in a slot, correct peers never touch it.

use crate::network_interface::{NetworkInterface, RoundCtx};
use crate::packet::MessageId;

/// Stable peer identity. Peers are created once at network init and the id
/// doubles as their index in `Network`'s peer vector.
pub type PeerId = usize;

/// A concrete consensus peer type (flat `PbftPeer` or `ShardedPbftPeer`)
/// implements this so the behavior-slot and infection machinery below can
/// be written once, generically, instead of once per peer kind.
pub trait ProtocolPeer: Sized {
    type Message: Clone;

    fn interface_mut(&mut self) -> &mut NetworkInterface<Self::Message>;
    fn behavior_mut(&mut self) -> &mut BehaviorSlots<Self>;

    fn is_byzantine(&self) -> bool;
    fn set_byzantine(&mut self, byzantine: bool);

    /// Run one round's worth of protocol logic. Replaced wholesale by the
    /// `crash` infection.
    fn default_computation(&mut self, ctx: &mut RoundCtx<'_, Self::Message>);

    /// Submit a client transaction. Replaced wholesale by the `censor`
    /// infection. Most peers never call this; it exists for completeness
    /// with the spec's three-slot contract.
    fn default_submit_transaction(&mut self, ctx: &mut RoundCtx<'_, Self::Message>, tx_id: u64);

    /// Send a single logical message. Replaced by `equivocate[NN]`.
    fn default_send_message(
        &mut self,
        ctx: &mut RoundCtx<'_, Self::Message>,
        msg_id: MessageId,
        body: Self::Message,
    );
}

type ComputeSlot<P> = Box<dyn FnMut(&mut P, &mut RoundCtx<'_, <P as ProtocolPeer>::Message>)>;
type SubmitSlot<P> = Box<dyn FnMut(&mut P, &mut RoundCtx<'_, <P as ProtocolPeer>::Message>, u64)>;
type SendSlot<P> = Box<
    dyn FnMut(
        &mut P,
        &mut RoundCtx<'_, <P as ProtocolPeer>::Message>,
        MessageId,
        <P as ProtocolPeer>::Message,
    ),
>;

/// The three first-class behavior slots. `None` only momentarily, while a
/// call is in flight (take-call-restore, to sidestep a self-referential
/// borrow of the closure while it mutates its own owner).
pub struct BehaviorSlots<P: ProtocolPeer> {
    compute_step: Option<ComputeSlot<P>>,
    submit_transaction: Option<SubmitSlot<P>>,
    send_message: Option<SendSlot<P>>,
}

impl<P: ProtocolPeer + 'static> Default for BehaviorSlots<P> {
    fn default() -> Self {
        BehaviorSlots {
            compute_step: Some(Box::new(|peer, ctx| peer.default_computation(ctx))),
            submit_transaction: Some(Box::new(|peer, ctx, tx_id| {
                peer.default_submit_transaction(ctx, tx_id)
            })),
            send_message: Some(Box::new(|peer, ctx, msg_id, body| {
                peer.default_send_message(ctx, msg_id, body)
            })),
        }
    }
}

impl<P: ProtocolPeer + 'static> BehaviorSlots<P> {
    pub fn set_compute_step(&mut self, f: ComputeSlot<P>) {
        self.compute_step = Some(f);
    }

    pub fn set_submit_transaction(&mut self, f: SubmitSlot<P>) {
        self.submit_transaction = Some(f);
    }

    pub fn set_send_message(&mut self, f: SendSlot<P>) {
        self.send_message = Some(f);
    }
}

/// `peer.performComputation()`: invokes whatever is currently in the
/// compute-step slot.
pub fn perform_computation<P: ProtocolPeer + 'static>(peer: &mut P, ctx: &mut RoundCtx<'_, P::Message>) {
    let mut f = peer
        .behavior_mut()
        .compute_step
        .take()
        .expect("compute_step slot must always be occupied between calls");
    f(peer, ctx);
    peer.behavior_mut().compute_step = Some(f);
}

/// `peer.submitTrans(tranId)`.
pub fn submit_transaction<P: ProtocolPeer + 'static>(
    peer: &mut P,
    ctx: &mut RoundCtx<'_, P::Message>,
    tx_id: u64,
) {
    let mut f = peer
        .behavior_mut()
        .submit_transaction
        .take()
        .expect("submit_transaction slot must always be occupied between calls");
    f(peer, ctx, tx_id);
    peer.behavior_mut().submit_transaction = Some(f);
}

/// `peer.sendMsg(msg)`: routes through the (possibly infected) send slot
/// instead of calling `NetworkInterface::broadcast` directly.
pub fn send_message<P: ProtocolPeer + 'static>(
    peer: &mut P,
    ctx: &mut RoundCtx<'_, P::Message>,
    msg_id: MessageId,
    body: P::Message,
) {
    let mut f = peer
        .behavior_mut()
        .send_message
        .take()
        .expect("send_message slot must always be occupied between calls");
    f(peer, ctx, msg_id, body);
    peer.behavior_mut().send_message = Some(f);
}
