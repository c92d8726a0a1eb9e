//! Packet and per-peer channel: the envelope carrying a message between two
//! peers, and the per-link in-flight buffer that ages it towards delivery.

use std::collections::VecDeque;

use crate::peer::PeerId;

/// A message id is unique per originating request; the simulator never
/// inspects its internal shape.
pub type MessageId = String;

/// `(msg_id, source, destination, delay_remaining, body)`.
///
/// A packet is never deliverable before its original delay has elapsed;
/// only the transport fields matter for that, `body` carries whatever the
/// protocol layer needs.
#[derive(Debug, Clone)]
pub struct Packet<M> {
    pub id: MessageId,
    pub source: PeerId,
    pub destination: PeerId,
    delay_remaining: u32,
    original_delay: u32,
    pub body: M,
}

impl<M> Packet<M> {
    pub fn new(id: MessageId, source: PeerId, destination: PeerId, delay: u32, body: M) -> Self {
        Packet {
            id,
            source,
            destination,
            delay_remaining: delay,
            original_delay: delay,
            body,
        }
    }

    pub fn delay_remaining(&self) -> u32 {
        self.delay_remaining
    }

    pub fn original_delay(&self) -> u32 {
        self.original_delay
    }

    /// `0 <= delay_remaining <= original_delay` holds for the whole
    /// lifetime of a packet; `tick` only ever decrements towards zero.
    fn tick(&mut self) {
        if self.delay_remaining > 0 {
            self.delay_remaining -= 1;
        }
    }

    fn matured(&self) -> bool {
        self.delay_remaining == 0
    }
}

/// Ordered in-flight buffer for a single directed link (`self -> neighbor`,
/// or `self -> self` when a peer targets itself).
#[derive(Debug, Default)]
pub struct Channel<M> {
    in_flight: VecDeque<Packet<M>>,
}

impl<M> Channel<M> {
    pub fn new() -> Self {
        Channel {
            in_flight: VecDeque::new(),
        }
    }

    pub fn send(&mut self, packet: Packet<M>) {
        self.in_flight.push_back(packet);
    }

    /// Decrements every in-flight packet's delay by one round. Packets that
    /// reach zero are drained, in the order they matured, so the caller can
    /// append them to the destination's inbound queue.
    pub fn tick(&mut self) -> Vec<Packet<M>> {
        for packet in self.in_flight.iter_mut() {
            packet.tick();
        }
        let mut matured = Vec::new();
        let mut remaining = VecDeque::with_capacity(self.in_flight.len());
        for packet in self.in_flight.drain(..) {
            if packet.matured() {
                matured.push(packet);
            } else {
                remaining.push_back(packet);
            }
        }
        self.in_flight = remaining;
        matured
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_matures_zero_delay_packets_in_send_order() {
        let mut channel: Channel<u32> = Channel::new();
        channel.send(Packet::new("a".into(), 0, 1, 2, 10));
        channel.send(Packet::new("b".into(), 0, 1, 1, 20));

        let matured = channel.tick();
        assert_eq!(matured.len(), 1);
        assert_eq!(matured[0].id, "b");
        assert!(!channel.is_empty());

        let matured = channel.tick();
        assert_eq!(matured.len(), 1);
        assert_eq!(matured[0].id, "a");
        assert!(channel.is_empty());
    }

    #[test]
    fn delay_never_goes_negative() {
        let mut p = Packet::new("a".into(), 0, 1, 0, 1);
        assert_eq!(p.delay_remaining(), 0);
        p.tick();
        assert_eq!(p.delay_remaining(), 0);
    }
}
