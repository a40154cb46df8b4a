// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::packet::number::{PacketNumber, PacketNumberSpace};
use alloc::collections::BTreeMap;

/// Sent-packet records for one packet number space, ordered by packet
/// number.
///
/// The `Info` payload is supplied by the recovery manager; this map only
/// enforces the monotonic-insert invariant of a QUIC sender.
#[derive(Clone, Debug)]
pub struct SentPackets<Info> {
    space: PacketNumberSpace,
    packets: BTreeMap<u64, Info>,
}

impl<Info> SentPackets<Info> {
    pub fn new(space: PacketNumberSpace) -> Self {
        Self {
            space,
            packets: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn space(&self) -> PacketNumberSpace {
        self.space
    }

    /// Records a sent packet.
    ///
    /// # Panics
    /// Panics in debug builds if `packet_number` does not exceed every
    /// previously inserted packet number; sender packet numbers are
    /// strictly increasing.
    pub fn insert(&mut self, packet_number: PacketNumber, info: Info) {
        debug_assert_eq!(packet_number.space(), self.space);
        debug_assert!(
            self.packets
                .last_key_value()
                .map_or(true, |(largest, _)| *largest < packet_number.as_u64()),
            "packet numbers must be strictly increasing"
        );
        self.packets.insert(packet_number.as_u64(), info);
    }

    #[inline]
    pub fn get(&self, packet_number: PacketNumber) -> Option<&Info> {
        self.packets.get(&packet_number.as_u64())
    }

    #[inline]
    pub fn remove(&mut self, packet_number: PacketNumber) -> Option<Info> {
        self.packets.remove(&packet_number.as_u64())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    #[inline]
    pub fn smallest(&self) -> Option<PacketNumber> {
        self.packets
            .keys()
            .next()
            .map(|&pn| self.new_packet_number(pn))
    }

    #[inline]
    pub fn largest(&self) -> Option<PacketNumber> {
        self.packets
            .keys()
            .next_back()
            .map(|&pn| self.new_packet_number(pn))
    }

    pub fn iter(&self) -> impl Iterator<Item = (PacketNumber, &Info)> + '_ {
        let space = self.space;
        self.packets
            .iter()
            .map(move |(&pn, info)| (space.new_packet_number(pn.try_into().expect("pn range")), info))
    }

    /// Removes and returns every record, oldest first
    pub fn drain(&mut self) -> impl Iterator<Item = (PacketNumber, Info)> {
        let space = self.space;
        core::mem::take(&mut self.packets)
            .into_iter()
            .map(move |(pn, info)| (space.new_packet_number(pn.try_into().expect("pn range")), info))
    }

    /// Removes every record with a packet number at or below `limit`
    pub fn remove_below(
        &mut self,
        limit: PacketNumber,
    ) -> impl Iterator<Item = (PacketNumber, Info)> {
        let space = self.space;
        let keep = self.packets.split_off(&(limit.as_u64() + 1));
        core::mem::replace(&mut self.packets, keep)
            .into_iter()
            .map(move |(pn, info)| (space.new_packet_number(pn.try_into().expect("pn range")), info))
    }

    fn new_packet_number(&self, value: u64) -> PacketNumber {
        self.space
            .new_packet_number(value.try_into().expect("pn range"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::varint::VarInt;

    fn pn(value: u64) -> PacketNumber {
        PacketNumberSpace::ApplicationData.new_packet_number(VarInt::new(value).unwrap())
    }

    #[test]
    fn ordered_access() {
        let mut sent = SentPackets::new(PacketNumberSpace::ApplicationData);
        for value in [1u64, 3, 5, 9] {
            sent.insert(pn(value), value * 100);
        }

        assert_eq!(sent.smallest(), Some(pn(1)));
        assert_eq!(sent.largest(), Some(pn(9)));
        assert_eq!(sent.get(pn(3)), Some(&300));
        assert_eq!(sent.remove(pn(3)), Some(300));
        assert_eq!(sent.get(pn(3)), None);
        assert_eq!(sent.len(), 3);
    }

    #[test]
    fn remove_below_splits_the_map() {
        let mut sent = SentPackets::new(PacketNumberSpace::ApplicationData);
        for value in 0..10u64 {
            sent.insert(pn(value), value);
        }

        let removed: Vec<_> = sent.remove_below(pn(4)).map(|(pn, _)| pn.as_u64()).collect();
        assert_eq!(removed, [0, 1, 2, 3, 4]);
        assert_eq!(sent.smallest(), Some(pn(5)));
    }

    #[test]
    #[should_panic(expected = "strictly increasing")]
    fn rejects_reused_packet_numbers() {
        let mut sent = SentPackets::new(PacketNumberSpace::ApplicationData);
        sent.insert(pn(5), ());
        sent.insert(pn(5), ());
    }
}
