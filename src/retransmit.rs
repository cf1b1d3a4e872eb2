//! Send-side retention of recently transmitted packets for NAK servicing.

use crate::seq::Seq;

/// Fixed-capacity ring of owned packet buffers, indexed by sequence number
/// modulo capacity. Each slot carries the absolute sequence so stale lookups
/// (a sequence long since overwritten) are rejected.
pub struct RetransmitRing {
    slots: Vec<Option<Slot>>,
}

struct Slot {
    seq: Seq,
    packet: Vec<u8>,
}

impl RetransmitRing {
    pub fn new(capacity: usize) -> RetransmitRing {
        assert!(capacity > 0);
        RetransmitRing {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn index(&self, seq: Seq) -> usize {
        seq.to_raw() as usize % self.slots.len()
    }

    /// Store the exact bytes sent for `seq`, evicting whatever previously
    /// occupied the slot.
    pub fn insert(&mut self, seq: Seq, packet: Vec<u8>) {
        let index = self.index(seq);
        self.slots[index] = Some(Slot { seq, packet });
    }

    /// The original packet bytes for `seq`, if still retained.
    pub fn get(&self, seq: Seq) -> Option<&[u8]> {
        match &self.slots[self.index(seq)] {
            Some(slot) if slot.seq == seq => Some(&slot.packet),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get() {
        let mut ring = RetransmitRing::new(4);
        ring.insert(Seq::from_raw(0), vec![0]);
        ring.insert(Seq::from_raw(1), vec![1]);
        assert_eq!(ring.get(Seq::from_raw(0)), Some([0u8].as_slice()));
        assert_eq!(ring.get(Seq::from_raw(1)), Some([1u8].as_slice()));
        assert_eq!(ring.get(Seq::from_raw(2)), None);
    }

    #[test]
    fn test_eviction_by_capacity() {
        let mut ring = RetransmitRing::new(4);
        for i in 0..6u32 {
            ring.insert(Seq::from_raw(i), vec![i as u8]);
        }
        // 0 and 1 were overwritten by 4 and 5
        assert_eq!(ring.get(Seq::from_raw(0)), None);
        assert_eq!(ring.get(Seq::from_raw(1)), None);
        assert_eq!(ring.get(Seq::from_raw(4)), Some([4u8].as_slice()));
        assert_eq!(ring.get(Seq::from_raw(5)), Some([5u8].as_slice()));
    }

    #[test]
    fn test_stale_lookup_rejected() {
        let mut ring = RetransmitRing::new(4);
        ring.insert(Seq::from_raw(8), vec![8]);
        // sequence 4 maps to the same slot but is not what is stored there
        assert_eq!(ring.get(Seq::from_raw(4)), None);
    }

    #[test]
    fn test_wrap_around_sequences() {
        let mut ring = RetransmitRing::new(4);
        ring.insert(Seq::from_raw(u32::MAX), vec![1]);
        ring.insert(Seq::from_raw(0), vec![2]);
        assert_eq!(ring.get(Seq::from_raw(u32::MAX)), Some([1u8].as_slice()));
        assert_eq!(ring.get(Seq::from_raw(0)), Some([2u8].as_slice()));
    }
}
