//! Page-replacement policies: victim selection over the frame table.
//!
//! The policy is a tagged variant chosen at boot by its id; the fault
//! handler dispatches on the tag. Selection only ever runs once the free
//! scan has come up empty, so every frame is owned at that point. Shared
//! frames are never candidates; an optional `hint` names the frame backing
//! the fork source page, which is avoided unless it is the only choice.

use rand::rngs::StdRng;
use rand::Rng;

use super::frame_table::FrameTable;

/// Replacement strategy, keyed by the boot-time policy id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacePolicy {
    /// Never evict; frames are bump-allocated and exhaustion is fatal.
    None,
    /// Uniform over non-shared frames.
    Random,
    /// Minimum load stamp.
    Fifo,
    /// Minimum access stamp.
    Lru,
    /// Rotating hand, second-chance reference bit.
    LruClock,
}

impl ReplacePolicy {
    pub fn from_id(id: usize) -> Option<Self> {
        match id {
            0 => Some(Self::None),
            1 => Some(Self::Random),
            2 => Some(Self::Fifo),
            3 => Some(Self::Lru),
            4 => Some(Self::LruClock),
            _ => None,
        }
    }

    /// Demand paging is on exactly when a replacement policy is.
    pub fn demand_paging(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// Pick a victim frame. Panics if every frame is shared; a run where
    /// no non-shared frame exists cannot make progress.
    pub fn select_victim(
        &self,
        frames: &mut FrameTable,
        rng: &mut StdRng,
        hint: Option<usize>,
    ) -> usize {
        let evictable = |f: usize| frames.entry(f).owner.is_some() && !frames.entry(f).shared;
        let mut candidates: Vec<usize> = (0..frames.num_frames()).filter(|&f| evictable(f)).collect();
        assert!(
            !candidates.is_empty(),
            "no evictable frame: every owned frame is shared"
        );
        // avoid the fork-source frame when there is any other choice
        if let Some(h) = hint {
            if candidates.len() > 1 {
                candidates.retain(|&f| f != h);
            }
        }
        match self {
            Self::None => unreachable!("replacement disabled"),
            Self::Random => candidates[rng.gen_range(0..candidates.len())],
            Self::Fifo => *candidates
                .iter()
                .min_by_key(|&&f| frames.entry(f).fifo_stamp)
                .unwrap(),
            Self::Lru => *candidates
                .iter()
                .min_by_key(|&&f| frames.entry(f).lru_stamp)
                .unwrap(),
            Self::LruClock => Self::clock_sweep(frames, &candidates),
        }
    }

    /// Advance the hand, clearing set reference bits, until a frame with a
    /// clear bit comes up. Two full sweeps always terminate: the first one
    /// clears every candidate's bit.
    fn clock_sweep(frames: &mut FrameTable, candidates: &[usize]) -> usize {
        let n = frames.num_frames();
        for _ in 0..2 * n + 1 {
            let f = frames.clock_hand;
            frames.clock_hand = (frames.clock_hand + 1) % n;
            if !candidates.contains(&f) {
                continue;
            }
            if frames.entry(f).lru_clock {
                // clear the reference bit, give the frame a second chance
                frames.clear_clock(f);
            } else {
                return f;
            }
        }
        unreachable!("clock sweep failed to settle");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn table(owners: &[(bool, bool, usize, usize, bool)]) -> FrameTable {
        // (owned, shared, fifo, lru, clock)
        let mut ft = FrameTable::new(owners.len());
        for (f, &(owned, shared, fifo, lru, clock)) in owners.iter().enumerate() {
            if owned {
                ft.claim(f, 1, f, shared, fifo);
                ft.touch(f, lru);
                if !clock {
                    ft.clear_clock(f);
                }
            }
        }
        ft
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(1)
    }

    #[test]
    fn ids_map_to_policies() {
        assert_eq!(ReplacePolicy::from_id(0), Some(ReplacePolicy::None));
        assert_eq!(ReplacePolicy::from_id(4), Some(ReplacePolicy::LruClock));
        assert_eq!(ReplacePolicy::from_id(5), None);
        assert!(!ReplacePolicy::None.demand_paging());
        assert!(ReplacePolicy::Fifo.demand_paging());
    }

    #[test]
    fn fifo_picks_oldest_load() {
        let mut ft = table(&[
            (true, false, 30, 30, true),
            (true, false, 10, 99, true),
            (true, false, 20, 5, true),
        ]);
        let v = ReplacePolicy::Fifo.select_victim(&mut ft, &mut rng(), None);
        assert_eq!(v, 1);
    }

    #[test]
    fn lru_picks_least_recent_access() {
        let mut ft = table(&[
            (true, false, 1, 30, true),
            (true, false, 2, 99, true),
            (true, false, 3, 5, true),
        ]);
        let v = ReplacePolicy::Lru.select_victim(&mut ft, &mut rng(), None);
        assert_eq!(v, 2);
    }

    #[test]
    fn shared_frames_are_never_victims() {
        let mut ft = table(&[
            (true, true, 0, 0, true),
            (true, false, 50, 50, true),
            (true, true, 0, 0, true),
        ]);
        for policy in [
            ReplacePolicy::Random,
            ReplacePolicy::Fifo,
            ReplacePolicy::Lru,
            ReplacePolicy::LruClock,
        ] {
            let v = policy.select_victim(&mut ft, &mut rng(), None);
            assert_eq!(v, 1, "{:?} chose a shared frame", policy);
        }
    }

    #[test]
    fn hint_is_avoided_when_possible() {
        let mut ft = table(&[(true, false, 1, 1, true), (true, false, 2, 2, true)]);
        let v = ReplacePolicy::Fifo.select_victim(&mut ft, &mut rng(), Some(0));
        assert_eq!(v, 1);
    }

    #[test]
    fn hint_is_taken_when_it_is_the_only_candidate() {
        let mut ft = table(&[(true, true, 0, 0, true), (true, false, 2, 2, true)]);
        let v = ReplacePolicy::Lru.select_victim(&mut ft, &mut rng(), Some(1));
        assert_eq!(v, 1);
    }

    #[test]
    fn clock_gives_second_chances() {
        // all reference bits set: one sweep clears them, the hand then
        // takes the first frame it started from
        let mut ft = table(&[
            (true, false, 0, 0, true),
            (true, false, 0, 0, true),
            (true, false, 0, 0, true),
        ]);
        let v = ReplacePolicy::LruClock.select_victim(&mut ft, &mut rng(), None);
        assert_eq!(v, 0);
        // bits are now clear and the hand has moved past the victim
        assert!(!ft.entry(1).lru_clock);
        let v2 = ReplacePolicy::LruClock.select_victim(&mut ft, &mut rng(), None);
        assert_eq!(v2, 1);
    }

    #[test]
    fn clock_skips_referenced_frame() {
        let mut ft = table(&[
            (true, false, 0, 0, true),
            (true, false, 0, 0, false),
            (true, false, 0, 0, true),
        ]);
        let v = ReplacePolicy::LruClock.select_victim(&mut ft, &mut rng(), None);
        assert_eq!(v, 1);
    }
}
