//! Component D: assemble the per-target composite reference state from the
//! PBWT scanner's emissions.

use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// One segment of a composite-state slot: haplotype `hap` is copied from
/// `start_marker` (inclusive) up to the next segment's `start_marker` (or
/// `M` for the slot's final segment).
#[derive(Clone, Copy, Debug)]
pub struct Segment {
    pub hap: u32,
    pub start_marker: usize,
}

/// A single composite-reference slot: an append-only, non-overlapping,
/// marker-covering list of segments.
#[derive(Clone, Debug, Default)]
pub struct Slot {
    pub segments: Vec<Segment>,
    last_seen_step: usize,
}

impl Slot {
    /// Panel of the segment active at marker `m`, resolved by the caller
    /// via a per-marker cursor rather than scanning `segments` from
    /// scratch (see [`CompositeState::panel_and_mismatch_at`]).
    fn segment_index_for(&self, m: usize, hint: usize) -> usize {
        let mut idx = hint.min(self.segments.len().saturating_sub(1));
        while idx + 1 < self.segments.len() && self.segments[idx + 1].start_marker <= m {
            idx += 1;
        }
        idx
    }
}

/// Heap entry ordering slots by their most recent IBS step; a max-heap
/// negated to act as a min-heap so `pop()` returns the slot with the
/// *oldest* last-IBS step, the recycling candidate.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct HeapEntry {
    last_step: usize,
    slot: usize,
    // a monotonically increasing generation stamps each push; stale
    // entries (superseded by a later push for the same slot) are dropped
    // lazily on pop, implementing the "lazy heap" strategy Design Note 9
    // recommends for a key that changes after insertion.
    generation: u64,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.last_step.cmp(&self.last_step)
    }
}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The composite-state assembler's working state for one target haplotype.
pub struct CompositeAssembler {
    capacity: usize,
    minimum_recycle_gap_steps: usize,
    /// `step_start_marker[s]` is the first marker index step `s` covers;
    /// used to resolve a recycled segment's midpoint in marker space rather
    /// than step space (steps may span many markers).
    step_start_marker: Vec<usize>,
    slots: Vec<Slot>,
    hap_to_slot: HashMap<u32, usize>,
    heap: BinaryHeap<HeapEntry>,
    generation_of_slot: Vec<u64>,
    generation_counter: u64,
}

impl CompositeAssembler {
    pub fn new(capacity: usize, minimum_recycle_gap_steps: usize, step_start_marker: Vec<usize>) -> Self {
        CompositeAssembler {
            capacity,
            minimum_recycle_gap_steps,
            step_start_marker,
            slots: Vec::new(),
            hap_to_slot: HashMap::new(),
            heap: BinaryHeap::new(),
            generation_of_slot: Vec::new(),
            generation_counter: 0,
        }
    }

    /// Feed one `(hap, step)` IBS emission, per spec 4.D's three-way
    /// algorithm.
    pub fn observe(&mut self, hap: u32, step: usize) {
        if let Some(&slot_idx) = self.hap_to_slot.get(&hap) {
            self.slots[slot_idx].last_seen_step = step;
            self.push_heap(slot_idx, step);
            return;
        }

        if self.slots.len() < self.capacity {
            self.allocate_new_slot(hap, step);
            return;
        }

        self.prune_stale();
        if let Some(&HeapEntry { last_step, slot, .. }) = self.heap.peek() {
            if step.saturating_sub(last_step) >= self.minimum_recycle_gap_steps {
                self.recycle(slot, hap, step);
                return;
            }
        }
        // heap minimum is too recent to recycle and we are at capacity:
        // drop the emission (spec 4.D step 3's implicit "otherwise" when
        // no slot is eligible is to allocate a new one only if `< S`; with
        // `slots.len() == capacity` and no eligible recycle target there is
        // nothing left to do for this emission).
    }

    fn allocate_new_slot(&mut self, hap: u32, step: usize) {
        let slot_idx = self.slots.len();
        self.slots.push(Slot {
            segments: vec![Segment {
                hap,
                start_marker: 0,
            }],
            last_seen_step: step,
        });
        self.generation_of_slot.push(0);
        self.hap_to_slot.insert(hap, slot_idx);
        self.push_heap(slot_idx, step);
    }

    fn recycle(&mut self, slot_idx: usize, hap: u32, step: usize) {
        let old_hap = self.slots[slot_idx]
            .segments
            .last()
            .map(|s| s.hap)
            .unwrap();
        self.hap_to_slot.remove(&old_hap);

        let old_step = self.slots[slot_idx].last_seen_step;
        let midpoint_marker = self.step_to_midpoint_marker(old_step, step);

        self.slots[slot_idx].segments.push(Segment {
            hap,
            start_marker: midpoint_marker,
        });
        self.slots[slot_idx].last_seen_step = step;
        self.hap_to_slot.insert(hap, slot_idx);
        self.push_heap(slot_idx, step);
    }

    /// Integer midpoint, in marker space, between `old_step` and
    /// `new_step`'s start markers (spec 4.D: "midpoint uses integer
    /// `(oldStep + newStep) >> 1`", generalized from step indices to
    /// marker indices since a step may span many markers).
    fn step_to_midpoint_marker(&self, old_step: usize, new_step: usize) -> usize {
        let old_marker = self.step_start_marker.get(old_step).copied().unwrap_or(old_step);
        let new_marker = self.step_start_marker.get(new_step).copied().unwrap_or(new_step);
        (old_marker + new_marker) >> 1
    }

    fn push_heap(&mut self, slot_idx: usize, step: usize) {
        self.generation_counter += 1;
        self.generation_of_slot[slot_idx] = self.generation_counter;
        self.heap.push(HeapEntry {
            last_step: step,
            slot: slot_idx,
            generation: self.generation_counter,
        });
    }

    /// Drop stale heap entries (superseded by a later push to the same
    /// slot) until the true minimum is at the top, matching the "drop
    /// stale peeks" half of the lazy-heap strategy.
    fn prune_stale(&mut self) {
        while let Some(top) = self.heap.peek() {
            if self.generation_of_slot[top.slot] != top.generation {
                self.heap.pop();
            } else {
                break;
            }
        }
    }

    /// Finalize: close every slot with a sentinel segment end at `m = M`,
    /// and fall back to `capacity` random reference haplotypes (seeded by
    /// `seed ^ query_hap`, per Design Note "Random reference-haplotype
    /// fallback") if the scanner produced no slots at all.
    pub fn finish(mut self, n_markers: usize, query_hap: u32, seed: u64, reference_haps: &[u32]) -> CompositeState {
        self.prune_stale();
        // Every worker thread reuses one `HmmEvaluator` (sized to `S` slot
        // columns) across every target haplotype it processes, so the
        // finished state must always carry exactly `capacity` slots rather
        // than however many the scanner happened to populate. Pad any
        // shortfall with random reference haplotypes, extending the "empty
        // scanner" fallback from spec 4.D to the more general "short"
        // scanner case.
        if self.slots.len() < self.capacity {
            let already_used: std::collections::HashSet<u32> = self
                .slots
                .iter()
                .flat_map(|slot| slot.segments.iter().map(|seg| seg.hap))
                .collect();
            let mut rng = SmallRng::seed_from_u64(seed ^ query_hap as u64);
            let mut pool: Vec<u32> = reference_haps
                .iter()
                .copied()
                .filter(|hap| !already_used.contains(hap))
                .collect();
            pool.shuffle(&mut rng);
            let shortfall = self.capacity - self.slots.len();
            self.slots.extend(pool.into_iter().take(shortfall).map(|hap| Slot {
                segments: vec![Segment {
                    hap,
                    start_marker: 0,
                }],
                last_seen_step: 0,
            }));
        }
        CompositeState {
            n_markers,
            slots: self.slots,
        }
    }
}

/// The finished composite reference: up to `S` slots, each covering
/// `[0, M)` with non-overlapping segments.
pub struct CompositeState {
    n_markers: usize,
    slots: Vec<Slot>,
}

impl CompositeState {
    pub fn n_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn n_markers(&self) -> usize {
        self.n_markers
    }

    /// Walk every slot's segment list once, in marker order, calling `f`
    /// with `(marker, slot_index, hap)` for the active segment. This is
    /// the intended access pattern: callers that need `panel`/`mismatch`
    /// per marker do the panel/allele lookup themselves, keeping this type
    /// agnostic of panel assignment.
    pub fn for_each_marker<F: FnMut(usize, usize, u32)>(&self, mut f: F) {
        let mut cursors = vec![0usize; self.slots.len()];
        for m in 0..self.n_markers {
            for (s, slot) in self.slots.iter().enumerate() {
                cursors[s] = slot.segment_index_for(m, cursors[s]);
                let hap = slot.segments[cursors[s]].hap;
                f(m, s, hap);
            }
        }
    }

    /// Every marker in `[0, n_markers)` is covered by exactly one segment
    /// in every slot -- the invariant spec section 8 requires be testable.
    pub fn covers_every_marker(&self) -> bool {
        self.slots.iter().all(|slot| {
            if slot.segments.is_empty() || slot.segments[0].start_marker != 0 {
                return false;
            }
            slot.segments
                .windows(2)
                .all(|w| w[0].start_marker < w[1].start_marker)
        })
    }
}

/// Per-marker, per-slot panel and mismatch arrays (spec 3's `panel[m][s]`,
/// `mismatch[m][s]`), the only shape the HMM evaluator needs from a
/// [`CompositeState`]. `O(M*S)` memory, per the resource model.
pub struct SlotObservations {
    pub panel: Vec<Vec<usize>>,
    pub mismatch: Vec<Vec<u8>>,
}

impl CompositeState {
    pub fn observations(
        &self,
        panel_of: impl Fn(u32) -> usize,
        allele_at: impl Fn(u32, usize) -> u8,
        target_allele: &[u8],
    ) -> SlotObservations {
        let s = self.n_slots();
        let mut panel = vec![vec![0usize; s]; self.n_markers];
        let mut mismatch = vec![vec![0u8; s]; self.n_markers];
        self.for_each_marker(|m, slot, hap| {
            panel[m][slot] = panel_of(hap);
            mismatch[m][slot] = u8::from(allele_at(hap, m) != target_allele[m]);
        });
        SlotObservations { panel, mismatch }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_emission_allocates_a_slot() {
        let mut asm = CompositeAssembler::new(4, 10, (0..50).collect());
        asm.observe(100, 1);
        let state = asm.finish(50, 0, 42, &[100, 101, 102]);
        assert_eq!(state.n_slots(), 1);
    }

    #[test]
    fn repeated_hap_updates_same_slot_without_growing() {
        let mut asm = CompositeAssembler::new(4, 10, (0..50).collect());
        asm.observe(100, 1);
        asm.observe(100, 2);
        asm.observe(100, 3);
        let state = asm.finish(50, 0, 42, &[100]);
        assert_eq!(state.n_slots(), 1);
    }

    #[test]
    fn slot_count_never_exceeds_capacity() {
        let mut asm = CompositeAssembler::new(2, 1, (0..100).collect());
        for (hap, step) in [(1, 1), (2, 2), (3, 3), (4, 4), (5, 5)] {
            asm.observe(hap, step);
        }
        let state = asm.finish(100, 0, 1, &[1, 2, 3, 4, 5]);
        assert!(state.n_slots() <= 2);
    }

    #[test]
    fn empty_scanner_falls_back_to_random_reference_haplotypes() {
        let asm = CompositeAssembler::new(3, 10, (0..20).collect());
        let state = asm.finish(20, 7, 99, &[10, 11, 12, 13]);
        assert_eq!(state.n_slots(), 3);
    }

    #[test]
    fn finished_state_covers_every_marker() {
        let mut asm = CompositeAssembler::new(2, 1, (0..100).collect());
        asm.observe(1, 1);
        asm.observe(2, 2);
        asm.observe(3, 5);
        let state = asm.finish(100, 0, 1, &[1, 2, 3]);
        assert!(state.covers_every_marker());
    }

    #[test]
    fn deterministic_fallback_depends_on_seed_xor_query_hap() {
        let asm_a = CompositeAssembler::new(2, 10, (0..10).collect());
        let state_a = asm_a.finish(10, 5, 123, &[1, 2, 3, 4, 5, 6]);
        let asm_b = CompositeAssembler::new(2, 10, (0..10).collect());
        let state_b = asm_b.finish(10, 5, 123, &[1, 2, 3, 4, 5, 6]);
        let haps_a: Vec<u32> = state_a.slots.iter().map(|s| s.segments[0].hap).collect();
        let haps_b: Vec<u32> = state_b.slots.iter().map(|s| s.segments[0].hap).collect();
        assert_eq!(haps_a, haps_b);
    }
}
