use std::fmt::{
    Display,
    Formatter,
};

use bitvec::vec::BitVec;
use index_vec::IndexVec;
use iter_tools::Itertools;

use crate::codegen::machine::{
    function::LoopId,
    InstrId,
    Location,
    Representation,
    SlotId,
    TargetMachine,
    Vreg,
};

/// Larger than any lifetime position of a real instruction.
pub const MAX_POSITION: u32 = 0x7FFF_FFFF;

pub const fn is_instruction_start(pos: u32) -> bool {
    pos & 1 == 0
}

pub const fn is_instruction_end(pos: u32) -> bool {
    pos & 1 == 1
}

pub const fn to_instruction_start(pos: u32) -> u32 {
    pos & !1
}

pub const fn to_instruction_end(pos: u32) -> u32 {
    pos | 1
}

index_vec::define_index_type! {
    pub struct LiveRangeId = u32;

    DISPLAY_FORMAT = "lr{}";
}

/// Half open interval `[start, end)` of lifetime positions.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UseInterval {
    pub start: u32,
    pub end: u32,
}

impl UseInterval {
    pub const fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub const fn contains(&self, pos: u32) -> bool {
        self.start <= pos && pos < self.end
    }

    /// First position covered by both intervals.
    pub const fn intersect(&self, other: &Self) -> Option<u32> {
        if self.start <= other.start {
            if other.start < self.end {
                return Some(other.start);
            }
        } else if self.start < other.end {
            return Some(self.start);
        }
        None
    }
}

impl Display for UseInterval {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Where the allocator should look for a preferred register.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Hint {
    Slot(SlotId),
    /// The location eventually assigned to another live range, e.g. a phi.
    AssignedTo(LiveRangeId),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UsePosition {
    pub pos: u32,
    pub slot: SlotId,
    pub hint: Option<Hint>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SafepointPosition {
    /// Always the end position of the instruction.
    pub pos: u32,
    pub instr: InstrId,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RangeOwner {
    Value(Vreg),
    /// Temporaries and writable copies of inputs. Never spilled.
    Temporary,
    /// Keeps a fixed register occupied. Never spilled.
    Blocking,
}

/// Cursor into a live range that only moves forward during allocation.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct AllocationFinger {
    first_pending_interval: usize,
    first_register_use: usize,
    first_register_beneficial_use: usize,
    first_hinted_use: usize,
}

#[derive(Debug, Clone)]
pub struct LiveRange<TM: TargetMachine> {
    pub owner: RangeOwner,
    pub repr: Representation,
    /// Sorted by start, never overlapping.
    intervals: Vec<UseInterval>,
    /// Sorted by position.
    uses: Vec<UsePosition>,
    safepoints: Vec<SafepointPosition>,
    pub assigned: Location<TM>,
    /// Only meaningful on the parent range; shared by all siblings.
    pub spill_slot: Location<TM>,
    pub next_sibling: Option<LiveRangeId>,
    pub is_loop_phi: bool,
    pub has_uses_which_require_stack: bool,
    only_unconstrained_uses_in_loop: BitVec,
    finger: AllocationFinger,
}

impl<TM: TargetMachine> LiveRange<TM> {
    pub fn new(owner: RangeOwner, repr: Representation) -> Self {
        Self {
            owner,
            repr,
            intervals: Vec::new(),
            uses: Vec::new(),
            safepoints: Vec::new(),
            assigned: Location::Invalid,
            spill_slot: Location::Invalid,
            next_sibling: None,
            is_loop_phi: false,
            has_uses_which_require_stack: false,
            only_unconstrained_uses_in_loop: BitVec::new(),
            finger: AllocationFinger::default(),
        }
    }

    pub const fn vreg(&self) -> Option<Vreg> {
        match self.owner {
            RangeOwner::Value(vreg) => Some(vreg),
            _ => None,
        }
    }

    pub fn intervals(&self) -> &[UseInterval] {
        &self.intervals
    }

    pub fn uses(&self) -> &[UsePosition] {
        &self.uses
    }

    pub fn safepoints(&self) -> &[SafepointPosition] {
        &self.safepoints
    }

    pub fn has_intervals(&self) -> bool {
        !self.intervals.is_empty()
    }

    pub fn start(&self) -> u32 {
        self.intervals
            .first()
            .map(|interval| interval.start)
            .expect("live range has no use intervals")
    }

    pub fn end(&self) -> u32 {
        self.intervals
            .last()
            .map(|interval| interval.end)
            .expect("live range has no use intervals")
    }

    pub fn can_cover(&self, pos: u32) -> bool {
        self.start() <= pos && pos < self.end()
    }

    pub fn contains(&self, pos: u32) -> bool {
        self.can_cover(pos) && self.intervals.iter().any(|interval| interval.contains(pos))
    }

    /// Prepends `[start, end)`. Ranges are built backwards, so intervals arrive
    /// in decreasing order; touching or overlapping ones are merged.
    pub fn add_use_interval(&mut self, start: u32, end: u32) {
        debug_assert!(start < end, "empty use interval [{start}, {end})");
        if let Some(first) = self.intervals.first_mut() {
            if start <= first.end && first.start <= end {
                first.start = first.start.min(start);
                first.end = first.end.max(end);
                return;
            }
            debug_assert!(end < first.start);
        }
        self.intervals.insert(0, UseInterval::new(start, end));
    }

    /// Trims the leading interval so that the range starts at its definition.
    pub fn define_at(&mut self, pos: u32) {
        match self.intervals.first_mut() {
            None => self.intervals.push(UseInterval::new(pos, pos + 1)),
            Some(first) => {
                debug_assert!(first.start <= pos, "definition at {pos} after use at {}", first.start);
                first.start = pos;
            }
        }
    }

    pub fn add_use(&mut self, pos: u32, slot: SlotId) -> usize {
        let index = self.uses.partition_point(|use_pos| use_pos.pos < pos);
        if let Some(existing) = self.uses.get(index) {
            if existing.pos == pos && existing.slot == slot {
                return index;
            }
        }
        self.uses.insert(index, UsePosition { pos, slot, hint: None });
        index
    }

    pub fn add_hinted_use(&mut self, pos: u32, slot: SlotId, hint: Hint) {
        let index = self.add_use(pos, slot);
        self.uses[index].hint = Some(hint);
    }

    /// Drops the first use. Used when a fixed output feeds the next instruction directly.
    pub fn pop_first_use(&mut self) -> Option<UsePosition> {
        if self.uses.is_empty() {
            None
        } else {
            Some(self.uses.remove(0))
        }
    }

    pub fn add_safepoint(&mut self, pos: u32, instr: InstrId) {
        let pos = to_instruction_end(pos);
        debug_assert!(self.safepoints.last().map_or(true, |last| last.pos < pos));
        self.safepoints.push(SafepointPosition { pos, instr });
    }

    pub fn has_only_unconstrained_uses_in_loop(&self, loop_id: LoopId) -> bool {
        self.only_unconstrained_uses_in_loop
            .get(loop_id.index())
            .map_or(false, |bit| *bit)
    }

    pub fn mark_has_only_unconstrained_uses_in_loop(&mut self, loop_id: LoopId) {
        if self.only_unconstrained_uses_in_loop.len() <= loop_id.index() {
            self.only_unconstrained_uses_in_loop
                .resize(loop_id.index() + 1, false);
        }
        self.only_unconstrained_uses_in_loop.set(loop_id.index(), true);
    }

    /// Moves everything after `split_pos` into a new range.
    ///
    /// The caller links the returned range into the sibling chain.
    pub fn split_off(&mut self, split_pos: u32) -> Self {
        debug_assert!(self.start() < split_pos && split_pos < self.end());
        let mut index = self.finger.first_pending_interval;
        if index >= self.intervals.len() || split_pos <= self.intervals[index].start {
            index = 0;
        }
        while self.intervals[index].end <= split_pos {
            index += 1;
        }
        let split_at_start = self.intervals[index].start == split_pos;
        let tail_intervals = if !split_at_start && self.intervals[index].contains(split_pos) {
            let mut tail = vec![UseInterval::new(split_pos, self.intervals[index].end)];
            tail.extend(self.intervals.drain(index + 1..));
            self.intervals[index].end = split_pos;
            tail
        } else {
            self.intervals.split_off(index)
        };
        let stays = |pos: u32| {
            if split_at_start {
                pos < split_pos
            } else {
                pos <= split_pos
            }
        };
        let uses_split = self.uses.partition_point(|use_pos| stays(use_pos.pos));
        let tail_uses = self.uses.split_off(uses_split);
        let safepoints_split = self.safepoints.partition_point(|safepoint| stays(safepoint.pos));
        let tail_safepoints = self.safepoints.split_off(safepoints_split);

        let finger = &mut self.finger;
        finger.first_pending_interval = finger.first_pending_interval.min(self.intervals.len());
        finger.first_register_use = finger.first_register_use.min(self.uses.len());
        finger.first_register_beneficial_use = finger.first_register_beneficial_use.min(self.uses.len());
        finger.first_hinted_use = finger.first_hinted_use.min(self.uses.len());

        Self {
            intervals: tail_intervals,
            uses: tail_uses,
            safepoints: tail_safepoints,
            next_sibling: self.next_sibling,
            ..Self::new(self.owner, self.repr)
        }
    }

    pub fn initialize_finger(&mut self) {
        self.finger = AllocationFinger::default();
    }

    /// Skips intervals that end before `start`. Returns true once none are left.
    pub fn advance_finger(&mut self, start: u32) -> bool {
        while self.finger.first_pending_interval < self.intervals.len()
            && self.intervals[self.finger.first_pending_interval].end <= start
        {
            self.finger.first_pending_interval += 1;
        }
        self.finger.first_pending_interval >= self.intervals.len()
    }

    pub fn pending_intervals(&self) -> &[UseInterval] {
        &self.intervals[self.finger.first_pending_interval.min(self.intervals.len())..]
    }

    pub fn first_pending_interval(&self) -> Option<UseInterval> {
        self.pending_intervals().first().copied()
    }

    /// Hints of the pending uses, in position order.
    pub fn pending_hints(&self) -> impl Iterator<Item = Hint> + '_ {
        self.uses[self.finger.first_hinted_use.min(self.uses.len())..]
            .iter()
            .filter_map(|use_pos| use_pos.hint)
    }

    fn first_use_after(&self, from: usize, after: u32) -> usize {
        let mut index = from;
        while index < self.uses.len() && self.uses[index].pos < after {
            index += 1;
        }
        index
    }

    /// First use at or after `after` that must be in a register.
    pub fn first_register_use(
        &mut self,
        after: u32,
        locations: &IndexVec<SlotId, Location<TM>>,
    ) -> Option<UsePosition> {
        let start = self.first_use_after(self.finger.first_register_use, after);
        let found = (start..self.uses.len())
            .find(|index| locations[self.uses[*index].slot].requires_register_now())?;
        self.finger.first_register_use = found;
        Some(self.uses[found])
    }

    /// First use at or after `after` for which a register is better than memory.
    pub fn first_register_beneficial_use(
        &mut self,
        after: u32,
        locations: &IndexVec<SlotId, Location<TM>>,
    ) -> Option<UsePosition> {
        let start = self.first_use_after(self.finger.first_register_beneficial_use, after);
        let found = (start..self.uses.len())
            .find(|index| locations[self.uses[*index].slot].is_register_beneficial())?;
        self.finger.first_register_beneficial_use = found;
        Some(self.uses[found])
    }

    /// Like [`Self::first_register_use`], but ignores uses at the end of the
    /// instruction at `after`.
    pub fn first_interfering_use(
        &mut self,
        after: u32,
        locations: &IndexVec<SlotId, Location<TM>>,
    ) -> Option<UsePosition> {
        let after = if is_instruction_end(after) { after + 1 } else { after };
        self.first_register_use(after, locations)
    }
}

/// First position at which two sorted interval lists overlap, or [`MAX_POSITION`].
pub fn first_intersection(a: &[UseInterval], u: &[UseInterval]) -> u32 {
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < u.len() {
        if let Some(pos) = a[i].intersect(&u[j]) {
            return pos;
        }
        if a[i].start < u[j].start {
            i += 1;
        } else {
            j += 1;
        }
    }
    MAX_POSITION
}

impl<TM: TargetMachine> Display for LiveRange<TM> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.owner {
            RangeOwner::Value(vreg) => write!(f, "{vreg}")?,
            RangeOwner::Temporary => write!(f, "temp")?,
            RangeOwner::Blocking => write!(f, "blocked")?,
        }
        write!(f, " {}", self.intervals.iter().join(" "))?;
        if !self.uses.is_empty() {
            write!(f, " uses: {}", self.uses.iter().map(|use_pos| use_pos.pos).join(" "))?;
        }
        write!(f, " -> {}", self.assigned)
    }
}

#[cfg(test)]
mod tests {
    use index_vec::IndexVec;
    use tracing_test::traced_test;

    use super::{
        first_intersection,
        LiveRange,
        RangeOwner,
        UseInterval,
        MAX_POSITION,
    };
    use crate::codegen::{
        machine::{
            InstrId,
            Location,
            Policy,
            Representation,
            SlotId,
            Vreg,
        },
        targets::x86_64::Target,
    };

    fn value_range() -> LiveRange<Target> {
        LiveRange::new(RangeOwner::Value(Vreg::new(0)), Representation::Tagged)
    }

    #[test]
    #[traced_test]
    fn intervals_are_prepended_and_coalesced() {
        let mut range = value_range();
        range.add_use_interval(20, 30);
        range.add_use_interval(10, 20);
        range.add_use_interval(2, 6);
        assert_eq!(range.intervals(), &[UseInterval::new(2, 6), UseInterval::new(10, 30)]);
        assert_eq!(range.start(), 2);
        assert_eq!(range.end(), 30);
        assert!(range.contains(12));
        assert!(!range.contains(8));
        assert!(range.can_cover(8));
    }

    #[test]
    #[traced_test]
    fn definition_trims_the_optimistic_interval() {
        let mut range = value_range();
        range.add_use_interval(10, 17);
        range.define_at(14);
        assert_eq!(range.intervals(), &[UseInterval::new(14, 17)]);

        let mut dead = value_range();
        dead.define_at(8);
        assert_eq!(dead.intervals(), &[UseInterval::new(8, 9)]);
    }

    #[test]
    #[traced_test]
    fn uses_stay_sorted_and_unique() {
        let mut range = value_range();
        range.add_use_interval(0, 20);
        range.add_use(15, SlotId::new(1));
        range.add_use(5, SlotId::new(2));
        range.add_use(9, SlotId::new(3));
        range.add_use(9, SlotId::new(3));
        let positions: Vec<u32> = range.uses().iter().map(|use_pos| use_pos.pos).collect();
        assert_eq!(positions, vec![5, 9, 15]);
    }

    #[test]
    #[traced_test]
    fn split_partitions_intervals_uses_and_safepoints() {
        let mut range = value_range();
        range.add_use_interval(20, 31);
        range.add_use_interval(4, 12);
        range.add_use(5, SlotId::new(0));
        range.add_use(11, SlotId::new(1));
        range.add_use(25, SlotId::new(2));
        range.add_safepoint(8, InstrId::new(0));
        range.add_safepoint(28, InstrId::new(1));

        let tail = range.split_off(10);
        assert_eq!(range.intervals(), &[UseInterval::new(4, 10)]);
        assert_eq!(tail.intervals(), &[UseInterval::new(10, 12), UseInterval::new(20, 31)]);
        assert_eq!(range.uses().len(), 1);
        assert_eq!(tail.uses().len(), 2);
        assert_eq!(range.safepoints()[0].pos, 9);
        assert_eq!(tail.safepoints()[0].pos, 29);
        assert_eq!(range.start(), 4);
        assert_eq!(tail.end(), 31);
    }

    #[test]
    #[traced_test]
    fn split_inside_a_hole_keeps_intervals_whole() {
        let mut range = value_range();
        range.add_use_interval(20, 30);
        range.add_use_interval(4, 12);
        let tail = range.split_off(16);
        assert_eq!(range.intervals(), &[UseInterval::new(4, 12)]);
        assert_eq!(tail.intervals(), &[UseInterval::new(20, 30)]);
    }

    #[test]
    #[traced_test]
    fn finger_finds_register_uses() {
        let mut locations: IndexVec<SlotId, Location<Target>> = IndexVec::new();
        let any = locations.push(Location::any());
        let register = locations.push(Location::Unallocated(Policy::RequiresRegister));
        let mut range = value_range();
        range.add_use_interval(2, 20);
        range.add_use(5, any);
        range.add_use(13, register);
        range.initialize_finger();
        assert_eq!(range.first_register_use(2, &locations).map(|u| u.pos), Some(13));
        assert_eq!(range.first_register_beneficial_use(2, &locations).map(|u| u.pos), Some(13));
        assert_eq!(range.first_interfering_use(12, &locations).map(|u| u.pos), Some(13));
        assert!(range.first_interfering_use(13, &locations).is_none());
        assert!(range.first_register_use(14, &locations).is_none());
        assert!(!range.advance_finger(10));
        assert!(range.advance_finger(20));
    }

    #[test]
    fn intersections() {
        let a = [UseInterval::new(0, 4), UseInterval::new(10, 14)];
        let b = [UseInterval::new(4, 8), UseInterval::new(12, 20)];
        assert_eq!(first_intersection(&a, &b), 12);
        assert_eq!(first_intersection(&a[..1], &b[..1]), MAX_POSITION);
    }
}
