use bitvec::vec::BitVec;
use tracing::trace;

use crate::codegen::{
    machine::{
        FrameBase,
        Location,
        RegisterKind,
        SlotWidth,
        StackSlot,
        TargetMachine,
    },
    register_allocator::{
        live_range::LiveRangeId,
        FlowGraphAllocator,
    },
};

/// Spill slots of the current pass and the position at which each becomes free.
///
/// A quad value takes two consecutive slots.
#[derive(Debug, Default, Clone)]
pub(super) struct SpillSlots {
    expiry: Vec<u32>,
    quad: BitVec,
    untagged: BitVec,
}

impl SpillSlots {
    pub fn len(&self) -> usize {
        self.expiry.len()
    }

    pub fn clear(&mut self) {
        self.expiry.clear();
        self.quad.clear();
        self.untagged.clear();
    }

    fn pad_to(&mut self, len: usize) {
        while self.expiry.len() < len {
            self.expiry.push(u32::MAX);
            self.quad.push(false);
            self.untagged.push(false);
        }
    }

    /// Keeps slot `index` occupied until `expiry`.
    pub fn reserve(&mut self, index: usize, expiry: u32) {
        self.pad_to(index + 1);
        self.expiry[index] = expiry;
    }

    /// Finds a slot of the same shape that is free at `start`, searching from
    /// `first`, or appends a new one. Returns the index to address the value by.
    pub fn allocate(&mut self, first: usize, start: u32, end: u32, need_quad: bool, need_untagged: bool) -> usize {
        let found = (first..self.len())
            .find(|index| self.quad[*index] == need_quad && self.untagged[*index] == need_untagged && self.expiry[*index] <= start);
        let index = match found {
            Some(index) => index,
            None => {
                self.pad_to(first);
                let index = self.len();
                for _ in 0..if need_quad { 2 } else { 1 } {
                    self.expiry.push(0);
                    self.quad.push(need_quad);
                    self.untagged.push(need_untagged);
                }
                index
            }
        };
        self.expiry[index] = end;
        if need_quad {
            debug_assert!(self.quad[index + 1]);
            self.expiry[index + 1] = end;
            // The higher index has the lower address.
            return index + 1;
        }
        index
    }
}

impl<TM: TargetMachine> FlowGraphAllocator<'_, TM> {
    /// Moves `range` to its parent's spill slot for its whole lifetime.
    pub(super) fn spill(&mut self, range: LiveRangeId) {
        let parent = self.parent_of(range).expect("only values are spilled");
        let spill_slot = self.spill_slot_of(parent);
        trace!("Spilling {} to {spill_slot}", self.ranges[range]);
        self.ranges[range].assigned = spill_slot;
        self.convert_all_uses(range);
    }

    /// The spill slot of `parent`, allocated on first request.
    pub(super) fn spill_slot_of(&mut self, parent: LiveRangeId) -> Location<TM> {
        if self.ranges[parent].spill_slot.is_invalid() {
            self.allocate_spill_slot_for(parent);
            if self.ranges[parent].repr.is_tagged() {
                self.mark_as_object_at_safepoints(parent);
            }
        }
        self.ranges[parent].spill_slot
    }

    /// Spills `range` from `from` on. Inside a loop the spill is hoisted to
    /// the header when the value has no constrained uses in the loop.
    pub(super) fn spill_after(&mut self, range: LiveRangeId, from: u32) {
        let mut from = from;
        let block = self.numbering.block_entry_at(from);
        if let Some(loop_id) = self.graph.cfg().loop_of(block) {
            let header_start = self.graph.blocks[self.graph.cfg().loop_info(loop_id).header].start_pos;
            let unconstrained = self
                .parent_of(range)
                .map_or(false, |parent| self.ranges[parent].has_only_unconstrained_uses_in_loop(loop_id));
            if self.ranges[range].start() <= header_start && unconstrained {
                debug_assert!(header_start <= from);
                trace!("Hoisting spill of {} to loop header at {header_start}", self.ranges[range]);
                from = header_start;
            }
        }
        let tail = self.split_at(range, from);
        self.spill(tail);
    }

    /// Spills `range` on `[from, to)` and queues the rest for allocation.
    pub(super) fn spill_between(&mut self, range: LiveRangeId, from: u32, to: u32) {
        debug_assert!(from < to);
        let tail = self.split_at(range, from);
        if self.ranges[tail].start() < to {
            let tail_tail = self.split_between(tail, self.ranges[tail].start(), to);
            self.spill(tail);
            self.add_to_unallocated(tail_tail);
        } else {
            self.add_to_unallocated(tail);
        }
    }

    fn allocate_spill_slot_for(&mut self, parent: LiveRangeId) {
        debug_assert!(self.ranges[parent].spill_slot.is_invalid());
        let start = self.ranges[parent].start();
        let last = self.siblings(parent).last().unwrap_or(parent);
        let end = self.ranges[last].end();

        let kind = self.register_file.kind;
        let repr = self.ranges[parent].repr;
        let need_quad = kind == RegisterKind::Fpu && repr.is_quad();
        let need_untagged = kind == RegisterKind::Cpu && !repr.is_tagged();
        let first = match kind {
            RegisterKind::Cpu => self.config.reserved_catch_slots,
            RegisterKind::Fpu => 0,
        };
        let index = self
            .spill_slots
            .allocate(first, start, end, need_quad, need_untagged);

        let slot = match kind {
            RegisterKind::Cpu => StackSlot::word(TM::FRAME_LAYOUT.frame_slot_for_spill_index(index)),
            RegisterKind::Fpu => {
                let factor = TM::DOUBLE_SPILL_FACTOR;
                StackSlot {
                    index: TM::FRAME_LAYOUT
                        .frame_slot_for_spill_index(self.cpu_spill_slot_count + index * factor + factor - 1),
                    base: FrameBase::FramePointer,
                    width: if need_quad { SlotWidth::Quad } else { SlotWidth::Double },
                }
            }
        };
        trace!("Allocated spill slot {index} for {}", self.ranges[parent]);
        self.ranges[parent].spill_slot = Location::Stack(slot);
        self.spilled.push(parent);
    }

    /// Records the spill slot of `parent` as holding a tagged value at every
    /// safepoint the value is live across.
    pub(super) fn mark_as_object_at_safepoints(&mut self, parent: LiveRangeId) {
        let slot = self.ranges[parent]
            .spill_slot
            .stack_slot()
            .expect("tagged values spill to the stack");
        let Some(spill_index) = TM::FRAME_LAYOUT.spill_index_for_frame_slot(slot.index) else {
            return;
        };
        let siblings: Vec<LiveRangeId> = self.siblings(parent).collect();
        for range in siblings {
            for index in 0..self.ranges[range].safepoints().len() {
                let instr = self.ranges[range].safepoints()[index].instr;
                self.graph.instrs[instr].locs.set_stack_bit(spill_index);
            }
        }
    }
}
