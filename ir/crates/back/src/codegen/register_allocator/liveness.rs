use bitvec::vec::BitVec;
use index_vec::IndexVec;
use tracing::debug;

use crate::codegen::machine::{
    function::BasicBlockId,
    instr::EnvId,
    FlowGraph,
    InstrId,
    TargetMachine,
    Vreg,
};

/// Per block live-in, live-out and kill sets over virtual registers.
#[derive(Debug, Default, Clone)]
pub struct Liveness {
    live_in: IndexVec<BasicBlockId, BitVec>,
    live_out: IndexVec<BasicBlockId, BitVec>,
    kill: IndexVec<BasicBlockId, BitVec>,
}

impl Liveness {
    pub fn analyze<TM: TargetMachine>(graph: &FlowGraph<TM>) -> Self {
        let empty = BitVec::repeat(false, graph.max_vreg());
        let block_count = graph.blocks.len();
        let mut liveness = Self {
            live_in: index_vec::index_vec![empty.clone(); block_count],
            live_out: index_vec::index_vec![empty.clone(); block_count],
            kill: index_vec::index_vec![empty; block_count],
        };
        liveness.compute_initial_sets(graph);
        liveness.compute_live_in_and_live_out_sets(graph);
        liveness
    }

    pub fn live_in(&self, bb: BasicBlockId) -> &BitVec {
        &self.live_in[bb]
    }

    pub fn live_out(&self, bb: BasicBlockId) -> &BitVec {
        &self.live_out[bb]
    }

    pub fn kill(&self, bb: BasicBlockId) -> &BitVec {
        &self.kill[bb]
    }

    fn define<TM: TargetMachine>(&mut self, graph: &FlowGraph<TM>, bb: BasicBlockId, vreg: Vreg) {
        self.kill[bb].set(vreg.index(), true);
        self.live_in[bb].set(vreg.index(), false);
        if graph.repr(vreg).is_pair() {
            self.kill[bb].set(vreg.second_of_pair().index(), true);
            self.live_in[bb].set(vreg.second_of_pair().index(), false);
        }
    }

    fn use_value<TM: TargetMachine>(&mut self, graph: &FlowGraph<TM>, bb: BasicBlockId, vreg: Vreg) {
        self.live_in[bb].set(vreg.index(), true);
        if graph.repr(vreg).is_pair() {
            self.live_in[bb].set(vreg.second_of_pair().index(), true);
        }
    }

    fn use_environment<TM: TargetMachine>(&mut self, graph: &FlowGraph<TM>, bb: BasicBlockId, env: EnvId) {
        let mut current = Some(env);
        while let Some(env) = current {
            for value in &graph.environments[env].values {
                if !graph.is_constant(*value) {
                    self.use_value(graph, bb, *value);
                }
            }
            current = graph.environments[env].outer;
        }
    }

    fn compute_initial_sets<TM: TargetMachine>(&mut self, graph: &FlowGraph<TM>) {
        for bb in graph.cfg().postorder() {
            let block = &graph.blocks[bb];
            for instr_id in block.instructions.iter().rev() {
                let instr = &graph.instrs[*instr_id];
                if let Some(output) = instr.output {
                    self.define(graph, bb, output);
                }
                for (input, slots) in instr.inputs.iter().zip(&instr.locs.inputs) {
                    if graph.location(slots.first()).is_constant() {
                        continue;
                    }
                    self.use_value(graph, bb, *input);
                }
                if let Some(env) = instr.env {
                    self.use_environment(graph, bb, env);
                }
            }
            for phi_id in &block.phis {
                let phi = &graph.instrs[*phi_id];
                if let Some(output) = phi.output {
                    self.define(graph, bb, output);
                }
                // An input not defined by its predecessor is live into it.
                for (input, pred) in phi.inputs.iter().zip(&block.preds) {
                    if graph.is_constant(*input) {
                        continue;
                    }
                    if !self.kill[*pred][input.index()] {
                        self.use_value(graph, *pred, *input);
                    }
                }
            }
            let initial_definitions: &[InstrId] = &block.initial_definitions;
            for instr_id in initial_definitions {
                if let Some(output) = graph.instrs[*instr_id].output {
                    self.define(graph, bb, output);
                }
            }
        }
    }

    fn compute_live_in_and_live_out_sets<TM: TargetMachine>(&mut self, graph: &FlowGraph<TM>) {
        let mut changed = true;
        let mut rounds = 0;
        while changed {
            changed = false;
            rounds += 1;
            for bb in graph.cfg().postorder() {
                if self.update_live_out(graph, bb) && self.update_live_in(bb) {
                    changed = true;
                }
            }
        }
        debug!("Liveness converged after {rounds} rounds");
    }

    fn update_live_out<TM: TargetMachine>(&mut self, graph: &FlowGraph<TM>, bb: BasicBlockId) -> bool {
        let mut changed = false;
        for succ in &graph.blocks[bb].succs {
            let live_in: Vec<usize> = self.live_in[*succ].iter_ones().collect();
            for vreg in live_in {
                if !self.live_out[bb][vreg] {
                    self.live_out[bb].set(vreg, true);
                    changed = true;
                }
            }
        }
        changed
    }

    fn update_live_in(&mut self, bb: BasicBlockId) -> bool {
        let mut changed = false;
        let live_out: Vec<usize> = self.live_out[bb].iter_ones().collect();
        for vreg in live_out {
            if !self.kill[bb][vreg] && !self.live_in[bb][vreg] {
                self.live_in[bb].set(vreg, true);
                changed = true;
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::Liveness;
    use crate::codegen::{
        machine::{
            function::Builder,
            Location,
            Representation,
        },
        targets::x86_64::Target,
    };

    #[test]
    #[traced_test]
    fn loop_carried_values_are_live_around_the_loop() {
        let mut b = Builder::<Target>::new();
        let entry = b.entry();
        let header = b.create_block();
        let body = b.create_block();
        let exit = b.create_block();
        let x = b.parameter(Representation::Tagged);
        let y = b.parameter(Representation::Tagged);
        b.goto(entry, header);
        let phi = b.phi(header, Representation::Tagged);
        b.branch(header, phi, body, exit);
        let next = b
            .op(body, "Add")
            .input(phi, Location::requires_register())
            .input(x, Location::any())
            .output(Representation::Tagged, Location::requires_register())
            .value();
        b.goto(body, header);
        b.phi_input(phi, entry, y);
        b.phi_input(phi, body, next);
        b.ret(exit, phi);
        let graph = b.finish();

        let liveness = Liveness::analyze(&graph);
        assert!(liveness.live_in(header)[x.index()]);
        assert!(liveness.live_out(body)[x.index()]);
        assert!(!liveness.live_out(body)[next.index()]);
        assert!(!liveness.live_in(header)[phi.index()]);
        assert!(liveness.kill(header)[phi.index()]);
        assert!(!liveness.live_out(entry)[y.index()]);
        assert!(!liveness.live_in(entry)[y.index()]);
        assert!(!liveness.live_in(exit)[x.index()]);
    }
}
