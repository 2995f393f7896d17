//! Dependency-ordered firing schedule for the continuous domain.
//!
//! The schedule is computed over ports, not actors: every channel
//! contributes a producer-to-consumer edge, and every actor that declares
//! direct feedthrough contributes input-to-output edges. Integrating
//! actors declare no feedthrough, which is what breaks feedback loops -
//! their output at time t does not depend on their input at time t.
//!
//! A directed cycle in this graph is an algebraic loop the kernel cannot
//! resolve; it is reported as a fatal error before execution starts, never
//! retried. Otherwise the ports are topologically sorted (producers
//! first), consecutive ports of the same actor collapse into a single
//! firing, and input ports with no incoming channels are skipped.
//!
//! An actor may legitimately appear more than once in the resulting list:
//! an integrator's output port sorts before the actors that compute its
//! derivative, and its input port after them, so one pass of the schedule
//! both publishes the integrator's state and feeds it back.

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use rivulet_core::{ActorId, CoreError, ModelGraph};

/// Scheduler error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// The model contains a cycle of same-time dependencies
    #[error("model is not schedulable: algebraic loop among actors: {}", .actors.join(", "))]
    AlgebraicLoop {
        /// Names of the actors on the cycle
        actors: Vec<String>,
    },

    /// Underlying graph lookup failure
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// One dependency-ordered pass over the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    /// Actor firings in execution order, consecutively deduplicated
    pub firings: Vec<ActorId>,
}

impl Schedule {
    /// Each scheduled actor once, in first-firing order
    #[must_use]
    pub fn unique_actors(&self) -> Vec<ActorId> {
        let set: IndexSet<ActorId> = self.firings.iter().copied().collect();
        set.into_iter().collect()
    }
}

/// Computes dependency-ordered firing schedules
pub struct ContScheduler;

#[derive(Clone, Copy, PartialEq, Eq)]
enum PortKind {
    Input,
    Output,
}

struct PortNode {
    actor: ActorId,
    kind: PortKind,
    connected: bool,
}

impl ContScheduler {
    /// Compute the firing schedule for the current topology
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::AlgebraicLoop`] if the model mixes
    /// same-time dependencies into a cycle, or a graph lookup error.
    pub fn compute(graph: &ModelGraph) -> Result<Schedule, SchedulerError> {
        // Lay out one node per port: inputs first, then outputs, actor by
        // actor in insertion order.
        let mut nodes = Vec::new();
        let mut input_base = vec![0usize; graph.actor_count()];
        let mut output_base = vec![0usize; graph.actor_count()];

        for id in graph.actor_ids() {
            if graph.is_disabled(id) {
                continue;
            }
            input_base[id.0] = nodes.len();
            for port in graph.input_ports(id)? {
                nodes.push(PortNode {
                    actor: id,
                    kind: PortKind::Input,
                    connected: !port.channels.is_empty(),
                });
            }
            output_base[id.0] = nodes.len();
            for _ in graph.output_ports(id)? {
                nodes.push(PortNode {
                    actor: id,
                    kind: PortKind::Output,
                    connected: true,
                });
            }
        }

        let mut edges: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];

        // Producer-to-consumer edges from every internal channel.
        for id in graph.actor_ids() {
            if graph.is_disabled(id) {
                continue;
            }
            for (port_index, port) in graph.output_ports(id)?.iter().enumerate() {
                for channel_id in &port.channels {
                    let Some(channel) = graph.channel(*channel_id) else {
                        continue;
                    };
                    let (target, target_port) = channel.target();
                    if graph.is_disabled(target) {
                        continue;
                    }
                    let from = output_base[id.0] + port_index;
                    let to = input_base[target.0] + target_port;
                    edges[from].push(to);
                }
            }
        }

        // Same-time input-to-output edges inside feedthrough actors.
        for id in graph.actor_ids() {
            if graph.is_disabled(id) || !graph.direct_feedthrough(id) {
                continue;
            }
            let inputs = graph.input_ports(id)?.len();
            let outputs = graph.output_ports(id)?.len();
            for i in 0..inputs {
                for o in 0..outputs {
                    edges[input_base[id.0] + i].push(output_base[id.0] + o);
                }
            }
        }

        let order = Self::topological_order(graph, &nodes, &edges)?;

        // Collapse ports into firings: skip unconnected inputs, merge
        // consecutive ports of the same actor.
        let mut firings: Vec<ActorId> = Vec::new();
        for node_index in order {
            let node = &nodes[node_index];
            if node.kind == PortKind::Input && !node.connected {
                continue;
            }
            if firings.last() != Some(&node.actor) {
                firings.push(node.actor);
            }
        }

        Ok(Schedule { firings })
    }

    /// Reverse post-order DFS; detects cycles and names the actors on one.
    fn topological_order(
        graph: &ModelGraph,
        nodes: &[PortNode],
        edges: &[Vec<usize>],
    ) -> Result<Vec<usize>, SchedulerError> {
        const WHITE: u8 = 0;
        const GRAY: u8 = 1;
        const BLACK: u8 = 2;

        let mut color = vec![WHITE; nodes.len()];
        let mut post_order = Vec::with_capacity(nodes.len());

        for start in 0..nodes.len() {
            if color[start] != WHITE {
                continue;
            }
            // Iterative DFS; the stack holds (node, next-edge-index).
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
            color[start] = GRAY;

            loop {
                let (node, edge_index) = match stack.last_mut() {
                    Some(frame) => {
                        let current = (frame.0, frame.1);
                        frame.1 += 1;
                        current
                    }
                    None => break,
                };
                if let Some(&next) = edges[node].get(edge_index) {
                    match color[next] {
                        WHITE => {
                            color[next] = GRAY;
                            stack.push((next, 0));
                        }
                        GRAY => {
                            return Err(Self::algebraic_loop(graph, nodes, &stack, next));
                        }
                        _ => {}
                    }
                } else {
                    color[node] = BLACK;
                    post_order.push(node);
                    stack.pop();
                }
            }
        }

        post_order.reverse();
        Ok(post_order)
    }

    fn algebraic_loop(
        graph: &ModelGraph,
        nodes: &[PortNode],
        stack: &[(usize, usize)],
        reentry: usize,
    ) -> SchedulerError {
        let cycle_start = stack
            .iter()
            .position(|&(node, _)| node == reentry)
            .unwrap_or(0);
        let mut actors: Vec<String> = Vec::new();
        for &(node, _) in &stack[cycle_start..] {
            let name = graph
                .actor_name(nodes[node].actor)
                .unwrap_or("<unknown>")
                .to_string();
            if !actors.contains(&name) {
                actors.push(name);
            }
        }
        SchedulerError::AlgebraicLoop { actors }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rivulet_core::library::{Gain, Recorder};
    use rivulet_core::{Actor, CoreResult, FiringContext, PortSpec};

    /// Minimal integrating actor: breaks same-time dependency loops.
    struct LoopBreaker;

    impl Actor for LoopBreaker {
        fn input_ports(&self) -> Vec<PortSpec> {
            vec![PortSpec::new("derivative")]
        }

        fn output_ports(&self) -> Vec<PortSpec> {
            vec![PortSpec::new("state")]
        }

        fn fire(&mut self, _ctx: &mut FiringContext<'_>) -> CoreResult<()> {
            Ok(())
        }

        fn direct_feedthrough(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_feedback_through_integrator_schedules() {
        let mut g = ModelGraph::new();
        let integ = g.add_actor("integ", Box::new(LoopBreaker)).unwrap();
        let gain = g.add_actor("gain", Box::new(Gain::new(-1.0))).unwrap();
        g.connect(integ, 0, gain, 0).unwrap();
        g.connect(gain, 0, integ, 0).unwrap();

        let schedule = ContScheduler::compute(&g).unwrap();
        // The integrator both opens and closes the pass.
        assert_eq!(schedule.firings, vec![integ, gain, integ]);
    }

    #[test]
    fn test_algebraic_loop_is_fatal_and_names_actors() {
        let mut g = ModelGraph::new();
        let a = g.add_actor("a", Box::new(Gain::new(2.0))).unwrap();
        let b = g.add_actor("b", Box::new(Gain::new(3.0))).unwrap();
        g.connect(a, 0, b, 0).unwrap();
        g.connect(b, 0, a, 0).unwrap();

        let err = ContScheduler::compute(&g).unwrap_err();
        match err {
            SchedulerError::AlgebraicLoop { actors } => {
                assert!(actors.contains(&"a".to_string()));
                assert!(actors.contains(&"b".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_chain_orders_producers_first() {
        let mut g = ModelGraph::new();
        let (rec, _tap) = Recorder::with_tap();
        let sink = g.add_actor("sink", Box::new(rec)).unwrap();
        let gain = g.add_actor("gain", Box::new(Gain::new(1.0))).unwrap();
        let src = g.add_actor("src", Box::new(LoopBreaker)).unwrap();
        g.connect(src, 0, gain, 0).unwrap();
        g.connect(gain, 0, sink, 0).unwrap();

        let schedule = ContScheduler::compute(&g).unwrap();
        let pos = |id: ActorId| schedule.firings.iter().position(|&x| x == id).unwrap();
        assert!(pos(src) < pos(gain));
        assert!(pos(gain) < pos(sink));
    }

    #[test]
    fn test_unconnected_input_is_skipped() {
        let mut g = ModelGraph::new();
        // A gain with no incoming channel contributes only its output port.
        let gain = g.add_actor("gain", Box::new(Gain::new(1.0))).unwrap();
        let (rec, _tap) = Recorder::with_tap();
        let sink = g.add_actor("sink", Box::new(rec)).unwrap();
        g.connect(gain, 0, sink, 0).unwrap();

        let schedule = ContScheduler::compute(&g).unwrap();
        assert_eq!(schedule.firings, vec![gain, sink]);
    }

    #[test]
    fn test_disabled_actor_excluded() {
        let mut g = ModelGraph::new();
        let gain = g.add_actor("gain", Box::new(Gain::new(1.0))).unwrap();
        let (rec, _tap) = Recorder::with_tap();
        let sink = g.add_actor("sink", Box::new(rec)).unwrap();
        g.connect(gain, 0, sink, 0).unwrap();
        g.disable(gain);

        let schedule = ContScheduler::compute(&g).unwrap();
        assert_eq!(schedule.firings, vec![sink]);
    }

    #[test]
    fn test_diamond_double_integrator() {
        let mut g = ModelGraph::new();
        let i1 = g.add_actor("i1", Box::new(LoopBreaker)).unwrap();
        let i2 = g.add_actor("i2", Box::new(LoopBreaker)).unwrap();
        let sum = g
            .add_actor("sum", Box::new(rivulet_core::library::AddSubtract))
            .unwrap();
        g.connect(i1, 0, sum, 0).unwrap();
        g.connect(i2, 0, sum, 0).unwrap();
        g.connect(sum, 0, i1, 0).unwrap();
        g.connect(sum, 0, i2, 0).unwrap();

        let schedule = ContScheduler::compute(&g).unwrap();
        let pos_first = |id: ActorId| schedule.firings.iter().position(|&x| x == id).unwrap();
        let pos_last = |id: ActorId| schedule.firings.iter().rposition(|&x| x == id).unwrap();
        // Both integrators publish before the adder and integrate after it.
        assert!(pos_first(i1) < pos_first(sum));
        assert!(pos_first(i2) < pos_first(sum));
        assert!(pos_last(i1) > pos_first(sum));
        assert!(pos_last(i2) > pos_first(sum));
    }
}
