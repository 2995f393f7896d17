//! End-to-end tests of the adaptive-step integration loop.

use rivulet_core::library::{Gain, Recorder, RecorderTap};
use rivulet_core::{Actor, CoreResult, FiringContext, ModelGraph, PortSpec, StepSizeControl};
use rivulet_cont::{ContConfig, ContDirector, ContError, Integrator, SolverKind};

/// Monitors a signal and vetoes a configured number of integration steps,
/// suggesting a fixed smaller step each time.
struct StepVeto {
    vetoes_remaining: usize,
    refined: f64,
    polls: usize,
}

impl StepVeto {
    fn new(vetoes: usize, refined: f64) -> Self {
        Self {
            vetoes_remaining: vetoes,
            refined,
            polls: 0,
        }
    }
}

impl Actor for StepVeto {
    fn input_ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::new("in")]
    }

    fn fire(&mut self, _ctx: &mut FiringContext<'_>) -> CoreResult<()> {
        Ok(())
    }

    fn step_size_control(&mut self) -> Option<&mut dyn StepSizeControl> {
        Some(self)
    }
}

impl StepSizeControl for StepVeto {
    fn is_step_size_accurate(&mut self) -> bool {
        self.polls += 1;
        if self.vetoes_remaining > 0 {
            self.vetoes_remaining -= 1;
            false
        } else {
            true
        }
    }

    fn refined_step_size(&self) -> f64 {
        self.refined
    }

    fn predicted_step_size(&self) -> f64 {
        f64::INFINITY
    }
}

/// dx/dt = -x feedback loop with a recorder on the state.
fn decay_model(graph: &mut ModelGraph, initial: f64) -> RecorderTap {
    let integ = graph
        .add_actor("integrator", Box::new(Integrator::new(initial)))
        .unwrap();
    let gain = graph.add_actor("gain", Box::new(Gain::new(-1.0))).unwrap();
    let (rec, tap) = Recorder::with_tap();
    let sink = graph.add_actor("recorder", Box::new(rec)).unwrap();
    graph.connect(integ, 0, gain, 0).unwrap();
    graph.connect(gain, 0, integ, 0).unwrap();
    graph.connect(integ, 0, sink, 0).unwrap();
    tap
}

fn run_collecting_steps(
    director: &mut ContDirector,
    graph: &mut ModelGraph,
) -> Result<Vec<f64>, ContError> {
    director.initialize(graph)?;
    let mut steps = Vec::new();
    loop {
        assert!(steps.len() < 100, "runaway execution");
        if !director.prefire(graph)? {
            break;
        }
        director.fire(graph)?;
        steps.push(director.current_step_size());
        if !director.postfire(graph)? {
            break;
        }
    }
    Ok(steps)
}

#[test]
fn breakpoint_clipped_step_sequence() {
    let mut graph = ModelGraph::new();
    let tap = decay_model(&mut graph, 1.0);

    let mut config = ContConfig::default();
    config.set_stop_time(1.0).unwrap();
    config.set_init_step_size(0.25).unwrap();
    config.set_solver(SolverKind::ForwardEuler);
    let mut director = ContDirector::new(config, false).unwrap();
    director.initialize(&mut graph).unwrap();
    director.fire_at_seconds("test", 0.6).unwrap();

    let mut steps = Vec::new();
    loop {
        assert!(steps.len() < 100, "runaway execution");
        if !director.prefire(&mut graph).unwrap() {
            break;
        }
        director.fire(&mut graph).unwrap();
        steps.push(director.current_step_size());
        if !director.postfire(&mut graph).unwrap() {
            break;
        }
    }

    // Breakpoints at the current time produce zero-step discrete
    // iterations; the integration steps are the nonzero entries.
    let nonzero: Vec<f64> = steps.iter().copied().filter(|s| *s > 0.0).collect();
    let expected = [0.25, 0.25, 0.10, 0.25, 0.15];
    assert_eq!(nonzero.len(), expected.len(), "steps: {steps:?}");
    for (actual, wanted) in nonzero.iter().zip(expected) {
        assert!(
            (actual - wanted).abs() < 1e-9,
            "steps: {nonzero:?}, expected {expected:?}"
        );
    }

    // Forward Euler over exactly those steps is deterministic arithmetic:
    // x scales by (1 - h) at each nonzero step.
    let last = tap.samples().last().copied().unwrap();
    assert!((last.time - 1.0).abs() < 1e-9);
    let expected_final = 0.75 * 0.75 * 0.9 * 0.75 * 0.85;
    assert!((last.token.as_double().unwrap() - expected_final).abs() < 1e-12);
}

#[test]
fn accuracy_gated_commit_keeps_candidate_step() {
    let mut graph = ModelGraph::new();
    let _tap = decay_model(&mut graph, 1.0);

    let mut config = ContConfig::default();
    config.set_init_step_size(0.25).unwrap();
    config.set_solver(SolverKind::ForwardEuler);
    let mut director = ContDirector::new(config, false).unwrap();

    director.initialize(&mut graph).unwrap();
    director.prefire(&mut graph).unwrap();
    director.fire(&mut graph).unwrap();
    // Every control actor accepted the first attempt: the committed step
    // is exactly the chosen candidate.
    assert_eq!(director.current_step_size(), 0.25);
}

#[test]
fn rejected_step_rolls_back_and_retries_smaller() {
    // Run A: a monitor vetoes the first attempt and suggests 0.125.
    let mut graph_a = ModelGraph::new();
    let tap_a = decay_model(&mut graph_a, 1.0);
    let integ = graph_a.actor_by_name("integrator").unwrap();
    let veto = graph_a
        .add_actor("veto", Box::new(StepVeto::new(1, 0.125)))
        .unwrap();
    graph_a.connect(integ, 0, veto, 0).unwrap();

    let mut config = ContConfig::default();
    config.set_stop_time(0.125).unwrap();
    config.set_init_step_size(0.25).unwrap();
    config.set_solver(SolverKind::ForwardEuler);
    let mut director_a = ContDirector::new(config.clone(), false).unwrap();
    run_collecting_steps(&mut director_a, &mut graph_a).unwrap();

    // Run B: no veto, the step is 0.125 from the start.
    let mut graph_b = ModelGraph::new();
    let tap_b = decay_model(&mut graph_b, 1.0);
    let mut config_b = ContConfig::default();
    config_b.set_stop_time(0.125).unwrap();
    config_b.set_init_step_size(0.125).unwrap();
    config_b.set_solver(SolverKind::ForwardEuler);
    let mut director_b = ContDirector::new(config_b, false).unwrap();
    run_collecting_steps(&mut director_b, &mut graph_b).unwrap();

    // The rolled-back retry must reproduce the direct run exactly.
    let a = tap_a.samples();
    let b = tap_b.samples();
    assert_eq!(a.first().map(|s| s.token), b.first().map(|s| s.token));
    assert!((a[0].time - 0.125).abs() < 1e-9);
    assert_eq!(a[0].token.as_double().unwrap(), 0.875);
}

#[test]
fn rollback_and_rerun_is_deterministic() {
    let build = || {
        let mut graph = ModelGraph::new();
        let tap = decay_model(&mut graph, 1.0);
        let integ = graph.actor_by_name("integrator").unwrap();
        let veto = graph
            .add_actor("veto", Box::new(StepVeto::new(2, 0.0625)))
            .unwrap();
        graph.connect(integ, 0, veto, 0).unwrap();
        (graph, tap)
    };

    let mut config = ContConfig::default();
    config.set_stop_time(0.5).unwrap();
    config.set_init_step_size(0.25).unwrap();
    config.set_solver(SolverKind::ForwardEuler);

    let (mut graph1, tap1) = build();
    let mut director1 = ContDirector::new(config.clone(), false).unwrap();
    let steps1 = run_collecting_steps(&mut director1, &mut graph1).unwrap();

    let (mut graph2, tap2) = build();
    let mut director2 = ContDirector::new(config, false).unwrap();
    let steps2 = run_collecting_steps(&mut director2, &mut graph2).unwrap();

    assert_eq!(steps1, steps2);
    assert_eq!(tap1.samples(), tap2.samples());
}

#[test]
fn every_control_actor_is_polled_even_after_a_veto() {
    // Two vetoing monitors: both must be polled on the failing attempt.
    let mut graph = ModelGraph::new();
    let _tap = decay_model(&mut graph, 1.0);
    let integ = graph.actor_by_name("integrator").unwrap();
    let veto1 = graph
        .add_actor("veto1", Box::new(StepVeto::new(1, 0.125)))
        .unwrap();
    let veto2 = graph
        .add_actor("veto2", Box::new(StepVeto::new(1, 0.125)))
        .unwrap();
    graph.connect(integ, 0, veto1, 0).unwrap();
    graph.connect(integ, 0, veto2, 0).unwrap();

    let mut config = ContConfig::default();
    config.set_stop_time(0.125).unwrap();
    config.set_init_step_size(0.25).unwrap();
    config.set_solver(SolverKind::ForwardEuler);
    let mut director = ContDirector::new(config, false).unwrap();
    director.initialize(&mut graph).unwrap();
    director.prefire(&mut graph).unwrap();
    director.fire(&mut graph).unwrap();

    // Both vetoes were consumed on the first attempt (no short-circuit),
    // so the second attempt found both accurate.
    assert_eq!(director.current_step_size(), 0.125);
}

#[test]
fn under_resolution_refinement_is_fatal_after_retry() {
    let mut graph = ModelGraph::new();
    let _tap = decay_model(&mut graph, 1.0);
    let integ = graph.actor_by_name("integrator").unwrap();
    // Vetoes forever, refining to zero: one clamp to the resolution is
    // tolerated, the second consecutive failure aborts.
    let veto = graph
        .add_actor("veto", Box::new(StepVeto::new(usize::MAX, 0.0)))
        .unwrap();
    graph.connect(integ, 0, veto, 0).unwrap();

    let mut config = ContConfig::default();
    config.set_stop_time(1.0).unwrap();
    config.set_init_step_size(0.25).unwrap();
    config.set_solver(SolverKind::ForwardEuler);
    let mut director = ContDirector::new(config, false).unwrap();
    director.initialize(&mut graph).unwrap();
    director.prefire(&mut graph).unwrap();
    let err = director.fire(&mut graph).unwrap_err();
    assert!(matches!(err, ContError::StepSizeTooSmall { .. }));
}

#[test]
fn rk23_tracks_exponential_decay() {
    let mut graph = ModelGraph::new();
    let tap = decay_model(&mut graph, 1.0);

    let mut config = ContConfig::default();
    config.set_stop_time(0.5).unwrap();
    config.set_init_step_size(0.1).unwrap();
    config.set_solver(SolverKind::ExplicitRk23);
    let mut director = ContDirector::new(config, false).unwrap();
    director.run(&mut graph).unwrap();

    let samples = tap.samples();
    assert!(!samples.is_empty());
    for sample in &samples {
        let analytic = (-sample.time).exp();
        let actual = sample.token.as_double().unwrap();
        assert!(
            (actual - analytic).abs() < 1e-2,
            "at t={} got {} want {}",
            sample.time,
            actual,
            analytic
        );
    }
    let last = samples.last().unwrap();
    assert!((last.time - 0.5).abs() < 1e-9);
}

#[test]
fn rk23_shrinks_step_under_tight_tolerance() {
    let mut graph = ModelGraph::new();
    let tap = decay_model(&mut graph, 1.0);

    let mut config = ContConfig::default();
    config.set_stop_time(0.2).unwrap();
    config.set_init_step_size(0.2).unwrap();
    config.set_error_tolerance(1e-9).unwrap();
    config.set_solver(SolverKind::ExplicitRk23);
    let mut director = ContDirector::new(config, false).unwrap();

    director.initialize(&mut graph).unwrap();
    director.prefire(&mut graph).unwrap();
    director.fire(&mut graph).unwrap();
    // The 0.2 candidate cannot meet a 1e-9 tolerance; the committed step
    // is the result of at least one rollback-and-halve.
    assert!(director.current_step_size() < 0.2);
    director.postfire(&mut graph).unwrap();

    let first = tap.samples()[0];
    assert!((first.token.as_double().unwrap() - (-first.time).exp()).abs() < 1e-6);
}

#[test]
fn backward_euler_converges_by_fixed_point() {
    let mut graph = ModelGraph::new();
    let tap = decay_model(&mut graph, 1.0);

    let mut config = ContConfig::default();
    config.set_stop_time(1.0).unwrap();
    config.set_init_step_size(0.25).unwrap();
    config.set_solver(SolverKind::BackwardEuler);
    let mut director = ContDirector::new(config, false).unwrap();
    director.run(&mut graph).unwrap();

    // Implicit Euler on dx/dt = -x divides by (1 + h) each step:
    // four steps of 0.25 from 1.0 give 1 / 1.25^4.
    let last = tap.samples().last().copied().unwrap();
    let expected = 1.0 / 1.25_f64.powi(4);
    assert!(
        (last.token.as_double().unwrap() - expected).abs() < 1e-4,
        "got {}",
        last.token
    );
}

#[test]
fn rk45_default_runs_to_stop_time() {
    let mut graph = ModelGraph::new();
    let tap = decay_model(&mut graph, 1.0);

    let mut config = ContConfig::default();
    config.set_stop_time(1.0).unwrap();
    let mut director = ContDirector::new(config, false).unwrap();
    director.run(&mut graph).unwrap();

    let last = tap.samples().last().copied().unwrap();
    assert!((last.time - 1.0).abs() < 1e-9);
    assert!(
        (last.token.as_double().unwrap() - (-1.0_f64).exp()).abs() < 1e-2,
        "got {}",
        last.token
    );
}
