//! RIVULET CLI
//!
//! Small demo models for the continuous-time and dynamic dataflow kernels.

#![warn(missing_docs)]
#![warn(clippy::all)]

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing::info;

use rivulet_core::library::{Gain, Ramp, Recorder};
use rivulet_core::{ModelGraph, Token};
use rivulet_cont::{ContConfig, ContDirector, Integrator, SolverKind};
use rivulet_ddf::{DdfConfig, DdfDirector};

#[derive(Parser)]
#[command(name = "rivulet")]
#[command(about = "RIVULET - continuous-time and dynamic dataflow simulation kernel", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Integrate dx/dt = -x with the continuous-time director
    Cont {
        /// Stop time in seconds
        #[arg(long, default_value_t = 1.0)]
        stop_time: f64,
        /// Initial step size in seconds
        #[arg(long, default_value_t = 0.1)]
        init_step: f64,
        /// ODE solver: ForwardEuler, BackwardEuler, ExplicitRK23, ExplicitRK45
        #[arg(long, default_value = "ExplicitRK45")]
        solver: String,
        /// Optional breakpoint the integration must land on exactly
        #[arg(long)]
        breakpoint: Option<f64>,
        /// Sleep to keep model time aligned with wall-clock time
        #[arg(long, default_value_t = false)]
        real_time: bool,
    },
    /// Run a ramp through a gain with the dynamic dataflow director
    Ddf {
        /// Number of logical iterations (0 = unbounded)
        #[arg(long, default_value_t = 10)]
        iterations: u64,
        /// Receiver capacity bound (0 = unbounded)
        #[arg(long, default_value_t = 0)]
        capacity: usize,
        /// Gain factor applied to the ramp
        #[arg(long, default_value_t = 2.0)]
        factor: f64,
    },
}

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Cont {
            stop_time,
            init_step,
            solver,
            breakpoint,
            real_time,
        } => run_cont(stop_time, init_step, &solver, breakpoint, real_time),
        Commands::Ddf {
            iterations,
            capacity,
            factor,
        } => run_ddf(iterations, capacity, factor),
    }
}

fn run_cont(
    stop_time: f64,
    init_step: f64,
    solver: &str,
    breakpoint: Option<f64>,
    real_time: bool,
) -> Result<()> {
    let solver: SolverKind = solver.parse()?;

    let mut graph = ModelGraph::new();
    let integ = graph.add_actor("integrator", Box::new(Integrator::new(1.0)))?;
    let gain = graph.add_actor("gain", Box::new(Gain::new(-1.0)))?;
    let (recorder, tap) = Recorder::with_tap();
    let sink = graph.add_actor("recorder", Box::new(recorder))?;
    graph.connect(integ, 0, gain, 0)?;
    graph.connect(gain, 0, integ, 0)?;
    graph.connect(integ, 0, sink, 0)?;

    let mut config = ContConfig::default();
    config.set_stop_time(stop_time)?;
    config.set_init_step_size(init_step)?;
    config.set_solver(solver);
    config.set_synchronize_to_real_time(real_time);

    let mut director = ContDirector::new(config, false)?;
    director.initialize(&mut graph)?;
    if let Some(at) = breakpoint {
        director.fire_at_seconds("cli", at)?;
    }

    info!(%solver, stop_time, init_step, "integrating dx/dt = -x from x(0) = 1");
    loop {
        if !director.prefire(&mut graph)? {
            break;
        }
        director.fire(&mut graph)?;
        if director.current_step_size() > 0.0 {
            info!(
                t = director.current_time_seconds(),
                step = director.current_step_size(),
                "step committed"
            );
        }
        if !director.postfire(&mut graph)? {
            break;
        }
    }

    println!("time        state       exact       error");
    for sample in tap.samples() {
        let value = sample.token.as_double().unwrap_or(f64::NAN);
        let exact = (-sample.time).exp();
        println!(
            "{:<11.6} {:<11.6} {:<11.6} {:+.3e}",
            sample.time,
            value,
            exact,
            value - exact
        );
    }
    Ok(())
}

fn run_ddf(iterations: u64, capacity: usize, factor: f64) -> Result<()> {
    let mut graph = ModelGraph::new();
    let ramp = graph.add_actor("ramp", Box::new(Ramp::new(0.0, 1.0)))?;
    let gain = graph.add_actor("gain", Box::new(Gain::new(factor)))?;
    let (recorder, tap) = Recorder::with_tap();
    let sink = graph.add_actor("recorder", Box::new(recorder))?;
    graph.connect(ramp, 0, gain, 0)?;
    graph.connect(gain, 0, sink, 0)?;

    let mut config = DdfConfig::default();
    config.set_iterations(iterations);
    config.set_maximum_receiver_capacity(capacity);

    let mut director = DdfDirector::new(config, false)?;
    director.run(&mut graph)?;

    info!(
        iterations = director.iteration_count(),
        "dataflow run finished"
    );
    for (index, sample) in tap.samples().iter().enumerate() {
        let value = match sample.token {
            Token::Double(v) => v,
            Token::Int(v) => v as f64,
            Token::Boolean(b) => f64::from(b as u8),
        };
        println!("sample {:>3}: {}", index, value);
    }
    Ok(())
}
