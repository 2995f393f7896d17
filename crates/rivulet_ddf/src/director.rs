//! The dynamic dataflow director.
//!
//! Dataflow here is dynamic: token rates may change from firing to firing,
//! so no static schedule exists. Instead, every basic iteration classifies
//! each live actor from its cached enabling record - not enabled, enabled
//! but deferrable, or enabled and not deferrable - fires all of the
//! non-deferrable enabled actors, and, only when there are none, fires the
//! deferrable actors with the smallest maximum output backlog (the minimax
//! set), which unblocks downstream consumers with the least excess
//! production.
//!
//! Records are maintained incrementally: an actor's classification depends
//! only on the buffer occupancy of its immediate neighbors, so after every
//! individual firing only the fired actor and its direct neighbors are
//! reclassified.

use indexmap::IndexMap;
use tracing::{debug, trace};

use rivulet_core::{ActorId, CoreError, FiringEnv, ModelGraph};

use crate::config::DdfConfig;
use crate::record::{ActorRecord, EnablingStatus};

/// Basic iterations one logical iteration may consume while waiting for
/// required firings before the run is declared stalled
///
/// An actor that never fires again would otherwise repeat basic
/// iterations forever; the ceiling turns that into a diagnosable error.
pub const REQUIRED_FIRINGS_SAFETY_CEILING: u64 = 1_000_000;

/// Dynamic dataflow director error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DdfError {
    /// `run_until_deadlock` configured without an enclosing director
    #[error("runUntilDeadlockInOneIteration is only permitted when embedded in an outer model")]
    RunUntilDeadlockAtTopLevel,

    /// Required firings were still unmet after the safety ceiling
    #[error("required firings not satisfied after {ceiling} basic iterations; stalled actors: {}", .actors.join(", "))]
    RequiredFiringsStalled {
        /// The configured ceiling that was hit
        ceiling: u64,
        /// Actors whose required firings were not met
        actors: Vec<String>,
    },

    /// Structural or actor failure
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Drives a model graph through dynamic dataflow execution
pub struct DdfDirector {
    config: DdfConfig,
    embedded: bool,

    records: IndexMap<ActorId, ActorRecord>,
    required: IndexMap<ActorId, u64>,

    iteration_count: u64,
    basic_iterations_this_logical: u64,
    fired_this_logical: u64,

    stop_requested: bool,
}

impl DdfDirector {
    /// Create a director from a configuration
    ///
    /// # Errors
    ///
    /// Returns [`DdfError::RunUntilDeadlockAtTopLevel`] when
    /// `run_until_deadlock` is requested without `embedded`.
    pub fn new(config: DdfConfig, embedded: bool) -> Result<Self, DdfError> {
        if config.run_until_deadlock() && !embedded {
            return Err(DdfError::RunUntilDeadlockAtTopLevel);
        }
        Ok(Self {
            config,
            embedded,
            records: IndexMap::new(),
            required: IndexMap::new(),
            iteration_count: 0,
            basic_iterations_this_logical: 0,
            fired_this_logical: 0,
            stop_requested: false,
        })
    }

    /// The configuration in effect
    #[must_use]
    pub const fn config(&self) -> &DdfConfig {
        &self.config
    }

    /// Completed logical iterations
    #[must_use]
    pub const fn iteration_count(&self) -> u64 {
        self.iteration_count
    }

    /// Request cooperative cancellation; polled between firings
    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    /// Declare how many firings `actor` must reach per logical iteration
    pub fn set_required_firings(&mut self, actor: ActorId, firings: u64) {
        self.required.insert(actor, firings);
        if let Some(record) = self.records.get_mut(&actor) {
            record.required_firings = Some(firings);
        }
    }

    /// Cached classification of an actor, if a record exists
    #[must_use]
    pub fn enabling_status(&self, actor: ActorId) -> Option<EnablingStatus> {
        self.records.get(&actor).map(|r| r.status)
    }

    /// The scheduling record of an actor, if one exists
    #[must_use]
    pub fn record(&self, actor: ActorId) -> Option<&ActorRecord> {
        self.records.get(&actor)
    }

    /// Prepare the model for execution
    ///
    /// Applies the receiver capacity bound and initializes every actor.
    ///
    /// # Errors
    ///
    /// Propagates actor initialization failures.
    pub fn initialize(&mut self, graph: &mut ModelGraph) -> Result<(), DdfError> {
        self.records.clear();
        self.iteration_count = 0;
        self.basic_iterations_this_logical = 0;
        self.fired_this_logical = 0;
        self.stop_requested = false;

        let capacity = match self.config.maximum_receiver_capacity() {
            0 => None,
            bound => Some(bound),
        };
        graph.set_receiver_capacity(capacity);

        let env = FiringEnv::dataflow();
        for id in graph.actor_ids().collect::<Vec<_>>() {
            graph.initialize_actor(id, &env)?;
        }
        // This domain keeps no breakpoint table; time-based refiring
        // requests have no meaning here.
        let _ = graph.take_fire_requests();

        debug!(actors = graph.actor_count(), "dataflow model initialized");
        Ok(())
    }

    /// Execute one basic iteration (or, when configured to run until
    /// deadlock, basic iterations until none fires); returns the number
    /// of firings
    ///
    /// # Errors
    ///
    /// Propagates actor failures and receiver capacity violations.
    pub fn fire(&mut self, graph: &mut ModelGraph) -> Result<usize, DdfError> {
        if self.basic_iterations_this_logical == 0 {
            // A new logical iteration: firing counts start over.
            for record in self.records.values_mut() {
                record.firings = 0;
            }
            self.fired_this_logical = 0;
        }

        let mut total = 0;
        loop {
            let fired = self.basic_iteration(graph)?;
            self.basic_iterations_this_logical += 1;
            total += fired;
            if !self.config.run_until_deadlock() || fired == 0 || self.stop_requested {
                break;
            }
        }
        Ok(total)
    }

    /// Complete a basic iteration; true if execution continues
    ///
    /// Repeats the basic iteration while declared required firings remain
    /// unmet (bounded by the safety ceiling); otherwise closes the logical
    /// iteration, enforcing the iteration limit and deciding whether an
    /// all-idle iteration is a true deadlock.
    ///
    /// # Errors
    ///
    /// Returns [`DdfError::RequiredFiringsStalled`] at the safety ceiling.
    pub fn postfire(&mut self, graph: &mut ModelGraph) -> Result<bool, DdfError> {
        if self.stop_requested {
            return Ok(false);
        }

        // The repeat rule engages only once something has fired this
        // logical iteration; an iteration where nothing ever fired falls
        // through to deadlock handling instead.
        if self.fired_this_logical > 0 {
            let unmet = self.unmet_required(graph);
            if !unmet.is_empty() {
                if self.basic_iterations_this_logical >= REQUIRED_FIRINGS_SAFETY_CEILING {
                    return Err(DdfError::RequiredFiringsStalled {
                        ceiling: REQUIRED_FIRINGS_SAFETY_CEILING,
                        actors: unmet,
                    });
                }
                trace!(?unmet, "required firings unmet, repeating basic iteration");
                return Ok(true);
            }
        }

        let fired_any = self.fired_this_logical > 0;
        self.iteration_count += 1;
        self.basic_iterations_this_logical = 0;

        if self.config.iterations() > 0 && self.iteration_count >= self.config.iterations() {
            debug!(iterations = self.iteration_count, "iteration limit reached");
            return Ok(false);
        }

        if !fired_any {
            if self.embedded && Self::has_pending_boundary_tokens(graph) {
                // Unconsumed tokens sit at the boundary; a future external
                // transfer may unblock the model, so this is not yet a
                // true deadlock.
                trace!("idle but boundary tokens pending, deferring deadlock");
                return Ok(true);
            }
            debug!("deadlock: no actor could fire");
            return Ok(false);
        }

        Ok(true)
    }

    /// Run to completion: initialize, then iterate until postfire stops
    ///
    /// # Errors
    ///
    /// Propagates any initialization or iteration error.
    pub fn run(&mut self, graph: &mut ModelGraph) -> Result<(), DdfError> {
        self.initialize(graph)?;
        while !self.stop_requested {
            self.fire(graph)?;
            if !self.postfire(graph)? {
                break;
            }
        }
        Ok(())
    }

    // ---- admission control ---------------------------------------------

    /// One basic iteration: fire all enabled-not-deferrable actors, else
    /// the minimax-deferrable set; zero firings means deadlock for this
    /// basic iteration
    fn basic_iteration(&mut self, graph: &mut ModelGraph) -> Result<usize, DdfError> {
        let live: Vec<ActorId> = graph
            .actor_ids()
            .filter(|id| !graph.is_disabled(*id))
            .collect();

        // Boundary channels are filled outside any firing, so incremental
        // maintenance never sees those transfers: reclassify their targets
        // before partitioning.
        for &id in &live {
            if Self::has_boundary_input(graph, id) && self.records.contains_key(&id) {
                self.refresh_record(graph, id)?;
            }
        }

        // Partition on the cached classifications.
        let mut to_fire = Vec::new();
        let mut minimax: Vec<ActorId> = Vec::new();
        let mut minimax_backlog = usize::MAX;
        for id in live {
            let record = self.record_mut(graph, id)?;
            match record.status {
                EnablingStatus::NotEnabled => {}
                EnablingStatus::EnabledNotDeferrable => to_fire.push(id),
                EnablingStatus::EnabledDeferrable => {
                    let backlog = record.max_tokens_on_outputs;
                    match backlog.cmp(&minimax_backlog) {
                        std::cmp::Ordering::Less => {
                            minimax_backlog = backlog;
                            minimax = vec![id];
                        }
                        std::cmp::Ordering::Equal => minimax.push(id),
                        std::cmp::Ordering::Greater => {}
                    }
                }
            }
        }

        let chosen = if to_fire.is_empty() { minimax } else { to_fire };
        let mut fired = 0;
        for id in chosen {
            if self.stop_requested {
                break;
            }
            if self.fire_one(graph, id)? {
                fired += 1;
            }
        }

        if fired == 0 {
            trace!("basic iteration fired nothing");
        }
        Ok(fired)
    }

    /// Fire one actor once (prefire, fire, postfire), then reclassify it
    /// and its direct neighbors
    fn fire_one(&mut self, graph: &mut ModelGraph, id: ActorId) -> Result<bool, DdfError> {
        let env = FiringEnv::dataflow();
        if !graph.prefire_actor(id, &env)? {
            return Ok(false);
        }
        graph.fire_actor(id, &env)?;
        let keep = graph.postfire_actor(id, &env)?;
        let _ = graph.take_fire_requests();

        if let Some(record) = self.records.get_mut(&id) {
            record.firings += 1;
        }
        self.fired_this_logical += 1;

        let neighbors = graph.neighbors(id);
        if keep {
            self.refresh_record(graph, id)?;
        } else {
            // The actor asked never to be fired again: drop it from the
            // live set entirely.
            debug!(actor = graph.actor_name(id).unwrap_or("<unknown>"), "actor disabled");
            graph.disable(id);
            self.records.swap_remove(&id);
        }
        for neighbor in neighbors {
            if !graph.is_disabled(neighbor) {
                self.refresh_record(graph, neighbor)?;
            }
        }
        Ok(true)
    }

    /// The record for an actor, created lazily on first reference
    fn record_mut(
        &mut self,
        graph: &ModelGraph,
        id: ActorId,
    ) -> Result<&mut ActorRecord, DdfError> {
        let Self {
            records, required, ..
        } = self;
        match records.entry(id) {
            indexmap::map::Entry::Occupied(entry) => Ok(entry.into_mut()),
            indexmap::map::Entry::Vacant(entry) => {
                let (status, backlog) = Self::classify(graph, id)?;
                let mut record = ActorRecord::new(status, backlog);
                record.required_firings = required.get(&id).copied();
                Ok(entry.insert(record))
            }
        }
    }

    fn refresh_record(&mut self, graph: &ModelGraph, id: ActorId) -> Result<(), DdfError> {
        let (status, backlog) = Self::classify(graph, id)?;
        let record = self.record_mut(graph, id)?;
        record.status = status;
        record.max_tokens_on_outputs = backlog;
        Ok(())
    }

    /// Classify an actor from its neighbors' buffer occupancy
    ///
    /// Enabled: every connected input channel holds at least the declared
    /// consumption rate. Deferrable: additionally, some output channel
    /// (self-loops excluded) already satisfies its consumer's declared
    /// rate, so firing now cannot newly enable anyone. The returned
    /// backlog is the largest occupancy across the actor's output
    /// receivers, used for minimax tie-breaking.
    fn classify(graph: &ModelGraph, id: ActorId) -> Result<(EnablingStatus, usize), DdfError> {
        for port in graph.input_ports(id)? {
            for channel_id in &port.channels {
                let Some(channel) = graph.channel(*channel_id) else {
                    continue;
                };
                if !port.rate.is_satisfied_by(channel.tokens()) {
                    return Ok((EnablingStatus::NotEnabled, 0));
                }
            }
        }

        let mut deferrable = false;
        let mut backlog = 0;
        for port in graph.output_ports(id)? {
            for channel_id in &port.channels {
                let Some(channel) = graph.channel(*channel_id) else {
                    continue;
                };
                let (consumer, consumer_port) = channel.target();
                if consumer == id {
                    // Self-loops do not make an actor deferrable.
                    continue;
                }
                backlog = backlog.max(channel.tokens());
                let consumer_rate = graph.input_ports(consumer)?[consumer_port].rate;
                if consumer_rate.is_satisfied_by(channel.tokens()) {
                    deferrable = true;
                }
            }
        }

        if deferrable {
            Ok((EnablingStatus::EnabledDeferrable, backlog))
        } else {
            Ok((EnablingStatus::EnabledNotDeferrable, 0))
        }
    }

    fn unmet_required(&self, graph: &ModelGraph) -> Vec<String> {
        let mut unmet = Vec::new();
        for (id, record) in &self.records {
            if record.required_unmet() {
                unmet.push(graph.actor_name(*id).unwrap_or("<unknown>").to_string());
            }
        }
        unmet
    }

    fn has_boundary_input(graph: &ModelGraph, id: ActorId) -> bool {
        graph.input_ports(id).is_ok_and(|ports| {
            ports.iter().any(|port| {
                port.channels.iter().any(|channel_id| {
                    graph
                        .channel(*channel_id)
                        .is_some_and(|channel| channel.source().is_none())
                })
            })
        })
    }

    /// True if any boundary (externally fed) channel still holds tokens
    fn has_pending_boundary_tokens(graph: &ModelGraph) -> bool {
        graph.actor_ids().any(|id| {
            graph.input_ports(id).is_ok_and(|ports| {
                ports.iter().any(|port| {
                    port.channels.iter().any(|channel_id| {
                        graph.channel(*channel_id).is_some_and(|channel| {
                            channel.source().is_none() && channel.tokens() > 0
                        })
                    })
                })
            })
        })
    }
}
