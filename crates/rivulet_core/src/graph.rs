//! The model graph: actors, ports, channels, receivers.
//!
//! A [`ModelGraph`] is the explicit context a director executes against.
//! There is no ambient registry: directors hold a `&mut ModelGraph`, and a
//! firing actor sees only a [`FiringContext`] scoped to its own ports.
//!
//! The graph is versioned; directors cache computed schedules keyed on
//! [`ModelGraph::version`] and recompute when the topology changes.

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use crate::actor::{Actor, IntegrationStep, Stateful, StepSizeControl};
use crate::error::{CoreError, CoreResult};
use crate::receiver::{Rate, Receiver};
use crate::time::{ModelTime, TimeResolution};
use crate::token::Token;

/// Identifier of an actor within one graph
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ActorId(pub usize);

/// Identifier of a channel within one graph
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ChannelId(pub usize);

/// Receiver semantics of the executing domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Single-value-per-round cells: put overwrites, get peeks.
    /// Used by the continuous domain, where a solver round may fire the
    /// schedule more than once and firings must be idempotent.
    Continuous,
    /// FIFO queues: put appends (capacity-checked), get consumes.
    Dataflow,
}

/// Immutable per-firing environment published by the director
#[derive(Debug, Clone)]
pub struct FiringEnv<'a> {
    /// Receiver semantics for this firing
    pub mode: ExecutionMode,
    /// Current model time
    pub time: ModelTime,
    /// Time quantization scale
    pub resolution: TimeResolution,
    /// Integration data for the current solver round, continuous only
    pub integration: Option<&'a IntegrationStep>,
}

impl<'a> FiringEnv<'a> {
    /// A dataflow environment (no notion of continuous time advance)
    #[must_use]
    pub fn dataflow() -> Self {
        Self {
            mode: ExecutionMode::Dataflow,
            time: ModelTime::ZERO,
            resolution: TimeResolution::default(),
            integration: None,
        }
    }
}

/// State of one declared port of one actor
#[derive(Debug, Clone)]
pub struct PortState {
    /// Port name
    pub name: String,
    /// Current declared rate (dataflow actors may change it per firing)
    pub rate: Rate,
    /// Channels attached to this port, in connection order
    pub channels: Vec<ChannelId>,
}

/// One point-to-point channel with its receiver
#[derive(Debug)]
pub struct Channel {
    source: Option<(ActorId, usize)>,
    target: (ActorId, usize),
    label: String,
    receiver: Receiver,
}

impl Channel {
    /// Producing actor and output port index; `None` for external inputs
    #[must_use]
    pub const fn source(&self) -> Option<(ActorId, usize)> {
        self.source
    }

    /// Consuming actor and input port index
    #[must_use]
    pub const fn target(&self) -> (ActorId, usize) {
        self.target
    }

    /// Human-readable channel label for diagnostics
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Number of tokens currently buffered
    #[must_use]
    pub fn tokens(&self) -> usize {
        self.receiver.len()
    }
}

struct ActorSlot {
    name: String,
    actor: Box<dyn Actor>,
    inputs: Vec<PortState>,
    outputs: Vec<PortState>,
    disabled: bool,
}

/// The complete actor graph a director executes
#[derive(Default)]
pub struct ModelGraph {
    actors: Vec<ActorSlot>,
    names: IndexMap<String, ActorId>,
    channels: Vec<Channel>,
    fire_requests: Vec<ModelTime>,
    converged_vote: bool,
    capacity: Option<usize>,
    version: u64,
}

impl ModelGraph {
    /// Create an empty graph
    #[must_use]
    pub fn new() -> Self {
        Self {
            converged_vote: true,
            ..Self::default()
        }
    }

    /// Add an actor under a unique name
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AlreadyExists`] if the name is taken.
    pub fn add_actor(
        &mut self,
        name: impl Into<String>,
        actor: Box<dyn Actor>,
    ) -> CoreResult<ActorId> {
        let name = name.into();
        if self.names.contains_key(&name) {
            return Err(CoreError::AlreadyExists {
                kind: "Actor".to_string(),
                name,
            });
        }

        let inputs = actor
            .input_ports()
            .into_iter()
            .map(|spec| PortState {
                name: spec.name,
                rate: spec.rate,
                channels: Vec::new(),
            })
            .collect();
        let outputs = actor
            .output_ports()
            .into_iter()
            .map(|spec| PortState {
                name: spec.name,
                rate: spec.rate,
                channels: Vec::new(),
            })
            .collect();

        let id = ActorId(self.actors.len());
        self.actors.push(ActorSlot {
            name: name.clone(),
            actor,
            inputs,
            outputs,
            disabled: false,
        });
        self.names.insert(name, id);
        self.version += 1;
        Ok(id)
    }

    /// Connect an output port to an input port
    ///
    /// Fan-in channels stack on the target port in connection order; the
    /// channel index within the port is the position in that order.
    ///
    /// # Errors
    ///
    /// Returns an error if either endpoint does not exist.
    pub fn connect(
        &mut self,
        source: ActorId,
        source_port: usize,
        target: ActorId,
        target_port: usize,
    ) -> CoreResult<ChannelId> {
        let label = format!(
            "{}.{} -> {}.{}",
            self.actor_name(source)?,
            self.output_port_name(source, source_port)?,
            self.actor_name(target)?,
            self.input_port_name(target, target_port)?,
        );

        let id = ChannelId(self.channels.len());
        let mut receiver = Receiver::new();
        receiver.set_capacity(self.capacity);
        self.channels.push(Channel {
            source: Some((source, source_port)),
            target: (target, target_port),
            label,
            receiver,
        });
        self.actors[source.0].outputs[source_port].channels.push(id);
        self.actors[target.0].inputs[target_port].channels.push(id);
        self.version += 1;
        Ok(id)
    }

    /// Add a channel fed from outside the graph (a boundary input)
    ///
    /// # Errors
    ///
    /// Returns an error if the target does not exist.
    pub fn add_external_input(
        &mut self,
        target: ActorId,
        target_port: usize,
    ) -> CoreResult<ChannelId> {
        let label = format!(
            "<external> -> {}.{}",
            self.actor_name(target)?,
            self.input_port_name(target, target_port)?,
        );

        let id = ChannelId(self.channels.len());
        let mut receiver = Receiver::new();
        receiver.set_capacity(self.capacity);
        self.channels.push(Channel {
            source: None,
            target: (target, target_port),
            label,
            receiver,
        });
        self.actors[target.0].inputs[target_port].channels.push(id);
        self.version += 1;
        Ok(id)
    }

    /// Put a token on a channel from outside a firing
    ///
    /// Used to transfer tokens across a composite boundary and to seed
    /// initial tokens (delays) before execution.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CapacityExceeded`] if the receiver is full.
    pub fn inject(&mut self, channel: ChannelId, token: Token) -> CoreResult<()> {
        let ch = self
            .channels
            .get_mut(channel.0)
            .ok_or_else(|| CoreError::NotFound {
                kind: "Channel".to_string(),
                name: format!("{:?}", channel),
            })?;
        if !ch.receiver.try_put(token) {
            return Err(CoreError::CapacityExceeded {
                channel: ch.label.clone(),
                capacity: ch.receiver.capacity().unwrap_or(0),
            });
        }
        Ok(())
    }

    /// Bound every receiver in the graph (`None` = unbounded)
    pub fn set_receiver_capacity(&mut self, capacity: Option<usize>) {
        self.capacity = capacity;
        for ch in &mut self.channels {
            ch.receiver.set_capacity(capacity);
        }
    }

    /// Monotonic topology version, bumped on every structural change
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Number of actors, including disabled ones
    #[must_use]
    pub fn actor_count(&self) -> usize {
        self.actors.len()
    }

    /// All actor ids in insertion order
    pub fn actor_ids(&self) -> impl Iterator<Item = ActorId> + '_ {
        (0..self.actors.len()).map(ActorId)
    }

    /// Look up an actor by name
    #[must_use]
    pub fn actor_by_name(&self, name: &str) -> Option<ActorId> {
        self.names.get(name).copied()
    }

    /// Name of an actor
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] for an unknown id.
    pub fn actor_name(&self, id: ActorId) -> CoreResult<&str> {
        self.actors
            .get(id.0)
            .map(|slot| slot.name.as_str())
            .ok_or_else(|| unknown_actor(id))
    }

    /// True if the actor has been permanently disabled
    #[must_use]
    pub fn is_disabled(&self, id: ActorId) -> bool {
        self.actors.get(id.0).is_none_or(|slot| slot.disabled)
    }

    /// Permanently remove the actor from execution
    pub fn disable(&mut self, id: ActorId) {
        if let Some(slot) = self.actors.get_mut(id.0) {
            slot.disabled = true;
        }
    }

    /// Input port states of an actor
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] for an unknown id.
    pub fn input_ports(&self, id: ActorId) -> CoreResult<&[PortState]> {
        self.actors
            .get(id.0)
            .map(|slot| slot.inputs.as_slice())
            .ok_or_else(|| unknown_actor(id))
    }

    /// Output port states of an actor
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] for an unknown id.
    pub fn output_ports(&self, id: ActorId) -> CoreResult<&[PortState]> {
        self.actors
            .get(id.0)
            .map(|slot| slot.outputs.as_slice())
            .ok_or_else(|| unknown_actor(id))
    }

    /// A channel by id
    #[must_use]
    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(id.0)
    }

    /// Whether the actor declares no same-time input-to-output dependency
    #[must_use]
    pub fn direct_feedthrough(&self, id: ActorId) -> bool {
        self.actors
            .get(id.0)
            .is_none_or(|slot| slot.actor.direct_feedthrough())
    }

    /// Actors sharing a channel with `id`, excluding `id` itself
    #[must_use]
    pub fn neighbors(&self, id: ActorId) -> IndexSet<ActorId> {
        let mut out = IndexSet::new();
        for ch in &self.channels {
            if let Some((src, _)) = ch.source {
                let (dst, _) = ch.target;
                if src == id && dst != id {
                    out.insert(dst);
                }
                if dst == id && src != id {
                    out.insert(src);
                }
            }
        }
        out
    }

    /// Clear every receiver (between continuous solver rounds)
    pub fn reset_receivers(&mut self) {
        for ch in &mut self.channels {
            ch.receiver.clear();
        }
    }

    /// Take the `fire_at` requests accumulated during recent firings
    #[must_use]
    pub fn take_fire_requests(&mut self) -> Vec<ModelTime> {
        std::mem::take(&mut self.fire_requests)
    }

    /// Reset the per-round convergence vote to "converged"
    pub fn reset_converged_vote(&mut self) {
        self.converged_vote = true;
    }

    /// The ANDed convergence votes since the last reset
    #[must_use]
    pub const fn converged_vote(&self) -> bool {
        self.converged_vote
    }

    /// Run an actor's `initialize`
    ///
    /// # Errors
    ///
    /// Propagates actor errors.
    pub fn initialize_actor(&mut self, id: ActorId, env: &FiringEnv<'_>) -> CoreResult<()> {
        self.with_context(id, env, |actor, ctx| actor.initialize(ctx))?
    }

    /// Run an actor's `prefire`
    ///
    /// # Errors
    ///
    /// Propagates actor errors.
    pub fn prefire_actor(&mut self, id: ActorId, env: &FiringEnv<'_>) -> CoreResult<bool> {
        self.with_context(id, env, |actor, ctx| actor.prefire(ctx))?
    }

    /// Run an actor's `fire`
    ///
    /// # Errors
    ///
    /// Propagates actor errors.
    pub fn fire_actor(&mut self, id: ActorId, env: &FiringEnv<'_>) -> CoreResult<()> {
        self.with_context(id, env, |actor, ctx| actor.fire(ctx))?
    }

    /// Run an actor's `postfire`; false means "never fire me again"
    ///
    /// # Errors
    ///
    /// Propagates actor errors.
    pub fn postfire_actor(&mut self, id: ActorId, env: &FiringEnv<'_>) -> CoreResult<bool> {
        self.with_context(id, env, |actor, ctx| actor.postfire(ctx))?
    }

    /// The actor's step-size-control capability, if any
    pub fn step_size_control(&mut self, id: ActorId) -> Option<&mut dyn StepSizeControl> {
        self.actors.get_mut(id.0)?.actor.step_size_control()
    }

    /// The actor's state-checkpoint capability, if any
    pub fn stateful(&mut self, id: ActorId) -> Option<&mut dyn Stateful> {
        self.actors.get_mut(id.0)?.actor.stateful()
    }

    fn with_context<R>(
        &mut self,
        id: ActorId,
        env: &FiringEnv<'_>,
        f: impl FnOnce(&mut dyn Actor, &mut FiringContext<'_>) -> R,
    ) -> CoreResult<R> {
        let Self {
            actors,
            channels,
            fire_requests,
            converged_vote,
            ..
        } = self;
        let slot = actors.get_mut(id.0).ok_or_else(|| unknown_actor(id))?;
        let mut ctx = FiringContext {
            actor: slot.name.as_str(),
            env,
            inputs: &mut slot.inputs,
            outputs: &mut slot.outputs,
            channels,
            fire_requests,
            converged_vote,
        };
        Ok(f(slot.actor.as_mut(), &mut ctx))
    }

    fn input_port_name(&self, id: ActorId, port: usize) -> CoreResult<&str> {
        let slot = self.actors.get(id.0).ok_or_else(|| unknown_actor(id))?;
        slot.inputs
            .get(port)
            .map(|p| p.name.as_str())
            .ok_or_else(|| CoreError::NotFound {
                kind: "Input port".to_string(),
                name: format!("{}[{}]", slot.name, port),
            })
    }

    fn output_port_name(&self, id: ActorId, port: usize) -> CoreResult<&str> {
        let slot = self.actors.get(id.0).ok_or_else(|| unknown_actor(id))?;
        slot.outputs
            .get(port)
            .map(|p| p.name.as_str())
            .ok_or_else(|| CoreError::NotFound {
                kind: "Output port".to_string(),
                name: format!("{}[{}]", slot.name, port),
            })
    }
}

fn unknown_actor(id: ActorId) -> CoreError {
    CoreError::NotFound {
        kind: "Actor".to_string(),
        name: format!("{:?}", id),
    }
}

/// Token I/O and clock access scoped to one firing of one actor
pub struct FiringContext<'a> {
    actor: &'a str,
    env: &'a FiringEnv<'a>,
    inputs: &'a mut Vec<PortState>,
    outputs: &'a mut Vec<PortState>,
    channels: &'a mut Vec<Channel>,
    fire_requests: &'a mut Vec<ModelTime>,
    converged_vote: &'a mut bool,
}

impl<'a> FiringContext<'a> {
    /// Name of the firing actor
    #[must_use]
    pub fn actor_name(&self) -> &str {
        self.actor
    }

    /// Receiver semantics in effect
    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.env.mode
    }

    /// Current model time
    #[must_use]
    pub fn time(&self) -> ModelTime {
        self.env.time
    }

    /// Current model time in seconds
    #[must_use]
    pub fn time_seconds(&self) -> f64 {
        self.env.resolution.seconds(self.env.time)
    }

    /// Integration data for the current solver round, if integrating
    #[must_use]
    pub fn integration(&self) -> Option<&IntegrationStep> {
        self.env.integration
    }

    /// Number of channels attached to an input port
    #[must_use]
    pub fn input_width(&self, port: usize) -> usize {
        self.inputs.get(port).map_or(0, |p| p.channels.len())
    }

    /// Number of channels attached to an output port
    #[must_use]
    pub fn output_width(&self, port: usize) -> usize {
        self.outputs.get(port).map_or(0, |p| p.channels.len())
    }

    /// True if an input channel holds at least `count` tokens
    #[must_use]
    pub fn has_input(&self, port: usize, channel: usize, count: usize) -> bool {
        self.input_channel(port, channel)
            .is_ok_and(|ch| ch.receiver.len() >= count)
    }

    /// Read a token from an input channel
    ///
    /// Consumes in dataflow mode, peeks in continuous mode.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NoToken`] if the channel is empty, or
    /// [`CoreError::ChannelOutOfRange`] for a bad index.
    pub fn get(&mut self, port: usize, channel: usize) -> CoreResult<Token> {
        let mode = self.env.mode;
        let actor = self.actor.to_string();
        let port_name = self
            .inputs
            .get(port)
            .map(|p| p.name.clone())
            .unwrap_or_default();
        let ch = self.input_channel_mut(port, channel)?;
        let token = match mode {
            ExecutionMode::Dataflow => ch.receiver.take(),
            ExecutionMode::Continuous => ch.receiver.peek(),
        };
        token.ok_or(CoreError::NoToken {
            actor,
            port: port_name,
            channel,
        })
    }

    /// Read a token if one is available
    #[must_use]
    pub fn try_get(&mut self, port: usize, channel: usize) -> Option<Token> {
        if self.has_input(port, channel, 1) {
            self.get(port, channel).ok()
        } else {
            None
        }
    }

    /// Send a token to every channel of an output port
    ///
    /// Appends in dataflow mode (capacity-checked), overwrites the
    /// single-value cell in continuous mode.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CapacityExceeded`] if a receiver is full.
    pub fn send(&mut self, port: usize, token: Token) -> CoreResult<()> {
        let channel_ids = self
            .outputs
            .get(port)
            .map(|p| p.channels.clone())
            .unwrap_or_default();
        for id in channel_ids {
            let ch = &mut self.channels[id.0];
            match self.env.mode {
                ExecutionMode::Continuous => ch.receiver.put_replacing(token),
                ExecutionMode::Dataflow => {
                    if !ch.receiver.try_put(token) {
                        return Err(CoreError::CapacityExceeded {
                            channel: ch.label.clone(),
                            capacity: ch.receiver.capacity().unwrap_or(0),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Request a future firing (registers a breakpoint in timed domains)
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::FireAtInPast`] if `time` is earlier than the
    /// current model time.
    pub fn fire_at(&mut self, time: ModelTime) -> CoreResult<()> {
        if time < self.env.time {
            return Err(CoreError::FireAtInPast {
                actor: self.actor.to_string(),
            });
        }
        self.fire_requests.push(time);
        Ok(())
    }

    /// Contribute to the solver round's convergence vote
    ///
    /// Votes are ANDed; an implicit solver keeps iterating while any actor
    /// votes unconverged.
    pub fn vote_converged(&mut self, converged: bool) {
        *self.converged_vote &= converged;
    }

    /// Change the declared consumption rate of one of the actor's inputs
    ///
    /// Dynamic dataflow actors may re-declare rates between firings.
    pub fn set_consumption_rate(&mut self, port: usize, rate: Rate) {
        if let Some(p) = self.inputs.get_mut(port) {
            p.rate = rate;
        }
    }

    /// Change the declared production rate of one of the actor's outputs
    pub fn set_production_rate(&mut self, port: usize, rate: Rate) {
        if let Some(p) = self.outputs.get_mut(port) {
            p.rate = rate;
        }
    }

    fn input_channel(&self, port: usize, channel: usize) -> CoreResult<&Channel> {
        let id = self
            .inputs
            .get(port)
            .and_then(|p| p.channels.get(channel))
            .ok_or_else(|| CoreError::ChannelOutOfRange {
                actor: self.actor.to_string(),
                port: self
                    .inputs
                    .get(port)
                    .map(|p| p.name.clone())
                    .unwrap_or_default(),
                channel,
            })?;
        Ok(&self.channels[id.0])
    }

    fn input_channel_mut(&mut self, port: usize, channel: usize) -> CoreResult<&mut Channel> {
        let id = self
            .inputs
            .get(port)
            .and_then(|p| p.channels.get(channel))
            .copied()
            .ok_or_else(|| CoreError::ChannelOutOfRange {
                actor: self.actor.to_string(),
                port: self
                    .inputs
                    .get(port)
                    .map(|p| p.name.clone())
                    .unwrap_or_default(),
                channel,
            })?;
        Ok(&mut self.channels[id.0])
    }
}
