//! Token receivers and declared port rates.
//!
//! A receiver is the buffered end of a channel: an ordered token queue,
//! optionally capacity-bounded. Dataflow domains consume destructively;
//! the continuous domain treats a receiver as a single-value cell per
//! solver round, overwriting on put and peeking on get.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::token::Token;

/// Declared token consumption or production rate of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rate {
    /// A fixed number of tokens per firing
    Exact(usize),
    /// Take all available tokens (boundary ports of an enclosing
    /// composite); at least one token is required for enabling
    All,
}

impl Rate {
    /// The minimum number of tokens a channel must hold to satisfy this rate
    #[must_use]
    pub const fn required_tokens(&self) -> usize {
        match self {
            Self::Exact(n) => *n,
            Self::All => 1,
        }
    }

    /// True if a channel holding `available` tokens satisfies this rate
    #[must_use]
    pub const fn is_satisfied_by(&self, available: usize) -> bool {
        available >= self.required_tokens()
    }
}

impl Default for Rate {
    fn default() -> Self {
        Self::Exact(1)
    }
}

/// The buffered end of one channel
#[derive(Debug, Clone, Default)]
pub struct Receiver {
    queue: VecDeque<Token>,
    capacity: Option<usize>,
}

impl Receiver {
    /// Create an unbounded receiver
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the capacity bound (`None` = unbounded)
    pub fn set_capacity(&mut self, capacity: Option<usize>) {
        self.capacity = capacity;
    }

    /// The capacity bound, if any
    #[must_use]
    pub const fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Append a token; returns false if the receiver is at capacity
    #[must_use]
    pub fn try_put(&mut self, token: Token) -> bool {
        if let Some(cap) = self.capacity {
            if self.queue.len() >= cap {
                return false;
            }
        }
        self.queue.push_back(token);
        true
    }

    /// Replace the receiver contents with a single token
    ///
    /// Continuous-domain put semantics: a receiver holds at most the one
    /// value resolved for the current solver round.
    pub fn put_replacing(&mut self, token: Token) {
        self.queue.clear();
        self.queue.push_back(token);
    }

    /// Remove and return the oldest token
    pub fn take(&mut self) -> Option<Token> {
        self.queue.pop_front()
    }

    /// Read the oldest token without removing it
    #[must_use]
    pub fn peek(&self) -> Option<Token> {
        self.queue.front().copied()
    }

    /// Number of buffered tokens
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True if no tokens are buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop all buffered tokens
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}
