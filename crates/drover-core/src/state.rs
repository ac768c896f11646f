//! Table-driven state machines for governed entities.
//!
//! One generic [`StateMachine`] engine is instantiated with a static
//! transition table per entity kind ([`AGENT`], [`FEATURE`], [`SESSION`],
//! [`WORKTREE`]). Every kind rejects an illegal move the same way: with an
//! [`InvalidTransition`] carrying the attempted target and the legal set.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// An entity whose status is governed by a [`StateMachine`].
pub trait Stateful<S> {
    /// Current status.
    fn status(&self) -> S;
    /// Overwrite the status. Only the engine should call this.
    fn set_status(&mut self, status: S);
}

/// Rejected transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid {machine} transition: {from} -> {to} (valid: {valid:?})")]
pub struct InvalidTransition<S: fmt::Display + fmt::Debug> {
    pub machine: &'static str,
    pub from: S,
    pub to: S,
    pub valid: Vec<S>,
}

/// Outcome of [`StateMachine::safe_transition`].
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome<E, S> {
    /// The move was legal; the entity carries the new status.
    Applied(E),
    /// The move was illegal; the entity is returned untouched.
    Rejected {
        entity: E,
        reason: String,
        valid_transitions: Vec<S>,
    },
}

impl<E, S> TransitionOutcome<E, S> {
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    /// Recover the entity regardless of outcome.
    pub fn into_entity(self) -> E {
        match self {
            Self::Applied(entity) | Self::Rejected { entity, .. } => entity,
        }
    }
}

/// Generic transition-table engine.
///
/// The table lists every state exactly once, terminal states with an empty
/// slice.
#[derive(Debug, Clone, Copy)]
pub struct StateMachine<S: 'static> {
    name: &'static str,
    table: Table<S>,
}

impl<S> StateMachine<S>
where
    S: Copy + Eq + fmt::Display + fmt::Debug + 'static,
{
    pub const fn new(name: &'static str, table: Table<S>) -> Self {
        Self { name, table }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// All states known to this machine, in table order.
    pub fn states(&self) -> impl Iterator<Item = S> + '_ {
        self.table.iter().map(|(state, _)| *state)
    }

    /// States reachable from `from` in one step.
    pub fn valid_transitions(&self, from: S) -> &'static [S] {
        self.table
            .iter()
            .find(|(state, _)| *state == from)
            .map(|(_, targets)| *targets)
            .unwrap_or(&[])
    }

    pub fn can_transition(&self, from: S, to: S) -> bool {
        self.valid_transitions(from).contains(&to)
    }

    /// A state is terminal when nothing is reachable from it.
    pub fn is_terminal(&self, state: S) -> bool {
        self.valid_transitions(state).is_empty()
    }

    /// Validate a move without touching any entity.
    pub fn check(&self, from: S, to: S) -> Result<(), InvalidTransition<S>> {
        if self.can_transition(from, to) {
            Ok(())
        } else {
            Err(InvalidTransition {
                machine: self.name,
                from,
                to,
                valid: self.valid_transitions(from).to_vec(),
            })
        }
    }

    /// Move an owned entity to `to`, returning it with the new status.
    pub fn transition<E: Stateful<S>>(
        &self,
        mut entity: E,
        to: S,
    ) -> Result<E, InvalidTransition<S>> {
        self.apply(&mut entity, to)?;
        Ok(entity)
    }

    /// Move a borrowed entity to `to`. Returns the previous status.
    pub fn apply<E: Stateful<S> + ?Sized>(
        &self,
        entity: &mut E,
        to: S,
    ) -> Result<S, InvalidTransition<S>> {
        let from = entity.status();
        self.check(from, to)?;
        entity.set_status(to);
        Ok(from)
    }

    /// Like [`transition`](Self::transition) but never fails: an illegal
    /// move hands the entity back together with the diagnostics.
    pub fn safe_transition<E: Stateful<S>>(&self, entity: E, to: S) -> TransitionOutcome<E, S> {
        let from = entity.status();
        match self.check(from, to) {
            Ok(()) => {
                let mut entity = entity;
                entity.set_status(to);
                TransitionOutcome::Applied(entity)
            }
            Err(err) => TransitionOutcome::Rejected {
                entity,
                reason: err.to_string(),
                valid_transitions: err.valid,
            },
        }
    }
}

macro_rules! status_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = crate::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(crate::Error::Config(format!(
                        "unknown {} '{other}'",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

status_enum! {
    /// Lifecycle of one agent run.
    AgentStatus {
        Idle => "idle",
        Working => "working",
        Waiting => "waiting",
        Paused => "paused",
        Error => "error",
        Completed => "completed",
    }
}

impl AgentStatus {
    /// Whether an agent process in this status has exited.
    ///
    /// `Error` is not terminal in [`AGENT`] (it can be retried back to
    /// `Working`), but a process that reached it has already exited.
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

status_enum! {
    /// Lifecycle of a feature moving through the workflow.
    FeatureStatus {
        Planning => "planning",
        InProgress => "in_progress",
        Review => "review",
        Testing => "testing",
        Blocked => "blocked",
        Completed => "completed",
        Cancelled => "cancelled",
    }
}

status_enum! {
    /// Lifecycle of a working session.
    SessionStatus {
        Active => "active",
        Paused => "paused",
        Completed => "completed",
        Crashed => "crashed",
        Archived => "archived",
    }
}

status_enum! {
    /// Lifecycle of an isolated worktree.
    WorktreeStatus {
        Active => "active",
        Stale => "stale",
        Removed => "removed",
    }
}

type Table<S> = &'static [(S, &'static [S])];

const AGENT_TABLE: Table<AgentStatus> = {
    use AgentStatus as A;
    &[
        (A::Idle, &[A::Working]),
        (A::Working, &[A::Waiting, A::Paused, A::Error, A::Completed]),
        (A::Waiting, &[A::Working, A::Error]),
        (A::Paused, &[A::Working, A::Error]),
        (A::Error, &[A::Working]),
        (A::Completed, &[]),
    ]
};

const FEATURE_TABLE: Table<FeatureStatus> = {
    use FeatureStatus as F;
    &[
        (F::Planning, &[F::InProgress, F::Cancelled]),
        (F::InProgress, &[F::Review, F::Blocked, F::Cancelled]),
        (F::Review, &[F::InProgress, F::Testing]),
        (F::Testing, &[F::InProgress, F::Completed]),
        (F::Blocked, &[F::InProgress, F::Cancelled]),
        (F::Completed, &[]),
        (F::Cancelled, &[]),
    ]
};

const SESSION_TABLE: Table<SessionStatus> = {
    use SessionStatus as S;
    &[
        (S::Active, &[S::Paused, S::Completed, S::Crashed]),
        (S::Paused, &[S::Active, S::Archived]),
        (S::Completed, &[S::Archived]),
        (S::Crashed, &[S::Active, S::Archived]),
        (S::Archived, &[]),
    ]
};

const WORKTREE_TABLE: Table<WorktreeStatus> = {
    use WorktreeStatus as W;
    &[
        (W::Active, &[W::Stale, W::Removed]),
        (W::Stale, &[W::Removed]),
        (W::Removed, &[]),
    ]
};

pub const AGENT: StateMachine<AgentStatus> = StateMachine::new("agent", AGENT_TABLE);
pub const FEATURE: StateMachine<FeatureStatus> = StateMachine::new("feature", FEATURE_TABLE);
pub const SESSION: StateMachine<SessionStatus> = StateMachine::new("session", SESSION_TABLE);
pub const WORKTREE: StateMachine<WorktreeStatus> = StateMachine::new("worktree", WORKTREE_TABLE);
