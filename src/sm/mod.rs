//! Per-transaction event-driven state machine (spec §4.A).

mod queue;
pub mod states;

pub use queue::EventQueue;

use crate::context::ActionContext;
use crate::domain::TransactionType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::warn;

/// Identifies one state across the transaction-type state tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateId {
    Dependencies,
    DependenciesWait,
    Unmount,
    UnmountAll,
    Install,
    Update,
    Remove,
    Verify,
    Commit,
    Rollback,
    Completed,
    Failed,
    Cancelled,
}

impl StateId {
    /// Terminal states per spec §4.D: no outgoing transition for any event.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StateId::Completed | StateId::Failed | StateId::Cancelled
        )
    }

    pub fn as_u32(&self) -> u32 {
        *self as u32
    }
}

/// Events observed by a state machine. `Start` is the synthetic kickstart
/// event queued on creation; it never causes a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    Start,
    Ok,
    Failed,
    Wake,
    Cancel,
}

/// Outcome of running a state's action (spec §4.A).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionResult {
    Continue,
    Wait,
    Abort,
}

pub type ActionFuture<'a> = Pin<Box<dyn Future<Output = ActionResult> + Send + 'a>>;
pub type ActionFn = for<'a> fn(&'a mut ActionContext) -> ActionFuture<'a>;

pub struct StateDef {
    pub transitions: HashMap<Event, StateId>,
    pub action: ActionFn,
    /// State to park in when this state's action returns `ActionResult::Wait`
    /// (e.g. `Dependencies` parks in `DependenciesWait`). Bypasses the normal
    /// event-driven transition for parking, since parking is a runner-level
    /// concept orthogonal to the FIFO event queue.
    pub wait_target: Option<StateId>,
}

pub type StateTable = HashMap<StateId, StateDef>;

/// `{ state_set, current_state, context, event_queue }` from spec §4.A. The
/// `context` the spec mentions is supplied per-step as an `ActionContext`
/// rather than stored on the machine, so one `StateTable` can be shared
/// (via `Arc`) across every transaction of the same type.
pub struct StateMachine {
    state_set: Arc<StateTable>,
    current_state: StateId,
    event_queue: EventQueue,
}

impl StateMachine {
    pub fn new(transaction_type: TransactionType, initial_state: StateId, queue_capacity: usize) -> Self {
        let mut queue = EventQueue::new(queue_capacity);
        queue.post(Event::Start);
        Self {
            state_set: states::table_for(transaction_type),
            current_state: initial_state,
            event_queue: queue,
        }
    }

    pub fn current_state(&self) -> StateId {
        self.current_state
    }

    pub fn is_terminal(&self) -> bool {
        self.current_state.is_terminal()
    }

    pub fn post_event(&mut self, event: Event) -> bool {
        self.event_queue.post(event)
    }

    /// One `execute` step: pop at most one event, transition if it matches,
    /// then invoke the current state's action (spec §4.A step semantics).
    /// Returns `None` when no event was pending and no action ran this step
    /// (spec §4.A: "If no event was pending and no action ran this step,
    /// return `Continue`") — callers that need to detect quiescence (the
    /// runner's dispatch loop) must treat `None` as "this machine made no
    /// progress", not as a completed step.
    pub async fn execute(&mut self, ctx: &mut ActionContext) -> Option<ActionResult> {
        let popped = self.event_queue.pop();

        if let Some(event) = popped {
            if event != Event::Start {
                let Some(def) = self.state_set.get(&self.current_state) else {
                    return Some(ActionResult::Abort);
                };
                match def.transitions.get(&event) {
                    Some(&target) => self.current_state = target,
                    None => warn!(
                        state = ?self.current_state,
                        ?event,
                        "no transition for event in current state"
                    ),
                }
            }
        }

        if popped.is_none() {
            return None;
        }

        let Some(def) = self.state_set.get(&self.current_state) else {
            return Some(ActionResult::Abort);
        };

        let result = (def.action)(ctx).await;

        if let Some(event) = ctx.take_emitted() {
            self.event_queue.post(event);
        }

        if result == ActionResult::Wait {
            if let Some(target) = def.wait_target {
                self.current_state = target;
            }
        }

        Some(result)
    }
}
