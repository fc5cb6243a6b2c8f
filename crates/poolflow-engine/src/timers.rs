/*!
 * Named one-shot timers for the session driver.
 *
 * Each [`TimerId`] has at most one pending timer: scheduling an id that is
 * already pending replaces it. Fired timers are delivered on a channel and
 * must be passed through [`Timers::accept`], which drops fires that were
 * cancelled or replaced after they were sent.
 */
use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::trace;

/// Timers owned by the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Reopen the socket after a close
    Reconnect,
    /// Next step of the initial query sequence
    QueryStep,
    /// In-flight slot request gave up waiting
    SlotTimeout,
    /// Send the next queued slot request
    SlotDispatch,
    /// Air temperature query following a water query
    AirFollowUp,
}

/// A timer that went off
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    id: TimerId,
    generation: u64,
}

#[derive(Debug)]
struct Pending {
    generation: u64,
    task: JoinHandle<()>,
}

/// Cancel-and-replace timer set
#[derive(Debug)]
pub struct Timers {
    fired: mpsc::UnboundedSender<TimerFired>,
    pending: HashMap<TimerId, Pending>,
    generation: u64,
}

impl Timers {
    /// Create a timer set delivering on `fired`
    pub fn new(fired: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            fired,
            pending: HashMap::new(),
            generation: 0,
        }
    }

    /// Fire `id` after `delay`, replacing any pending timer with the same id
    pub fn schedule(&mut self, id: TimerId, delay: Duration) {
        self.generation += 1;
        let generation = self.generation;
        let fired = self.fired.clone();

        let task = tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = fired.send(TimerFired { id, generation });
        });

        trace!("Timer {:?} scheduled in {:?}", id, delay);
        if let Some(previous) = self.pending.insert(id, Pending { generation, task }) {
            previous.task.abort();
        }
    }

    /// Cancel `id` if pending
    pub fn cancel(&mut self, id: TimerId) {
        if let Some(pending) = self.pending.remove(&id) {
            trace!("Timer {:?} cancelled", id);
            pending.task.abort();
        }
    }

    /// Cancel everything
    pub fn cancel_all(&mut self) {
        for (_, pending) in self.pending.drain() {
            pending.task.abort();
        }
    }

    /// Whether `id` is pending
    pub fn is_pending(&self, id: TimerId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Number of pending timers
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no timer is pending
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Resolve a fire: the id if it is still current, `None` if stale
    pub fn accept(&mut self, fired: TimerFired) -> Option<TimerId> {
        match self.pending.get(&fired.id) {
            Some(pending) if pending.generation == fired.generation => {
                self.pending.remove(&fired.id);
                Some(fired.id)
            }
            _ => None,
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
