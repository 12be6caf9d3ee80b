//! Per-rank inbox with (source, tag) matching

use super::{AbortHook, CommsErrorKind, Source, Tag};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

struct Envelope {
    source: usize,
    tag: Tag,
    data: Vec<u8>,
}

struct State {
    queue: VecDeque<Envelope>,
    aborted: Option<i32>,
    disconnected: Vec<bool>,
}

pub(crate) struct Mailbox {
    rank: usize,
    state: Mutex<State>,
    arrived: Condvar,
    on_abort: Mutex<Option<AbortHook>>,
}

impl Mailbox {
    pub(crate) fn new(rank: usize, size: usize) -> Self {
        Self {
            rank,
            state: Mutex::new(State {
                queue: VecDeque::new(),
                aborted: None,
                disconnected: vec![false; size],
            }),
            arrived: Condvar::new(),
            on_abort: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn deliver(&self, source: usize, tag: Tag, data: Vec<u8>) {
        self.lock().queue.push_back(Envelope { source, tag, data });
        self.arrived.notify_all();
    }

    pub(crate) fn abort(&self, code: i32) {
        let first = {
            let mut state = self.lock();
            let first = state.aborted.is_none();
            state.aborted.get_or_insert(code);
            first
        };
        self.arrived.notify_all();
        if first {
            self.fire_abort_hook(code);
        }
    }

    pub(crate) fn aborted(&self) -> Option<i32> {
        self.lock().aborted
    }

    /// Install `hook`, running it straight away if the group already aborted
    pub(crate) fn set_abort_hook(&self, hook: AbortHook) {
        *self.on_abort.lock().unwrap_or_else(PoisonError::into_inner) = Some(hook);
        if let Some(code) = self.aborted() {
            self.fire_abort_hook(code);
        }
    }

    fn fire_abort_hook(&self, code: i32) {
        let hook = self.on_abort.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(hook) = hook.as_ref() {
            hook(code);
        }
    }

    pub(crate) fn disconnect(&self, source: usize) {
        if let Some(d) = self.lock().disconnected.get_mut(source) {
            *d = true;
        }
        self.arrived.notify_all();
    }

    /// Block until a message matching `source` and `tag` arrives.
    /// Messages from one source with one tag come out in the order they went in.
    pub(crate) fn take(&self, source: Source, tag: Tag) -> Result<(usize, Vec<u8>), CommsErrorKind> {
        let mut state = self.lock();
        loop {
            if let Some(code) = state.aborted {
                return Err(CommsErrorKind::Aborted(code));
            }
            let found = state.queue.iter().position(|e| {
                e.tag == tag
                    && match source {
                        Source::Any => true,
                        Source::Rank(r) => e.source == r,
                    }
            });
            if let Some(env) = found.and_then(|pos| state.queue.remove(pos)) {
                return Ok((env.source, env.data));
            }
            match source {
                Source::Rank(r) if state.disconnected.get(r).copied().unwrap_or(true) => {
                    return Err(CommsErrorKind::Disconnected(r));
                }
                Source::Any => {
                    let me = self.rank;
                    let peers_gone = state
                        .disconnected
                        .iter()
                        .enumerate()
                        .all(|(r, gone)| r == me || *gone);
                    if peers_gone && state.disconnected.len() > 1 {
                        return Err(CommsErrorKind::Disconnected(me));
                    }
                }
                Source::Rank(_) => {}
            }
            state = self
                .arrived
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}
