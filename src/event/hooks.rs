//! Pre-dispatch, idle and post-dispatch hook lists.

use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;

/// Identifier of a registered dispatch hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookId(u64);

/// Handle to an idle hook.
///
/// One-shot idles disarm themselves before they are invoked; the handle
/// re-arms them. Re-arming an already armed idle is a no-op, so a burst
/// of reschedules results in a single invocation.
#[derive(Debug, Clone)]
pub struct Idle {
    id: HookId,
    armed: Rc<Cell<bool>>,
}

impl Idle {
    /// The hook id, usable with `remove_hook`.
    pub fn id(&self) -> HookId {
        self.id
    }

    /// Arms the idle for the next loop iteration.
    pub fn reschedule(&self) {
        self.armed.set(true);
    }

    /// Disarms the idle without removing it.
    pub fn cancel(&self) {
        self.armed.set(false);
    }
}

struct Entry<Data> {
    id: HookId,
    armed: Rc<Cell<bool>>,
    oneshot: bool,
    cb: Option<Box<dyn FnMut(&mut Data)>>,
}

#[derive(Clone, Copy)]
enum Phase {
    Pre,
    Idle,
    Post,
}

pub(super) struct HookList<Data> {
    pre: Vec<Entry<Data>>,
    idle: Vec<Entry<Data>>,
    post: Vec<Entry<Data>>,
    next_id: u64,
}

impl<Data> HookList<Data> {
    pub(super) fn new() -> Self {
        HookList {
            pre: Vec::new(),
            idle: Vec::new(),
            post: Vec::new(),
            next_id: 0,
        }
    }

    fn next_id(&mut self) -> HookId {
        self.next_id += 1;
        HookId(self.next_id)
    }

    fn entry(&mut self, cb: Box<dyn FnMut(&mut Data)>, oneshot: bool) -> Entry<Data> {
        Entry {
            id: self.next_id(),
            armed: Rc::new(Cell::new(true)),
            oneshot,
            cb: Some(cb),
        }
    }

    pub(super) fn add_pre(&mut self, cb: Box<dyn FnMut(&mut Data)>) -> HookId {
        let entry = self.entry(cb, false);
        let id = entry.id;
        self.pre.push(entry);
        id
    }

    pub(super) fn add_idle(&mut self, cb: Box<dyn FnMut(&mut Data)>, oneshot: bool) -> Idle {
        let entry = self.entry(cb, oneshot);
        let handle = Idle {
            id: entry.id,
            armed: entry.armed.clone(),
        };
        self.idle.push(entry);
        handle
    }

    pub(super) fn add_post(&mut self, cb: Box<dyn FnMut(&mut Data)>) -> HookId {
        let entry = self.entry(cb, false);
        let id = entry.id;
        self.post.push(entry);
        id
    }

    pub(super) fn remove(&mut self, id: HookId) {
        self.pre.retain(|e| e.id != id);
        self.idle.retain(|e| e.id != id);
        self.post.retain(|e| e.id != id);
    }

    fn list(&mut self, phase: Phase) -> &mut Vec<Entry<Data>> {
        match phase {
            Phase::Pre => &mut self.pre,
            Phase::Idle => &mut self.idle,
            Phase::Post => &mut self.post,
        }
    }

    // Hooks may register or remove hooks (including themselves) while the
    // list is being walked: iteration goes over a snapshot of ids and the
    // callback is taken out of the entry for the duration of the call.
    fn fire(hooks: &Rc<RefCell<Self>>, phase: Phase, data: &mut Data) {
        let ids: Vec<HookId> = hooks
            .borrow_mut()
            .list(phase)
            .iter()
            .map(|e| e.id)
            .collect();

        for id in ids {
            let cb = {
                let mut hooks = hooks.borrow_mut();
                match hooks.list(phase).iter_mut().find(|e| e.id == id) {
                    Some(entry) if entry.armed.get() => {
                        if entry.oneshot {
                            entry.armed.set(false);
                        }
                        entry.cb.take()
                    }
                    _ => None,
                }
            };
            if let Some(mut cb) = cb {
                cb(data);
                let mut hooks = hooks.borrow_mut();
                if let Some(entry) = hooks.list(phase).iter_mut().find(|e| e.id == id) {
                    entry.cb = Some(cb);
                }
            }
        }
    }

    pub(super) fn fire_pre(hooks: &Rc<RefCell<Self>>, data: &mut Data) {
        Self::fire(hooks, Phase::Pre, data);
    }

    pub(super) fn fire_idle(hooks: &Rc<RefCell<Self>>, data: &mut Data) {
        Self::fire(hooks, Phase::Idle, data);
    }

    pub(super) fn fire_post(hooks: &Rc<RefCell<Self>>, data: &mut Data) {
        Self::fire(hooks, Phase::Post, data);
    }
}
