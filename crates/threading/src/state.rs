//! Per-thread interpreter state
//!
//! Each thread carries at most one state object. The shim does not know its
//! type; callers get it back with the type they stored.

use std::any::Any;
use std::cell::RefCell;
use std::sync::Arc;

type State = Arc<dyn Any + Send + Sync>;

thread_local! {
    static THREAD_STATE: RefCell<Option<State>> = const { RefCell::new(None) };
}

/// Set the calling thread's state, replacing any previous one
pub fn set_state<S: Any + Send + Sync>(state: Arc<S>) {
    THREAD_STATE.with(|slot| *slot.borrow_mut() = Some(state));
}

/// The calling thread's state, if one of type `S` is set
pub fn get_state<S: Any + Send + Sync>() -> Option<Arc<S>> {
    THREAD_STATE.with(|slot| {
        slot.borrow()
            .as_ref()
            .and_then(|state| Arc::clone(state).downcast::<S>().ok())
    })
}

pub fn clear_state() {
    THREAD_STATE.with(|slot| *slot.borrow_mut() = None);
}
