use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

use crate::signature::Signature;

/// Task lifecycle events observable through the hook registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    Publish,
    Process,
    Cancel,
}

/// Callback fired on task events, for metrics and audit trails. Hooks hold
/// only a borrowed view of the signature for the duration of the call.
pub trait TaskEventHook: Send + Sync {
    fn on_task_event(&self, queue: &str, event: TaskEvent, signature: &Signature);
}

impl<F> TaskEventHook for F
where
    F: Fn(&str, TaskEvent, &Signature) + Send + Sync,
{
    fn on_task_event(&self, queue: &str, event: TaskEvent, signature: &Signature) {
        self(queue, event, signature)
    }
}

// Process-wide and append-only; register everything before the first
// `start_consuming`.
static HOOKS: Lazy<RwLock<Vec<Arc<dyn TaskEventHook>>>> = Lazy::new(|| RwLock::new(Vec::new()));

pub fn register_task_event_hook(hook: Arc<dyn TaskEventHook>) {
    HOOKS
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .push(hook);
}

pub(crate) fn fire(queue: &str, event: TaskEvent, signature: &Signature) {
    let hooks = HOOKS.read().unwrap_or_else(|e| e.into_inner());
    for hook in hooks.iter() {
        hook.on_task_event(queue, event, signature);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn registered_hooks_fire_per_event() {
        let publishes = Arc::new(AtomicUsize::new(0));
        let processes = Arc::new(AtomicUsize::new(0));

        let seen_publishes = publishes.clone();
        let seen_processes = processes.clone();
        // hooks are global across the test binary, so count only this
        // test's queue
        register_task_event_hook(Arc::new(
            move |queue: &str, event: TaskEvent, _sig: &Signature| {
                if queue != "hook_unit_test_queue" {
                    return;
                }
                match event {
                    TaskEvent::Publish => {
                        seen_publishes.fetch_add(1, Ordering::SeqCst);
                    }
                    TaskEvent::Process => {
                        seen_processes.fetch_add(1, Ordering::SeqCst);
                    }
                    TaskEvent::Cancel => {}
                }
            },
        ));

        let sig = Signature::new("add", vec![]);
        fire("hook_unit_test_queue", TaskEvent::Publish, &sig);
        fire("hook_unit_test_queue", TaskEvent::Publish, &sig);
        fire("hook_unit_test_queue", TaskEvent::Process, &sig);
        fire("some_other_queue", TaskEvent::Publish, &sig);

        assert_eq!(publishes.load(Ordering::SeqCst), 2);
        assert_eq!(processes.load(Ordering::SeqCst), 1);
    }
}
