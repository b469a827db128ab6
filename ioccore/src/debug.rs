//! Process wide debug state: the verbosity category map and the pre-abort
//! hook used to warn remote peers before the process dies.

use hashbrown::HashSet;
use lazy_static::lazy_static;
use std::env;
use std::process;
use std::sync::Mutex;

/// Hook invoked with the fatal message right before aborting the process.
pub type PreAbortHook = Box<dyn Fn(&str) + Send>;

struct DebugState {
    all: bool,
    categories: HashSet<String>,
}

impl DebugState {
    fn from_env() -> DebugState {
        let mut state = DebugState {
            all: false,
            categories: HashSet::new(),
        };

        if let Ok(filter) = env::var("IOC_DEBUG") {
            state.apply_filter(&filter);
        }

        state
    }

    fn apply_filter(&mut self, filter: &str) {
        if filter == "all" || filter == "*" {
            self.all = true;
            return;
        }

        for category in filter.split(',').filter(|part| !part.is_empty()) {
            self.categories.insert(category.to_string());
        }
    }
}

lazy_static! {
    static ref STATE: Mutex<DebugState> = Mutex::new(DebugState::from_env());
    static ref PRE_ABORT_HOOK: Mutex<Option<PreAbortHook>> = Mutex::new(None);
}

/// Enable the given verbosity filter, either `all`/`*` or a comma separated
/// list of categories. The `IOC_DEBUG` environment variable is applied at
/// startup and this overrides it.
pub fn set_verbosity(filter: &str) {
    let mut state = STATE.lock().expect("Debug state lock poisoned");
    state.all = false;
    state.categories.clear();
    state.apply_filter(filter);
}

/// Enable every verbosity category.
pub fn enable_all() {
    STATE.lock().expect("Debug state lock poisoned").all = true;
}

/// Check whether the given verbosity category is enabled.
pub fn verbose_enabled(category: &str) -> bool {
    let state = STATE.lock().expect("Debug state lock poisoned");
    state.all || state.categories.contains(category)
}

/// Install the hook to be called before aborting on a fatal error. The server
/// uses it to broadcast the error to every connected client.
pub fn set_pre_abort_hook(hook: PreAbortHook) {
    *PRE_ABORT_HOOK.lock().expect("Abort hook lock poisoned") = Some(hook);
}

/// Remove the pre-abort hook.
pub fn clear_pre_abort_hook() {
    *PRE_ABORT_HOOK.lock().expect("Abort hook lock poisoned") = None;
}

/// Terminate the process on an unrecoverable error. The pre-abort hook runs
/// first so remote peers can be notified. `IOC_ABORT` selects between a core
/// dump and a clean exit.
pub fn fatal(message: &str) -> ! {
    eprintln!("FATAL: {}", message);

    // Take the hook out so a second fatal error raised while broadcasting
    // cannot loop.
    let hook = PRE_ABORT_HOOK
        .lock()
        .expect("Abort hook lock poisoned")
        .take();

    if let Some(hook) = hook {
        hook(message);
    }

    match env::var("IOC_ABORT") {
        Ok(value) if value == "0" || value == "false" => process::exit(1),
        _ => process::abort(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Single test since the verbosity state is process wide.
    #[test]
    fn test_verbosity_filters() {
        set_verbosity("client:tcp,nvdimm");

        assert!(verbose_enabled("client:tcp"));
        assert!(verbose_enabled("nvdimm"));
        assert!(!verbose_enabled("serializer"));

        set_verbosity("*");
        assert!(verbose_enabled("serializer"));

        set_verbosity("");
        assert!(!verbose_enabled("client:tcp"));
        assert!(!verbose_enabled("serializer"));
    }
}
