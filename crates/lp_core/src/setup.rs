//! Process-global wiring used by the interposition shim.

use std::sync::Arc;
use std::sync::Once;

use once_cell::sync::OnceCell;

use crate::environment::Environment;
use crate::library_context::LibraryGuard;
use crate::patrol::PatrolThread;
use crate::protector;
use crate::table::AllocationTable;
use crate::watch_switch::WatchSwitch;

static TABLE: OnceCell<Arc<AllocationTable>> = OnceCell::new();
static PATROL: OnceCell<PatrolThread> = OnceCell::new();

/// Directs [`log`] calls to stderr, once. `RUST_LOG` controls the level.
pub fn setup_logging() {
    static START: Once = Once::new();
    START.call_once(|| {
        let _ = env_logger::try_init();
    });
}

/// Brings up the whole engine: environment, watch switch, allocation table,
/// fault handler, patrol thread. Idempotent; the shim calls this from its
/// load-time constructor. Until it has run, [`global_table`] returns `None`
/// and wrappers delegate to the backing allocator untracked.
pub fn initialize() {
    static START: Once = Once::new();
    START.call_once(|| {
        // Everything below allocates; none of it may be tracked.
        let _ctx = LibraryGuard::enter();

        setup_logging();
        let env = Environment::from_env();

        let switch = match WatchSwitch::open_or_create(&env.comm_file_path) {
            Ok(switch) => Arc::new(switch),
            Err(err) => {
                // Without the shared word nothing can ever enable watching
                // externally; keep a private one so auto-start still works.
                log::warn!("watch switch unavailable, falling back to in-process control: {err}");
                Arc::new(WatchSwitch::detached())
            }
        };

        let table = Arc::new(AllocationTable::new(env, Arc::clone(&switch)));
        TABLE.set(Arc::clone(&table)).ok();

        protector::install_fault_handler();
        PATROL.set(PatrolThread::spawn(table, switch)).ok();

        log::info!("leakpatrol initialized");
    });
}

/// The table the shim and the fault handler route through. `None` before
/// [`initialize`] has completed.
pub fn global_table() -> Option<&'static Arc<AllocationTable>> {
    TABLE.get()
}
