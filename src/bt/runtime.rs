//! BT Runtime (C8): ticks the loaded policy tree at a fixed rate while in
//! AUTO mode (§4.7).

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bonsai_bt::Status;
use tracing::{debug, error, info};

use crate::bt::context::ServiceContext;
use crate::bt::nodes::Blackboard;
use crate::bt::tree::{self, PolicyNode};
use crate::device_registry::DeviceRegistry;
use crate::error::{ErrorKind, Result, RuntimeError};
use crate::events::EventEmitter;
use crate::mode::{Mode, ModeManager};
use crate::parameters::ParameterManager;
use crate::provider::registry::ProviderRegistry;
use crate::router::CallRouter;
use crate::state_cache::StateCache;

pub const MIN_TICK_RATE_HZ: u64 = 1;
pub const MAX_TICK_RATE_HZ: u64 = 1000;
pub const DEFAULT_TICK_RATE_HZ: u64 = 10;

/// Ticks since the tree last returned `Success` before the health is
/// reported as stalled (§4.7, §9 open question: hard-coded rather than
/// configurable, see `DESIGN.md`).
pub const STALLED_TICK_THRESHOLD: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BtHealth {
    Idle,
    Running,
    Error,
    Stalled,
}

struct TickCounters {
    last_tick_ms: AtomicU64,
    total_ticks: AtomicU64,
    ticks_since_progress: AtomicU64,
    last_status_failure: AtomicBool,
    error_latched: AtomicBool,
}

impl Default for TickCounters {
    fn default() -> Self {
        Self {
            last_tick_ms: AtomicU64::new(0),
            total_ticks: AtomicU64::new(0),
            ticks_since_progress: AtomicU64::new(0),
            last_status_failure: AtomicBool::new(false),
            error_latched: AtomicBool::new(false),
        }
    }
}

/// Owns the loaded tree plus the shared subsystem handles it needs to build
/// a [`ServiceContext`] every tick, and the dedicated tick thread.
pub struct BtRuntime {
    tree: RwLock<Option<PolicyNode>>,
    state_cache: Arc<StateCache>,
    call_router: Arc<CallRouter>,
    devices: Arc<DeviceRegistry>,
    providers: Arc<ProviderRegistry>,
    parameters: Arc<ParameterManager>,
    mode_manager: Arc<ModeManager>,
    emitter: Arc<EventEmitter>,
    counters: TickCounters,
    stop_flag: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl BtRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state_cache: Arc<StateCache>,
        call_router: Arc<CallRouter>,
        devices: Arc<DeviceRegistry>,
        providers: Arc<ProviderRegistry>,
        parameters: Arc<ParameterManager>,
        mode_manager: Arc<ModeManager>,
        emitter: Arc<EventEmitter>,
    ) -> Self {
        Self {
            tree: RwLock::new(None),
            state_cache,
            call_router,
            devices,
            providers,
            parameters,
            mode_manager,
            emitter,
            counters: TickCounters::default(),
            stop_flag: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    pub fn load_tree(&self, path: &Path) -> Result<()> {
        let tree = tree::load_tree(path)?;
        *self.tree.write().unwrap() = Some(tree);
        info!(path = %path.display(), "loaded behavior tree");
        Ok(())
    }

    fn tick_once(&self) {
        if self.mode_manager.current_mode() != Mode::Auto {
            return;
        }
        let tree_guard = self.tree.read().unwrap();
        let Some(tree) = tree_guard.as_ref() else {
            return;
        };

        let ctx = ServiceContext::new(
            &self.state_cache,
            &self.call_router,
            &self.devices,
            &self.providers,
            &self.parameters,
        );
        let mut bb = Blackboard::default();

        let start = Instant::now();
        let status = crate::bt::tree::tick(tree, &ctx, &mut bb);
        let elapsed_ms = start.elapsed().as_millis() as u64;

        self.counters.last_tick_ms.store(elapsed_ms, Ordering::SeqCst);
        self.counters.total_ticks.fetch_add(1, Ordering::SeqCst);

        match status {
            Status::Success => {
                self.counters.ticks_since_progress.store(0, Ordering::SeqCst);
            }
            Status::Running => {
                self.counters.ticks_since_progress.fetch_add(1, Ordering::SeqCst);
            }
            Status::Failure => {
                self.counters.ticks_since_progress.fetch_add(1, Ordering::SeqCst);
                let was_failing = self.counters.last_status_failure.swap(true, Ordering::SeqCst);
                if !was_failing {
                    error!("behavior tree tick returned FAILURE");
                    self.emitter.emit_bt_error("behavior tree tick returned FAILURE");
                    self.counters.error_latched.store(true, Ordering::SeqCst);
                }
                return;
            }
        }
        self.counters.last_status_failure.store(false, Ordering::SeqCst);

        debug!(status = ?status, elapsed_ms, "bt tick complete");
    }

    pub fn get_health(&self) -> BtHealth {
        if self.tree.read().unwrap().is_none() {
            return BtHealth::Idle;
        }
        if self.counters.error_latched.load(Ordering::SeqCst) {
            return BtHealth::Error;
        }
        if self.counters.ticks_since_progress.load(Ordering::SeqCst) >= STALLED_TICK_THRESHOLD {
            return BtHealth::Stalled;
        }
        BtHealth::Running
    }

    pub fn total_ticks(&self) -> u64 {
        self.counters.total_ticks.load(Ordering::SeqCst)
    }

    pub fn last_tick_ms(&self) -> u64 {
        self.counters.last_tick_ms.load(Ordering::SeqCst)
    }

    /// Spawns the dedicated tick thread at `tick_rate_hz` (clamped to
    /// `[1, 1000]`, §4.7). No-op if already running.
    pub fn start(self: &Arc<Self>, tick_rate_hz: u64) -> Result<()> {
        let rate = tick_rate_hz.clamp(MIN_TICK_RATE_HZ, MAX_TICK_RATE_HZ);
        let mut guard = self.thread.lock().unwrap();
        if guard.is_some() {
            return Ok(());
        }
        self.stop_flag.store(false, Ordering::SeqCst);
        let runtime = Arc::clone(self);
        let stop_flag = Arc::clone(&self.stop_flag);
        let period = Duration::from_millis(1000 / rate.max(1));
        let handle = std::thread::Builder::new()
            .name("bt-tick".into())
            .spawn(move || {
                let mut next_deadline = Instant::now() + period;
                while !stop_flag.load(Ordering::SeqCst) {
                    runtime.tick_once();
                    while Instant::now() < next_deadline {
                        if stop_flag.load(Ordering::SeqCst) {
                            break;
                        }
                        std::thread::sleep(Duration::from_millis(1).min(period));
                    }
                    next_deadline += period;
                }
            })
            .map_err(|e| RuntimeError::new(ErrorKind::Internal, format!("spawn bt tick thread: {e}")))?;
        *guard = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}
