use std::collections::{HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, Weak};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use worldhost_common::{EntityId, Position};
use worldhost_persist::{StateStore, StoreError};
use worldhost_state::{Entity, Inventory, Player, StateError, World, WorldState};

use crate::isolation::{FaultIsolationController, IsolationPolicy, IsolationSnapshot};

/// Errors from executor lifecycle and persistence operations.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("failed to spawn tick thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("system {0} must not be blank")]
    BlankSystemKey(&'static str),
}

/// Failure reported by a system callback.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct SystemError(pub String);

impl SystemError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Passed to each system callback once per tick.
pub struct TickContext {
    pub state: Arc<WorldState>,
    pub tick: u64,
}

type SystemCallback = Arc<dyn Fn(&TickContext) -> Result<(), SystemError> + Send + Sync>;

/// Executor configuration. `state_path: None` disables persistence;
/// `autosave_every_ticks: 0` disables autosave but keeps the final save on
/// stop.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub tick_period: Duration,
    pub autosave_every_ticks: u64,
    pub default_world: String,
    pub isolation: IsolationPolicy,
    pub state_path: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            tick_period: Duration::from_millis(50),
            autosave_every_ticks: 200,
            default_world: "world".to_string(),
            isolation: IsolationPolicy::default(),
            state_path: None,
        }
    }
}

/// Point-in-time view of the executor and its systems.
#[derive(Debug, Clone)]
pub struct ExecutorStatus {
    pub running: bool,
    pub tick_count: u64,
    pub tick_failures: u64,
    pub last_tick_duration: Duration,
    pub average_tick_duration: Duration,
    pub queued_mutations: usize,
    pub online_players: usize,
    pub worlds: usize,
    pub entities: usize,
    pub systems: Vec<SystemStatus>,
}

#[derive(Debug, Clone)]
pub struct SystemStatus {
    pub owner: String,
    pub unit: String,
    pub runs: u64,
    pub failures: u64,
    pub average_duration: Duration,
    pub max_duration: Duration,
    pub isolation: IsolationSnapshot,
}

struct SystemEntry {
    owner: String,
    unit: String,
    owner_key: String,
    unit_key: String,
    callback: SystemCallback,
    runs: u64,
    failures: u64,
    total_duration: Duration,
    max_duration: Duration,
}

type Mutation = Box<dyn FnOnce(&WorldState) + Send>;

struct MutationQueue {
    /// While open, jobs are drained by the tick thread. Closed by `stop()`
    /// after the final drain; later callers apply directly.
    open: bool,
    jobs: VecDeque<Mutation>,
}

#[derive(Default)]
struct Inner {
    systems: Vec<SystemEntry>,
    last_tick_duration: Duration,
    total_tick_duration: Duration,
    handle: Option<JoinHandle<()>>,
    migration_history: Vec<String>,
}

/// Tick-driven executor over a [`WorldState`].
///
/// Construct with [`TickExecutor::new`], then `start()` to load persisted
/// state and spawn the tick thread. Callers must `stop()` before dropping
/// the last external handle, since the tick thread holds its own.
pub struct TickExecutor {
    self_handle: Weak<Self>,
    config: ExecutorConfig,
    state: Arc<WorldState>,
    store: Option<StateStore>,
    isolation: FaultIsolationController,
    queue: Mutex<MutationQueue>,
    inner: Mutex<Inner>,
    /// Set by the tick thread itself on entry to the loop. Kept outside
    /// `inner` so the fast-path check in `mutate` never contends with a tick
    /// in progress.
    tick_thread: Mutex<Option<ThreadId>>,
    running: AtomicBool,
    tick_count: AtomicU64,
    tick_failures: AtomicU64,
}

impl TickExecutor {
    pub fn new(config: ExecutorConfig) -> Arc<Self> {
        let state = Arc::new(WorldState::new(&config.default_world));
        let store = config.state_path.clone().map(StateStore::new);
        let isolation = FaultIsolationController::new(config.isolation.clone());
        Arc::new_cyclic(|weak| Self {
            self_handle: weak.clone(),
            config,
            state,
            store,
            isolation,
            queue: Mutex::new(MutationQueue {
                open: false,
                jobs: VecDeque::new(),
            }),
            inner: Mutex::new(Inner::default()),
            tick_thread: Mutex::new(None),
            running: AtomicBool::new(false),
            tick_count: AtomicU64::new(0),
            tick_failures: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> &Arc<WorldState> {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count.load(Ordering::SeqCst)
    }

    /// Load persisted state (if configured) and spawn the tick thread.
    /// Idempotent: a second call while running does nothing.
    pub fn start(&self) -> Result<(), ExecutorError> {
        // The tick thread needs a strong handle; new() hands these out as
        // Arc, so the upgrade cannot fail while a caller exists.
        let Some(executor) = self.self_handle.upgrade() else {
            return Ok(());
        };
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.load_persisted() {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }
        self.lock_queue().open = true;
        let handle = std::thread::Builder::new()
            .name("worldhost-tick".to_string())
            .spawn(move || executor.run_loop())?;
        self.lock_inner().handle = Some(handle);
        tracing::info!(
            tick_period_ms = self.config.tick_period.as_millis() as u64,
            autosave_every_ticks = self.config.autosave_every_ticks,
            persistent = self.store.is_some(),
            "executor started"
        );
        Ok(())
    }

    /// Stop the tick thread, drain any still-queued mutations, and write a
    /// final save. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let handle = self.lock_inner().handle.take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        // Close the queue and run whatever raced in after the last tick, so
        // every blocked mutate() call completes.
        let leftovers = {
            let mut queue = self.lock_queue();
            queue.open = false;
            std::mem::take(&mut queue.jobs)
        };
        for job in leftovers {
            job(&self.state);
        }
        if let Err(e) = self.save_state() {
            tracing::warn!(error = %e, "final save on stop failed");
        }
        tracing::info!(ticks = self.tick_count(), "executor stopped");
    }

    /// Run a write against the world state. While the executor is running,
    /// the closure is queued and applied at the next tick boundary; the
    /// caller blocks until it has run. Calls from the tick thread itself
    /// (i.e. from a system callback) and calls while stopped apply
    /// immediately.
    pub fn mutate<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&WorldState) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.on_tick_thread() {
            return f(&self.state);
        }
        let (done_tx, done_rx) = mpsc::channel();
        {
            let mut queue = self.lock_queue();
            if !queue.open {
                drop(queue);
                return f(&self.state);
            }
            queue.jobs.push_back(Box::new(move |state: &WorldState| {
                let _ = done_tx.send(f(state));
            }));
        }
        match done_rx.recv() {
            Ok(result) => result,
            // The queue is drained before it closes, so the sender cannot be
            // dropped without having run the job.
            Err(_) => unreachable!("queued mutation dropped without running"),
        }
    }

    // --- systems ---

    /// Register a system callback, replacing any previous registration for
    /// the same (owner, unit) key. Systems run each tick in (owner, unit)
    /// order, case-insensitively.
    pub fn register_system<F>(&self, owner: &str, unit: &str, callback: F) -> Result<(), ExecutorError>
    where
        F: Fn(&TickContext) -> Result<(), SystemError> + Send + Sync + 'static,
    {
        let owner = owner.trim();
        let unit = unit.trim();
        if owner.is_empty() {
            return Err(ExecutorError::BlankSystemKey("owner"));
        }
        if unit.is_empty() {
            return Err(ExecutorError::BlankSystemKey("unit"));
        }
        let entry = SystemEntry {
            owner: owner.to_string(),
            unit: unit.to_string(),
            owner_key: owner.to_lowercase(),
            unit_key: unit.to_lowercase(),
            callback: Arc::new(callback),
            runs: 0,
            failures: 0,
            total_duration: Duration::ZERO,
            max_duration: Duration::ZERO,
        };
        let mut inner = self.lock_inner();
        inner
            .systems
            .retain(|s| !(s.owner_key == entry.owner_key && s.unit_key == entry.unit_key));
        inner.systems.push(entry);
        inner
            .systems
            .sort_by(|a, b| (&a.owner_key, &a.unit_key).cmp(&(&b.owner_key, &b.unit_key)));
        tracing::debug!(owner, unit, total = inner.systems.len(), "system registered");
        Ok(())
    }

    /// Unregister a system and drop its isolation state.
    pub fn unregister_system(&self, owner: &str, unit: &str) -> bool {
        let owner_key = owner.trim().to_lowercase();
        let unit_key = unit.trim().to_lowercase();
        let mut inner = self.lock_inner();
        let before = inner.systems.len();
        inner
            .systems
            .retain(|s| !(s.owner_key == owner_key && s.unit_key == unit_key));
        let removed = inner.systems.len() < before;
        if removed {
            let active: HashSet<(String, String)> = inner
                .systems
                .iter()
                .map(|s| (s.owner_key.clone(), s.unit_key.clone()))
                .collect();
            self.isolation.prune_to(&active);
        }
        removed
    }

    // --- mutation wrappers ---

    pub fn create_world(&self, name: &str, seed: i64) -> Result<World, StateError> {
        let name = name.to_string();
        self.mutate(move |state| state.create_world(&name, seed))
    }

    pub fn join_player(
        &self,
        name: &str,
        world: &str,
        position: Position,
    ) -> Result<Player, StateError> {
        let name = name.to_string();
        let world = world.to_string();
        self.mutate(move |state| state.join_player(&name, &world, position))
    }

    pub fn leave_player(&self, name: &str) -> Option<Player> {
        let name = name.to_string();
        self.mutate(move |state| state.leave_player(&name))
    }

    pub fn move_player(
        &self,
        name: &str,
        position: Position,
        world: Option<&str>,
    ) -> Option<Player> {
        let name = name.to_string();
        let world = world.map(str::to_string);
        self.mutate(move |state| state.move_player(&name, position, world.as_deref()))
    }

    pub fn spawn_entity(
        &self,
        kind: &str,
        world: &str,
        position: Position,
    ) -> Result<Entity, StateError> {
        let kind = kind.to_string();
        let world = world.to_string();
        self.mutate(move |state| state.spawn_entity(&kind, &world, position))
    }

    pub fn remove_entity(&self, id: EntityId) -> Option<Entity> {
        self.mutate(move |state| state.remove_entity(id))
    }

    pub fn set_inventory_item(&self, owner: &str, slot: u32, item_id: &str) -> bool {
        let owner = owner.to_string();
        let item_id = item_id.to_string();
        self.mutate(move |state| state.set_inventory_item(&owner, slot, &item_id))
    }

    pub fn set_world_time(&self, world: &str, time: u64) -> bool {
        let world = world.to_string();
        self.mutate(move |state| state.set_world_time(&world, time))
    }

    pub fn set_world_weather(&self, world: &str, weather: &str) -> bool {
        let world = world.to_string();
        let weather = weather.to_string();
        self.mutate(move |state| state.set_world_weather(&world, &weather))
    }

    pub fn set_world_data(
        &self,
        world: &str,
        data: &std::collections::BTreeMap<String, String>,
    ) -> Option<std::collections::BTreeMap<String, String>> {
        let world = world.to_string();
        let data = data.clone();
        self.mutate(move |state| state.set_world_data(&world, &data))
    }

    // --- read pass-throughs ---

    pub fn worlds(&self) -> Arc<Vec<World>> {
        self.state.worlds()
    }

    pub fn players(&self) -> Arc<Vec<Player>> {
        self.state.players()
    }

    pub fn entities(&self, world: Option<&str>) -> Arc<Vec<Entity>> {
        self.state.entities(world)
    }

    pub fn inventory(&self, owner: &str) -> Option<Inventory> {
        self.state.inventory(owner)
    }

    pub fn find_player(&self, name: &str) -> Option<Player> {
        self.state.find_player(name)
    }

    pub fn world_time(&self, world: &str) -> Option<u64> {
        self.state.world_time(world)
    }

    // --- persistence ---

    /// Write the current state. A no-op without a configured state path.
    pub fn save_state(&self) -> Result<(), ExecutorError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let history = self.lock_inner().migration_history.clone();
        store.save(&self.state.snapshot(), &history)?;
        Ok(())
    }

    fn load_persisted(&self) -> Result<(), ExecutorError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let Some(result) = store.load_with_report()? else {
            tracing::info!(path = %store.path().display(), "no state file, starting fresh");
            return Ok(());
        };
        self.state.restore(&result.snapshot);
        self.state.create_world(&self.config.default_world, 0).ok();
        self.lock_inner().migration_history = result.report.migration_history.clone();
        if result.report.migrated {
            // Rewrite at the current schema so the upgrade only happens once.
            if let Err(e) = self.save_state() {
                tracing::warn!(error = %e, "re-save after migration failed");
            }
        }
        Ok(())
    }

    // --- status ---

    pub fn status(&self) -> ExecutorStatus {
        let tick_count = self.tick_count();
        let inner = self.lock_inner();
        let systems = inner
            .systems
            .iter()
            .map(|s| SystemStatus {
                owner: s.owner.clone(),
                unit: s.unit.clone(),
                runs: s.runs,
                failures: s.failures,
                average_duration: if s.runs > 0 {
                    s.total_duration / s.runs as u32
                } else {
                    Duration::ZERO
                },
                max_duration: s.max_duration,
                isolation: self
                    .isolation
                    .snapshot_for(&s.owner_key, &s.unit_key, tick_count),
            })
            .collect();
        ExecutorStatus {
            running: self.is_running(),
            tick_count,
            tick_failures: self.tick_failures.load(Ordering::SeqCst),
            last_tick_duration: inner.last_tick_duration,
            average_tick_duration: if tick_count > 0 {
                inner.total_tick_duration / tick_count as u32
            } else {
                Duration::ZERO
            },
            queued_mutations: self.lock_queue().jobs.len(),
            online_players: self.state.online_player_count(),
            worlds: self.state.world_count(),
            entities: self.state.entity_count(),
            systems,
        }
    }

    // --- tick loop ---

    fn run_loop(self: Arc<Self>) {
        *self.lock_tick_thread() = Some(std::thread::current().id());
        while self.running.load(Ordering::SeqCst) {
            let started = Instant::now();
            self.tick_once();
            let elapsed = started.elapsed();
            if let Some(remaining) = self.config.tick_period.checked_sub(elapsed) {
                std::thread::sleep(remaining);
            }
        }
        *self.lock_tick_thread() = None;
    }

    fn tick_once(&self) {
        let tick = self.tick_count.load(Ordering::SeqCst);
        let started = Instant::now();

        self.drain_queue();
        self.run_systems(tick);
        self.state.tick_worlds();
        self.drain_queue();

        let elapsed = started.elapsed();
        let completed = self.tick_count.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut inner = self.lock_inner();
            inner.last_tick_duration = elapsed;
            inner.total_tick_duration += elapsed;
        }

        if self.config.autosave_every_ticks > 0
            && self.store.is_some()
            && completed % self.config.autosave_every_ticks == 0
        {
            if let Err(e) = self.save_state() {
                tracing::warn!(tick = completed, error = %e, "autosave failed");
            } else {
                tracing::debug!(tick = completed, "autosave complete");
            }
        }
    }

    fn drain_queue(&self) {
        loop {
            let job = self.lock_queue().jobs.pop_front();
            match job {
                Some(job) => job(&self.state),
                None => break,
            }
        }
    }

    fn run_systems(&self, tick: u64) {
        // Snapshot the run order up front and release the registry lock:
        // callbacks may call back into the executor (mutation wrappers,
        // status, even register_system), so no executor lock may be held
        // while one runs.
        let batch: Vec<(String, String, SystemCallback)> = {
            let inner = self.lock_inner();
            inner
                .systems
                .iter()
                .map(|s| (s.owner_key.clone(), s.unit_key.clone(), Arc::clone(&s.callback)))
                .collect()
        };
        let ctx = TickContext {
            state: Arc::clone(&self.state),
            tick,
        };
        for (owner_key, unit_key, callback) in batch {
            if !self.isolation.should_run(&owner_key, &unit_key, tick) {
                continue;
            }
            let started = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(|| callback(&ctx)));
            let elapsed = started.elapsed();
            let error = match outcome {
                Ok(Ok(())) => {
                    self.isolation.record_success(&owner_key, &unit_key);
                    let mut inner = self.lock_inner();
                    if let Some(entry) = find_system(&mut inner, &owner_key, &unit_key) {
                        entry.runs += 1;
                        entry.total_duration += elapsed;
                        entry.max_duration = entry.max_duration.max(elapsed);
                    }
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(panic) => format!("panic: {}", panic_message(panic.as_ref())),
            };
            {
                let mut inner = self.lock_inner();
                if let Some(entry) = find_system(&mut inner, &owner_key, &unit_key) {
                    entry.failures += 1;
                }
            }
            self.tick_failures.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(
                owner = %owner_key,
                unit = %unit_key,
                tick,
                error = %error,
                "system failed"
            );
            self.isolation
                .record_failure(&owner_key, &unit_key, tick, &error);
        }
    }

    fn on_tick_thread(&self) -> bool {
        *self.lock_tick_thread() == Some(std::thread::current().id())
    }

    fn lock_tick_thread(&self) -> MutexGuard<'_, Option<ThreadId>> {
        self.tick_thread.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_queue(&self) -> MutexGuard<'_, MutationQueue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn find_system<'a>(
    inner: &'a mut Inner,
    owner_key: &str,
    unit_key: &str,
) -> Option<&'a mut SystemEntry> {
    inner
        .systems
        .iter_mut()
        .find(|s| s.owner_key == owner_key && s.unit_key == unit_key)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
