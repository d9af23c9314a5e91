//! WASM plugin runtime using wasmtime.
//!
//! This module compiles plugin modules, instantiates them inside a memory
//! limited store, and invokes their exported handlers under an epoch deadline
//! so a runaway guest cannot hold a host thread forever.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use wasmtime::{
    Config, Engine, Instance, Linker, Memory, Module, Store, StoreLimitsBuilder, Trap, TypedFunc,
};

use super::host::{self, DispatchSlot, HostDispatch, HostState};
use super::{CallContext, LogBuffer, Manifest, PluginError, PluginResult, PLUGIN_API_VERSION, WASM_MAGIC};

/// Interval between engine epoch increments.
const EPOCH_TICK: Duration = Duration::from_millis(10);

/// Exports that belong to the ABI rather than to plugin handlers.
const RESERVED_EXPORTS: [&str; 3] = ["memory", "_start", "_initialize"];

type HandlerFunc = TypedFunc<(u32, u32), u64>;
type DispatchFunc = TypedFunc<(u32, u32, u32, u32), u64>;

/// Background thread advancing the engine epoch. Stops when dropped.
struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EpochTicker {
    fn start(engine: Engine) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = std::thread::Builder::new()
            .name("wasmhost-epoch".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    std::thread::sleep(EPOCH_TICK);
                    engine.increment_epoch();
                }
            })
            .ok();
        if handle.is_none() {
            tracing::error!("Failed to start epoch ticker; plugin calls will not time out");
        }
        Self { stop, handle: Mutex::new(handle) }
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

fn deadline_ticks(timeout: Duration) -> u64 {
    let ticks = timeout.as_millis() / EPOCH_TICK.as_millis();
    u64::try_from(ticks).unwrap_or(u64::MAX).max(1) + 1
}

/// Plugin runtime for executing WASM plugins.
///
/// Cloning is cheap; clones share the engine, the epoch ticker and the
/// compilation counter.
#[derive(Clone)]
pub struct PluginRuntime {
    engine: Engine,
    _ticker: Arc<EpochTicker>,
    memory_limit: usize,
    logs: Arc<LogBuffer>,
    compiles: Arc<AtomicUsize>,
    dispatch: DispatchSlot,
}

impl PluginRuntime {
    /// Create a runtime whose stores may grow to `memory_limit` bytes.
    pub fn new(memory_limit: usize, logs: Arc<LogBuffer>) -> PluginResult<Self> {
        let mut config = Config::new();
        config.epoch_interruption(true);
        let engine =
            Engine::new(&config).map_err(|e| PluginError::Config(format!("wasm engine: {e}")))?;
        let ticker = Arc::new(EpochTicker::start(engine.clone()));

        Ok(Self {
            engine,
            _ticker: ticker,
            memory_limit,
            logs,
            compiles: Arc::new(AtomicUsize::new(0)),
            dispatch: DispatchSlot::default(),
        })
    }

    /// Route `plugin_call` host calls from every instance of this runtime to
    /// `dispatcher`. Only the first dispatcher sticks.
    pub fn set_dispatcher(&self, dispatcher: Weak<dyn HostDispatch>) {
        if self.dispatch.set(dispatcher).is_err() {
            tracing::debug!("Plugin call dispatcher already set");
        }
    }

    /// Number of modules compiled by this runtime.
    pub fn compile_count(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }

    /// Compile and instantiate a plugin.
    ///
    /// When `manifest` is `None` the module must export `gk_register`, whose
    /// JSON output becomes the manifest. Every handler the manifest declares
    /// is resolved here, so a missing export fails the load rather than a call.
    pub fn instantiate(
        &self,
        name: &str,
        bytes: &[u8],
        manifest: Option<Manifest>,
        timeout: Duration,
    ) -> PluginResult<CompiledPlugin> {
        let mut booted = self.boot(name, bytes, timeout)?;

        let manifest = match manifest {
            Some(manifest) => manifest,
            None => booted.register(name, timeout)?,
        };
        manifest.ensure_identity(name)?;
        if !manifest.is_compatible_with(PLUGIN_API_VERSION) {
            return Err(PluginError::IncompatibleVersion {
                name: name.to_string(),
                required: manifest.api_version.clone(),
                available: PLUGIN_API_VERSION.to_string(),
            });
        }

        let (table, dispatcher) = booted.dispatch_table();
        for handler in manifest.handlers() {
            if !table.contains_key(handler) && dispatcher.is_none() {
                return Err(PluginError::MissingExport {
                    plugin: name.to_string(),
                    handler: handler.to_string(),
                });
            }
        }

        let manifest = Arc::new(manifest);
        booted.store.data_mut().manifest = Some(manifest.clone());
        tracing::debug!(plugin = name, handlers = table.len(), "Plugin instantiated");

        Ok(CompiledPlugin {
            name: name.to_string(),
            manifest,
            live: Mutex::new(Live {
                store: booted.store,
                memory: booted.memory,
                malloc: booted.malloc,
                free: booted.free,
                table,
                dispatcher,
            }),
        })
    }

    /// Run a standalone module's `gk_register` and return its manifest.
    pub fn describe(&self, name: &str, bytes: &[u8], timeout: Duration) -> PluginResult<Manifest> {
        self.boot(name, bytes, timeout)?.register(name, timeout)
    }

    fn boot(&self, name: &str, bytes: &[u8], timeout: Duration) -> PluginResult<Booted> {
        check_magic(name, bytes)?;
        let module = Module::new(&self.engine, bytes).map_err(|e| PluginError::compile(name, e))?;
        self.compiles.fetch_add(1, Ordering::SeqCst);

        let limits = StoreLimitsBuilder::new()
            .memory_size(self.memory_limit)
            .instances(1)
            .trap_on_grow_failure(true)
            .build();
        let state = HostState::new(name, self.logs.clone(), limits, self.dispatch.clone());
        let mut store = Store::new(&self.engine, state);
        store.limiter(|state| &mut state.limits);

        let mut linker = Linker::new(&self.engine);
        host::add_host_functions(&mut linker).map_err(|e| PluginError::compile(name, e))?;
        linker.define_unknown_imports_as_traps(&module).map_err(|e| PluginError::compile(name, e))?;

        store.set_epoch_deadline(deadline_ticks(timeout));
        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| classify(e, name, "instantiate", timeout))?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| missing_export(name, "memory"))?;
        let malloc = instance
            .get_typed_func::<u32, u32>(&mut store, "gk_malloc")
            .map_err(|_| missing_export(name, "gk_malloc"))?;
        let free = instance.get_typed_func::<u32, ()>(&mut store, "gk_free").ok();

        Ok(Booted { module, instance, store, memory, malloc, free })
    }
}

fn check_magic(name: &str, bytes: &[u8]) -> PluginResult<()> {
    if bytes.len() < WASM_MAGIC.len() || bytes[..WASM_MAGIC.len()] != WASM_MAGIC {
        return Err(PluginError::compile(name, "not a WebAssembly module (bad magic bytes)"));
    }
    Ok(())
}

fn missing_export(plugin: &str, export: &str) -> PluginError {
    PluginError::MissingExport { plugin: plugin.to_string(), handler: export.to_string() }
}

/// Map a wasmtime error from guest code to a plugin error.
fn classify(err: wasmtime::Error, plugin: &str, function: &str, timeout: Duration) -> PluginError {
    match err.downcast_ref::<Trap>() {
        Some(Trap::Interrupt) => PluginError::Timeout {
            plugin: plugin.to_string(),
            function: function.to_string(),
            millis: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        },
        _ => PluginError::execution(plugin, function, format!("{err:#}")),
    }
}

/// A freshly instantiated module, before its dispatch table is built.
struct Booted {
    module: Module,
    instance: Instance,
    store: Store<HostState>,
    memory: Memory,
    malloc: TypedFunc<u32, u32>,
    free: Option<TypedFunc<u32, ()>>,
}

impl Booted {
    fn register(&mut self, name: &str, timeout: Duration) -> PluginResult<Manifest> {
        let register = self
            .instance
            .get_typed_func::<(), u64>(&mut self.store, "gk_register")
            .map_err(|_| {
                PluginError::ManifestInvalid(format!(
                    "standalone module '{name}' must export gk_register"
                ))
            })?;
        self.store.set_epoch_deadline(deadline_ticks(timeout));
        let packed = register
            .call(&mut self.store, ())
            .map_err(|e| classify(e, name, "gk_register", timeout))?;
        let bytes = read_result(&mut self.store, self.memory, self.free.as_ref(), packed)
            .map_err(|reason| PluginError::InvalidResponse {
                plugin: name.to_string(),
                function: "gk_register".to_string(),
                reason,
            })?;
        Manifest::from_json(&bytes)
    }

    /// Resolve every export shaped like a handler, plus the optional `gk_call` dispatcher.
    fn dispatch_table(&mut self) -> (HashMap<String, HandlerFunc>, Option<DispatchFunc>) {
        let names: Vec<String> = self
            .module
            .exports()
            .map(|export| export.name().to_string())
            .filter(|name| !name.starts_with("gk_") && !RESERVED_EXPORTS.contains(&name.as_str()))
            .collect();

        let mut table = HashMap::new();
        for name in names {
            if let Ok(func) = self.instance.get_typed_func::<(u32, u32), u64>(&mut self.store, &name)
            {
                table.insert(name, func);
            }
        }
        let dispatcher = self
            .instance
            .get_typed_func::<(u32, u32, u32, u32), u64>(&mut self.store, "gk_call")
            .ok();
        (table, dispatcher)
    }
}

/// A compiled, instantiated plugin module.
///
/// The store is single-threaded, so calls into one plugin are serialized.
pub struct CompiledPlugin {
    name: String,
    manifest: Arc<Manifest>,
    live: Mutex<Live>,
}

impl std::fmt::Debug for CompiledPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledPlugin").field("name", &self.name).finish_non_exhaustive()
    }
}

struct Live {
    store: Store<HostState>,
    memory: Memory,
    malloc: TypedFunc<u32, u32>,
    free: Option<TypedFunc<u32, ()>>,
    table: HashMap<String, HandlerFunc>,
    dispatcher: Option<DispatchFunc>,
}

impl CompiledPlugin {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.manifest
    }

    /// Whether `function` resolves to a direct export.
    pub fn exports(&self, function: &str) -> bool {
        self.live.lock().table.contains_key(function)
    }

    /// Invoke `function` with JSON `args`. Blocks until the guest returns,
    /// traps, or runs past `timeout`. Host imports see `ctx` for the duration.
    pub fn invoke(
        &self,
        function: &str,
        args: &[u8],
        ctx: &CallContext,
        timeout: Duration,
    ) -> PluginResult<Vec<u8>> {
        let started = Instant::now();
        let mut live = self.live.try_lock_for(timeout).ok_or_else(|| PluginError::Timeout {
            plugin: self.name.clone(),
            function: function.to_string(),
            millis: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        })?;
        let remaining = timeout.saturating_sub(started.elapsed());

        live.store.data_mut().enter(ctx, started + timeout);
        let result = live.call(&self.name, function, args, remaining);
        live.store.data_mut().leave();
        result
    }
}

impl Live {
    fn call(
        &mut self,
        plugin: &str,
        function: &str,
        args: &[u8],
        timeout: Duration,
    ) -> PluginResult<Vec<u8>> {
        let direct = self.table.get(function).cloned();
        let dispatcher = self.dispatcher.clone();
        if direct.is_none() && dispatcher.is_none() {
            return Err(PluginError::FunctionNotFound {
                plugin: plugin.to_string(),
                function: function.to_string(),
            });
        }

        self.store.set_epoch_deadline(deadline_ticks(timeout));
        let fault = |e: wasmtime::Error| classify(e, plugin, function, timeout);

        let (args_ptr, args_len) = self.write(args).map_err(fault)?;
        let packed = if let Some(handler) = direct {
            handler.call(&mut self.store, (args_ptr, args_len))
        } else {
            let (fn_ptr, fn_len) = self.write(function.as_bytes()).map_err(fault)?;
            let packed = match &dispatcher {
                Some(dispatcher) => {
                    dispatcher.call(&mut self.store, (fn_ptr, fn_len, args_ptr, args_len))
                }
                None => Ok(0),
            };
            self.release(fn_ptr);
            packed
        }
        .map_err(fault)?;
        self.release(args_ptr);

        read_result(&mut self.store, self.memory, self.free.as_ref(), packed).map_err(|reason| {
            PluginError::InvalidResponse {
                plugin: plugin.to_string(),
                function: function.to_string(),
                reason,
            }
        })
    }

    fn write(&mut self, data: &[u8]) -> wasmtime::Result<(u32, u32)> {
        if data.is_empty() {
            return Ok((0, 0));
        }
        let len = u32::try_from(data.len()).map_err(wasmtime::Error::msg)?;
        let ptr = self.malloc.call(&mut self.store, len)?;
        self.memory.write(&mut self.store, ptr as usize, data)?;
        Ok((ptr, len))
    }

    fn release(&mut self, ptr: u32) {
        if ptr == 0 {
            return;
        }
        if let Some(free) = &self.free {
            if let Err(e) = free.call(&mut self.store, ptr) {
                tracing::debug!(plugin = %self.store.data().plugin, error = %e, "gk_free failed");
            }
        }
    }
}

/// Copy a packed `(ptr, len)` result out of guest memory and release it.
fn read_result(
    store: &mut Store<HostState>,
    memory: Memory,
    free: Option<&TypedFunc<u32, ()>>,
    packed: u64,
) -> Result<Vec<u8>, String> {
    let (ptr, len) = host::unpack(packed);
    if len == 0 {
        return Ok(Vec::new());
    }
    if len > host::MAX_GUEST_TRANSFER {
        return Err(format!("result of {len} bytes exceeds transfer limit"));
    }
    let mut buf = vec![0u8; len as usize];
    memory
        .read(&*store, ptr as usize, &mut buf)
        .map_err(|_| format!("result pointer {ptr}+{len} is outside guest memory"))?;
    if let Some(free) = free {
        if let Err(e) = free.call(&mut *store, ptr) {
            tracing::debug!(plugin = %store.data().plugin, error = %e, "gk_free failed");
        }
    }
    Ok(buf)
}
