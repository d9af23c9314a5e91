//! Host functions for plugins.
//!
//! This module defines what a guest module can import from the host (module
//! `gk`) and the per-store state those imports read. Data crosses the sandbox
//! boundary as `(ptr, len)` pairs in guest memory; results are packed into a
//! single `i64` as `(ptr << 32) | len`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use wasmtime::{Caller, Extern, Linker, Memory, StoreLimits};

use super::{CallContext, LogBuffer, Manifest, PluginError, PluginResult};

/// Largest buffer the host will copy out of guest memory in one read.
pub const MAX_GUEST_TRANSFER: u32 = 16 * 1024 * 1024;

/// Host import module name.
pub const HOST_MODULE: &str = "gk";

/// Longest chain of plugins waiting on each other through `plugin_call`.
pub const MAX_CALL_DEPTH: usize = 8;

/// Entries a single plugin may keep in its cache.
pub const CACHE_CAPACITY: usize = 256;

/// Log level for plugin logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level (most verbose).
    Trace,
    /// Debug level.
    Debug,
    /// Info level.
    Info,
    /// Warning level.
    Warn,
    /// Error level.
    Error,
}

impl LogLevel {
    /// Level number used by the `gk.log` import. Trace has no guest number.
    pub fn to_u32(self) -> u32 {
        match self {
            Self::Trace | Self::Debug => 0,
            Self::Info => 1,
            Self::Warn => 2,
            Self::Error => 3,
        }
    }

    /// Level from a `gk.log` level number.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Debug),
            1 => Some(Self::Info),
            2 => Some(Self::Warn),
            3 => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    /// Mirror a plugin log line to the operator log.
    pub fn emit(self, plugin: &str, message: &str) {
        match self {
            Self::Trace => tracing::trace!(plugin, "{}", message),
            Self::Debug => tracing::debug!(plugin, "{}", message),
            Self::Info => tracing::info!(plugin, "{}", message),
            Self::Warn => tracing::warn!(plugin, "{}", message),
            Self::Error => tracing::error!(plugin, "{}", message),
        }
    }
}

impl FromStr for LogLevel {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(PluginError::Config(format!("unknown log level '{other}'"))),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routes `plugin_call` requests from one plugin to another.
///
/// Invoked from inside a guest call, on the blocking thread running it.
pub trait HostDispatch: Send + Sync {
    fn call_plugin(
        &self,
        ctx: &CallContext,
        plugin: &str,
        function: &str,
        args: &[u8],
    ) -> PluginResult<Vec<u8>>;
}

/// Dispatcher slot shared by every store a runtime creates. Filled once the
/// owner of the runtime is ready to accept nested calls.
pub(crate) type DispatchSlot = Arc<OnceCell<Weak<dyn HostDispatch>>>;

/// Key-value cache private to one plugin instance.
#[derive(Debug, Default)]
pub(crate) struct PluginCache {
    entries: HashMap<String, CacheEntry>,
}

#[derive(Debug)]
struct CacheEntry {
    value: Value,
    stored: Instant,
    expires: Option<Instant>,
}

impl CacheEntry {
    fn expired(&self, now: Instant) -> bool {
        self.expires.is_some_and(|at| now >= at)
    }
}

impl PluginCache {
    pub(crate) fn get(&mut self, key: &str) -> Option<&Value> {
        if self.entries.get(key).is_some_and(|e| e.expired(Instant::now())) {
            self.entries.remove(key);
        }
        self.entries.get(key).map(|e| &e.value)
    }

    /// Store `value` under `key`. When full, expired entries go first, then the oldest.
    pub(crate) fn set(&mut self, key: String, value: Value, ttl: Option<Duration>) {
        let now = Instant::now();
        if !self.entries.contains_key(&key) && self.entries.len() >= CACHE_CAPACITY {
            self.entries.retain(|_, e| !e.expired(now));
            if self.entries.len() >= CACHE_CAPACITY {
                let oldest =
                    self.entries.iter().min_by_key(|(_, e)| e.stored).map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    self.entries.remove(&oldest);
                }
            }
        }
        let expires = ttl.map(|ttl| now + ttl);
        self.entries.insert(key, CacheEntry { value, stored: now, expires });
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// State owned by each plugin's wasmtime store.
pub struct HostState {
    pub(crate) plugin: String,
    /// Set once the manifest is known (after `gk_register` for standalone modules).
    pub(crate) manifest: Option<Arc<Manifest>>,
    /// Context of the call currently executing.
    pub(crate) context: CallContext,
    /// When the call currently executing must finish.
    pub(crate) deadline: Option<Instant>,
    pub(crate) logs: Arc<LogBuffer>,
    pub(crate) limits: StoreLimits,
    pub(crate) cache: PluginCache,
    pub(crate) dispatch: DispatchSlot,
}

impl HostState {
    pub(crate) fn new(
        plugin: &str,
        logs: Arc<LogBuffer>,
        limits: StoreLimits,
        dispatch: DispatchSlot,
    ) -> Self {
        Self {
            plugin: plugin.to_string(),
            manifest: None,
            context: CallContext::default(),
            deadline: None,
            logs,
            limits,
            cache: PluginCache::default(),
            dispatch,
        }
    }

    /// Enter a call: the context and deadline stay visible to host imports until [`leave`](Self::leave).
    pub(crate) fn enter(&mut self, ctx: &CallContext, deadline: Instant) {
        self.context = ctx.clone();
        self.deadline = Some(deadline);
    }

    pub(crate) fn leave(&mut self) {
        self.context = CallContext::default();
        self.deadline = None;
    }

    fn log(&self, level: LogLevel, message: &str) {
        level.emit(&self.plugin, message);
        self.logs.log(&self.plugin, level, message);
    }
}

pub(crate) fn pack(ptr: u32, len: u32) -> u64 {
    (u64::from(ptr) << 32) | u64::from(len)
}

pub(crate) fn unpack(packed: u64) -> (u32, u32) {
    ((packed >> 32) as u32, (packed & 0xFFFF_FFFF) as u32)
}

/// Register the `gk` import module on a linker.
pub(crate) fn add_host_functions(linker: &mut Linker<HostState>) -> wasmtime::Result<()> {
    linker.func_wrap(
        HOST_MODULE,
        "log",
        |mut caller: Caller<'_, HostState>, level: u32, ptr: u32, len: u32| {
            let Some(bytes) = read_guest(&mut caller, ptr, len) else {
                return;
            };
            let message = String::from_utf8_lossy(&bytes);
            let level = LogLevel::from_u32(level).unwrap_or(LogLevel::Info);
            caller.data().log(level, &message);
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "host_call",
        |mut caller: Caller<'_, HostState>,
         fn_ptr: u32,
         fn_len: u32,
         args_ptr: u32,
         args_len: u32|
         -> u64 {
            let Some(function) = read_guest(&mut caller, fn_ptr, fn_len) else {
                caller.data().log(LogLevel::Error, "host_call: function name out of bounds");
                return 0;
            };
            let function = String::from_utf8_lossy(&function).into_owned();
            let args = read_guest(&mut caller, args_ptr, args_len).unwrap_or_default();

            let response = match dispatch_host_call(caller.data_mut(), &function, &args) {
                Ok(response) => response,
                Err(reason) => {
                    caller.data().log(LogLevel::Error, &format!("host_call {function} failed: {reason}"));
                    return 0;
                }
            };

            match write_guest(&mut caller, &response) {
                Ok(packed) => packed,
                Err(e) => {
                    caller
                        .data()
                        .log(LogLevel::Error, &format!("host_call {function}: write failed: {e}"));
                    0
                }
            }
        },
    )?;

    Ok(())
}

#[derive(Deserialize)]
struct KeyArgs {
    key: String,
}

#[derive(Deserialize)]
struct CacheSetArgs {
    key: String,
    #[serde(default)]
    value: Value,
    /// Seconds until the entry expires. Zero or absent keeps it until evicted.
    #[serde(default)]
    ttl: u64,
}

#[derive(Deserialize)]
struct PluginCallArgs {
    plugin: String,
    function: String,
    #[serde(default)]
    args: Option<Value>,
}

/// Route a guest `host_call` to the matching host capability.
fn dispatch_host_call(
    state: &mut HostState,
    function: &str,
    args: &[u8],
) -> Result<Vec<u8>, String> {
    let value = match function {
        "language" => {
            json!({ "value": state.context.language.as_deref().unwrap_or("en") })
        }
        "translate" => {
            let req: KeyArgs = serde_json::from_slice(args).map_err(|e| e.to_string())?;
            let text = state
                .manifest
                .as_deref()
                .and_then(|m| m.translate(state.context.language.as_deref(), &req.key))
                .unwrap_or(&req.key);
            json!({ "value": text })
        }
        "config_get" => {
            let req: KeyArgs = serde_json::from_slice(args).map_err(|e| e.to_string())?;
            let value = state
                .manifest
                .as_deref()
                .and_then(|m| m.config.get(&req.key))
                .cloned()
                .unwrap_or(Value::Null);
            json!({ "value": value })
        }
        "cache_get" => {
            let req: KeyArgs = serde_json::from_slice(args).map_err(|e| e.to_string())?;
            match state.cache.get(&req.key) {
                Some(value) => json!({ "value": value, "found": true }),
                None => json!({ "value": Value::Null, "found": false }),
            }
        }
        "cache_set" => {
            let req: CacheSetArgs = serde_json::from_slice(args).map_err(|e| e.to_string())?;
            let ttl = (req.ttl > 0).then(|| Duration::from_secs(req.ttl));
            state.cache.set(req.key, req.value, ttl);
            json!({ "ok": true })
        }
        // The target's raw result is handed back unchanged.
        "plugin_call" => return plugin_call(state, args),
        other => return Err(format!("unknown host function: {other}")),
    };
    serde_json::to_vec(&value).map_err(|e| e.to_string())
}

fn plugin_call(state: &HostState, args: &[u8]) -> Result<Vec<u8>, String> {
    let req: PluginCallArgs = serde_json::from_slice(args).map_err(|e| e.to_string())?;

    let ctx = &state.context;
    if req.plugin == state.plugin || ctx.callers.contains(&req.plugin) {
        return Err(format!("call cycle: '{}' is already waiting on this call", req.plugin));
    }
    if ctx.callers.len() + 1 > MAX_CALL_DEPTH {
        return Err(format!("plugin calls nested deeper than {MAX_CALL_DEPTH}"));
    }

    let timeout = match state.deadline {
        Some(deadline) => {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err("call deadline exceeded".to_string());
            }
            Some(left)
        }
        None => None,
    };

    let dispatch = state
        .dispatch
        .get()
        .and_then(Weak::upgrade)
        .ok_or_else(|| "plugin calls are not available in this host".to_string())?;
    let call_args = serde_json::to_vec(&req.args.unwrap_or_else(|| json!({})))
        .map_err(|e| e.to_string())?;

    tracing::debug!(plugin = %state.plugin, target = %req.plugin, function = %req.function, "Nested plugin call");
    dispatch
        .call_plugin(&ctx.nested(&state.plugin, timeout), &req.plugin, &req.function, &call_args)
        .map_err(|e| e.to_string())
}

fn caller_memory(caller: &mut Caller<'_, HostState>) -> Option<Memory> {
    caller.get_export("memory").and_then(Extern::into_memory)
}

fn read_guest(caller: &mut Caller<'_, HostState>, ptr: u32, len: u32) -> Option<Vec<u8>> {
    if len == 0 {
        return Some(Vec::new());
    }
    if len > MAX_GUEST_TRANSFER {
        return None;
    }
    let memory = caller_memory(caller)?;
    let mut buf = vec![0u8; len as usize];
    memory.read(&*caller, ptr as usize, &mut buf).ok()?;
    Some(buf)
}

/// Copy `data` into guest memory obtained from `gk_malloc`, returning the packed pointer.
fn write_guest(caller: &mut Caller<'_, HostState>, data: &[u8]) -> wasmtime::Result<u64> {
    if data.is_empty() {
        return Ok(0);
    }
    let len = u32::try_from(data.len()).map_err(wasmtime::Error::msg)?;
    let malloc = caller
        .get_export("gk_malloc")
        .and_then(Extern::into_func)
        .ok_or_else(|| wasmtime::Error::msg("module does not export gk_malloc"))?
        .typed::<u32, u32>(&*caller)?;
    let ptr = malloc.call(&mut *caller, len)?;
    let memory =
        caller_memory(caller).ok_or_else(|| wasmtime::Error::msg("module does not export memory"))?;
    memory.write(&mut *caller, ptr as usize, data)?;
    Ok(pack(ptr, len))
}
