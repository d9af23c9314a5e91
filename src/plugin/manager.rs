//! Plugin manager for discovering, loading, and dispatching calls to plugins.
//!
//! The manager owns the set of discovered plugin names and the map of loaded
//! instances. Loading is lazy: a plugin is compiled the first time something
//! needs it, and concurrent first uses of one name share a single compilation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use super::host::{HostDispatch, LogLevel};
use super::runtime::CompiledPlugin;
use super::store::{Installed, ModuleStore};
use super::types::html_fragment;
use super::{
    BoundJob, BoundMenuItem, BoundRoute, BoundWidget, CallContext, LogBuffer, LogEntry, Manifest,
    PluginError, PluginInfo, PluginResult, PluginRuntime, RenderedWidget, DEFAULT_LOG_CAPACITY,
};

/// Extra time the async side waits past the guest deadline before giving up on a call.
const CALL_GRACE: Duration = Duration::from_millis(250);

/// Name of the enable/disable state file inside the plugin directory.
pub const STATE_FILE: &str = ".wasmhost-state.json";

type LoadResult = Result<Arc<PluginInstance>, Arc<PluginError>>;
type LoadFuture = Shared<BoxFuture<'static, LoadResult>>;

/// Tuning knobs for a [`PluginManager`].
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Upper bound on a single plugin call, including lazy loading.
    pub call_timeout: Duration,
    /// Linear memory limit per plugin, in bytes.
    pub memory_limit: usize,
    /// Capacity of the log buffer created by [`PluginManager::new`].
    pub log_capacity: usize,
    /// Persist enable/disable overrides across restarts.
    pub persist_state: bool,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            memory_limit: 16 * 1024 * 1024,
            log_capacity: DEFAULT_LOG_CAPACITY,
            persist_state: false,
        }
    }
}

/// Persisted state of a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    /// Plugin is enabled and active.
    Enabled,
    /// Plugin is disabled.
    Disabled,
}

impl PluginState {
    fn from_enabled(enabled: bool) -> Self {
        if enabled {
            Self::Enabled
        } else {
            Self::Disabled
        }
    }
}

/// State file format.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    plugins: BTreeMap<String, PluginState>,
}

/// A loaded plugin.
pub struct PluginInstance {
    compiled: CompiledPlugin,
    enabled: AtomicBool,
    loaded_at: DateTime<Utc>,
    checksum: String,
    path: PathBuf,
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("name", &self.name())
            .field("enabled", &self.is_enabled())
            .field("loaded_at", &self.loaded_at)
            .field("path", &self.path)
            .finish()
    }
}

impl PluginInstance {
    pub fn name(&self) -> &str {
        self.compiled.name()
    }

    pub fn manifest(&self) -> &Manifest {
        self.compiled.manifest()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// SHA-256 of the module binary this instance was compiled from.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub fn info(&self) -> PluginInfo {
        let manifest = self.manifest();
        PluginInfo {
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            description: manifest.description.clone(),
            author: manifest.author.clone(),
            license: manifest.license.clone(),
            enabled: self.is_enabled(),
            loaded: true,
            checksum: Some(self.checksum.clone()),
            loaded_at: Some(self.loaded_at),
            routes: manifest.routes.clone(),
            widgets: manifest.widgets.clone(),
            jobs: manifest.jobs.clone(),
            menu_items: manifest.menu_items.clone(),
        }
    }
}

/// Central plugin registry.
pub struct PluginManager {
    store: ModuleStore,
    runtime: PluginRuntime,
    logs: Arc<LogBuffer>,
    call_timeout: Duration,
    persist_state: bool,
    discovered: RwLock<BTreeSet<String>>,
    plugins: RwLock<HashMap<String, Arc<PluginInstance>>>,
    /// In-flight lazy loads, one per name. Lock order: `inflight` before `plugins`.
    inflight: Mutex<HashMap<String, LoadFuture>>,
    overrides: Mutex<BTreeMap<String, bool>>,
}

impl PluginManager {
    /// Create a manager with its own log buffer and run discovery.
    pub fn new(store: ModuleStore, options: ManagerOptions) -> PluginResult<Self> {
        let logs = Arc::new(LogBuffer::new(options.log_capacity));
        Self::with_logs(store, options, logs)
    }

    /// Create a manager writing to an existing log buffer and run discovery.
    pub fn with_logs(
        store: ModuleStore,
        options: ManagerOptions,
        logs: Arc<LogBuffer>,
    ) -> PluginResult<Self> {
        let runtime = PluginRuntime::new(options.memory_limit, logs.clone())?;
        let discovered = store.discover()?;
        tracing::info!(count = discovered.len(), dir = %store.dir().display(), "Plugin manager started");

        let manager = Self {
            store,
            runtime,
            logs,
            call_timeout: options.call_timeout,
            persist_state: options.persist_state,
            discovered: RwLock::new(discovered),
            plugins: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            overrides: Mutex::new(BTreeMap::new()),
        };
        if manager.persist_state {
            manager.load_state()?;
        }
        Ok(manager)
    }

    /// Move the manager behind an `Arc` and let its plugins reach each other
    /// through `plugin_call`.
    pub fn into_shared(self) -> Arc<Self> {
        let manager = Arc::new(self);
        let dispatcher: Weak<dyn HostDispatch> = Arc::<Self>::downgrade(&manager);
        manager.runtime.set_dispatcher(dispatcher);
        manager
    }

    pub fn store(&self) -> &ModuleStore {
        &self.store
    }

    pub fn logs(&self) -> &Arc<LogBuffer> {
        &self.logs
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Number of module compilations performed so far.
    pub fn compile_count(&self) -> usize {
        self.runtime.compile_count()
    }

    /// Manifests of all loaded plugins, sorted by name.
    pub fn list(&self) -> Vec<Manifest> {
        let mut manifests: Vec<Manifest> =
            self.plugins.read().values().map(|p| p.manifest().clone()).collect();
        manifests.sort_by(|a, b| a.name.cmp(&b.name));
        manifests
    }

    /// Names known to the store but not loaded yet.
    pub fn discovered(&self) -> Vec<String> {
        let plugins = self.plugins.read();
        self.discovered.read().iter().filter(|name| !plugins.contains_key(*name)).cloned().collect()
    }

    /// Listing of every plugin, loaded or not.
    pub fn infos(&self) -> Vec<PluginInfo> {
        let mut infos: Vec<PluginInfo> =
            self.plugins.read().values().map(|p| p.info()).collect();
        infos.extend(self.discovered().iter().map(|name| PluginInfo::discovered(name)));
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// The loaded instance for `name`. Never triggers a load.
    pub fn get(&self, name: &str) -> Option<Arc<PluginInstance>> {
        self.plugins.read().get(name).cloned()
    }

    /// Whether `name` is enabled, or `None` if it is not loaded.
    pub fn is_enabled(&self, name: &str) -> Option<bool> {
        self.get(name).map(|p| p.is_enabled())
    }

    /// Return the loaded instance for `name`, loading it first if it was only discovered.
    pub async fn ensure_loaded(&self, name: &str) -> PluginResult<Arc<PluginInstance>> {
        if let Some(instance) = self.get(name) {
            return Ok(instance);
        }

        let future = {
            let mut inflight = self.inflight.lock();
            if let Some(instance) = self.get(name) {
                return Ok(instance);
            }
            if !self.discovered.read().contains(name) {
                return Err(PluginError::NotFound(name.to_string()));
            }
            match inflight.get(name) {
                // A finished failure left behind by an abandoned caller is retried.
                Some(pending) if !matches!(pending.peek(), Some(Err(_))) => pending.clone(),
                _ => {
                    let future = self.spawn_load(name);
                    inflight.insert(name.to_string(), future.clone());
                    future
                }
            }
        };

        let result = future.clone().await;

        let mut inflight = self.inflight.lock();
        let current = inflight.get(name).is_some_and(|pending| pending.ptr_eq(&future));
        match result {
            Ok(instance) => {
                let mut plugins = self.plugins.write();
                if let Some(existing) = plugins.get(name) {
                    return Ok(existing.clone());
                }
                if current {
                    inflight.remove(name);
                    plugins.insert(name.to_string(), instance.clone());
                    drop(plugins);
                    tracing::info!(plugin = name, version = %instance.manifest().version, "Plugin loaded");
                    self.logs.log(
                        name,
                        LogLevel::Info,
                        format!("plugin loaded (version {})", instance.manifest().version),
                    );
                }
                Ok(instance)
            }
            Err(source) => {
                if current {
                    inflight.remove(name);
                    drop(inflight);
                    tracing::warn!(plugin = name, error = %source, "Plugin failed to load");
                    self.logs.push(
                        LogEntry::new(name, LogLevel::Error, format!("load failed: {source}"))
                            .with_error_kind(source.kind()),
                    );
                }
                Err(PluginError::LoadFailed { plugin: name.to_string(), source })
            }
        }
    }

    fn spawn_load(&self, name: &str) -> LoadFuture {
        let store = self.store.clone();
        let runtime = self.runtime.clone();
        let timeout = self.call_timeout;
        let enabled_override = self.overrides.lock().get(name).copied();
        let name = name.to_string();

        async move {
            let task_name = name.clone();
            let loaded = tokio::task::spawn_blocking(move || {
                load_instance(&store, &runtime, &task_name, timeout, enabled_override)
            })
            .await;
            match loaded {
                Ok(result) => result.map(Arc::new).map_err(Arc::new),
                Err(join) => Err(Arc::new(PluginError::compile(&name, format!("load task failed: {join}")))),
            }
        }
        .boxed()
        .shared()
    }

    /// Invoke `function` on plugin `name` with JSON `args`.
    pub async fn call(
        &self,
        ctx: &CallContext,
        name: &str,
        function: &str,
        args: &[u8],
    ) -> PluginResult<Vec<u8>> {
        let instance = match self.ensure_loaded(name).await {
            Ok(instance) => instance,
            Err(e) => {
                if e.is_not_found() {
                    self.logs.push(
                        LogEntry::new(name, LogLevel::Warn, "call rejected: unknown plugin")
                            .with_function(function)
                            .with_error_kind(e.kind()),
                    );
                }
                return Err(e);
            }
        };

        if !instance.is_enabled() {
            let err = PluginError::Disabled(name.to_string());
            tracing::debug!(plugin = name, function, "Rejected call to disabled plugin");
            self.logs.push(
                LogEntry::new(name, LogLevel::Warn, "call rejected: plugin is disabled")
                    .with_function(function)
                    .with_error_kind(err.kind()),
            );
            return Err(err);
        }

        let timeout = ctx.timeout.map_or(self.call_timeout, |t| t.min(self.call_timeout));
        let started = Instant::now();

        let task = {
            let instance = instance.clone();
            let function = function.to_string();
            let args = args.to_vec();
            let ctx = ctx.clone();
            tokio::task::spawn_blocking(move || instance.compiled.invoke(&function, &args, &ctx, timeout))
        };
        let result = match tokio::time::timeout(timeout + CALL_GRACE, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => {
                Err(PluginError::execution(name, function, format!("call task failed: {join}")))
            }
            Err(_) => Err(PluginError::Timeout {
                plugin: name.to_string(),
                function: function.to_string(),
                millis: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        };

        let millis = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let caller = ctx.caller();
        let via = caller.map(|c| format!(" (called by {c})")).unwrap_or_default();
        match &result {
            Ok(output) => {
                tracing::debug!(plugin = name, function, caller, millis, bytes = output.len(), "Plugin call succeeded");
                self.logs.push(
                    LogEntry::new(name, LogLevel::Info, format!("{function} completed{via}"))
                        .with_function(function)
                        .with_duration_ms(millis),
                );
            }
            Err(e) => {
                tracing::warn!(plugin = name, function, caller, millis, error = %e, "Plugin call failed");
                self.logs.push(
                    LogEntry::new(name, LogLevel::Error, format!("{function} failed{via}: {e}"))
                        .with_function(function)
                        .with_error_kind(e.kind())
                        .with_duration_ms(millis),
                );
            }
        }
        result
    }

    pub async fn enable(&self, name: &str) -> PluginResult<()> {
        self.set_enabled(name, true).await
    }

    pub async fn disable(&self, name: &str) -> PluginResult<()> {
        self.set_enabled(name, false).await
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> PluginResult<()> {
        let instance = self.ensure_loaded(name).await?;
        instance.enabled.store(enabled, Ordering::SeqCst);
        self.overrides.lock().insert(name.to_string(), enabled);

        let action = if enabled { "enabled" } else { "disabled" };
        tracing::info!(plugin = name, "Plugin {}", action);
        self.logs.log(name, LogLevel::Info, format!("plugin {action}"));

        if self.persist_state {
            self.save_state()?;
        }
        Ok(())
    }

    /// Load every known plugin, skipping (and logging) the ones that fail.
    pub async fn load_all(&self) -> Vec<Arc<PluginInstance>> {
        let mut names: BTreeSet<String> = self.discovered.read().clone();
        names.extend(self.plugins.read().keys().cloned());

        let deadline = self.call_timeout + CALL_GRACE;
        let loads = names.iter().map(|name| async move {
            match tokio::time::timeout(deadline, self.ensure_loaded(name)).await {
                Ok(Ok(instance)) => Some(instance),
                Ok(Err(_)) => None,
                Err(_) => {
                    tracing::warn!(plugin = %name, "Plugin load timed out");
                    self.logs.push(
                        LogEntry::new(name, LogLevel::Error, "load timed out")
                            .with_error_kind("timeout"),
                    );
                    None
                }
            }
        });
        join_all(loads).await.into_iter().flatten().collect()
    }

    /// Widgets of all enabled plugins, optionally limited to one location.
    ///
    /// Loads every discovered plugin as a side effect.
    pub async fn all_widgets(&self, location: Option<&str>) -> Vec<BoundWidget> {
        self.load_all()
            .await
            .iter()
            .filter(|p| p.is_enabled())
            .flat_map(|p| {
                p.manifest()
                    .widgets
                    .iter()
                    .filter(|w| location.map_or(true, |l| w.location == l))
                    .map(|w| BoundWidget { plugin_name: p.name().to_string(), widget: w.clone() })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Render every widget at `location` in parallel. Widgets whose handler
    /// fails or times out are left out.
    pub async fn render_widgets(
        &self,
        ctx: &CallContext,
        location: Option<&str>,
    ) -> Vec<RenderedWidget> {
        let widgets = self.all_widgets(location).await;
        let renders = widgets.iter().map(|bound| self.render_widget(ctx, &bound.plugin_name, &bound.widget.id));
        join_all(renders).await.into_iter().filter_map(Result::ok).collect()
    }

    /// Render one widget. The handler must return an object with an `html` string.
    pub async fn render_widget(
        &self,
        ctx: &CallContext,
        name: &str,
        widget_id: &str,
    ) -> PluginResult<RenderedWidget> {
        let instance = self.ensure_loaded(name).await?;
        let widget = instance.manifest().widget(widget_id).cloned().ok_or_else(|| {
            PluginError::WidgetNotFound { plugin: name.to_string(), widget: widget_id.to_string() }
        })?;

        let args = serde_json::json!({ "widget": widget.id, "location": widget.location });
        let output = self.call(ctx, name, &widget.handler, args.to_string().as_bytes()).await?;

        let Some(html) = html_fragment(&output) else {
            let err = PluginError::InvalidResponse {
                plugin: name.to_string(),
                function: widget.handler.clone(),
                reason: "widget handler did not return an object with an html field".to_string(),
            };
            self.logs.push(
                LogEntry::new(name, LogLevel::Error, err.to_string())
                    .with_function(&widget.handler)
                    .with_error_kind(err.kind()),
            );
            return Err(err);
        };

        Ok(RenderedWidget { plugin_name: name.to_string(), widget, html })
    }

    /// Menu entries of loaded, enabled plugins. Never triggers a load.
    pub fn menu_items(&self, location: Option<&str>) -> Vec<BoundMenuItem> {
        let mut items: Vec<BoundMenuItem> = self
            .plugins
            .read()
            .values()
            .filter(|p| p.is_enabled())
            .flat_map(|p| {
                p.manifest()
                    .menu_items
                    .iter()
                    .filter(|m| location.map_or(true, |l| m.location == l))
                    .map(|m| BoundMenuItem { plugin_name: p.name().to_string(), item: m.clone() })
                    .collect::<Vec<_>>()
            })
            .collect();
        items.sort_by(|a, b| {
            (a.item.order, &a.plugin_name, &a.item.id).cmp(&(b.item.order, &b.plugin_name, &b.item.id))
        });
        items
    }

    /// Routes declared by every plugin that loads, sorted by plugin name.
    pub async fn routes(&self) -> Vec<BoundRoute> {
        let mut plugins = self.load_all().await;
        plugins.sort_by(|a, b| a.name().cmp(b.name()));
        plugins
            .iter()
            .flat_map(|p| {
                p.manifest()
                    .routes
                    .iter()
                    .map(|r| BoundRoute { plugin_name: p.name().to_string(), route: r.clone() })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Background jobs declared by every plugin that loads.
    pub async fn jobs(&self) -> Vec<BoundJob> {
        let mut plugins = self.load_all().await;
        plugins.sort_by(|a, b| a.name().cmp(b.name()));
        plugins
            .iter()
            .flat_map(|p| {
                p.manifest()
                    .jobs
                    .iter()
                    .map(|j| BoundJob { plugin_name: p.name().to_string(), job: j.clone() })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Drop the loaded instance for `name`. The name stays discovered, so the
    /// next use loads it again from disk. Returns whether anything was unloaded.
    pub fn unload(&self, name: &str) -> bool {
        let mut inflight = self.inflight.lock();
        let pending = inflight.remove(name).is_some();
        let removed = self.plugins.write().remove(name).is_some();
        drop(inflight);

        if removed {
            tracing::info!(plugin = name, "Plugin unloaded");
            self.logs.log(name, LogLevel::Info, "plugin unloaded");
        }
        removed || pending
    }

    /// Re-run discovery. Returns the names that were not known before.
    pub fn rescan(&self) -> PluginResult<BTreeSet<String>> {
        let found = self.store.discover()?;
        let mut discovered = self.discovered.write();
        let added: BTreeSet<String> = found.difference(&discovered).cloned().collect();
        *discovered = found;
        drop(discovered);

        for name in &added {
            tracing::info!(plugin = %name, "Discovered plugin");
        }
        Ok(added)
    }

    /// Install an uploaded `.wasm` or `.zip`. A loaded plugin of the same
    /// name is unloaded so the new version is picked up on next use.
    pub async fn install(&self, upload_name: &str, bytes: Vec<u8>) -> PluginResult<Installed> {
        let store = self.store.clone();
        let runtime = self.runtime.clone();
        let upload = upload_name.to_string();
        let timeout = self.call_timeout;
        let result = tokio::task::spawn_blocking(move || {
            store.install(&upload, &bytes, &runtime, timeout)
        })
        .await
        .map_err(|join| PluginError::Packaging(format!("upload task failed: {join}")))
        .and_then(|r| r);

        match result {
            Ok(installed) => {
                self.unload(&installed.name);
                self.discovered.write().insert(installed.name.clone());
                self.logs.log(&installed.name, LogLevel::Info, format!("plugin installed from {upload_name}"));
                Ok(installed)
            }
            Err(e) => {
                tracing::warn!(upload = upload_name, error = %e, "Plugin upload rejected");
                self.logs.push(
                    LogEntry::new(upload_name, LogLevel::Error, format!("upload rejected: {e}"))
                        .with_error_kind(e.kind()),
                );
                Err(e)
            }
        }
    }

    /// Tear down: drop every loaded instance and flush persisted state.
    pub fn shutdown(&self) {
        let count = {
            let mut inflight = self.inflight.lock();
            inflight.clear();
            let mut plugins = self.plugins.write();
            let count = plugins.len();
            plugins.clear();
            count
        };
        if self.persist_state {
            if let Err(e) = self.save_state() {
                tracing::error!(error = %e, "Failed to save plugin state");
            }
        }
        tracing::info!(unloaded = count, "Plugin manager shut down");
    }

    fn state_path(&self) -> PathBuf {
        self.store.dir().join(STATE_FILE)
    }

    fn load_state(&self) -> PluginResult<()> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(());
        }
        let content = std::fs::read_to_string(&path)?;
        let state: StateFile =
            serde_json::from_str(&content).map_err(|e| PluginError::Config(e.to_string()))?;
        let mut overrides = self.overrides.lock();
        for (name, state) in state.plugins {
            overrides.insert(name, state == PluginState::Enabled);
        }
        Ok(())
    }

    fn save_state(&self) -> PluginResult<()> {
        let state = StateFile {
            plugins: self
                .overrides
                .lock()
                .iter()
                .map(|(name, enabled)| (name.clone(), PluginState::from_enabled(*enabled)))
                .collect(),
        };
        let content =
            serde_json::to_string_pretty(&state).map_err(|e| PluginError::Config(e.to_string()))?;
        std::fs::write(self.state_path(), content)?;
        Ok(())
    }
}

impl HostDispatch for PluginManager {
    /// Runs on the blocking thread of the calling plugin, so waiting on the
    /// async call here does not stall the runtime's workers.
    fn call_plugin(
        &self,
        ctx: &CallContext,
        plugin: &str,
        function: &str,
        args: &[u8],
    ) -> PluginResult<Vec<u8>> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| PluginError::execution(plugin, function, format!("no async runtime: {e}")))?;
        handle.block_on(self.call(ctx, plugin, function, args))
    }
}

fn load_instance(
    store: &ModuleStore,
    runtime: &PluginRuntime,
    name: &str,
    timeout: Duration,
    enabled_override: Option<bool>,
) -> PluginResult<PluginInstance> {
    let source = store.read(name)?;
    let checksum = source.checksum();
    let compiled = runtime.instantiate(name, &source.module, source.manifest, timeout)?;
    let enabled = enabled_override.unwrap_or(compiled.manifest().default_enabled);

    Ok(PluginInstance {
        compiled,
        enabled: AtomicBool::new(enabled),
        loaded_at: Utc::now(),
        checksum,
        path: source.path,
    })
}
