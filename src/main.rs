//! wasmhost - sandboxed WebAssembly extension host.
//!
//! Runs the plugin HTTP host and offers one-shot commands for listing,
//! calling, packaging and inspecting plugins.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use wasmhost::plugin::{package, PLUGIN_EXTENSION};
use wasmhost::{
    CallContext, HostConfig, LogBuffer, Manifest, ModuleStore, PluginManager, PluginRuntime,
};

/// Sandboxed WebAssembly extension host
#[derive(Parser)]
#[command(name = "wasmhost")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (defaults to ./wasmhost.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Plugin directory, overriding the configuration
    #[arg(long, global = true, env = "WASMHOST_PLUGIN_DIR")]
    plugin_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP plugin host
    Serve {
        /// Address to listen on, overriding the configuration
        #[arg(short, long, env = "WASMHOST_BIND")]
        bind: Option<String>,
    },

    /// Discover, load and list plugins
    List {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Call a plugin function once and print the result
    Call {
        /// Plugin name
        plugin: String,

        /// Exported function or handler name
        function: String,

        /// JSON arguments
        #[arg(short, long, default_value = "{}")]
        args: String,

        /// Language exposed to the plugin
        #[arg(short, long)]
        lang: Option<String>,
    },

    /// Build a plugin package from a manifest and a module
    Package {
        /// Manifest file (plugin.json or plugin.toml)
        manifest: PathBuf,

        /// Compiled module (.wasm)
        module: PathBuf,

        /// Output archive (defaults to <name>.zip)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the manifest of a .wasm module or .zip package
    Inspect {
        /// Plugin artifact
        artifact: PathBuf,
    },

    /// Show configuration
    Config {
        /// Show config directory path
        #[arg(long)]
        path: bool,
    },
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // stdout carries command output
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    let mut config = HostConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.plugin_dir {
        config.plugins.dir = dir;
    }

    match cli.command {
        Commands::Serve { bind } => cmd_serve(config, bind),
        Commands::List { format } => cmd_list(&config, &format),
        Commands::Call { plugin, function, args, lang } => {
            cmd_call(&config, &plugin, &function, &args, lang)
        }
        Commands::Package { manifest, module, output } => {
            cmd_package(&manifest, &module, output.as_deref())
        }
        Commands::Inspect { artifact } => cmd_inspect(&config, &artifact),
        Commands::Config { path } => cmd_config(&config, path),
    }
}

fn open_manager(config: &HostConfig) -> Result<Arc<PluginManager>> {
    let store = ModuleStore::open(&config.plugins.dir)?;
    Ok(PluginManager::new(store, config.plugins.manager_options())?.into_shared())
}

/// Run the HTTP host.
fn cmd_serve(mut config: HostConfig, bind: Option<String>) -> Result<()> {
    if let Some(bind) = bind {
        config.server.bind = bind;
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(wasmhost::server::serve(config))
}

/// List plugins.
fn cmd_list(config: &HostConfig, format: &str) -> Result<()> {
    let manager = open_manager(config)?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(manager.load_all());
    let infos = manager.infos();

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&infos)?;
            println!("{json}");
        }
        _ => {
            for info in &infos {
                let state = match (info.loaded, info.enabled) {
                    (false, _) => "failed to load",
                    (true, true) => "enabled",
                    (true, false) => "disabled",
                };
                println!("{} {} [{}] - {}", info.name, info.version, state, info.description);
            }
            println!("\nTotal: {} plugins in {}", infos.len(), config.plugins.dir.display());
        }
    }

    manager.shutdown();
    Ok(())
}

/// Call a plugin function once.
fn cmd_call(
    config: &HostConfig,
    plugin: &str,
    function: &str,
    args: &str,
    lang: Option<String>,
) -> Result<()> {
    serde_json::from_str::<serde_json::Value>(args).context("--args must be valid JSON")?;

    let manager = open_manager(config)?;
    let mut ctx = CallContext::new();
    if let Some(lang) = lang {
        ctx = ctx.with_language(lang);
    }

    let rt = tokio::runtime::Runtime::new()?;
    let output = rt.block_on(manager.call(&ctx, plugin, function, args.as_bytes()))?;
    println!("{}", String::from_utf8_lossy(&output));

    manager.shutdown();
    Ok(())
}

/// Build a package.
fn cmd_package(manifest_path: &Path, module_path: &Path, output: Option<&Path>) -> Result<()> {
    let manifest = Manifest::from_file(manifest_path)?;
    let module = std::fs::read(module_path)
        .with_context(|| format!("Failed to read {}", module_path.display()))?;

    let archive = package::package(&manifest, &module)?;
    let output = output.map_or_else(|| PathBuf::from(format!("{}.zip", manifest.name)), Path::to_path_buf);
    std::fs::write(&output, archive)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!("Packaged {} v{} -> {}", manifest.name, manifest.version, output.display());
    Ok(())
}

/// Print the manifest of an artifact.
fn cmd_inspect(config: &HostConfig, artifact: &Path) -> Result<()> {
    let bytes =
        std::fs::read(artifact).with_context(|| format!("Failed to read {}", artifact.display()))?;

    let manifest = if package::is_package(artifact) {
        package::inspect(&bytes)?
    } else if artifact.extension().is_some_and(|e| e.eq_ignore_ascii_case(PLUGIN_EXTENSION)) {
        let name = artifact
            .file_stem()
            .and_then(|s| s.to_str())
            .context("Module file name is not valid UTF-8")?;
        let options = config.plugins.manager_options();
        let runtime = PluginRuntime::new(options.memory_limit, Arc::new(LogBuffer::new(16)))?;
        runtime.describe(name, &bytes, options.call_timeout)?
    } else {
        bail!("Unsupported artifact: expected a .wasm module or .zip package");
    };

    println!("{}", serde_json::to_string_pretty(&manifest)?);
    Ok(())
}

/// Show configuration.
fn cmd_config(config: &HostConfig, show_path: bool) -> Result<()> {
    if show_path {
        if let Some(path) = HostConfig::config_dir() {
            println!("{}", path.display());
        }
        return Ok(());
    }

    let mut shown = config.clone();
    for token in &mut shown.auth.tokens {
        token.token = "********".to_string();
    }
    let toml = toml::to_string_pretty(&shown)?;
    println!("{toml}");
    Ok(())
}
