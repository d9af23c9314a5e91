//! On-disk plugin directory.
//!
//! Layout:
//! - `<dir>/<name>.wasm`: standalone module, manifest comes from `gk_register`.
//! - `<dir>/<name>/`: unpacked package holding a manifest file and the module.
//! - `<dir>/<name>.zip`: dropped-in package, unpacked into `<dir>/<name>/` on first load.
//!
//! Entries starting with `.` are staging or bookkeeping files and are never plugins.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};

use super::manifest::validate_name;
use super::package;
use super::{
    Manifest, PluginError, PluginResult, PluginRuntime, MANIFEST_FILES, PACKAGE_EXTENSION,
    PLUGIN_EXTENSION,
};

/// Where a plugin lives on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    /// A bare `.wasm` module.
    Standalone(PathBuf),
    /// An unpacked package directory.
    Unpacked { dir: PathBuf, manifest: PathBuf },
    /// A package archive not yet unpacked.
    Archive(PathBuf),
}

/// Module bytes ready to compile, plus the package manifest if there is one.
#[derive(Debug, Clone)]
pub struct ModuleSource {
    pub path: PathBuf,
    pub manifest: Option<Manifest>,
    pub module: Vec<u8>,
}

impl ModuleSource {
    pub fn checksum(&self) -> String {
        checksum(&self.module)
    }
}

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installed {
    pub name: String,
    pub path: PathBuf,
}

/// SHA-256 of `bytes` as lowercase hex.
pub fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// The plugin directory.
#[derive(Debug, Clone)]
pub struct ModuleStore {
    dir: PathBuf,
}

impl ModuleStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Open the store, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> PluginResult<Self> {
        let store = Self::new(dir);
        fs::create_dir_all(&store.dir).map_err(|_| PluginError::StoreUnavailable(store.dir.clone()))?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Scan the directory and return every plugin name found.
    pub fn discover(&self) -> PluginResult<BTreeSet<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(dir = %self.dir.display(), "Plugin directory does not exist");
                return Ok(BTreeSet::new());
            }
            Err(_) => return Err(PluginError::StoreUnavailable(self.dir.clone())),
        };

        let mut names = BTreeSet::new();
        for entry in entries.filter_map(Result::ok) {
            if let Some(name) = plugin_name(&entry.path()) {
                names.insert(name);
            }
        }
        tracing::debug!(count = names.len(), dir = %self.dir.display(), "Discovered plugins");
        Ok(names)
    }

    /// Find the artifact for `name`.
    ///
    /// A standalone module and a package with the same name are ambiguous and rejected.
    pub fn locate(&self, name: &str) -> PluginResult<Artifact> {
        validate_name(name).map_err(|_| PluginError::NotFound(name.to_string()))?;

        let standalone = self.dir.join(format!("{name}.{PLUGIN_EXTENSION}"));
        let archive = self.dir.join(format!("{name}.{PACKAGE_EXTENSION}"));
        let unpacked = self.dir.join(name);

        let package = if archive.is_file() {
            Some(Artifact::Archive(archive))
        } else {
            find_manifest(&unpacked)
                .map(|manifest| Artifact::Unpacked { dir: unpacked.clone(), manifest })
        };

        match (standalone.is_file(), package) {
            (true, Some(_)) => Err(PluginError::ManifestInvalid(format!(
                "plugin '{name}' exists both as a standalone module and as a package"
            ))),
            (true, None) => Ok(Artifact::Standalone(standalone)),
            (false, Some(package)) => Ok(package),
            (false, None) => Err(PluginError::NotFound(name.to_string())),
        }
    }

    /// Read the module for `name`, unpacking a dropped-in archive first.
    pub fn read(&self, name: &str) -> PluginResult<ModuleSource> {
        match self.locate(name)? {
            Artifact::Standalone(path) => {
                let module = fs::read(&path)?;
                Ok(ModuleSource { path, manifest: None, module })
            }
            Artifact::Unpacked { dir, manifest } => read_unpacked(name, &dir, &manifest),
            Artifact::Archive(path) => {
                let manifest = package::inspect(&fs::read(&path)?)?;
                manifest.ensure_identity(name)?;
                package::extract(&path, &self.dir)?;
                fs::remove_file(&path)?;
                tracing::info!(plugin = name, "Unpacked dropped-in package");
                match self.locate(name)? {
                    Artifact::Unpacked { dir, manifest } => read_unpacked(name, &dir, &manifest),
                    _ => Err(PluginError::NotFound(name.to_string())),
                }
            }
        }
    }

    /// Upload pipeline: stage under a hidden name, validate, then move into place.
    ///
    /// Validation instantiates the module the way a load would, so an upload
    /// that could never load is rejected. Any failure leaves the directory
    /// exactly as it was.
    pub fn install(
        &self,
        upload_name: &str,
        bytes: &[u8],
        runtime: &PluginRuntime,
        timeout: Duration,
    ) -> PluginResult<Installed> {
        let file_name = sanitize_upload_name(upload_name)?;
        let path = Path::new(&file_name);
        let extension = path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase);
        let as_packaging = |e: PluginError| match e {
            PluginError::Packaging(_) | PluginError::Io(_) => e,
            other => PluginError::Packaging(other.to_string()),
        };

        fs::create_dir_all(&self.dir)?;

        match extension.as_deref() {
            Some(PLUGIN_EXTENSION) => {
                let name = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default().to_string();
                validate_name(&name).map_err(as_packaging)?;
                runtime.instantiate(&name, bytes, None, timeout).map_err(as_packaging)?;

                let mut staged =
                    tempfile::Builder::new().prefix(".upload-").tempfile_in(&self.dir)?;
                staged.write_all(bytes)?;
                staged.as_file().sync_all()?;

                let target = self.dir.join(format!("{name}.{PLUGIN_EXTENSION}"));
                staged.persist(&target).map_err(|e| PluginError::Io(e.error))?;
                self.remove_package(&name)?;

                tracing::info!(plugin = %name, "Plugin module installed");
                Ok(Installed { name, path: target })
            }
            Some(PACKAGE_EXTENSION) => {
                let mut staged = tempfile::Builder::new()
                    .prefix(".upload-")
                    .suffix(&format!(".{PACKAGE_EXTENSION}"))
                    .tempfile_in(&self.dir)?;
                staged.write_all(bytes)?;
                staged.as_file().sync_all()?;

                let (manifest, module_path) =
                    package::extract_with(staged.path(), &self.dir, |manifest, module| {
                        runtime
                            .instantiate(&manifest.name, module, Some(manifest.clone()), timeout)
                            .map(drop)
                            .map_err(as_packaging)
                    })
                    .map_err(as_packaging)?;
                self.remove_standalone(&manifest.name)?;

                tracing::info!(plugin = %manifest.name, version = %manifest.version, "Plugin package installed");
                Ok(Installed { name: manifest.name, path: module_path })
            }
            _ => Err(PluginError::Packaging(format!(
                "'{file_name}': only .{PLUGIN_EXTENSION} and .{PACKAGE_EXTENSION} files are allowed"
            ))),
        }
    }

    fn remove_package(&self, name: &str) -> PluginResult<()> {
        let unpacked = self.dir.join(name);
        if unpacked.is_dir() {
            fs::remove_dir_all(&unpacked)?;
        }
        let archive = self.dir.join(format!("{name}.{PACKAGE_EXTENSION}"));
        if archive.is_file() {
            fs::remove_file(&archive)?;
        }
        Ok(())
    }

    fn remove_standalone(&self, name: &str) -> PluginResult<()> {
        let standalone = self.dir.join(format!("{name}.{PLUGIN_EXTENSION}"));
        if standalone.is_file() {
            fs::remove_file(&standalone)?;
        }
        Ok(())
    }
}

/// The plugin name an entry of the store directory stands for, if any.
fn plugin_name(path: &Path) -> Option<String> {
    let file_name = path.file_name()?.to_str()?;
    if file_name.starts_with('.') {
        return None;
    }

    let name = if path.is_dir() {
        find_manifest(path)?;
        file_name
    } else {
        let ext = path.extension()?.to_str()?;
        if !ext.eq_ignore_ascii_case(PLUGIN_EXTENSION) && !ext.eq_ignore_ascii_case(PACKAGE_EXTENSION)
        {
            return None;
        }
        path.file_stem()?.to_str()?
    };

    match validate_name(name) {
        Ok(()) => Some(name.to_string()),
        Err(_) => {
            tracing::debug!(path = %path.display(), "Ignoring entry with unusable plugin name");
            None
        }
    }
}

fn find_manifest(dir: &Path) -> Option<PathBuf> {
    MANIFEST_FILES.iter().map(|file| dir.join(file)).find(|path| path.is_file())
}

fn read_unpacked(name: &str, dir: &Path, manifest_path: &Path) -> PluginResult<ModuleSource> {
    let manifest = Manifest::from_file(manifest_path)?;
    manifest.ensure_identity(name)?;

    let preferred = dir.join(format!("{name}.{PLUGIN_EXTENSION}"));
    let path = if preferred.is_file() {
        preferred
    } else {
        let mut modules = fs::read_dir(dir)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|p| p.extension().is_some_and(|e| e.eq_ignore_ascii_case(PLUGIN_EXTENSION)));
        match (modules.next(), modules.next()) {
            (Some(path), None) => path,
            (None, _) => {
                return Err(PluginError::ManifestInvalid(format!(
                    "package '{name}' has no .{PLUGIN_EXTENSION} module"
                )))
            }
            (Some(_), Some(_)) => {
                return Err(PluginError::ManifestInvalid(format!(
                    "package '{name}' has more than one .{PLUGIN_EXTENSION} module"
                )))
            }
        }
    };

    let module = fs::read(&path)?;
    Ok(ModuleSource { path, manifest: Some(manifest), module })
}

/// Reduce an uploaded file name to a bare, non-hidden file name.
fn sanitize_upload_name(upload_name: &str) -> PluginResult<String> {
    let base = upload_name.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    if base.is_empty() || base == "." || base == ".." || base.starts_with('.') {
        return Err(PluginError::Packaging(format!("invalid file name '{upload_name}'")));
    }
    Ok(base.to_string())
}
