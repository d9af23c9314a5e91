//! Plugin package archives.
//!
//! A package is a zip archive holding exactly one manifest (`plugin.json` or
//! `plugin.toml`) and exactly one WebAssembly module. Any other files are
//! carried along as plugin assets. Entry names are untrusted: anything that
//! would resolve outside the package root is rejected.

use std::fs::{self, File};
use std::io::{Cursor, Read, Seek, Write};
use std::path::{Component, Path, PathBuf};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::{
    Manifest, PluginError, PluginResult, MANIFEST_FILES, PACKAGE_EXTENSION, PLUGIN_EXTENSION,
    WASM_MAGIC,
};

/// Largest single entry accepted from an archive.
pub const MAX_ENTRY_BYTES: u64 = 64 * 1024 * 1024;

/// Parsed contents of a package archive, still in memory.
struct Contents {
    manifest_file: String,
    manifest: Manifest,
    module: Vec<u8>,
    assets: Vec<(PathBuf, Vec<u8>)>,
}

fn packaging(reason: impl Into<String>) -> PluginError {
    PluginError::Packaging(reason.into())
}

/// Whether `path` has the package extension.
pub fn is_package(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case(PACKAGE_EXTENSION))
}

/// Unpack `archive_path` into `<dest_dir>/<name>/`.
///
/// The archive is extracted into a hidden staging directory inside
/// `dest_dir` and renamed into place only once it is complete, so a bad
/// archive never disturbs an existing plugin of the same name.
pub fn extract(archive_path: &Path, dest_dir: &Path) -> PluginResult<(Manifest, PathBuf)> {
    extract_with(archive_path, dest_dir, |_, _| Ok(()))
}

/// Like [`extract`], but runs `check` on the manifest and module before
/// anything is written to `dest_dir`.
pub fn extract_with<F>(
    archive_path: &Path,
    dest_dir: &Path,
    check: F,
) -> PluginResult<(Manifest, PathBuf)>
where
    F: FnOnce(&Manifest, &[u8]) -> PluginResult<()>,
{
    if !is_package(archive_path) {
        return Err(packaging(format!(
            "'{}' is not a .{PACKAGE_EXTENSION} package",
            archive_path.display()
        )));
    }
    let contents = read_package(File::open(archive_path)?)?;
    let name = contents.manifest.name.clone();
    check(&contents.manifest, &contents.module)?;

    fs::create_dir_all(dest_dir)?;
    let staging = tempfile::Builder::new().prefix(".extract-").tempdir_in(dest_dir)?;
    let staged = staging.path().join("pkg");
    fs::create_dir(&staged)?;

    let manifest_bytes = serialize_manifest(&contents.manifest, &contents.manifest_file)?;
    fs::write(staged.join(&contents.manifest_file), manifest_bytes)?;
    fs::write(staged.join(format!("{name}.{PLUGIN_EXTENSION}")), &contents.module)?;
    for (rel, bytes) in &contents.assets {
        let target = staged.join(rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(target, bytes)?;
    }

    let target = dest_dir.join(&name);
    swap_into_place(&staged, &target, dest_dir)?;

    tracing::info!(plugin = %name, version = %contents.manifest.version, "Plugin package extracted");
    let module_path = target.join(format!("{name}.{PLUGIN_EXTENSION}"));
    Ok((contents.manifest, module_path))
}

/// Replace `target` with `staged`. An existing `target` is moved aside first
/// and restored if the final rename fails.
fn swap_into_place(staged: &Path, target: &Path, dest_dir: &Path) -> PluginResult<()> {
    if !target.exists() {
        fs::rename(staged, target)?;
        return Ok(());
    }

    let trash = tempfile::Builder::new().prefix(".replaced-").tempdir_in(dest_dir)?;
    let old = trash.path().join("old");
    fs::rename(target, &old)?;
    if let Err(e) = fs::rename(staged, target) {
        if let Err(restore) = fs::rename(&old, target) {
            tracing::error!(path = %target.display(), error = %restore, "Failed to restore plugin directory");
        }
        return Err(e.into());
    }
    Ok(())
}

/// Read the manifest of a package without extracting it.
pub fn inspect(bytes: &[u8]) -> PluginResult<Manifest> {
    Ok(read_package(Cursor::new(bytes))?.manifest)
}

/// Build a package archive from a manifest and module binary. The inverse of [`extract`].
pub fn package(manifest: &Manifest, module: &[u8]) -> PluginResult<Vec<u8>> {
    manifest.validate()?;
    if !module.starts_with(&WASM_MAGIC) {
        return Err(packaging("module is not a WebAssembly binary"));
    }

    let zip_err = |e: zip::result::ZipError| packaging(e.to_string());
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));

    writer.start_file("plugin.json", options).map_err(zip_err)?;
    writer.write_all(&manifest.to_json()?)?;
    writer.start_file(format!("{}.{PLUGIN_EXTENSION}", manifest.name), options).map_err(zip_err)?;
    writer.write_all(module)?;

    Ok(writer.finish().map_err(zip_err)?.into_inner())
}

fn read_package<R: Read + Seek>(reader: R) -> PluginResult<Contents> {
    let mut archive =
        ZipArchive::new(reader).map_err(|e| packaging(format!("not a valid zip archive: {e}")))?;

    let mut manifests: Vec<(PathBuf, Vec<u8>)> = Vec::new();
    let mut modules: Vec<Vec<u8>> = Vec::new();
    let mut assets: Vec<(PathBuf, Vec<u8>)> = Vec::new();

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(|e| packaging(e.to_string()))?;
        let raw_name = entry.name().to_string();
        let Some(rel) = entry.enclosed_name() else {
            return Err(packaging(format!("entry '{raw_name}' escapes the package root")));
        };
        if !rel.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(packaging(format!("entry '{raw_name}' escapes the package root")));
        }
        if entry.is_dir() || rel.starts_with("__MACOSX") {
            continue;
        }
        if entry.size() > MAX_ENTRY_BYTES {
            return Err(packaging(format!("entry '{raw_name}' exceeds {MAX_ENTRY_BYTES} bytes")));
        }

        let mut bytes = Vec::new();
        entry.by_ref().take(MAX_ENTRY_BYTES + 1).read_to_end(&mut bytes)?;
        if bytes.len() as u64 > MAX_ENTRY_BYTES {
            return Err(packaging(format!("entry '{raw_name}' exceeds {MAX_ENTRY_BYTES} bytes")));
        }

        let file_name = rel.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if MANIFEST_FILES.contains(&file_name) {
            manifests.push((rel, bytes));
        } else if rel.extension().is_some_and(|ext| ext.eq_ignore_ascii_case(PLUGIN_EXTENSION)) {
            modules.push(bytes);
        } else {
            assets.push((rel, bytes));
        }
    }

    let (manifest_path, manifest_bytes) = match manifests.len() {
        0 => return Err(packaging("package has no manifest (plugin.json or plugin.toml)")),
        1 => manifests.remove(0),
        n => return Err(packaging(format!("package has {n} manifests, expected one"))),
    };
    let module = match modules.len() {
        0 => return Err(packaging("package has no .wasm module")),
        1 => modules.remove(0),
        n => return Err(packaging(format!("package has {n} .wasm modules, expected one"))),
    };
    if !module.starts_with(&WASM_MAGIC) {
        return Err(packaging("module is not a WebAssembly binary"));
    }

    let manifest = Manifest::from_bytes(&manifest_bytes, &manifest_path)
        .map_err(|e| packaging(e.to_string()))?;
    let manifest_file =
        manifest_path.file_name().and_then(|n| n.to_str()).unwrap_or("plugin.json").to_string();

    // Assets are laid out relative to the directory holding the manifest.
    let root = manifest_path.parent().map(Path::to_path_buf).unwrap_or_default();
    let assets = assets
        .into_iter()
        .filter_map(|(rel, bytes)| {
            rel.strip_prefix(&root).ok().map(|rel| (rel.to_path_buf(), bytes))
        })
        .collect();

    Ok(Contents { manifest_file, manifest, module, assets })
}

/// Serialize `manifest` in the format implied by `file_name`.
fn serialize_manifest(manifest: &Manifest, file_name: &str) -> PluginResult<Vec<u8>> {
    if file_name.ends_with(".toml") {
        Ok(manifest.to_toml()?.into_bytes())
    } else {
        manifest.to_json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODULE: &[u8] = b"\0asm\x01\0\0\0";

    fn manifest(name: &str) -> Manifest {
        let json = format!(
            r#"{{"name": "{name}", "version": "1.0.0",
                "widgets": [{{"id": "hello", "title": "Hello", "handler": "render"}}]}}"#
        );
        Manifest::from_json(json.as_bytes()).unwrap()
    }

    fn zip_of(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, bytes) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(bytes).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn write_archive(dir: &Path, bytes: &[u8]) -> PathBuf {
        let path = dir.join("upload.zip");
        fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn test_package_extract_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let original = manifest("greeter");
        let archive = write_archive(dir.path(), &package(&original, MODULE).unwrap());

        let store = dir.path().join("plugins");
        let (manifest, module_path) = extract(&archive, &store).unwrap();

        assert_eq!(manifest, original);
        assert_eq!(module_path, store.join("greeter").join("greeter.wasm"));
        assert_eq!(fs::read(&module_path).unwrap(), MODULE);
        assert!(store.join("greeter").join("plugin.json").exists());
    }

    #[test]
    fn test_missing_manifest_leaves_store_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("plugins");
        fs::create_dir(&store).unwrap();
        let archive = write_archive(dir.path(), &zip_of(&[("greeter.wasm", MODULE)]));

        let err = extract(&archive, &store).unwrap_err();
        assert!(matches!(err, PluginError::Packaging(ref r) if r.contains("no manifest")));
        assert_eq!(fs::read_dir(&store).unwrap().count(), 0);
    }

    #[test]
    fn test_rejects_bad_archives() {
        let json = manifest("greeter").to_json().unwrap();
        let cases: Vec<Vec<u8>> = vec![
            zip_of(&[("plugin.json", &json[..])]),
            zip_of(&[("plugin.json", &json[..]), ("a.wasm", MODULE), ("b.wasm", MODULE)]),
            zip_of(&[
                ("plugin.json", &json[..]),
                ("plugin.toml", &b"name = 'x'"[..]),
                ("a.wasm", MODULE),
            ]),
            zip_of(&[("plugin.json", &json[..]), ("a.wasm", &b"not wasm"[..])]),
            zip_of(&[("plugin.json", &json[..]), ("a.wasm", MODULE), ("../evil.txt", &b"x"[..])]),
            b"definitely not a zip".to_vec(),
        ];
        for bytes in cases {
            assert!(matches!(inspect(&bytes), Err(PluginError::Packaging(_))));
        }
    }

    #[test]
    fn test_extension_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("greeter.tar");
        fs::write(&path, package(&manifest("greeter"), MODULE).unwrap()).unwrap();
        assert!(matches!(extract(&path, dir.path()), Err(PluginError::Packaging(_))));
    }

    #[test]
    fn test_extract_replaces_existing_plugin() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("plugins");
        let stale = store.join("greeter");
        fs::create_dir_all(&stale).unwrap();
        fs::write(stale.join("stale.txt"), b"old").unwrap();

        let archive = write_archive(dir.path(), &package(&manifest("greeter"), MODULE).unwrap());
        extract(&archive, &store).unwrap();

        assert!(!stale.join("stale.txt").exists());
        assert!(stale.join("greeter.wasm").exists());
        let leftovers: Vec<_> = fs::read_dir(&store)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_assets_and_toml_manifest() {
        let toml = "name = \"stats\"\nversion = \"0.3.0\"\n";
        let bytes = zip_of(&[
            ("stats/plugin.toml", toml.as_bytes()),
            ("stats/stats.wasm", MODULE),
            ("stats/static/app.css", &b"body{}"[..]),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let archive = write_archive(dir.path(), &bytes);
        let (manifest, _) = extract(&archive, dir.path()).unwrap();

        assert_eq!(manifest.version, "0.3.0");
        assert!(dir.path().join("stats/plugin.toml").exists());
        assert!(dir.path().join("stats/static/app.css").exists());
    }
}
