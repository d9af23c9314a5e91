//! Shared fixtures: plugin modules authored as WAT and plugin directory helpers.

#![allow(dead_code)]

use std::path::Path;

use wasmhost::plugin::package;
use wasmhost::Manifest;

/// What a handler export does when called.
enum Behavior {
    /// Return a fixed byte string.
    Returns(String),
    /// Return the argument bytes unchanged.
    Echo,
    /// Never return.
    Hang,
    /// Trap immediately.
    Trap,
    /// Forward a fixed request to `gk.host_call` and return its result.
    HostCall { function: String, args: String },
}

/// Builds a plugin module following the guest ABI.
#[derive(Default)]
pub struct Guest {
    handlers: Vec<(String, Behavior)>,
    register: Option<String>,
    register_hangs: bool,
}

impl Guest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler returning `output` verbatim.
    pub fn returns(mut self, name: &str, output: &str) -> Self {
        self.handlers.push((name.to_string(), Behavior::Returns(output.to_string())));
        self
    }

    /// Handler returning `{"html": html}`.
    pub fn html(self, name: &str, html: &str) -> Self {
        let output = serde_json::json!({ "html": html }).to_string();
        self.returns(name, &output)
    }

    pub fn echo(mut self, name: &str) -> Self {
        self.handlers.push((name.to_string(), Behavior::Echo));
        self
    }

    pub fn hang(mut self, name: &str) -> Self {
        self.handlers.push((name.to_string(), Behavior::Hang));
        self
    }

    pub fn trap(mut self, name: &str) -> Self {
        self.handlers.push((name.to_string(), Behavior::Trap));
        self
    }

    /// Handler that calls host function `function` with `args` and returns the reply.
    pub fn host_call(mut self, name: &str, function: &str, args: &str) -> Self {
        let behavior = Behavior::HostCall { function: function.to_string(), args: args.to_string() };
        self.handlers.push((name.to_string(), behavior));
        self
    }

    /// Export a `gk_register` that never returns.
    pub fn register_hangs(mut self) -> Self {
        self.register_hangs = true;
        self
    }

    /// Export `gk_register` returning `manifest_json`.
    pub fn register(mut self, manifest_json: &str) -> Self {
        self.register = Some(manifest_json.to_string());
        self
    }

    pub fn wat(&self) -> String {
        let mut data = String::new();
        let mut funcs = String::new();
        let mut offset = 16usize;

        let mut segment = |text: &str, data: &mut String| -> (usize, usize) {
            let at = offset;
            data.push_str(&format!("  (data (i32.const {at}) \"{}\")\n", escape(text)));
            offset += text.len() + 16;
            (at, text.len())
        };

        if self.register_hangs {
            funcs.push_str("  (func (export \"gk_register\") (result i64) (loop $spin (br $spin)) (i64.const 0))\n");
        } else if let Some(manifest) = &self.register {
            let (at, len) = segment(manifest, &mut data);
            funcs.push_str(&format!(
                "  (func (export \"gk_register\") (result i64) {})\n",
                packed(at, len)
            ));
        }

        for (name, behavior) in &self.handlers {
            let body = match behavior {
                Behavior::Returns(output) => {
                    let (at, len) = segment(output, &mut data);
                    packed(at, len)
                }
                Behavior::Echo => "(i64.or (i64.shl (i64.extend_i32_u (local.get 0)) (i64.const 32)) (i64.extend_i32_u (local.get 1)))".to_string(),
                Behavior::Hang => "(loop $spin (br $spin)) (i64.const 0)".to_string(),
                Behavior::Trap => "unreachable".to_string(),
                Behavior::HostCall { function, args } => {
                    let (fn_at, fn_len) = segment(function, &mut data);
                    let (args_at, args_len) = segment(args, &mut data);
                    format!(
                        "(call $host_call (i32.const {fn_at}) (i32.const {fn_len}) (i32.const {args_at}) (i32.const {args_len}))"
                    )
                }
            };
            funcs.push_str(&format!(
                "  (func (export \"{name}\") (param i32 i32) (result i64) {body})\n"
            ));
        }

        let imports = if self.handlers.iter().any(|(_, b)| matches!(b, Behavior::HostCall { .. })) {
            "  (import \"gk\" \"host_call\" (func $host_call (param i32 i32 i32 i32) (result i64)))\n"
        } else {
            ""
        };

        format!(
            r#"(module
{imports}  (memory (export "memory") 2)
  (global $next (mut i32) (i32.const 65536))
  (func (export "gk_malloc") (param $size i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $next))
    (global.set $next (i32.add (global.get $next) (local.get $size)))
    (local.get $ptr))
{data}{funcs})"#
        )
    }

    pub fn build(&self) -> Vec<u8> {
        wat::parse_str(self.wat()).unwrap()
    }
}

fn packed(ptr: usize, len: usize) -> String {
    format!("(i64.or (i64.shl (i64.const {ptr}) (i64.const 32)) (i64.const {len}))")
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace('\t', "\\t")
}

/// Lay out an unpacked package: `<dir>/<name>/plugin.json` plus `<name>.wasm`.
pub fn install_dir(dir: &Path, manifest_json: &str, module: &[u8]) -> String {
    let manifest = Manifest::from_json(manifest_json.as_bytes()).unwrap();
    let plugin_dir = dir.join(&manifest.name);
    std::fs::create_dir_all(&plugin_dir).unwrap();
    std::fs::write(plugin_dir.join("plugin.json"), manifest_json).unwrap();
    std::fs::write(plugin_dir.join(format!("{}.wasm", manifest.name)), module).unwrap();
    manifest.name
}

/// Build a `.zip` package from a JSON manifest and a module.
pub fn package_bytes(manifest_json: &str, module: &[u8]) -> Vec<u8> {
    let manifest = Manifest::from_json(manifest_json.as_bytes()).unwrap();
    package::package(&manifest, module).unwrap()
}

/// Names of the entries directly under `dir`, sorted.
pub fn entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

pub const GREETER_MANIFEST: &str = r#"{
    "name": "greeter",
    "version": "1.0.0",
    "widgets": [{"id": "hello", "title": "Hello", "handler": "render"}]
}"#;

pub fn greeter_module() -> Vec<u8> {
    Guest::new().html("render", "<b>hi</b>").build()
}
