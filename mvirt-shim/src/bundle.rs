//! Bundle `config.json` resolution.
//!
//! Only the parts of the OCI runtime config the shim needs are read: the
//! root path, a single workload file in `process.args`, and `PATH` from
//! `process.env`.

use crate::Interpreter;
use crate::error::ConfigError;
use serde::Deserialize;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

pub const CONFIG_FILENAME: &str = "config.json";

#[derive(Debug, Deserialize)]
struct BundleConfig {
    #[serde(default)]
    root: Root,
    #[serde(default)]
    process: Process,
}

#[derive(Debug, Default, Deserialize)]
struct Root {
    #[serde(default)]
    path: String,
}

#[derive(Debug, Default, Deserialize)]
struct Process {
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: Vec<String>,
}

/// What a bundle asks the shim to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    /// Root filesystem, absolute or relative to the shim's working directory.
    pub root_path: PathBuf,
    /// Workload file, relative to the root.
    pub entrypoint_path: String,
    /// Entries of the bundle's `PATH`, in order.
    pub search_path: Vec<String>,
}

/// A resolved command line for the workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

impl ResolvedConfig {
    /// Read and validate `<bundle>/config.json`.
    ///
    /// `extensions` lists accepted workload file extensions; empty accepts
    /// any file.
    pub fn read(bundle: &Path, extensions: &[String]) -> Result<Self, ConfigError> {
        let file = bundle.join(CONFIG_FILENAME);
        let data = std::fs::read(&file).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ConfigError::NotFound(file.clone()),
            _ => ConfigError::Read {
                path: file.clone(),
                source: e,
            },
        })?;
        let config: BundleConfig = serde_json::from_slice(&data)?;

        if config.root.path.is_empty() {
            return Err(ConfigError::MissingRoot);
        }

        let [entrypoint] = config.process.args.as_slice() else {
            return Err(ConfigError::ArgCount(config.process.args.len()));
        };

        if !extensions.is_empty() {
            let extension = Path::new(entrypoint).extension().and_then(OsStr::to_str);
            if !extension.is_some_and(|ext| extensions.iter().any(|e| e == ext)) {
                return Err(ConfigError::Extension(entrypoint.clone()));
            }
        }

        let root_path = bundle.join(&config.root.path);
        let resolved = Self {
            root_path,
            entrypoint_path: entrypoint.clone(),
            search_path: search_path(&config.process.env),
        };

        let script = resolved.full_path();
        if !script.is_file() {
            return Err(ConfigError::MissingEntrypoint(script));
        }

        Ok(resolved)
    }

    /// Absolute location of the workload file.
    pub fn full_path(&self) -> PathBuf {
        self.root_path
            .join(self.entrypoint_path.trim_start_matches('/'))
    }

    /// Command line running the workload file under `interpreter`.
    pub fn workload(&self, interpreter: &Interpreter) -> Workload {
        let mut args = interpreter.args.clone();
        args.push(self.full_path().display().to_string());

        let mut env = Vec::new();
        if !self.search_path.is_empty() {
            env.push(("PATH".to_string(), self.search_path.join(":")));
        }

        Workload {
            program: interpreter.program.clone(),
            args,
            cwd: self.root_path.clone(),
            env,
        }
    }
}

fn search_path(env: &[String]) -> Vec<String> {
    env.iter()
        .find_map(|var| var.strip_prefix("PATH="))
        .map(|path| path.split(':').map(str::to_string).collect())
        .unwrap_or_default()
}
