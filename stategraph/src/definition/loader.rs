//! Subgraph source loading and the compile context
//!
//! Subgraph nodes reference nested definitions by name. A [`SourceLoader`]
//! turns a reference into text plus a canonical key; the [`CompileContext`]
//! keeps the stack of keys currently being compiled so a graph that embeds
//! itself, directly or transitively, is rejected.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// A loaded definition source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedSource {
    /// Canonical identity used for cycle detection
    pub key: String,
    pub text: String,
}

/// Resolves subgraph references to definition text.
pub trait SourceLoader: Send + Sync {
    /// Load `reference`, resolved relative to the source identified by `base`
    fn load(&self, reference: &str, base: Option<&str>) -> Result<LoadedSource, String>;
}

/// Loads definitions from the filesystem.
///
/// Relative references resolve against the directory of the parent
/// definition; `~/` expands to the home directory.
#[derive(Debug, Clone, Default)]
pub struct FsLoader;

impl FsLoader {
    fn resolve(reference: &str, base: Option<&str>) -> PathBuf {
        if let Some(rest) = reference.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest);
            }
        }
        let path = Path::new(reference);
        if path.is_absolute() {
            return path.to_path_buf();
        }
        match base.map(Path::new).and_then(Path::parent) {
            Some(dir) => dir.join(path),
            None => path.to_path_buf(),
        }
    }
}

impl SourceLoader for FsLoader {
    fn load(&self, reference: &str, base: Option<&str>) -> Result<LoadedSource, String> {
        let path = Self::resolve(reference, base);
        let canonical = path
            .canonicalize()
            .map_err(|e| format!("{}: {}", path.display(), e))?;
        let text = std::fs::read_to_string(&canonical)
            .map_err(|e| format!("{}: {}", canonical.display(), e))?;
        Ok(LoadedSource {
            key: canonical.to_string_lossy().into_owned(),
            text,
        })
    }
}

/// In-memory sources keyed by reference.
#[derive(Debug, Clone, Default)]
pub struct MemoryLoader {
    sources: HashMap<String, String>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, name: impl Into<String>, text: impl Into<String>) -> Self {
        self.sources.insert(name.into(), text.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, text: impl Into<String>) {
        self.sources.insert(name.into(), text.into());
    }
}

impl SourceLoader for MemoryLoader {
    fn load(&self, reference: &str, _base: Option<&str>) -> Result<LoadedSource, String> {
        self.sources
            .get(reference)
            .map(|text| LoadedSource {
                key: reference.to_string(),
                text: text.clone(),
            })
            .ok_or_else(|| format!("no source named `{reference}`"))
    }
}

/// State threaded through one compile, including nested subgraph compiles.
#[derive(Debug, Clone, Default)]
pub struct CompileContext {
    stack: Vec<String>,
}

impl CompileContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context whose root is the source identified by `key`
    pub fn rooted_at(key: impl Into<String>) -> Self {
        Self {
            stack: vec![key.into()],
        }
    }

    /// Key of the definition currently being compiled
    pub fn current(&self) -> Option<&str> {
        self.stack.last().map(String::as_str)
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Push `key`, rejecting it if it is already being compiled
    pub fn enter(&mut self, key: impl Into<String>) -> Result<(), ConfigError> {
        let key = key.into();
        if self.stack.contains(&key) {
            let mut chain = self.stack.clone();
            chain.push(key);
            return Err(ConfigError::CircularSubgraph { chain });
        }
        self.stack.push(key);
        Ok(())
    }

    pub fn exit(&mut self) {
        self.stack.pop();
    }
}
