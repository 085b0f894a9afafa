//! Loaders turn a source file into a CommonJS module body.
//!
//! A loader receives the current source text and returns the transformed text. Loaders are
//! looked up by name in a [`LoaderRegistry`]; rules decide which names apply to a file.

use anyhow::{Context, Result, anyhow, bail};
use cow_utils::CowUtils;
use indexmap::IndexMap;
use log::{debug, trace};
use serde::de::IgnoredAny;
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;

use crate::config::{BundlerConfiguration, CommandLoaderConfig, Mode};
use crate::rules::{JS_LOADER, JSON_LOADER};

pub const RAW_LOADER: &str = "raw-loader";

/// Environment variable carrying the resource path to command loaders
pub const RESOURCE_ENV: &str = "FERRYPACK_RESOURCE";

/// What a loader knows about the file being processed
#[derive(Debug, Clone, Copy)]
pub struct LoaderContext<'a> {
    /// Absolute path of the file being loaded
    pub resource_path: &'a Path,
    /// Project context directory
    pub context: &'a Path,
    pub mode: Mode,
}

pub trait Loader: Send + Sync {
    fn load(&self, source: String, ctx: &LoaderContext<'_>) -> Result<String>;
}

impl<F> Loader for F
where
    F: Fn(String, &LoaderContext<'_>) -> Result<String> + Send + Sync,
{
    fn load(&self, source: String, ctx: &LoaderContext<'_>) -> Result<String> {
        self(source, ctx)
    }
}

/// Passes JavaScript through untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct JsLoader;

impl Loader for JsLoader {
    fn load(&self, source: String, _ctx: &LoaderContext<'_>) -> Result<String> {
        Ok(source)
    }
}

/// Validates JSON and exposes it as the module's exports.
///
/// The document is emitted as written, so key order and number precision survive.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLoader;

impl Loader for JsonLoader {
    fn load(&self, source: String, ctx: &LoaderContext<'_>) -> Result<String> {
        serde_json::from_str::<IgnoredAny>(&source)
            .with_context(|| format!("Invalid JSON in {:?}", ctx.resource_path))?;
        let document = source.trim();
        Ok(format!(
            "module.exports = {};",
            document
                .cow_replace('\u{2028}', "\\u2028")
                .cow_replace('\u{2029}', "\\u2029")
        ))
    }
}

/// Exposes the file content as a string export
#[derive(Debug, Clone, Copy, Default)]
pub struct RawLoader;

impl Loader for RawLoader {
    fn load(&self, source: String, _ctx: &LoaderContext<'_>) -> Result<String> {
        let literal = serde_json::to_string(&source)?;
        Ok(format!("module.exports = {};", literal))
    }
}

/// Runs an external program: source on stdin, module body on stdout
#[derive(Debug, Clone)]
pub struct CommandLoader {
    name: String,
    config: CommandLoaderConfig,
}

impl CommandLoader {
    pub fn new(name: impl Into<String>, config: CommandLoaderConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }
}

impl Loader for CommandLoader {
    fn load(&self, source: String, ctx: &LoaderContext<'_>) -> Result<String> {
        debug!(
            "Running {} ({} {:?}) on {:?}",
            self.name, self.config.command, self.config.args, ctx.resource_path
        );

        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .current_dir(ctx.context)
            .env(RESOURCE_ENV, ctx.resource_path)
            .env("FERRYPACK_MODE", ctx.mode.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| {
                format!(
                    "Failed to start loader '{}' ({})",
                    self.name, self.config.command
                )
            })?;

        // Feed stdin from a separate thread so a chatty child cannot fill its stdout pipe
        // while we are still writing.
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("Loader '{}' has no stdin", self.name))?;
        let writer = std::thread::spawn(move || stdin.write_all(source.as_bytes()));

        let output = child
            .wait_with_output()
            .with_context(|| format!("Failed to wait for loader '{}'", self.name))?;

        match writer.join() {
            Ok(Ok(())) => {}
            // The child may legitimately exit without reading all of stdin.
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::BrokenPipe => {}
            Ok(Err(err)) => {
                return Err(err)
                    .with_context(|| format!("Failed to write to loader '{}'", self.name));
            }
            Err(_) => bail!("Writer thread for loader '{}' panicked", self.name),
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "Loader '{}' failed with {} on {:?}:\n{}",
                self.name,
                output.status,
                ctx.resource_path,
                stderr.trim_end()
            );
        }

        String::from_utf8(output.stdout)
            .with_context(|| format!("Loader '{}' produced non UTF-8 output", self.name))
    }
}

/// Name-keyed set of loaders
#[derive(Clone, Default)]
pub struct LoaderRegistry {
    loaders: IndexMap<String, Arc<dyn Loader>>,
}

impl fmt::Debug for LoaderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderRegistry")
            .field("loaders", &self.loaders.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl LoaderRegistry {
    /// Registry holding only the built-in loaders
    pub fn with_builtins() -> Self {
        let mut registry = Self::default();
        registry.register(JS_LOADER, JsLoader);
        registry.register(JSON_LOADER, JsonLoader);
        registry.register(RAW_LOADER, RawLoader);
        registry
    }

    /// Built-ins plus the command loaders declared in the configuration
    pub fn from_config(config: &BundlerConfiguration) -> Self {
        let mut registry = Self::with_builtins();
        for (name, loader) in &config.loaders {
            registry.register(name.clone(), CommandLoader::new(name.clone(), loader.clone()));
        }
        registry
    }

    /// Register `loader` under `name`, replacing any loader of the same name
    pub fn register(&mut self, name: impl Into<String>, loader: impl Loader + 'static) {
        let name = name.into();
        if self.loaders.insert(name.clone(), Arc::new(loader)).is_some() {
            debug!("Loader '{}' replaced", name);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Loader>> {
        self.loaders.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.loaders.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.loaders.keys().map(String::as_str)
    }

    /// Run `chain` over `source`, in order
    pub fn run_chain(
        &self,
        chain: &[&str],
        source: String,
        ctx: &LoaderContext<'_>,
    ) -> Result<String> {
        chain.iter().try_fold(source, |source, name| {
            let loader = self
                .get(name)
                .ok_or_else(|| anyhow!("Unknown loader '{}'", name))?;
            trace!("Applying {} to {:?}", name, ctx.resource_path);
            loader
                .load(source, ctx)
                .with_context(|| format!("Loader '{}' failed on {:?}", name, ctx.resource_path))
        })
    }
}
