use anyhow::{Result, bail};
use indexmap::IndexMap;
use log::trace;
use oxc_resolver::{ResolveError, ResolveOptions, Resolver};
use std::path::{Path, PathBuf};

use crate::config::BundlerConfiguration;
use crate::util::display_relative;

/// Outcome of resolving a `require` specifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// A file that becomes part of the bundle
    File(PathBuf),
    /// A request provided at runtime by the named global variable
    External { request: String, global: String },
}

/// Maps specifiers to files or externals.
///
/// Files are found the way Node's `require` finds them: the exact path, then each configured
/// extension, then `index` files and `package.json` `main` fields, then `node_modules`.
/// The underlying resolver caches filesystem lookups, so build a new one per compilation.
#[derive(Debug)]
pub struct ModuleResolver {
    context: PathBuf,
    externals: IndexMap<String, String>,
    resolver: Resolver,
}

impl ModuleResolver {
    pub fn new(config: &BundlerConfiguration) -> Self {
        let options = ResolveOptions {
            extensions: config.resolve.extensions.clone(),
            condition_names: vec!["require".to_owned(), "default".to_owned()],
            // Resolved paths keep symlinked components as written
            symlinks: false,
            ..ResolveOptions::default()
        };
        Self {
            context: config.context.clone(),
            externals: config.externals.clone(),
            resolver: Resolver::new(options),
        }
    }

    /// Resolve the configured entry point; it has to be an existing file
    pub fn resolve_entry(&self, entry_point: &Path) -> Result<PathBuf> {
        match self
            .resolver
            .resolve(&self.context, &entry_point.to_string_lossy())
        {
            Ok(resolution) => Ok(resolution.full_path()),
            Err(err) => {
                trace!("Entry resolution failed: {}", err);
                bail!(
                    "Entry module not found: {} does not exist",
                    display_relative(&self.context, entry_point)
                )
            }
        }
    }

    /// Resolve `specifier` as written in `importer`
    pub fn resolve(&self, specifier: &str, importer: &Path) -> Result<Resolved> {
        if let Some(global) = self.externals.get(specifier) {
            return Ok(Resolved::External {
                request: specifier.to_owned(),
                global: global.clone(),
            });
        }

        let dir = importer
            .parent()
            .filter(|parent| parent.components().next().is_some())
            .unwrap_or(&self.context);
        let not_found = || {
            format!(
                "Module not found: Can't resolve '{}' in '{}'",
                specifier,
                display_relative(&self.context, dir)
            )
        };

        match self.resolver.resolve(dir, specifier) {
            Ok(resolution) => {
                let found = resolution.full_path();
                trace!("Resolved '{}' from {:?} to {:?}", specifier, importer, found);
                Ok(Resolved::File(found))
            }
            Err(ResolveError::NotFound(_)) => bail!(not_found()),
            Err(err) => Err(anyhow::Error::new(err).context(not_found())),
        }
    }
}
