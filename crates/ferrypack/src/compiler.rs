use anyhow::{Context, Result, bail};
use indexmap::IndexMap;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Instant;
use walkdir::WalkDir;

use crate::config::BundlerConfiguration;
use crate::emit::{BundleEmitter, ENTRY_CHUNK_NAME, content_hash, render_filename, render_html};
use crate::graph::{ModuleGraph, ModuleId, ModuleKey, ModuleKind};
use crate::loader::{Loader, LoaderContext, LoaderRegistry};
use crate::resolver::{ModuleResolver, Resolved};
use crate::rules::RuleSet;
use crate::scanner::{rewrite_requires, scan_requires};
use crate::util::{display_relative, normalize_line_endings};

/// The in-memory result of one build
#[derive(Debug)]
pub struct Compilation {
    pub graph: ModuleGraph,
    /// Rendered name of the bundle asset
    pub bundle_filename: String,
    /// SHA-256 of the bundle
    pub hash: String,
    /// Output files keyed by their name relative to the output directory
    pub assets: IndexMap<String, String>,
}

impl Compilation {
    pub fn bundle(&self) -> &str {
        self.assets
            .get(&self.bundle_filename)
            .map_or("", String::as_str)
    }

    pub fn asset(&self, name: &str) -> Option<&str> {
        self.assets.get(name).map(String::as_str)
    }

    /// Files read by this compilation
    pub fn watch_files(&self) -> Vec<PathBuf> {
        self.graph.source_files().map(Path::to_path_buf).collect()
    }

    /// Write every asset below `output_directory`, creating directories as needed
    pub fn emit(&self, output_directory: &Path) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(output_directory).with_context(|| {
            format!("Failed to create output directory: {:?}", output_directory)
        })?;

        let mut written = Vec::with_capacity(self.assets.len());
        for (name, content) in &self.assets {
            let path = output_directory.join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {:?}", parent))?;
            }
            fs::write(&path, content)
                .with_context(|| format!("Failed to write output file: {:?}", path))?;
            debug!("Wrote {} ({} bytes)", name, content.len());
            written.push(path);
        }
        Ok(written)
    }
}

/// Builds a [`Compilation`] from a [`BundlerConfiguration`]
#[derive(Debug)]
pub struct Compiler {
    config: BundlerConfiguration,
    rules: RuleSet,
    loaders: LoaderRegistry,
}

impl Compiler {
    pub fn new(config: BundlerConfiguration) -> Result<Self> {
        let rules = RuleSet::compile(&config.module_rules)?;
        let loaders = LoaderRegistry::from_config(&config);
        Ok(Self {
            config,
            rules,
            loaders,
        })
    }

    pub fn config(&self) -> &BundlerConfiguration {
        &self.config
    }

    /// Make `loader` available to module rules under `name`
    pub fn register_loader(&mut self, name: impl Into<String>, loader: impl Loader + 'static) {
        self.loaders.register(name, loader);
    }

    /// Compile and write the assets to the output directory
    pub fn run(&self) -> Result<Compilation> {
        let compilation = self.compile()?;
        let output_directory = &self.config.output.output_directory;

        if self.config.output.clean {
            self.clean_output_directory(&compilation)?;
        }

        compilation.emit(output_directory)?;
        info!(
            "Bundle written to: {:?}",
            output_directory.join(&compilation.bundle_filename)
        );
        Ok(compilation)
    }

    /// Build the module graph from the entry point and render the assets in memory
    pub fn compile(&self) -> Result<Compilation> {
        let started = Instant::now();
        self.check_rule_loaders()?;

        let resolver = ModuleResolver::new(&self.config);
        let entry = resolver.resolve_entry(&self.config.entry_point)?;
        info!(
            "Compiling from entry: {}",
            display_relative(&self.config.context, &entry)
        );

        let mut graph = ModuleGraph::new();
        let (entry_id, _) = graph.intern(ModuleKey::File(entry.clone()), || {
            self.source_module(entry.clone())
        });

        let mut queue = VecDeque::from([entry_id]);
        while let Some(id) = queue.pop_front() {
            self.build_module(&mut graph, &resolver, id, &mut queue)?;
        }

        for cycle in graph.cycles() {
            let names: Vec<String> = cycle
                .iter()
                .map(|&id| self.module_label(&graph, id))
                .collect();
            warn!("Circular dependency: {}", names.join(" → "));
        }

        let code = BundleEmitter::new(self.config.mode, &self.config.context).render(&graph);
        let bundle_filename =
            render_filename(
                &self.config.output.bundle_filename,
                ENTRY_CHUNK_NAME,
                code.as_bytes(),
            )?;
        let hash = content_hash(code.as_bytes());

        let mut assets = IndexMap::new();
        if let Some(html) = &self.config.html {
            if html.filename == bundle_filename {
                bail!(
                    "Conflict: html filename '{}' is the same as the bundle filename",
                    html.filename
                );
            }
            let page = render_html(html, &script_src(&html.filename, &bundle_filename));
            assets.insert(bundle_filename.clone(), code);
            assets.insert(html.filename.clone(), page);
        } else {
            assets.insert(bundle_filename.clone(), code);
        }

        info!(
            "Compiled {} modules in {:.2?}",
            graph.len(),
            started.elapsed()
        );

        Ok(Compilation {
            graph,
            bundle_filename,
            hash,
            assets,
        })
    }

    fn check_rule_loaders(&self) -> Result<()> {
        for (index, name) in self.rules.loader_names().enumerate() {
            if !self.loaders.contains(name) {
                let known: Vec<&str> = self.loaders.names().collect();
                bail!(
                    "Unknown loader '{}' in module rule #{}. Declare it under [loaders.{}] \
                     or register it programmatically. Known loaders: {}",
                    name,
                    index + 1,
                    name,
                    known.join(", ")
                );
            }
        }
        Ok(())
    }

    fn source_module(&self, path: PathBuf) -> ModuleKind {
        let loaders = self
            .rules
            .loaders_for(&path)
            .into_iter()
            .map(str::to_owned)
            .collect();
        ModuleKind::Source { path, loaders }
    }

    fn module_label(&self, graph: &ModuleGraph, id: ModuleId) -> String {
        match graph.get(id).map(|module| &module.kind) {
            Some(ModuleKind::Source { path, .. }) => display_relative(&self.config.context, path),
            Some(ModuleKind::External { request, .. }) => request.clone(),
            None => id.to_string(),
        }
    }

    /// Load one module, resolve its requests and queue newly discovered files
    fn build_module(
        &self,
        graph: &mut ModuleGraph,
        resolver: &ModuleResolver,
        id: ModuleId,
        queue: &mut VecDeque<ModuleId>,
    ) -> Result<()> {
        let Some(ModuleKind::Source { path, loaders }) = graph.get(id).map(|m| m.kind.clone())
        else {
            return Ok(());
        };
        let relative = display_relative(&self.config.context, &path);

        if loaders.is_empty() {
            bail!(
                "Module parse failed: {relative}\nYou may need an appropriate loader to handle \
                 this file type, currently no module rule matches it."
            );
        }

        let source = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read module: {:?}", path))?;
        let source = normalize_line_endings(source);

        let ctx = LoaderContext {
            resource_path: &path,
            context: &self.config.context,
            mode: self.config.mode,
        };
        let chain: Vec<&str> = loaders.iter().map(String::as_str).collect();
        debug!("{} <- [{}]", relative, chain.join(", "));
        let code = self
            .loaders
            .run_chain(&chain, source, &ctx)
            .with_context(|| format!("Module build failed: {relative}"))?;

        let calls = scan_requires(&code);
        let mut ids = Vec::with_capacity(calls.len());
        for call in &calls {
            let dependency = match resolver.resolve(&call.specifier, &path)? {
                Resolved::File(file) => {
                    let (dep, added) =
                        graph.intern(ModuleKey::File(file.clone()), || self.source_module(file));
                    if added {
                        queue.push_back(dep);
                    }
                    dep
                }
                Resolved::External { request, global } => {
                    graph
                        .intern(ModuleKey::External(request.clone()), || ModuleKind::External {
                            request,
                            global,
                        })
                        .0
                }
            };
            graph.add_dependency(id, dependency);
            ids.push(dependency);
        }

        let annotate = self.config.mode.is_development();
        graph.set_code(id, rewrite_requires(&code, &calls, &ids, annotate));
        Ok(())
    }

    /// Remove everything inside the output directory, unless that would also remove the
    /// static content root, the project itself or any file the compilation read
    fn clean_output_directory(&self, compilation: &Compilation) -> Result<()> {
        let output = &self.config.output.output_directory;
        if !output.is_dir() {
            return Ok(());
        }

        let protected = [
            self.config.dev_server.static_content_root.clone(),
            self.config.context.clone(),
            self.config.entry_point.clone(),
        ]
        .into_iter()
        .chain(compilation.watch_files());
        for protected in protected {
            if protected.starts_with(output) {
                warn!(
                    "Not cleaning {:?}: it contains {:?}",
                    output, protected
                );
                return Ok(());
            }
        }

        for entry in WalkDir::new(output).min_depth(1).max_depth(1) {
            let entry = entry.with_context(|| format!("Failed to list {:?}", output))?;
            let path = entry.path();
            let removed = if entry.file_type().is_dir() {
                fs::remove_dir_all(path)
            } else {
                fs::remove_file(path)
            };
            removed.with_context(|| format!("Failed to remove {:?}", path))?;
        }
        debug!("Cleaned {:?}", output);
        Ok(())
    }
}

/// Path of the bundle as referenced from the HTML page; both live in the output directory
fn script_src(html_filename: &str, bundle_filename: &str) -> String {
    let depth = Path::new(html_filename)
        .parent()
        .map_or(0, |parent| {
            parent
                .components()
                .filter(|c| matches!(c, Component::Normal(_)))
                .count()
        });
    format!("{}{}", "../".repeat(depth), bundle_filename)
}
