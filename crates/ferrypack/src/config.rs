use anyhow::{Context, Result, anyhow, bail};
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use crate::combine::Combine;
use crate::dirs::{find_project_config, system_config_file, user_ferrypack_config_dir};
use crate::util::{normalize_path, rebase};

pub const DEFAULT_ENTRY: &str = "./src/index.js";
pub const DEFAULT_OUTPUT_DIRECTORY: &str = "./dist";
pub const DEFAULT_BUNDLE_FILENAME: &str = "main.js";
pub const DEFAULT_STATIC_CONTENT_ROOT: &str = "./public";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HTML_FILENAME: &str = "index.html";
pub const DEFAULT_HTML_TITLE: &str = "Ferrypack App";

/// Build mode. Development keeps per-module annotations in the emitted bundle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Development,
    #[default]
    Production,
}

impl Mode {
    pub fn parse(value: &str) -> Result<Self> {
        use cow_utils::CowUtils;
        match value.trim().cow_to_lowercase().as_ref() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            _ => Err(anyhow!(
                "Invalid mode '{}'. Supported modes: development, production",
                value
            )),
        }
    }

    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Development => write!(f, "development"),
            Self::Production => write!(f, "production"),
        }
    }
}

impl Combine for Option<Mode> {
    fn combine(self, other: Self) -> Self {
        self.or(other)
    }
}

/// Development server settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DevServerConfig {
    /// Directory served as static assets during development
    pub static_content_root: PathBuf,
    /// When true, unmatched routes are answered with the entry document
    pub history_fallback_enabled: bool,
    /// TCP port the development server listens on
    pub port: u16,
    pub host: String,
}

/// A single `(pattern, loader)` pair. The pattern is kept in source form; see
/// [`crate::rules::RuleSet`] for the compiled view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleRule {
    #[serde(alias = "test")]
    pub file_pattern: String,
    #[serde(alias = "use", alias = "loader")]
    pub loader_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputConfig {
    /// Name of the emitted bundle, may contain `[name]` and `[contenthash]`
    pub bundle_filename: String,
    /// Directory receiving build output, always absolute
    pub output_directory: PathBuf,
    pub clean: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolveConfig {
    pub extensions: Vec<String>,
}

/// An external process used as a loader: the module source is written to its stdin and its
/// stdout becomes the module body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandLoaderConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HtmlConfig {
    pub filename: String,
    pub title: String,
}

/// The resolved bundler configuration.
///
/// Built once at startup and read-only afterwards. All paths are absolute and normalized;
/// relative values were resolved against the directory of the configuration file that
/// declared them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundlerConfiguration {
    /// Base directory for defaults
    pub context: PathBuf,
    pub mode: Mode,
    /// Root source file the bundler compiles from
    pub entry_point: PathBuf,
    /// Ordered `(pattern, loader)` pairs applied to matching source files
    pub module_rules: Vec<ModuleRule>,
    pub resolve: ResolveConfig,
    /// Requests that are never bundled, mapped to the global variable providing them
    pub externals: IndexMap<String, String>,
    pub loaders: IndexMap<String, CommandLoaderConfig>,
    pub output: OutputConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<HtmlConfig>,
    pub dev_server: DevServerConfig,
}

impl BundlerConfiguration {
    /// Load configuration with hierarchical precedence:
    /// 1. CLI-provided config path (highest precedence)
    /// 2. Environment variables (FERRYPACK_*)
    /// 3. Project config (nearest ferrypack.toml from the current directory)
    /// 4. User config (~/.config/ferrypack/ferrypack.toml)
    /// 5. System config (/etc/ferrypack/ferrypack.toml or equivalent)
    /// 6. Default values (lowest precedence)
    pub fn load(cli_config_path: Option<&Path>) -> Result<Self> {
        let cwd = env::current_dir().context("Failed to determine the current directory")?;
        let mut loader = ConfigLoader::new(cwd);
        if let Some(path) = cli_config_path {
            loader = loader.with_config_file(path);
        }
        loader.load()
    }

    /// Render the resolved configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawDevServer {
    #[serde(alias = "content_base", alias = "static")]
    pub static_content_root: Option<PathBuf>,
    #[serde(alias = "history_api_fallback")]
    pub history_fallback_enabled: Option<bool>,
    pub port: Option<u16>,
    pub host: Option<String>,
}

impl Combine for RawDevServer {
    fn combine(self, other: Self) -> Self {
        Self {
            static_content_root: self.static_content_root.combine(other.static_content_root),
            history_fallback_enabled: self
                .history_fallback_enabled
                .combine(other.history_fallback_enabled),
            port: self.port.combine(other.port),
            host: self.host.combine(other.host),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawOutput {
    #[serde(alias = "filename")]
    pub bundle_filename: Option<String>,
    #[serde(alias = "path")]
    pub output_directory: Option<PathBuf>,
    pub clean: Option<bool>,
}

impl Combine for RawOutput {
    fn combine(self, other: Self) -> Self {
        Self {
            bundle_filename: self.bundle_filename.combine(other.bundle_filename),
            output_directory: self.output_directory.combine(other.output_directory),
            clean: self.clean.combine(other.clean),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawResolve {
    pub extensions: Option<Vec<String>>,
}

impl Combine for RawResolve {
    fn combine(self, other: Self) -> Self {
        Self {
            extensions: self.extensions.combine(other.extensions),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawHtml {
    pub filename: Option<String>,
    pub title: Option<String>,
}

impl Combine for Option<RawHtml> {
    fn combine(self, other: Self) -> Self {
        match (self, other) {
            (Some(a), Some(b)) => Some(RawHtml {
                filename: a.filename.combine(b.filename),
                title: a.title.combine(b.title),
            }),
            (a, b) => a.or(b),
        }
    }
}

/// One partially specified configuration layer, as read from a file, the environment or
/// the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawConfig {
    pub context: Option<PathBuf>,
    pub mode: Option<Mode>,
    #[serde(alias = "entry")]
    pub entry_point: Option<PathBuf>,
    #[serde(alias = "rules")]
    pub module_rules: Option<Vec<ModuleRule>>,
    pub resolve: RawResolve,
    pub externals: Option<IndexMap<String, String>>,
    pub loaders: Option<IndexMap<String, CommandLoaderConfig>>,
    pub output: RawOutput,
    pub html: Option<RawHtml>,
    #[serde(alias = "devServer")]
    pub dev_server: RawDevServer,
}

impl Combine for RawConfig {
    fn combine(self, other: Self) -> Self {
        Self {
            context: self.context.combine(other.context),
            mode: self.mode.combine(other.mode),
            entry_point: self.entry_point.combine(other.entry_point),
            module_rules: self.module_rules.combine(other.module_rules),
            resolve: self.resolve.combine(other.resolve),
            externals: self.externals.combine(other.externals),
            loaders: self.loaders.combine(other.loaders),
            output: self.output.combine(other.output),
            html: self.html.combine(other.html),
            dev_server: self.dev_server.combine(other.dev_server),
        }
    }
}

impl RawConfig {
    /// Parse a layer from TOML source without touching its paths
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(Into::into)
    }

    /// Load a single config file and resolve its relative paths against the file's directory
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = std::path::absolute(path.as_ref())
            .with_context(|| format!("Failed to resolve config path: {:?}", path.as_ref()))?;
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut layer = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        let base = path.parent().unwrap_or(Path::new("/"));
        layer.rebase(base);
        Ok(layer)
    }

    /// Resolve every relative path of this layer against `base`
    pub fn rebase(&mut self, base: &Path) {
        for path in [
            &mut self.context,
            &mut self.entry_point,
            &mut self.output.output_directory,
            &mut self.dev_server.static_content_root,
        ]
        .into_iter()
        .flatten()
        {
            *path = rebase(base, path);
        }
    }

    /// Apply defaults and validate, producing the final configuration.
    ///
    /// `default_context` is used when no layer sets `context` explicitly. Paths still
    /// relative at this point are resolved against the context.
    pub fn finalize(self, default_context: &Path) -> Result<BundlerConfiguration> {
        let context = normalize_path(&self.context.unwrap_or_else(|| default_context.to_owned()));
        let resolve_path = |value: Option<PathBuf>, default: &str| {
            rebase(&context, &value.unwrap_or_else(|| PathBuf::from(default)))
        };

        let module_rules = self.module_rules.unwrap_or_default();
        for (index, rule) in module_rules.iter().enumerate() {
            validate_rule(rule).with_context(|| format!("Invalid module rule #{}", index + 1))?;
        }

        let extensions = self
            .resolve
            .extensions
            .unwrap_or_else(|| vec![".js".to_owned(), ".json".to_owned()]);
        if let Some(bad) = extensions.iter().find(|ext| !ext.starts_with('.') || ext.len() < 2) {
            bail!("Invalid resolve extension '{bad}': extensions must start with '.'");
        }

        let loaders = self.loaders.unwrap_or_default();
        for (name, loader) in &loaders {
            if loader.command.trim().is_empty() {
                bail!("Loader '{name}' has an empty command");
            }
        }

        let bundle_filename = self
            .output
            .bundle_filename
            .unwrap_or_else(|| DEFAULT_BUNDLE_FILENAME.to_owned());
        validate_asset_filename(&bundle_filename)
            .with_context(|| format!("Invalid output filename '{bundle_filename}'"))?;

        let port = self.dev_server.port.unwrap_or(DEFAULT_PORT);
        if port == 0 {
            bail!("Invalid dev server port 0: the port must be a positive integer");
        }

        let html = match self.html {
            Some(raw) => {
                let filename = raw
                    .filename
                    .unwrap_or_else(|| DEFAULT_HTML_FILENAME.to_owned());
                validate_asset_filename(&filename)
                    .with_context(|| format!("Invalid html filename '{filename}'"))?;
                Some(HtmlConfig {
                    filename,
                    title: raw.title.unwrap_or_else(|| DEFAULT_HTML_TITLE.to_owned()),
                })
            }
            None => None,
        };

        Ok(BundlerConfiguration {
            mode: self.mode.unwrap_or_default(),
            entry_point: resolve_path(self.entry_point, DEFAULT_ENTRY),
            module_rules,
            resolve: ResolveConfig { extensions },
            externals: self.externals.unwrap_or_default(),
            loaders,
            output: OutputConfig {
                bundle_filename,
                output_directory: resolve_path(
                    self.output.output_directory,
                    DEFAULT_OUTPUT_DIRECTORY,
                ),
                clean: self.output.clean.unwrap_or(false),
            },
            html,
            dev_server: DevServerConfig {
                static_content_root: resolve_path(
                    self.dev_server.static_content_root,
                    DEFAULT_STATIC_CONTENT_ROOT,
                ),
                history_fallback_enabled: self.dev_server.history_fallback_enabled.unwrap_or(false),
                port,
                host: self
                    .dev_server
                    .host
                    .unwrap_or_else(|| DEFAULT_HOST.to_owned()),
            },
            context,
        })
    }
}

fn validate_rule(rule: &ModuleRule) -> Result<()> {
    if rule.file_pattern.is_empty() {
        bail!("file_pattern must not be empty");
    }
    if rule.loader_name.trim().is_empty() {
        bail!("loader_name must not be empty");
    }
    Regex::new(&rule.file_pattern)
        .with_context(|| format!("file_pattern '{}' is not a valid pattern", rule.file_pattern))?;
    Ok(())
}

/// Asset names are joined onto the output directory and served at `/<name>`, so they must
/// stay inside it.
fn validate_asset_filename(filename: &str) -> Result<()> {
    if filename.trim().is_empty() {
        bail!("filename must not be empty");
    }
    let path = Path::new(filename);
    if path.is_absolute() || filename.starts_with('/') {
        bail!("filename must be relative to the output directory");
    }
    if path
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        bail!("filename must not contain '.' or '..' segments");
    }
    Ok(())
}

/// Configuration values from environment variables with FERRYPACK_ prefix
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub mode: Option<Mode>,
    pub entry_point: Option<PathBuf>,
    pub output_directory: Option<PathBuf>,
    pub bundle_filename: Option<String>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub static_content_root: Option<PathBuf>,
    pub history_fallback_enabled: Option<bool>,
}

impl EnvConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let mut config = Self::default();

        if let Some(mode) = non_empty("FERRYPACK_MODE") {
            config.mode = Some(Mode::parse(&mode).context("Invalid FERRYPACK_MODE")?);
        }

        config.entry_point = non_empty("FERRYPACK_ENTRY").map(PathBuf::from);
        config.output_directory = non_empty("FERRYPACK_OUTPUT_PATH").map(PathBuf::from);
        config.bundle_filename = non_empty("FERRYPACK_OUTPUT_FILENAME");

        if let Some(port) = non_empty("FERRYPACK_DEV_SERVER_PORT") {
            let port = port
                .trim()
                .parse::<u16>()
                .with_context(|| format!("Invalid FERRYPACK_DEV_SERVER_PORT '{port}'"))?;
            config.port = Some(port);
        }

        config.host = non_empty("FERRYPACK_DEV_SERVER_HOST");
        config.static_content_root = non_empty("FERRYPACK_DEV_SERVER_STATIC").map(PathBuf::from);

        if let Some(value) = non_empty("FERRYPACK_HISTORY_API_FALLBACK") {
            config.history_fallback_enabled = Some(parse_bool(&value).ok_or_else(|| {
                anyhow!("Invalid FERRYPACK_HISTORY_API_FALLBACK '{value}': expected a boolean")
            })?);
        }

        Ok(config)
    }

    /// Turn the environment values into a layer; relative paths resolve against `cwd`
    pub fn into_layer(self, cwd: &Path) -> RawConfig {
        let mut layer = RawConfig {
            mode: self.mode,
            entry_point: self.entry_point,
            output: RawOutput {
                bundle_filename: self.bundle_filename,
                output_directory: self.output_directory,
                clean: None,
            },
            dev_server: RawDevServer {
                static_content_root: self.static_content_root,
                history_fallback_enabled: self.history_fallback_enabled,
                port: self.port,
                host: self.host,
            },
            ..RawConfig::default()
        };
        layer.rebase(cwd);
        layer
    }
}

/// Parse a boolean value from string, supporting various common formats
fn parse_bool(value: &str) -> Option<bool> {
    use cow_utils::CowUtils;
    match value.trim().cow_to_lowercase().as_ref() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Assembles the configuration layers and resolves them into a [`BundlerConfiguration`].
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    cwd: PathBuf,
    config_file: Option<PathBuf>,
    env: Option<EnvConfig>,
    global_configs: bool,
    overrides: Option<RawConfig>,
}

impl ConfigLoader {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            config_file: None,
            env: None,
            global_configs: true,
            overrides: None,
        }
    }

    /// Explicit config file, loaded above the environment layer
    #[must_use]
    pub fn with_config_file(mut self, path: impl AsRef<Path>) -> Self {
        self.config_file = Some(rebase(&self.cwd, path.as_ref()));
        self
    }

    /// Use these environment values instead of reading the process environment
    #[must_use]
    pub fn with_env(mut self, env: EnvConfig) -> Self {
        self.env = Some(env);
        self
    }

    /// Whether the user and system config files take part
    #[must_use]
    pub fn with_global_configs(mut self, enabled: bool) -> Self {
        self.global_configs = enabled;
        self
    }

    /// Highest precedence layer, typically built from CLI flags. Relative paths resolve
    /// against the working directory.
    #[must_use]
    pub fn with_overrides(mut self, overrides: RawConfig) -> Self {
        self.overrides = Some(overrides);
        self
    }

    fn try_load_and_combine(config: &mut RawConfig, path: &Path, context: &str) -> Result<()> {
        if path.exists() {
            log::debug!("Loading {} from: {:?}", context, path);
            let loaded = RawConfig::load_from_file(path)
                .with_context(|| format!("Failed to load {} from {:?}", context, path))?;
            *config = loaded.combine(std::mem::take(config));
        }
        Ok(())
    }

    pub fn load(self) -> Result<BundlerConfiguration> {
        let mut config = RawConfig::default();
        let mut default_context = self.cwd.clone();

        if self.global_configs {
            if let Some(system_config_path) = system_config_file() {
                Self::try_load_and_combine(&mut config, &system_config_path, "system config")?;
            }

            if let Some(user_config_dir) = user_ferrypack_config_dir() {
                let user_config_path = user_config_dir.join(crate::dirs::CONFIG_FILE);
                Self::try_load_and_combine(&mut config, &user_config_path, "user config")?;
            }
        }

        if let Some(project_config_path) = find_project_config(&self.cwd) {
            let is_cli_config = self
                .config_file
                .as_deref()
                .is_some_and(|cli| same_file(cli, &project_config_path));
            if !is_cli_config {
                Self::try_load_and_combine(&mut config, &project_config_path, "project config")?;
                if let Some(parent) = project_config_path.parent() {
                    default_context = parent.to_path_buf();
                }
            }
        }

        let env_config = match self.env {
            Some(env) => env,
            None => EnvConfig::from_env()?,
        };
        config = env_config.into_layer(&self.cwd).combine(config);

        if let Some(cli_config_path) = &self.config_file {
            if !cli_config_path.exists() {
                bail!("Config file not found: {:?}", cli_config_path);
            }
            Self::try_load_and_combine(&mut config, cli_config_path, "CLI config")?;
            if let Some(parent) = cli_config_path.parent() {
                default_context = parent.to_path_buf();
            }
        }

        if let Some(mut overrides) = self.overrides {
            overrides.rebase(&self.cwd);
            config = overrides.combine(config);
        }

        config
            .finalize(&default_context)
            .context("Invalid configuration")
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_mode_parsing() {
        assert_eq!(Mode::parse("development").unwrap(), Mode::Development);
        assert_eq!(Mode::parse("PROD").unwrap(), Mode::Production);
        assert!(Mode::parse("staging").is_err());
        assert_eq!(Mode::default(), Mode::Production);
    }

    #[test]
    fn test_defaults_resolve_against_context() {
        let config = RawConfig::default()
            .finalize(Path::new("/project"))
            .unwrap();

        assert_eq!(config.entry_point, PathBuf::from("/project/src/index.js"));
        assert_eq!(config.output.output_directory, PathBuf::from("/project/dist"));
        assert_eq!(config.output.bundle_filename, "main.js");
        assert_eq!(
            config.dev_server.static_content_root,
            PathBuf::from("/project/public")
        );
        assert_eq!(config.dev_server.port, 8080);
        assert!(!config.dev_server.history_fallback_enabled);
        assert!(config.module_rules.is_empty());
        assert_eq!(config.resolve.extensions, vec![".js", ".json"]);
        assert!(config.html.is_none());
    }

    #[test]
    fn test_webpack_spellings_are_accepted() {
        let layer = RawConfig::from_toml_str(
            r#"
entry = "./TryElmish.fsproj"

[dev_server]
content_base = "./public"
history_api_fallback = true
port = 8080

[[module_rules]]
test = '\.fs(x|proj)?$'
use = "fable-loader"

[output]
filename = "bundle.js"
path = "./public"
"#,
        )
        .unwrap();

        assert_eq!(layer.entry_point, Some(PathBuf::from("./TryElmish.fsproj")));
        assert_eq!(layer.dev_server.history_fallback_enabled, Some(true));
        assert_eq!(
            layer.module_rules,
            Some(vec![ModuleRule {
                file_pattern: r"\.fs(x|proj)?$".to_owned(),
                loader_name: "fable-loader".to_owned(),
            }])
        );
        assert_eq!(layer.output.bundle_filename.as_deref(), Some("bundle.js"));
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let err = RawConfig::from_toml_str("entrypoint = \"./a.js\"").unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn test_port_zero_is_rejected() {
        let layer = RawConfig::from_toml_str("[dev_server]\nport = 0").unwrap();
        let err = layer.finalize(Path::new("/project")).unwrap_err();
        assert!(err.to_string().contains("positive integer"));
    }

    #[test]
    fn test_port_out_of_range_is_a_parse_error() {
        assert!(RawConfig::from_toml_str("[dev_server]\nport = 70000").is_err());
        assert!(RawConfig::from_toml_str("[dev_server]\nport = -1").is_err());
    }

    #[test]
    fn test_invalid_rules_are_rejected() {
        let cases = [
            (r#"[[module_rules]]
test = ""
use = "x""#, "file_pattern must not be empty"),
            (r#"[[module_rules]]
test = '\.js$'
use = " ""#, "loader_name must not be empty"),
            (r#"[[module_rules]]
test = '(unclosed'
use = "x""#, "not a valid pattern"),
        ];

        for (source, expected) in cases {
            let err = RawConfig::from_toml_str(source)
                .unwrap()
                .finalize(Path::new("/project"))
                .unwrap_err();
            assert!(
                format!("{err:#}").contains(expected),
                "expected '{expected}' in '{err:#}'"
            );
        }
    }

    #[test]
    fn test_output_filename_must_stay_in_output_directory() {
        for filename in ["", "/abs.js", "../escape.js", "js/../../x.js"] {
            let layer = RawConfig {
                output: RawOutput {
                    bundle_filename: Some(filename.to_owned()),
                    ..RawOutput::default()
                },
                ..RawConfig::default()
            };
            assert!(
                layer.finalize(Path::new("/project")).is_err(),
                "{filename:?} should be rejected"
            );
        }

        let nested = RawConfig {
            output: RawOutput {
                bundle_filename: Some("js/[name].[contenthash:8].js".to_owned()),
                ..RawOutput::default()
            },
            ..RawConfig::default()
        };
        assert!(nested.finalize(Path::new("/project")).is_ok());
    }

    #[test]
    fn test_combine_prefers_higher_layer_and_appends_rules() {
        let high = RawConfig::from_toml_str(
            r#"
mode = "development"
[[module_rules]]
test = '\.fs$'
use = "fable-loader"
"#,
        )
        .unwrap();
        let low = RawConfig::from_toml_str(
            r#"
mode = "production"
[dev_server]
port = 3000
[[module_rules]]
test = '\.txt$'
use = "raw-loader"
"#,
        )
        .unwrap();

        let merged = high.combine(low);
        assert_eq!(merged.mode, Some(Mode::Development));
        assert_eq!(merged.dev_server.port, Some(3000));
        let loaders: Vec<_> = merged
            .module_rules
            .unwrap()
            .into_iter()
            .map(|rule| rule.loader_name)
            .collect();
        assert_eq!(loaders, vec!["fable-loader", "raw-loader"]);
    }

    #[test]
    fn test_env_config_parsing() {
        let vars = [
            ("FERRYPACK_MODE", "development"),
            ("FERRYPACK_DEV_SERVER_PORT", "9000"),
            ("FERRYPACK_HISTORY_API_FALLBACK", "yes"),
            ("FERRYPACK_OUTPUT_PATH", "build"),
            ("FERRYPACK_ENTRY", ""),
        ];
        let lookup = |key: &str| {
            vars.iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| (*value).to_owned())
        };

        let env = EnvConfig::from_lookup(lookup).unwrap();
        assert_eq!(env.mode, Some(Mode::Development));
        assert_eq!(env.port, Some(9000));
        assert_eq!(env.history_fallback_enabled, Some(true));
        assert_eq!(env.entry_point, None);

        let layer = env.into_layer(Path::new("/work"));
        assert_eq!(
            layer.output.output_directory,
            Some(PathBuf::from("/work/build"))
        );
    }

    #[test]
    fn test_env_config_rejects_bad_values() {
        let bad_port = |key: &str| (key == "FERRYPACK_DEV_SERVER_PORT").then(|| "http".to_owned());
        assert!(EnvConfig::from_lookup(bad_port).is_err());

        let bad_bool =
            |key: &str| (key == "FERRYPACK_HISTORY_API_FALLBACK").then(|| "maybe".to_owned());
        assert!(EnvConfig::from_lookup(bad_bool).is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool(" 0 "), Some(false));
        assert_eq!(parse_bool("sure"), None);
    }
}
