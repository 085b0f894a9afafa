use anyhow::{Context, Result};
use regex::Regex;
use std::path::Path;

use crate::config::ModuleRule;
use crate::util::to_slash;

/// Loader used for `.js`, `.mjs` and `.cjs` files that no rule claims
pub const JS_LOADER: &str = "js-loader";
/// Loader used for `.json` files that no rule claims
pub const JSON_LOADER: &str = "json-loader";

#[derive(Debug, Clone)]
struct CompiledRule {
    pattern: Regex,
    loader_name: String,
}

/// Compiled view of `module_rules`.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    pub fn compile(rules: &[ModuleRule]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|rule| {
                let pattern = Regex::new(&rule.file_pattern).with_context(|| {
                    format!("file_pattern '{}' is not a valid pattern", rule.file_pattern)
                })?;
                Ok(CompiledRule {
                    pattern,
                    loader_name: rule.loader_name.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Loader names referenced by the rules, in declaration order
    pub fn loader_names(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|rule| rule.loader_name.as_str())
    }

    /// Loaders to run for `path`, in execution order.
    ///
    /// Every matching rule contributes its loader. The chain runs from the last matching rule
    /// to the first. When nothing matches, JavaScript and JSON files get their built-in
    /// loader; any other file yields an empty chain.
    pub fn loaders_for(&self, path: &Path) -> Vec<&str> {
        let subject = to_slash(path);
        let mut chain: Vec<&str> = self
            .rules
            .iter()
            .filter(|rule| rule.pattern.is_match(&subject))
            .map(|rule| rule.loader_name.as_str())
            .collect();

        if chain.is_empty() {
            if let Some(builtin) = builtin_loader_for(path) {
                chain.push(builtin);
            }
        }

        chain.reverse();
        chain
    }
}

fn builtin_loader_for(path: &Path) -> Option<&'static str> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("js" | "mjs" | "cjs") => Some(JS_LOADER),
        Some("json") => Some(JSON_LOADER),
        _ => None,
    }
}
