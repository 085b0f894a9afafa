use anyhow::{Result, bail};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::fmt::Write;
use std::path::Path;

use crate::config::{HtmlConfig, Mode};
use crate::graph::{ModuleGraph, ModuleKind};
use crate::scanner::RUNTIME_REQUIRE;
use crate::util::display_relative;

/// Name of the single chunk an entry produces, substituted for `[name]`
pub const ENTRY_CHUNK_NAME: &str = "main";

const DEFAULT_HASH_LENGTH: usize = 20;

static CONTENTHASH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[contenthash(?::(\d+))?\]").expect("Invalid regex pattern for [contenthash]")
});

/// Renders a module graph into a single self-executing script
#[derive(Debug, Clone, Copy)]
pub struct BundleEmitter<'a> {
    mode: Mode,
    context: &'a Path,
}

impl<'a> BundleEmitter<'a> {
    pub fn new(mode: Mode, context: &'a Path) -> Self {
        Self { mode, context }
    }

    pub fn render(&self, graph: &ModuleGraph) -> String {
        let mut out = String::new();
        out.push_str(&runtime_prelude());

        for module in graph.modules() {
            if self.mode.is_development() {
                let label = match &module.kind {
                    ModuleKind::Source { path, .. } => display_relative(self.context, path),
                    ModuleKind::External { request, .. } => format!("external \"{request}\""),
                };
                let _ = writeln!(out, "/* {} */", label.replace("*/", "*\\/"));
            }
            let _ = writeln!(
                out,
                "function (module, exports, {RUNTIME_REQUIRE}) {{"
            );
            out.push_str(&module.code);
            if !module.code.ends_with('\n') {
                out.push('\n');
            }
            out.push_str("},\n");
        }

        out.push_str("]);\n");
        out
    }
}

fn runtime_prelude() -> String {
    format!(
        r#"(function (modules) {{
  var cache = {{}};
  function {RUNTIME_REQUIRE}(id) {{
    var cached = cache[id];
    if (cached !== undefined) {{
      return cached.exports;
    }}
    var module = (cache[id] = {{ id: id, exports: {{}} }});
    modules[id].call(module.exports, module, module.exports, {RUNTIME_REQUIRE});
    return module.exports;
  }}
  return {RUNTIME_REQUIRE}(0);
}})([
"#
    )
}

/// Hex SHA-256 of `content`
pub fn content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Substitute `[name]` and `[contenthash]` / `[contenthash:N]` in a filename template
pub fn render_filename(template: &str, name: &str, content: &[u8]) -> Result<String> {
    let with_name = template.replace("[name]", name);
    if !CONTENTHASH_PATTERN.is_match(&with_name) {
        return Ok(with_name);
    }

    let hash = content_hash(content);
    let mut error = None;
    let rendered = CONTENTHASH_PATTERN.replace_all(&with_name, |captures: &regex::Captures<'_>| {
        let length = match captures.get(1) {
            Some(digits) => digits.as_str().parse::<usize>().unwrap_or(0),
            None => DEFAULT_HASH_LENGTH,
        };
        if length == 0 || length > hash.len() {
            error = Some(captures[0].to_owned());
            return String::new();
        }
        hash[..length].to_owned()
    });

    if let Some(placeholder) = error {
        bail!(
            "Invalid placeholder {placeholder} in '{template}': \
             hash length must be between 1 and {}",
            hash.len()
        );
    }
    Ok(rendered.into_owned())
}

/// HTML document loading the bundle
pub fn render_html(html: &HtmlConfig, bundle_filename: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
  <head>
    <meta charset="utf-8">
    <title>{}</title>
  </head>
  <body>
    <script src="{}"></script>
  </body>
</html>
"#,
        escape_html(&html.title),
        escape_html(bundle_filename)
    )
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ModuleKey;
    use std::path::PathBuf;

    #[test]
    fn test_render_filename_placeholders() {
        let hash = content_hash(b"bundle");
        assert_eq!(render_filename("bundle.js", "main", b"x").unwrap(), "bundle.js");
        assert_eq!(render_filename("[name].js", "main", b"x").unwrap(), "main.js");
        assert_eq!(
            render_filename("[name].[contenthash].js", "main", b"bundle").unwrap(),
            format!("main.{}.js", &hash[..20])
        );
        assert_eq!(
            render_filename("[contenthash:8].js", "main", b"bundle").unwrap(),
            format!("{}.js", &hash[..8])
        );
        assert!(render_filename("[contenthash:0].js", "main", b"bundle").is_err());
        assert!(render_filename("[contenthash:99].js", "main", b"bundle").is_err());
    }

    #[test]
    fn test_content_hash_is_sha256() {
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_render_html_escapes() {
        let html = HtmlConfig {
            filename: "index.html".to_owned(),
            title: "Tom & <Jerry>".to_owned(),
        };
        let page = render_html(&html, "bundle.js");
        assert!(page.contains("<title>Tom &amp; &lt;Jerry&gt;</title>"));
        assert!(page.contains(r#"<script src="bundle.js"></script>"#));
    }

    #[test]
    fn test_development_bundle_labels_modules() {
        let mut graph = ModuleGraph::new();
        let path = PathBuf::from("/app/Entry.src");
        let (id, _) = graph.intern(ModuleKey::File(path.clone()), || ModuleKind::Source {
            path,
            loaders: vec!["custom-loader".to_owned()],
        });
        graph.set_code(id, "module.exports = 42;".to_owned());

        let dev = BundleEmitter::new(Mode::Development, Path::new("/app")).render(&graph);
        insta::assert_snapshot!(dev, @r#"
        (function (modules) {
          var cache = {};
          function __ferrypack_require__(id) {
            var cached = cache[id];
            if (cached !== undefined) {
              return cached.exports;
            }
            var module = (cache[id] = { id: id, exports: {} });
            modules[id].call(module.exports, module, module.exports, __ferrypack_require__);
            return module.exports;
          }
          return __ferrypack_require__(0);
        })([
        /* ./Entry.src */
        function (module, exports, __ferrypack_require__) {
        module.exports = 42;
        },
        ]);
        "#);

        let prod = BundleEmitter::new(Mode::Production, Path::new("/app")).render(&graph);
        assert!(!prod.contains("/* ./Entry.src */"));
        assert!(prod.contains("module.exports = 42;\n},\n]);\n"));
    }
}
