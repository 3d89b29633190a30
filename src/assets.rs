//! External asset scanning
//!
//! A light per-category pass over the markup string. It does not parse the
//! document; each category has its own pattern and only absolute http(s) or
//! protocol-relative references are counted. `data:` URIs are ignored.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetCategory {
    Stylesheets,
    Scripts,
    Images,
    Fonts,
    Media,
    Frames,
}

impl AssetCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetCategory::Stylesheets => "stylesheets",
            AssetCategory::Scripts => "scripts",
            AssetCategory::Images => "images",
            AssetCategory::Fonts => "fonts",
            AssetCategory::Media => "media",
            AssetCategory::Frames => "frames",
        }
    }
}

const URL: &str = r#"((?:https?:)?//[^"'\s)]+)"#;

static PATTERNS: Lazy<Vec<(AssetCategory, Regex)>> = Lazy::new(|| {
    let build = |pattern: String| Regex::new(&pattern).expect("asset pattern must compile");
    vec![
        (
            AssetCategory::Stylesheets,
            build(format!(
                r#"(?i)<link\b[^>]*rel\s*=\s*["']?stylesheet["']?[^>]*href\s*=\s*["']{URL}"#
            )),
        ),
        (
            AssetCategory::Stylesheets,
            build(format!(r#"(?i)@import\s+(?:url\()?\s*["']?{URL}"#)),
        ),
        (
            AssetCategory::Scripts,
            build(format!(r#"(?i)<script\b[^>]*src\s*=\s*["']{URL}"#)),
        ),
        (
            AssetCategory::Images,
            build(format!(r#"(?i)<img\b[^>]*src\s*=\s*["']{URL}"#)),
        ),
        (
            AssetCategory::Fonts,
            build(
                r#"(?i)url\(\s*["']?((?:https?:)?//[^"'\s)]+\.(?:woff2?|ttf|otf|eot))\b"#
                    .to_string(),
            ),
        ),
        (
            AssetCategory::Media,
            build(format!(r#"(?i)<(?:video|audio|source)\b[^>]*src\s*=\s*["']{URL}"#)),
        ),
        (
            AssetCategory::Frames,
            build(format!(r#"(?i)<iframe\b[^>]*src\s*=\s*["']{URL}"#)),
        ),
    ]
});

static INLINE_SCRIPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<script\b").expect("script pattern must compile"));

#[derive(Debug, Clone, Default, Serialize)]
pub struct AssetReport {
    pub assets: BTreeMap<AssetCategory, Vec<String>>,
}

impl AssetReport {
    pub fn total(&self) -> usize {
        self.assets.values().map(Vec::len).sum()
    }

    pub fn get(&self, category: AssetCategory) -> &[String] {
        self.assets.get(&category).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Per-category counts as a JSON object.
    pub fn counts(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .assets
            .iter()
            .map(|(category, urls)| (category.as_str().to_string(), urls.len().into()))
            .collect();
        serde_json::Value::Object(map)
    }
}

pub fn scan_assets(markup: &str) -> AssetReport {
    let mut report = AssetReport::default();
    for (category, pattern) in PATTERNS.iter() {
        for captures in pattern.captures_iter(markup) {
            if let Some(url) = captures.get(1) {
                let urls = report.assets.entry(*category).or_default();
                let url = url.as_str().to_string();
                if !urls.contains(&url) {
                    urls.push(url);
                }
            }
        }
    }
    report
}

pub fn contains_inline_script(markup: &str) -> bool {
    INLINE_SCRIPT.is_match(markup)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_each_category() {
        let markup = r#"
            <link rel="stylesheet" href="https://cdn.example.com/site.css">
            <style>@import url("https://fonts.example.com/css?family=Inter");
              @font-face { src: url(https://fonts.example.com/inter.woff2) }</style>
            <script src="//cdn.example.com/app.js"></script>
            <img src="https://img.example.com/logo.png" alt="">
            <video src="https://media.example.com/intro.mp4"></video>
            <iframe src="https://embed.example.com/widget"></iframe>
        "#;
        let report = scan_assets(markup);
        assert_eq!(report.get(AssetCategory::Stylesheets).len(), 2);
        assert_eq!(report.get(AssetCategory::Scripts), ["//cdn.example.com/app.js"]);
        assert_eq!(report.get(AssetCategory::Images).len(), 1);
        assert_eq!(report.get(AssetCategory::Fonts).len(), 1);
        assert_eq!(report.get(AssetCategory::Media).len(), 1);
        assert_eq!(report.get(AssetCategory::Frames).len(), 1);
        assert_eq!(report.total(), 7);
    }

    #[test]
    fn ignores_relative_and_data_uris() {
        let markup = r#"<img src="logo.png"><img src="data:image/png;base64,AAAA"><link rel="stylesheet" href="/a.css">"#;
        assert_eq!(scan_assets(markup).total(), 0);
    }

    #[test]
    fn duplicate_references_are_counted_once() {
        let markup = r#"<img src="https://x.test/a.png"><img src="https://x.test/a.png">"#;
        assert_eq!(scan_assets(markup).get(AssetCategory::Images).len(), 1);
    }

    #[test]
    fn detects_inline_scripts() {
        assert!(contains_inline_script("<p>x</p><SCRIPT>alert(1)</SCRIPT>"));
        assert!(!contains_inline_script("<p>description of script tags</p>"));
    }
}
