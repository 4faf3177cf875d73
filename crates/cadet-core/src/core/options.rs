//! Bullet lists rewritten as numbered options.
//!
//! `render` turns every bullet line of an assistant reply into `**n.** text`
//! and returns the number → text table so the next input can be a bare number.

use std::sync::LazyLock;

use regex::Regex;

static BULLET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\s*)[•\-\*]\s+(.+)$").expect("bullet pattern is valid"));

/// Number → option text, in display order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionMap {
    entries: Vec<(String, String)>,
}

impl OptionMap {
    /// Numbers `options` from 1 in iteration order.
    pub fn from_options<I, S>(options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entries = options
            .into_iter()
            .enumerate()
            .map(|(i, text)| ((i + 1).to_string(), text.into()))
            .collect();
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Output of [`render`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub text: String,
    pub options: OptionMap,
}

/// Rewrites bullet lines as numbered options.
///
/// Lines that do not start (after indentation) with `•`, `-` or `*` plus
/// whitespace pass through untouched. A tip trailer is appended only when
/// at least one option was found.
pub fn render(text: &str) -> Rendered {
    let mut entries = Vec::new();
    let lines: Vec<String> = text
        .split('\n')
        .map(|line| match BULLET.captures(line) {
            Some(caps) => {
                let indent = caps.get(1).map_or("", |m| m.as_str());
                let content = caps.get(2).map_or("", |m| m.as_str()).trim_end();
                let n = entries.len() + 1;
                entries.push((n.to_string(), content.to_string()));
                format!("{indent}**{n}.** {content}")
            }
            None => line.to_string(),
        })
        .collect();

    let mut out = lines.join("\n");
    if !entries.is_empty() {
        out.push_str(&format!(
            "\n\n*Tip: Type a number (1-{}) to select an option*",
            entries.len()
        ));
    }

    Rendered {
        text: out,
        options: OptionMap { entries },
    }
}

/// Maps a bare number back to its option text.
///
/// Anything that is not all ASCII digits, or not a key in `options`,
/// comes back unchanged.
pub fn resolve<'a>(token: &'a str, options: &'a OptionMap) -> &'a str {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return token;
    }
    options.get(token).unwrap_or(token)
}
