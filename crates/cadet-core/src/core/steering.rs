//! Action-intent steering.
//!
//! When the user clearly asks for an action (push, upload, ...) the model is
//! nudged with an extra directive on the trailing human message. The model
//! can still answer in text; this only changes what it is shown.

/// Directive appended when an action keyword is found.
pub const TOOL_DIRECTIVE: &str =
    "\n\n[SYSTEM: You MUST call the appropriate tool NOW. Do not respond with text.]";

pub const DEFAULT_KEYWORDS: &[&str] = &["push", "upload", "github", "repo"];

/// Maps the last human utterance to an optional suffix for it.
pub trait SteeringPolicy: Send + Sync {
    fn steer(&self, last_human: &str) -> Option<String>;
}

/// Substring match against a small vocabulary, case-insensitive.
#[derive(Debug, Clone)]
pub struct KeywordSteering {
    keywords: Vec<String>,
    directive: String,
}

impl KeywordSteering {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            directive: TOOL_DIRECTIVE.to_string(),
        }
    }

    #[must_use]
    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directive = directive.into();
        self
    }
}

impl Default for KeywordSteering {
    fn default() -> Self {
        Self::new(DEFAULT_KEYWORDS)
    }
}

impl SteeringPolicy for KeywordSteering {
    fn steer(&self, last_human: &str) -> Option<String> {
        let lowered = last_human.to_lowercase();
        self.keywords
            .iter()
            .any(|k| lowered.contains(k.as_str()))
            .then(|| self.directive.clone())
    }
}

/// Never steers.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSteering;

impl SteeringPolicy for NoSteering {
    fn steer(&self, _last_human: &str) -> Option<String> {
        None
    }
}
