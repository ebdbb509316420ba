//! Keyword classification of free-text requests.

use std::sync::LazyLock;

use regex::Regex;
use saga_core::{AgentKind, AgentRequest};

static PLOT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(plots?|story|stories|storyline|outline|narrative|arc)\b").unwrap()
});
static AUTHOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(author|writers?|narrator|voice|writing style)\b").unwrap());
static WORLD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(worlds?|setting|worldbuilding|lore|map|kingdom)\b").unwrap()
});
static CHARACTERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(characters?|protagonists?|heroe?s?|villains?|cast)\b").unwrap()
});
static ENHANCEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(enhance|improve|polish|refine|revise|rewrite|darker|lighter)\w*\b").unwrap()
});

/// Keyword pattern for an agent kind. `Other` has none.
pub fn kind_pattern(kind: AgentKind) -> Option<&'static Regex> {
    match kind {
        AgentKind::Plot => Some(&*PLOT),
        AgentKind::Author => Some(&*AUTHOR),
        AgentKind::World => Some(&*WORLD),
        AgentKind::Characters => Some(&*CHARACTERS),
        AgentKind::Enhancement => Some(&*ENHANCEMENT),
        AgentKind::Other => None,
    }
}

/// Distinct artifact kinds the text mentions, in priority order.
pub fn mentioned_artifacts(text: &str) -> Vec<AgentKind> {
    AgentKind::artifact_kinds()
        .into_iter()
        .filter(|kind| kind_pattern(*kind).is_some_and(|re| re.is_match(text)))
        .collect()
}

/// A request is composite when it names two or more distinct artifact
/// kinds. An explicit `composite` metadata flag wins over the text.
pub fn is_composite(request: &AgentRequest) -> bool {
    if let Some(flag) = request.flag("composite") {
        return flag;
    }
    mentioned_artifacts(&request.raw_text).len() >= 2
}
