//! Facts, the fact store seam, and `#{variable}` substitution.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;
use tokio::sync::RwLock;
use tracing::warn;

use crate::core::ability::ParserDef;
use crate::core::link::{LinkId, OperationId};
use crate::error::Result;

/// Matches `#{name}` placeholders in ability commands.
static VARIABLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#\{([A-Za-z0-9_.\-]+)\}").unwrap());

/// A piece of knowledge produced or consumed by abilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    /// Trait name, e.g. `host.user.name`.
    pub name: String,
    pub value: String,
    #[serde(default = "default_score")]
    pub score: i32,
    #[serde(default)]
    pub link_id: Option<LinkId>,
    #[serde(default = "Utc::now")]
    pub collected_at: DateTime<Utc>,
}

fn default_score() -> i32 {
    1
}

impl Fact {
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            score: default_score(),
            link_id: None,
            collected_at: Utc::now(),
        }
    }

    pub fn from_link(name: &str, value: &str, link_id: LinkId) -> Self {
        Self {
            link_id: Some(link_id),
            ..Self::new(name, value)
        }
    }

    /// Same trait and value, regardless of provenance.
    pub fn same_as(&self, other: &Fact) -> bool {
        self.name == other.name && self.value == other.value
    }
}

/// Knowledge store consulted by planners and fed by link results.
#[async_trait]
pub trait FactStore: Send + Sync {
    async fn facts_for(&self, operation: OperationId) -> Result<Vec<Fact>>;

    /// Add facts to an operation. Returns how many were new.
    async fn merge(&self, operation: OperationId, facts: Vec<Fact>) -> Result<usize>;
}

/// Process-local fact store, deduplicating by trait and value.
#[derive(Default)]
pub struct InMemoryFactStore {
    facts: RwLock<HashMap<OperationId, Vec<Fact>>>,
}

impl InMemoryFactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FactStore for InMemoryFactStore {
    async fn facts_for(&self, operation: OperationId) -> Result<Vec<Fact>> {
        Ok(self
            .facts
            .read()
            .await
            .get(&operation)
            .cloned()
            .unwrap_or_default())
    }

    async fn merge(&self, operation: OperationId, facts: Vec<Fact>) -> Result<usize> {
        let mut all = self.facts.write().await;
        let known = all.entry(operation).or_default();
        let mut added = 0;
        for fact in facts {
            if !known.iter().any(|k| k.same_as(&fact)) {
                known.push(fact);
                added += 1;
            }
        }
        Ok(added)
    }
}

/// A command with every placeholder filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub command: String,
    pub facts: Vec<Fact>,
}

/// Placeholder names in order of first appearance.
pub fn variables(command: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for cap in VARIABLE_RE.captures_iter(command) {
        let name = cap[1].to_string();
        if !seen.contains(&name) {
            seen.push(name);
        }
    }
    seen
}

/// Fill every placeholder of `template` in one pass. Inserted values are
/// never scanned again, so a value containing `#{...}` stays literal.
fn render(
    template: &str,
    globals: &BTreeMap<String, String>,
    assigned: &[(&str, &Fact)],
) -> String {
    VARIABLE_RE
        .replace_all(template, |cap: &regex::Captures<'_>| {
            let name = &cap[1];
            if let Some(value) = globals.get(name) {
                return value.clone();
            }
            assigned
                .iter()
                .find(|(assigned_name, _)| *assigned_name == name)
                .map_or_else(|| cap[0].to_string(), |(_, fact)| fact.value.clone())
        })
        .into_owned()
}

/// Expand `command` into one binding per combination of fact values.
///
/// Globals fill their placeholders directly. Each other placeholder draws
/// its values from `facts`, highest score first, then lexically. A
/// placeholder with no value yields no bindings at all. Output order is
/// deterministic and capped at `max`.
pub fn bind(
    command: &str,
    globals: &BTreeMap<String, String>,
    facts: &[Fact],
    max: usize,
) -> Vec<Binding> {
    let names: Vec<String> = variables(command)
        .into_iter()
        .filter(|name| !globals.contains_key(name))
        .collect();
    let mut choices: Vec<Vec<&Fact>> = Vec::with_capacity(names.len());
    for name in &names {
        let mut values: Vec<&Fact> = Vec::new();
        for fact in facts.iter().filter(|f| &f.name == name) {
            if !values.iter().any(|v| v.value == fact.value) {
                values.push(fact);
            }
        }
        if values.is_empty() {
            return Vec::new();
        }
        values.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.value.cmp(&b.value)));
        choices.push(values);
    }

    let mut combinations: Vec<Vec<&Fact>> = vec![Vec::new()];
    for values in &choices {
        let mut next = Vec::new();
        'outer: for partial in &combinations {
            for fact in values {
                if next.len() >= max {
                    break 'outer;
                }
                let mut extended = partial.clone();
                extended.push(*fact);
                next.push(extended);
            }
        }
        combinations = next;
    }
    combinations.truncate(max);

    combinations
        .into_iter()
        .map(|used| {
            let assigned: Vec<(&str, &Fact)> =
                names.iter().map(String::as_str).zip(used.iter().copied()).collect();
            Binding {
                command: render(command, globals, &assigned),
                facts: used.into_iter().cloned().collect(),
            }
        })
        .collect()
}

/// Extract facts from link output using an ability's parsers.
pub fn parse_output(parsers: &[ParserDef], output: &str, link_id: LinkId) -> Vec<Fact> {
    let mut found: Vec<Fact> = Vec::new();
    for parser in parsers {
        let re = match Regex::new(&parser.pattern) {
            Ok(re) => re,
            Err(e) => {
                warn!("Skipping parser for {}: invalid pattern: {}", parser.source, e);
                continue;
            }
        };
        for cap in re.captures_iter(output) {
            let value = cap
                .get(1)
                .or_else(|| cap.get(0))
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default();
            if value.is_empty() {
                continue;
            }
            let fact = Fact::from_link(&parser.source, &value, link_id);
            if !found.iter().any(|f| f.same_as(&fact)) {
                found.push(fact);
            }
        }
    }
    found
}
