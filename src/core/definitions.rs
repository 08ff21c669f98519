//! Loader for ability, adversary, planner and fact-source definitions.

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::core::ability::{Ability, Adversary, FactSource, PlannerDefinition};
use crate::error::{Error, Result};

/// Shape of one definitions file. Every table is optional.
#[derive(Debug, Default, Deserialize)]
struct DefinitionFile {
    #[serde(default)]
    ability: Vec<Ability>,
    #[serde(default)]
    adversary: Vec<Adversary>,
    #[serde(default)]
    planner: Vec<PlannerDefinition>,
    #[serde(default)]
    source: Vec<FactSource>,
}

/// Immutable catalog of everything operations are built from.
#[derive(Debug, Default, Clone)]
pub struct Definitions {
    abilities: HashMap<String, Arc<Ability>>,
    adversaries: HashMap<String, Arc<Adversary>>,
    planners: HashMap<String, Arc<PlannerDefinition>>,
    sources: HashMap<String, Arc<FactSource>>,
}

impl Definitions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.toml` file in `dir`, in file-name order.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut paths: Vec<_> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        paths.sort();

        let mut defs = Self::new();
        for path in &paths {
            debug!("Loading definitions from {}", path.display());
            defs.add_toml(&fs::read_to_string(path)?)?;
        }
        defs.validate()?;
        info!(
            "Loaded {} abilities, {} adversaries, {} planners, {} sources from {}",
            defs.abilities.len(),
            defs.adversaries.len(),
            defs.planners.len(),
            defs.sources.len(),
            dir.display()
        );
        Ok(defs)
    }

    /// Parse one definitions document and add its contents.
    pub fn add_toml(&mut self, contents: &str) -> Result<()> {
        let file: DefinitionFile = toml::from_str(contents)?;
        for ability in file.ability {
            self.add_ability(ability)?;
        }
        for adversary in file.adversary {
            self.add_adversary(adversary)?;
        }
        for planner in file.planner {
            self.add_planner(planner)?;
        }
        for source in file.source {
            self.add_source(source)?;
        }
        Ok(())
    }

    pub fn add_ability(&mut self, ability: Ability) -> Result<()> {
        if ability.executors.is_empty() {
            return Err(Error::InvalidDefinition(format!(
                "ability {} has no executors",
                ability.id
            )));
        }
        insert_unique(&mut self.abilities, "ability", ability.id.clone(), ability)
    }

    pub fn add_adversary(&mut self, adversary: Adversary) -> Result<()> {
        insert_unique(&mut self.adversaries, "adversary", adversary.id.clone(), adversary)
    }

    pub fn add_planner(&mut self, planner: PlannerDefinition) -> Result<()> {
        insert_unique(&mut self.planners, "planner", planner.id.clone(), planner)
    }

    pub fn add_source(&mut self, source: FactSource) -> Result<()> {
        insert_unique(&mut self.sources, "source", source.id.clone(), source)
    }

    /// Check cross references once everything is loaded.
    pub fn validate(&self) -> Result<()> {
        for adversary in self.adversaries.values() {
            for ability_id in &adversary.atomic_ordering {
                if !self.abilities.contains_key(ability_id) {
                    return Err(Error::InvalidDefinition(format!(
                        "adversary {} references unknown ability {}",
                        adversary.id, ability_id
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn ability(&self, id: &str) -> Option<Arc<Ability>> {
        self.abilities.get(id).cloned()
    }

    pub fn adversary(&self, id: &str) -> Result<Arc<Adversary>> {
        self.adversaries
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownAdversary(id.to_string()))
    }

    pub fn planner(&self, id: &str) -> Result<Arc<PlannerDefinition>> {
        self.planners
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownPlanner(id.to_string()))
    }

    pub fn source(&self, id: &str) -> Result<Arc<FactSource>> {
        self.sources
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownSource(id.to_string()))
    }

    /// Abilities of an adversary, in its atomic ordering.
    pub fn abilities_for(&self, adversary: &Adversary) -> Vec<Arc<Ability>> {
        adversary
            .atomic_ordering
            .iter()
            .filter_map(|id| self.ability(id))
            .collect()
    }

    pub fn counts(&self) -> (usize, usize, usize, usize) {
        (
            self.abilities.len(),
            self.adversaries.len(),
            self.planners.len(),
            self.sources.len(),
        )
    }
}

fn insert_unique<T>(
    map: &mut HashMap<String, Arc<T>>,
    kind: &str,
    id: String,
    value: T,
) -> Result<()> {
    if map.contains_key(&id) {
        return Err(Error::InvalidDefinition(format!("duplicate {} id {}", kind, id)));
    }
    map.insert(id, Arc::new(value));
    Ok(())
}
