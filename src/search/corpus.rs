//! Corpus provider: the entities and text fields that get indexed.
//!
//! An [`Entity`] is a character or an event with text fields grouped by
//! category (`traits`, `relationships`, `accounts`, ...). Within a category,
//! fields are ordered `(field_key, text)` pairs; that order is the indexing
//! order.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::canonicalize::field_text;
use super::scope::Scope;
use crate::error::{SearchError, SearchResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Character,
    Event,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Character => "character",
            Self::Event => "event",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub kind: EntityKind,
    /// category → ordered `(field_key, text)` pairs
    #[serde(default)]
    pub fields: BTreeMap<String, Vec<(String, String)>>,
}

impl Entity {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            fields: BTreeMap::new(),
        }
    }

    pub fn character(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Character, id)
    }

    pub fn event(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Event, id)
    }

    /// Append a field instance.
    pub fn with_field(
        mut self,
        category: impl Into<String>,
        key: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        self.fields
            .entry(category.into().trim().to_lowercase())
            .or_default()
            .push((key.into(), text.into()));
        self
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// `(category, field_key, text)` for every field in `scope`, categories
    /// in sorted order, fields in insertion order.
    pub fn fields_in<'a>(
        &'a self,
        scope: &'a Scope,
    ) -> impl Iterator<Item = (&'a str, &'a str, &'a str)> {
        self.fields
            .iter()
            .filter(|(category, _)| scope.contains(category))
            .flat_map(|(category, pairs)| {
                pairs
                    .iter()
                    .map(move |(key, text)| (category.as_str(), key.as_str(), text.as_str()))
            })
    }

    /// All in-scope fields joined into one profile text.
    pub fn profile_text(&self, scope: &Scope) -> String {
        self.fields_in(scope)
            .map(|(_, key, text)| field_text(key, text))
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Copy restricted to the categories in `scope`.
    pub fn restricted_to(&self, scope: &Scope) -> Self {
        Self {
            id: self.id.clone(),
            kind: self.kind,
            fields: self
                .fields
                .iter()
                .filter(|(category, _)| scope.contains(category))
                .map(|(category, pairs)| (category.clone(), pairs.clone()))
                .collect(),
        }
    }
}

/// Source of entities to index.
pub trait CorpusProvider: Send + Sync {
    /// Every field category this provider can contribute.
    fn categories(&self) -> Vec<String>;

    /// Entities with at least one field in `scope`, fields restricted to it.
    fn list_entities(&self, scope: &Scope) -> SearchResult<Vec<Entity>>;

    /// One entity with all of its fields, or [`SearchError::NotFound`].
    fn get_entity(&self, kind: EntityKind, id: &str) -> SearchResult<Entity>;
}

/// Corpus held in memory, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCorpus {
    entities: Vec<Entity>,
    declared: BTreeSet<String>,
}

#[derive(Deserialize)]
struct CorpusDocument {
    #[serde(default)]
    categories: Vec<String>,
    #[serde(default)]
    characters: Vec<EntityDocument>,
    #[serde(default)]
    events: Vec<EntityDocument>,
}

#[derive(Deserialize)]
struct EntityDocument {
    id: String,
    #[serde(default)]
    fields: BTreeMap<String, Vec<(String, String)>>,
}

impl InMemoryCorpus {
    pub fn new(entities: Vec<Entity>) -> Self {
        Self {
            entities,
            declared: BTreeSet::new(),
        }
    }

    /// Declare categories that exist even when no entity uses them yet.
    pub fn with_categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.declared
            .extend(categories.into_iter().map(|c| c.as_ref().trim().to_lowercase()));
        self
    }

    /// Parse `{categories?, characters: [...], events: [...]}`, each entity
    /// being `{id, fields: {category: [[key, text], ...]}}`.
    pub fn from_json(raw: &str) -> SearchResult<Self> {
        let doc: CorpusDocument = serde_json::from_str(raw)
            .map_err(|err| SearchError::Corpus(format!("invalid corpus document: {err}")))?;

        let mut entities = Vec::with_capacity(doc.characters.len() + doc.events.len());
        for (kind, docs) in [
            (EntityKind::Character, doc.characters),
            (EntityKind::Event, doc.events),
        ] {
            for entity in docs {
                if entity.id.trim().is_empty() {
                    return Err(SearchError::InvalidKey(format!("{kind} with empty id")));
                }
                let mut built = Entity::new(kind, entity.id);
                for (category, pairs) in entity.fields {
                    for (key, text) in pairs {
                        built = built.with_field(category.as_str(), key, text);
                    }
                }
                entities.push(built);
            }
        }
        Ok(Self::new(entities).with_categories(doc.categories))
    }

    pub fn from_json_file(path: &Path) -> SearchResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| SearchError::Corpus(format!("read {}: {err}", path.display())))?;
        Self::from_json(&raw)
    }

    pub fn push(&mut self, entity: Entity) {
        self.entities.push(entity);
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl CorpusProvider for InMemoryCorpus {
    fn categories(&self) -> Vec<String> {
        let mut all = self.declared.clone();
        for entity in &self.entities {
            all.extend(entity.categories().map(str::to_string));
        }
        all.into_iter().collect()
    }

    fn list_entities(&self, scope: &Scope) -> SearchResult<Vec<Entity>> {
        Ok(self
            .entities
            .iter()
            .map(|entity| entity.restricted_to(scope))
            .filter(|entity| !entity.fields.is_empty())
            .collect())
    }

    fn get_entity(&self, kind: EntityKind, id: &str) -> SearchResult<Entity> {
        self.entities
            .iter()
            .find(|entity| entity.kind == kind && entity.id == id)
            .cloned()
            .ok_or_else(|| SearchError::not_found(kind, id))
    }
}
