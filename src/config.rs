use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Largest batch the remote API accepts in one composite call.
pub const MAX_BATCH_SIZE: usize = 50;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub harvest: HarvestConfig,
    #[serde(default)]
    pub index: IndexConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_rate_limit_ms")]
    pub rate_limit_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub access_token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            batch_size: default_batch_size(),
            rate_limit_ms: default_rate_limit_ms(),
            timeout_secs: default_timeout_secs(),
            access_token: None,
        }
    }
}

fn default_base_url() -> String {
    "https://graph.facebook.com/".to_string()
}
fn default_batch_size() -> usize {
    15
}
fn default_rate_limit_ms() -> u64 {
    1000
}
fn default_timeout_secs() -> u64 {
    30
}

/// One relation type to fetch per subject, and the dotted path of the
/// field shown as its preview.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RelationSpec {
    pub relation: String,
    #[serde(default = "default_preview")]
    pub preview: String,
}

impl RelationSpec {
    pub fn new(relation: &str, preview: &str) -> Self {
        Self {
            relation: relation.to_string(),
            preview: preview.to_string(),
        }
    }
}

fn default_preview() -> String {
    "name".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct HarvestConfig {
    #[serde(default = "default_root_subject")]
    pub root_subject: String,
    #[serde(default = "default_root_name")]
    pub root_name: String,
    #[serde(default = "default_connections_relation")]
    pub connections_relation: String,
    #[serde(default = "default_indexable_keys")]
    pub indexable_keys: Vec<String>,
    #[serde(default = "default_relations")]
    pub relations: Vec<RelationSpec>,
    #[serde(default = "default_connection_relations")]
    pub connection_relations: Vec<RelationSpec>,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            root_subject: default_root_subject(),
            root_name: default_root_name(),
            connections_relation: default_connections_relation(),
            indexable_keys: default_indexable_keys(),
            relations: default_relations(),
            connection_relations: default_connection_relations(),
        }
    }
}

impl HarvestConfig {
    /// Preview path configured for a relation, falling back to `name`.
    pub fn preview_path(&self, relation: &str) -> String {
        self.relations
            .iter()
            .chain(self.connection_relations.iter())
            .find(|spec| spec.relation == relation)
            .map(|spec| spec.preview.clone())
            .unwrap_or_else(default_preview)
    }
}

fn default_root_subject() -> String {
    "me".to_string()
}
fn default_root_name() -> String {
    "me".to_string()
}
fn default_connections_relation() -> String {
    "friends".to_string()
}

fn default_indexable_keys() -> Vec<String> {
    [
        "subject_name",
        "preview",
        "name",
        "description",
        "location",
        "category",
        "message",
        "story",
        "type",
        "title",
    ]
    .iter()
    .map(|k| k.to_string())
    .collect()
}

// pokes, notifications and payments are left out: broken pagination or
// permissions the harvester never asks for.
const ROOT_RELATIONS: &[(&str, &str)] = &[
    ("accounts", "name"),
    ("achievements", "achievement.title"),
    ("activities", "name"),
    ("albums", "name"),
    ("apprequests", "application"),
    ("books", "name"),
    ("checkins", "place.name"),
    ("events", "name"),
    ("family", "name"),
    ("friendlists", "name"),
    ("friends", "name"),
    ("games", "name"),
    ("groups", "name"),
    ("inbox", "comments.data.message"),
    ("interests", "name"),
    ("likes", "name"),
    ("links", "name"),
    ("locations", "place.name"),
    ("movies", "name"),
    ("music", "name"),
    ("notes", "subject"),
    ("outbox", "message"),
    ("photos", "picture"),
    ("photos/uploaded", "picture"),
    ("posts", "message"),
    ("questions", "question"),
    ("scores", "application"),
    ("statuses", "message"),
    ("subscribedto", "name"),
    ("subscribers", "name"),
    ("tagged", "name"),
    ("television", "name"),
    ("updates", "message"),
    ("videos", "name"),
];

/// Relations the API refuses for anyone but the token owner.
const OWNER_ONLY_RELATIONS: &[&str] = &["friendlists", "friends", "inbox", "outbox", "updates"];

fn default_relations() -> Vec<RelationSpec> {
    ROOT_RELATIONS
        .iter()
        .map(|(relation, preview)| RelationSpec::new(relation, preview))
        .collect()
}

fn default_connection_relations() -> Vec<RelationSpec> {
    ROOT_RELATIONS
        .iter()
        .filter(|(relation, _)| !OWNER_ONLY_RELATIONS.contains(relation))
        .map(|(relation, preview)| RelationSpec::new(relation, preview))
        .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// FTS5 tokenizer declaration used as the index analyzer.
    #[serde(default = "default_tokenizer")]
    pub tokenizer: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            tokenizer: default_tokenizer(),
        }
    }
}

fn default_tokenizer() -> String {
    "unicode61 remove_diacritics 2".to_string()
}

impl Config {
    /// Config with defaults everywhere and the database at `db_path`.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            api: ApiConfig::default(),
            harvest: HarvestConfig::default(),
            index: IndexConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.api.batch_size == 0 || config.api.batch_size > MAX_BATCH_SIZE {
        anyhow::bail!("api.batch_size must be between 1 and {}", MAX_BATCH_SIZE);
    }

    if config.api.rate_limit_ms == 0 {
        anyhow::bail!("api.rate_limit_ms must be > 0");
    }

    if !config.api.base_url.starts_with("http://") && !config.api.base_url.starts_with("https://")
    {
        anyhow::bail!("api.base_url must be an http(s) URL");
    }

    if config.harvest.indexable_keys.is_empty() {
        anyhow::bail!("harvest.indexable_keys must not be empty");
    }

    if config.harvest.connections_relation.trim().is_empty() {
        anyhow::bail!("harvest.connections_relation must not be empty");
    }

    for spec in config
        .harvest
        .relations
        .iter()
        .chain(config.harvest.connection_relations.iter())
    {
        if spec.relation.trim().is_empty() {
            anyhow::bail!("relation names must not be empty");
        }
        if spec.preview.split('.').any(|segment| segment.is_empty()) {
            anyhow::bail!(
                "invalid preview path '{}' for relation '{}'",
                spec.preview,
                spec.relation
            );
        }
    }

    if config.index.tokenizer.trim().is_empty() {
        anyhow::bail!("index.tokenizer must not be empty");
    }

    Ok(())
}
