// Reasoning-template store: parses fenced-metadata source files, embeds a
// composite description per template, and serves cosine-ranked retrieval.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::InferenceError;
use crate::llm_client::ChatBackend;

/// Stable id of the template returned when nothing clears the similarity
/// floor. Shipped in the default template directory.
pub const FALLBACK_TEMPLATE_ID: &str = "first-principles";
pub const FALLBACK_SCORE: f32 = 0.5;

const BODY_PREFIX_CHARS: usize = 800;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateMeta {
    pub name: String,
    pub domain: Option<String>,
    pub complexity: Option<String>,
    pub methodology: Option<String>,
    pub keywords: Vec<String>,
    pub description: String,
}

/// A retrieval hit handed to the orchestrator and serialized into
/// `rag_completed` events.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TemplateRef {
    pub id: String,
    pub name: String,
    pub score: f32,
    pub description: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub domain: Option<String>,
    pub keywords: Vec<String>,
    pub use_count: u64,
    pub source: String,
}

struct IndexedTemplate {
    meta: TemplateMeta,
    body: String,
    embedding: Vec<f32>,
    source_path: PathBuf,
    use_count: u64,
}

pub struct TemplateStore {
    backend: Arc<dyn ChatBackend>,
    embed_model: String,
    // BTreeMap keeps iteration deterministic, which the ranking tie-break
    // relies on.
    index: RwLock<BTreeMap<String, IndexedTemplate>>,
}

impl TemplateStore {
    pub fn new(backend: Arc<dyn ChatBackend>, embed_model: impl Into<String>) -> Self {
        Self {
            backend,
            embed_model: embed_model.into(),
            index: RwLock::new(BTreeMap::new()),
        }
    }

    /// Scan the given directories, upsert every parseable template, and
    /// replace prior embeddings. Unparseable files are skipped with a
    /// warning; an unreachable embedding backend aborts the reindex.
    pub async fn reindex(&self, dirs: &[PathBuf]) -> Result<usize> {
        let mut fresh: BTreeMap<String, IndexedTemplate> = BTreeMap::new();

        for dir in dirs {
            for path in template_files(dir)? {
                let text = match std::fs::read_to_string(&path) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "skipping unreadable template source");
                        continue;
                    }
                };
                let (meta, body) = match parse_template_source(&text) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "skipping malformed template source");
                        continue;
                    }
                };
                let slug = slugify(&meta.name);
                if fresh.contains_key(&slug) {
                    tracing::warn!(
                        path = %path.display(),
                        slug = %slug,
                        "duplicate template name, keeping first occurrence"
                    );
                    continue;
                }

                let embedding = self
                    .backend
                    .embed(&self.embed_model, &composite_text(&meta, &body))
                    .await
                    .with_context(|| format!("embedding template '{slug}'"))?;

                fresh.insert(
                    slug,
                    IndexedTemplate {
                        meta,
                        body,
                        embedding,
                        source_path: path,
                        use_count: 0,
                    },
                );
            }
        }

        // Use counters survive a reindex of unchanged sources.
        {
            let current = self.index.read().await;
            for (slug, indexed) in fresh.iter_mut() {
                if let Some(existing) = current.get(slug) {
                    indexed.use_count = existing.use_count;
                }
            }
        }

        let count = fresh.len();
        *self.index.write().await = fresh;
        tracing::info!(templates = count, "template index rebuilt");
        Ok(count)
    }

    /// Parse and index a single source file.
    pub async fn add_one(&self, path: &Path) -> Result<String> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading template source {}", path.display()))?;
        let (meta, body) = parse_template_source(&text)
            .with_context(|| format!("parsing template source {}", path.display()))?;
        let slug = slugify(&meta.name);
        let embedding = self
            .backend
            .embed(&self.embed_model, &composite_text(&meta, &body))
            .await
            .with_context(|| format!("embedding template '{slug}'"))?;

        let mut index = self.index.write().await;
        let use_count = index.get(&slug).map(|t| t.use_count).unwrap_or(0);
        index.insert(
            slug.clone(),
            IndexedTemplate {
                meta,
                body,
                embedding,
                source_path: path.to_path_buf(),
                use_count,
            },
        );
        Ok(slug)
    }

    /// Top-k templates by similarity, floor applied first. An empty result
    /// falls back to the designated fallback template when indexed.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        floor: f32,
    ) -> Result<Vec<TemplateRef>, InferenceError> {
        let query_embedding = self.backend.embed(&self.embed_model, query).await?;
        let index = self.index.read().await;

        let mut scored: Vec<(f32, &String, &IndexedTemplate)> = index
            .iter()
            .map(|(id, template)| (similarity(&query_embedding, &template.embedding), id, template))
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.1.cmp(b.1))
        });

        let passing: Vec<TemplateRef> = scored
            .iter()
            .filter(|(score, _, _)| *score >= floor)
            .take(k)
            .map(|(score, id, template)| template_ref(id, template, *score))
            .collect();
        if !passing.is_empty() {
            return Ok(passing);
        }

        if let Some(fallback) = index.get(FALLBACK_TEMPLATE_ID) {
            return Ok(vec![template_ref(
                FALLBACK_TEMPLATE_ID,
                fallback,
                FALLBACK_SCORE,
            )]);
        }
        Ok(Vec::new())
    }

    pub async fn list(&self) -> Vec<TemplateSummary> {
        let index = self.index.read().await;
        index
            .iter()
            .map(|(id, template)| TemplateSummary {
                id: id.clone(),
                name: template.meta.name.clone(),
                description: template.meta.description.clone(),
                domain: template.meta.domain.clone(),
                keywords: template.meta.keywords.clone(),
                use_count: template.use_count,
                source: template.source_path.display().to_string(),
            })
            .collect()
    }

    pub async fn record_use(&self, id: &str) {
        let mut index = self.index.write().await;
        if let Some(template) = index.get_mut(id) {
            template.use_count += 1;
        }
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.len()
    }

    #[cfg(test)]
    async fn source_path(&self, id: &str) -> Option<PathBuf> {
        self.index
            .read()
            .await
            .get(id)
            .map(|t| t.source_path.clone())
    }
}

fn template_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("opening template directory {}", dir.display()))?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && matches!(
                    path.extension().and_then(|ext| ext.to_str()),
                    Some("md") | Some("txt")
                )
        })
        .collect();
    paths.sort();
    Ok(paths)
}

/// Slug of a template name: lowercase, alphanumeric runs joined by `-`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for ch in name.chars() {
        if ch.is_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            for lower in ch.to_lowercase() {
                slug.push(lower);
            }
        } else {
            pending_dash = true;
        }
    }
    slug
}

/// Parse a template source: a `---`-fenced metadata header followed by the
/// body text.
pub(crate) fn parse_template_source(text: &str) -> Result<(TemplateMeta, String)> {
    let mut lines = text.lines();

    loop {
        match lines.next() {
            Some(line) if line.trim().is_empty() => continue,
            Some(line) if line.trim() == "---" => break,
            Some(_) => anyhow::bail!("missing opening metadata fence"),
            None => anyhow::bail!("empty template source"),
        }
    }

    let mut meta = TemplateMeta::default();
    let mut closed = false;
    for line in lines.by_ref() {
        let trimmed = line.trim();
        if trimmed == "---" {
            closed = true;
            break;
        }
        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "name" => meta.name = value.to_string(),
            "domain" => meta.domain = non_empty(value),
            "complexity" => meta.complexity = non_empty(value),
            "methodology" => meta.methodology = non_empty(value),
            "keywords" => {
                meta.keywords = value
                    .split(',')
                    .map(|kw| kw.trim().to_string())
                    .filter(|kw| !kw.is_empty())
                    .collect();
            }
            "description" => meta.description = value.to_string(),
            _ => {}
        }
    }

    if !closed {
        anyhow::bail!("missing closing metadata fence");
    }
    if meta.name.trim().is_empty() {
        anyhow::bail!("metadata header missing 'name'");
    }

    let body = lines.collect::<Vec<_>>().join("\n").trim().to_string();
    Ok((meta, body))
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// The single string handed to the embedding model for one template.
pub(crate) fn composite_text(meta: &TemplateMeta, body: &str) -> String {
    let mut parts: Vec<String> = vec![meta.name.clone()];
    if !meta.description.is_empty() {
        parts.push(meta.description.clone());
    }
    if !meta.keywords.is_empty() {
        parts.push(meta.keywords.join(", "));
    }
    if let Some(domain) = &meta.domain {
        parts.push(domain.clone());
    }
    if let Some(methodology) = &meta.methodology {
        parts.push(methodology.clone());
    }
    let prefix: String = body.chars().take(BODY_PREFIX_CHARS).collect();
    if !prefix.is_empty() {
        parts.push(prefix);
    }
    parts.join("\n")
}

/// Similarity mapped from cosine distance d into [0,1] as `1 - d/2`.
/// Zero-norm vectors carry no signal and score 0.
pub(crate) fn similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let cosine = (dot / (norm_a * norm_b)).clamp(-1.0, 1.0);
    (1.0 + cosine) / 2.0
}

fn template_ref(id: &str, template: &IndexedTemplate, score: f32) -> TemplateRef {
    TemplateRef {
        id: id.to_string(),
        name: template.meta.name.clone(),
        score,
        description: template.meta.description.clone(),
        body: template.body.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::testing::ScriptedBackend;

    fn write_template(dir: &Path, file: &str, name: &str, keywords: &str, body: &str) {
        let text = format!(
            "---\nname: {name}\nkeywords: {keywords}\ndescription: a template about {keywords}\n---\n{body}\n"
        );
        std::fs::write(dir.join(file), text).unwrap();
    }

    fn keyword_backend() -> Arc<ScriptedBackend> {
        // Axis 0 lights up for proofs, axis 1 for systems; anything else
        // is orthogonal to both.
        Arc::new(ScriptedBackend::with_embed_fn(Vec::new(), |text| {
            let text = text.to_ascii_lowercase();
            vec![
                if text.contains("proof") { 1.0 } else { 0.0 },
                if text.contains("systems") { 1.0 } else { 0.0 },
                if text.contains("proof") || text.contains("systems") {
                    0.0
                } else {
                    1.0
                },
            ]
        }))
    }

    #[test]
    fn slugify_joins_alphanumeric_runs() {
        assert_eq!(slugify("First Principles"), "first-principles");
        assert_eq!(slugify("  Socratic -- Method!  "), "socratic-method");
        assert_eq!(slugify("A/B Testing 101"), "a-b-testing-101");
    }

    #[test]
    fn parse_extracts_metadata_and_body() {
        let text = "---\nname: Root Cause Analysis\ndomain: engineering\nkeywords: why, causes\ndescription: dig below symptoms\n---\nAsk why five times.\n";
        let (meta, body) = parse_template_source(text).unwrap();
        assert_eq!(meta.name, "Root Cause Analysis");
        assert_eq!(meta.domain.as_deref(), Some("engineering"));
        assert_eq!(meta.keywords, vec!["why", "causes"]);
        assert_eq!(body, "Ask why five times.");
    }

    #[test]
    fn parse_rejects_missing_fences_and_name() {
        assert!(parse_template_source("no fences here").is_err());
        assert!(parse_template_source("---\nname: x\nno closing fence").is_err());
        assert!(parse_template_source("---\ndescription: anonymous\n---\nbody").is_err());
        assert!(parse_template_source("").is_err());
    }

    #[test]
    fn composite_text_truncates_body_prefix() {
        let meta = TemplateMeta {
            name: "Long".to_string(),
            description: "d".to_string(),
            ..TemplateMeta::default()
        };
        let body = "x".repeat(5000);
        let composite = composite_text(&meta, &body);
        assert!(composite.chars().count() <= "Long\nd\n".len() + BODY_PREFIX_CHARS);
    }

    #[test]
    fn similarity_maps_cosine_into_unit_interval() {
        let a = vec![1.0, 0.0];
        let b = vec![1.0, 0.0];
        let c = vec![0.0, 1.0];
        let d = vec![-1.0, 0.0];
        assert!((similarity(&a, &b) - 1.0).abs() < 1e-6);
        assert!((similarity(&a, &c) - 0.5).abs() < 1e-6);
        assert!(similarity(&a, &d).abs() < 1e-6);
        assert_eq!(similarity(&a, &[0.0, 0.0]), 0.0);
        assert_eq!(similarity(&a, &[1.0, 0.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn reindex_is_idempotent_over_unchanged_sources() {
        let dir = tempfile::tempdir().unwrap();
        write_template(dir.path(), "proofs.md", "Proof Sketching", "proof", "Sketch the proof.");
        write_template(dir.path(), "systems.md", "Systems Thinking", "systems", "Map the system.");

        let store = TemplateStore::new(keyword_backend(), "embed");
        let dirs = vec![dir.path().to_path_buf()];

        let first = store.reindex(&dirs).await.unwrap();
        let first_listing = store.list().await;
        let second = store.reindex(&dirs).await.unwrap();
        let second_listing = store.list().await;

        assert_eq!(first, 2);
        assert_eq!(second, 2);
        let ids = |listing: &[TemplateSummary]| {
            listing.iter().map(|t| t.id.clone()).collect::<Vec<_>>()
        };
        assert_eq!(ids(&first_listing), ids(&second_listing));
        assert_eq!(ids(&first_listing), vec!["proof-sketching", "systems-thinking"]);
    }

    #[tokio::test]
    async fn reindex_skips_malformed_files_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        write_template(dir.path(), "good.md", "Good One", "proof", "body");
        std::fs::write(dir.path().join("bad.md"), "not a template at all").unwrap();

        let store = TemplateStore::new(keyword_backend(), "embed");
        let count = store.reindex(&[dir.path().to_path_buf()]).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn reindex_drops_removed_sources() {
        let dir = tempfile::tempdir().unwrap();
        write_template(dir.path(), "a.md", "Alpha", "proof", "body");
        write_template(dir.path(), "b.md", "Beta", "systems", "body");

        let store = TemplateStore::new(keyword_backend(), "embed");
        let dirs = vec![dir.path().to_path_buf()];
        assert_eq!(store.reindex(&dirs).await.unwrap(), 2);

        std::fs::remove_file(dir.path().join("b.md")).unwrap();
        assert_eq!(store.reindex(&dirs).await.unwrap(), 1);
        assert!(store.source_path("beta").await.is_none());
    }

    #[tokio::test]
    async fn search_ranks_by_similarity_and_applies_floor() {
        let dir = tempfile::tempdir().unwrap();
        write_template(dir.path(), "proofs.md", "Proof Sketching", "proof", "Sketch the proof.");
        write_template(dir.path(), "systems.md", "Systems Thinking", "systems", "Map the system.");

        let store = TemplateStore::new(keyword_backend(), "embed");
        store.reindex(&[dir.path().to_path_buf()]).await.unwrap();

        let hits = store.search("a proof question", 5, 0.8).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "proof-sketching");
        assert!(hits[0].score >= 0.8);
    }

    #[tokio::test]
    async fn search_falls_back_when_nothing_clears_the_floor() {
        let dir = tempfile::tempdir().unwrap();
        write_template(dir.path(), "proofs.md", "Proof Sketching", "proof", "Sketch the proof.");
        // The fallback template lives on the proof axis too, so the
        // cooking query below clears the floor against nothing.
        write_template(
            dir.path(),
            "fallback.md",
            "First Principles",
            "proof, axioms",
            "Strip the problem to axioms.",
        );

        let store = TemplateStore::new(keyword_backend(), "embed");
        store.reindex(&[dir.path().to_path_buf()]).await.unwrap();

        let hits = store.search("unrelated cooking question", 3, 0.9).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, FALLBACK_TEMPLATE_ID);
        assert_eq!(hits[0].score, FALLBACK_SCORE);
    }

    #[tokio::test]
    async fn search_returns_empty_when_fallback_missing() {
        let dir = tempfile::tempdir().unwrap();
        write_template(dir.path(), "proofs.md", "Proof Sketching", "proof", "body");

        let store = TemplateStore::new(keyword_backend(), "embed");
        store.reindex(&[dir.path().to_path_buf()]).await.unwrap();

        let hits = store.search("unrelated cooking question", 3, 0.9).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn add_one_upserts_and_keeps_use_count() {
        let dir = tempfile::tempdir().unwrap();
        write_template(dir.path(), "proofs.md", "Proof Sketching", "proof", "old body");

        let store = TemplateStore::new(keyword_backend(), "embed");
        let slug = store.add_one(&dir.path().join("proofs.md")).await.unwrap();
        assert_eq!(slug, "proof-sketching");
        store.record_use(&slug).await;

        write_template(dir.path(), "proofs.md", "Proof Sketching", "proof", "new body");
        store.add_one(&dir.path().join("proofs.md")).await.unwrap();

        let listing = store.list().await;
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].use_count, 1);

        let hits = store.search("a proof question", 1, 0.8).await.unwrap();
        assert_eq!(hits[0].body, "new body");
    }

    #[tokio::test]
    async fn record_use_survives_reindex() {
        let dir = tempfile::tempdir().unwrap();
        write_template(dir.path(), "proofs.md", "Proof Sketching", "proof", "body");

        let store = TemplateStore::new(keyword_backend(), "embed");
        let dirs = vec![dir.path().to_path_buf()];
        store.reindex(&dirs).await.unwrap();

        store.record_use("proof-sketching").await;
        store.record_use("proof-sketching").await;
        store.reindex(&dirs).await.unwrap();

        let listing = store.list().await;
        assert_eq!(listing[0].use_count, 2);
    }
}
