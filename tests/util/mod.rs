use lore_semantic::search::embedder::{Embedder, EmbedderError, EmbedderResult};
use lore_semantic::search::hash_embedder::HashEmbedder;
use lore_semantic::{
    EmbedderService, EmbedderSignature, Entity, InMemoryCorpus, SearchHit, SemanticConfig,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

/// Captures tracing output for tests.
#[allow(dead_code)]
pub struct TestTracing {
    buffer: Arc<std::sync::Mutex<Vec<u8>>>,
}

#[allow(dead_code)]
impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Assert that the captured log output contains the provided substring.
    pub fn assert_contains(&self, needle: &str) {
        let out = self.output();
        assert!(
            out.contains(needle),
            "expected logs to contain `{needle}`, got:\n{out}"
        );
    }
}

struct TestWriter(Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.0.lock().unwrap();
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Temp data dir plus a hash-only config rooted in it.
#[allow(dead_code)]
pub struct TempLore {
    pub dir: TempDir,
}

#[allow(dead_code)]
impl TempLore {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("tempdir"),
        }
    }

    pub fn config(&self) -> SemanticConfig {
        SemanticConfig::with_data_dir(self.dir.path()).with_embedder("hash")
    }

    pub fn cache_dir(&self) -> std::path::PathBuf {
        self.config().cache_dir()
    }
}

/// The two-character Galilee/Judea corpus.
#[allow(dead_code)]
pub fn galilee_corpus() -> InMemoryCorpus {
    InMemoryCorpus::new(vec![
        Entity::character("A").with_field("traits", "trait", "teacher in Galilee"),
        Entity::character("B").with_field("traits", "trait", "prophet in Judea"),
    ])
}

/// Characters and events spread over several categories.
#[allow(dead_code)]
pub fn lore_corpus() -> InMemoryCorpus {
    InMemoryCorpus::new(vec![
        Entity::character("A")
            .with_field("traits", "trait", "teacher in Galilee")
            .with_field("traits", "trait", "healer of the sick")
            .with_field("relationships", "disciple", "Peter the fisherman"),
        Entity::character("B")
            .with_field("traits", "trait", "prophet in Judea")
            .with_field("relationships", "cousin", "A"),
        Entity::character("C")
            .with_field("traits", "trait", "fisherman from Galilee")
            .with_field("accounts", "gospel", "called by the lake"),
        Entity::event("E1")
            .with_field("accounts", "summary", "feeding of the five thousand in Galilee")
            .with_field("relationships", "witness", "the crowd"),
        Entity::event("E2")
            .with_field("accounts", "summary", "baptism in the Jordan river")
            .with_field("relationships", "witness", "B"),
        Entity::event("E3")
            .with_field("accounts", "summary", "feeding of the crowd by the lake in Galilee"),
    ])
}

/// Hash embedder posing as a semantic model, counting the texts it embeds.
/// `broken` fails every call with `Unavailable`; `mismatched` returns vectors
/// twice as wide as the declared dimension.
#[allow(dead_code)]
pub struct CountingEmbedder {
    inner: HashEmbedder,
    pub texts: Arc<AtomicUsize>,
    pub calls: Arc<AtomicUsize>,
    pub broken: Arc<AtomicBool>,
    pub mismatched: Arc<AtomicBool>,
    pub delay: Duration,
}

impl Embedder for CountingEmbedder {
    fn embed(&self, text: &str) -> EmbedderResult<Vec<f32>> {
        self.embed_batch(&[text])?
            .pop()
            .ok_or_else(|| EmbedderError::Failed("no vector".into()))
    }

    fn embed_batch(&self, texts: &[&str]) -> EmbedderResult<Vec<Vec<f32>>> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(EmbedderError::Unavailable("model crashed".into()));
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.mismatched.load(Ordering::SeqCst) {
            let wide = HashEmbedder::new(self.inner.dimension() * 2);
            return texts.iter().map(|t| wide.embed(t)).collect();
        }
        texts.iter().map(|t| self.inner.embed(t)).collect()
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn id(&self) -> &str {
        "counting-128"
    }

    fn is_semantic(&self) -> bool {
        true
    }
}

/// Handles onto a [`CountingEmbedder`] installed as the service's heavy model.
#[allow(dead_code)]
pub struct CountingService {
    pub service: Arc<EmbedderService>,
    pub texts: Arc<AtomicUsize>,
    pub calls: Arc<AtomicUsize>,
    pub broken: Arc<AtomicBool>,
    pub mismatched: Arc<AtomicBool>,
}

#[allow(dead_code)]
impl CountingService {
    pub fn new(delay: Duration) -> Self {
        let texts = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let broken = Arc::new(AtomicBool::new(false));
        let mismatched = Arc::new(AtomicBool::new(false));
        let (t, c, b, m) = (
            texts.clone(),
            calls.clone(),
            broken.clone(),
            mismatched.clone(),
        );
        let service = EmbedderService::with_loader(
            EmbedderSignature::new("", "counting", 128),
            Arc::new(move |_sig: &EmbedderSignature| -> EmbedderResult<Arc<dyn Embedder>> {
                Ok(Arc::new(CountingEmbedder {
                    inner: HashEmbedder::new(128),
                    texts: t.clone(),
                    calls: c.clone(),
                    broken: b.clone(),
                    mismatched: m.clone(),
                    delay,
                }))
            }),
        );
        Self {
            service: Arc::new(service),
            texts,
            calls,
            broken,
            mismatched,
        }
    }

    pub fn texts_embedded(&self) -> usize {
        self.texts.load(Ordering::SeqCst)
    }

    pub fn batch_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Helper to fluently assert `SearchHit` fields in tests.
pub struct SearchHitAssert<'a> {
    hit: &'a SearchHit,
}

#[allow(dead_code)]
pub fn assert_hit(hit: &SearchHit) -> SearchHitAssert<'_> {
    SearchHitAssert { hit }
}

#[allow(dead_code)]
impl SearchHitAssert<'_> {
    pub fn entity(self, expected: impl AsRef<str>) -> Self {
        assert_eq!(
            self.hit.entity_id,
            expected.as_ref(),
            "entity mismatch for hit {:?}",
            self.hit.matched_field
        );
        self
    }

    pub fn field_starts_with(self, prefix: impl AsRef<str>) -> Self {
        let prefix = prefix.as_ref();
        assert!(
            self.hit.matched_field.starts_with(prefix),
            "matched_field `{}` does not start with `{prefix}`",
            self.hit.matched_field
        );
        self
    }

    pub fn explanation_contains(self, needle: impl AsRef<str>) -> Self {
        let needle = needle.as_ref();
        assert!(
            self.hit.explanation.contains(needle),
            "explanation `{}` missing `{needle}`",
            self.hit.explanation
        );
        self
    }

    pub fn score_in_unit_range(self) -> Self {
        assert!(
            (0.0..=1.0).contains(&self.hit.score),
            "score {} outside [0, 1]",
            self.hit.score
        );
        self
    }

    pub fn snippet_within(self, max_chars: usize) -> Self {
        assert!(
            self.hit.snippet.chars().count() <= max_chars,
            "snippet longer than {max_chars} chars: {}",
            self.hit.snippet
        );
        self
    }
}

/// Assert that two f32 vectors are approximately equal (element-wise).
#[allow(dead_code)]
pub fn assert_vec_float_eq(a: &[f32], b: &[f32], epsilon: f32) {
    assert_eq!(
        a.len(),
        b.len(),
        "vector length mismatch: {} vs {}",
        a.len(),
        b.len()
    );
    for (i, (va, vb)) in a.iter().zip(b.iter()).enumerate() {
        let diff = (va - vb).abs();
        assert!(
            diff <= epsilon,
            "vector element mismatch at index {i}: {va} vs {vb} (diff={diff}, epsilon={epsilon})"
        );
    }
}
