//! Scripted providers and engine builders shared by the integration tests.

use async_trait::async_trait;
use chorus::{
    EngineConfig, EnsembleEngine, EnsembleError, EnsembleRequest, ErrorCategory, ModelCatalog,
    ModelParams, ModelProvider, ProviderId, ProviderResponse, RoleOutput, Synthesizer, Tier,
    Waiter,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What a scripted provider does when a given model is invoked.
#[derive(Debug, Clone)]
pub enum Script {
    Reply { content: String, confidence: f64 },
    Fail { category: ErrorCategory },
    Sleep { delay: Duration },
}

/// Provider whose behavior is scripted per model name.
pub struct ScriptedProvider {
    id: ProviderId,
    scripts: Mutex<HashMap<String, Script>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(id: ProviderId) -> Arc<Self> {
        Arc::new(Self { id, scripts: Mutex::new(HashMap::new()), calls: AtomicUsize::new(0) })
    }

    /// Script one model's behavior; unscripted models reply sensibly.
    pub fn script(self: &Arc<Self>, model: &str, script: Script) -> Arc<Self> {
        self.scripts.lock().unwrap().insert(model.to_string(), script);
        Arc::clone(self)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn id(&self) -> ProviderId {
        self.id
    }

    async fn complete(
        &self,
        model: &str,
        prompt: &str,
        _params: &ModelParams,
    ) -> Result<ProviderResponse, EnsembleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().unwrap().get(model).cloned();
        match script {
            None => Ok(ProviderResponse {
                content: format!("{model} answers: {prompt}"),
                tokens_in: Some(prompt.len() as u32 / 4),
                tokens_out: Some(16),
                confidence: Some(0.8),
            }),
            Some(Script::Reply { content, confidence }) => Ok(ProviderResponse {
                content,
                tokens_in: Some(8),
                tokens_out: Some(8),
                confidence: Some(confidence),
            }),
            Some(Script::Fail { category }) => {
                Err(EnsembleError::model_failure(self.id, model, category, "scripted failure"))
            }
            Some(Script::Sleep { delay }) => {
                tokio::time::sleep(delay).await;
                Ok(ProviderResponse {
                    content: format!("{model} (slow) answers: {prompt}"),
                    tokens_in: Some(8),
                    tokens_out: Some(8),
                    confidence: Some(0.7),
                })
            }
        }
    }
}

/// Synthesizer that merges the fulfilled outputs into one line.
pub struct MergingSynthesizer;

#[async_trait]
impl Synthesizer for MergingSynthesizer {
    fn provider(&self) -> ProviderId {
        ProviderId::Anthropic
    }

    fn model(&self) -> &str {
        "claude-sonnet-4"
    }

    async fn synthesize(
        &self,
        _prompt: &str,
        outputs: &[RoleOutput],
    ) -> Result<String, EnsembleError> {
        let sources: Vec<&str> = outputs
            .iter()
            .filter(|o| o.is_fulfilled())
            .map(|o| o.content.as_str())
            .collect();
        Ok(format!("Synthesis of {} sources: {}", sources.len(), sources.join(" | ")))
    }
}

/// Install a test subscriber once so `cargo test -- --nocapture` shows
/// engine traces.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// One binding per role so tests can predict every provider call.
pub fn three_role_catalog() -> ModelCatalog {
    let mut catalog = ModelCatalog::new();
    catalog.add("gpt4o", ProviderId::OpenAi, "gpt-4o", 1, 0.9);
    catalog.add("claude", ProviderId::Anthropic, "claude-sonnet-4", 1, 0.9);
    catalog.add("gemini", ProviderId::Google, "gemini-2.0-flash", 1, 0.85);
    catalog
}

pub fn single_role_catalog() -> ModelCatalog {
    let mut catalog = ModelCatalog::new();
    catalog.add("gpt4o", ProviderId::OpenAi, "gpt-4o", 1, 0.9);
    catalog
}

/// Engine over the three stock providers with the test config profile.
pub fn three_provider_engine(
    config: EngineConfig,
    openai: Arc<ScriptedProvider>,
    anthropic: Arc<ScriptedProvider>,
    google: Arc<ScriptedProvider>,
) -> EnsembleEngine {
    init_tracing();
    EnsembleEngine::builder()
        .config(config)
        .catalog(three_role_catalog())
        .provider(openai)
        .provider(anthropic)
        .provider(google)
        .synthesizer(Arc::new(MergingSynthesizer))
        .waiter(Waiter::Skip)
        .build()
        .expect("valid engine")
}

pub fn request(prompt: &str) -> EnsembleRequest {
    EnsembleRequest::new(prompt, "u1", "s1", Tier::Free)
}
