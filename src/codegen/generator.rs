//! Generate → write → compile → fix, bounded
//!
//! ```text
//!  attempt 1..=max_attempts
//!    ├── Storage spec (alone, others build on its types)
//!    ├── every other pending spec (JoinSet, all finish before compile)
//!    ├── write changed files (secrets replaced by lookups)
//!    └── supervisor compile ──clean──► Done
//!                             └─errors─► attach to specs, retry those
//! ```

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::prompt::generation_messages;
use super::secrets::SecretStore;
use super::spec::{extract_code, GenState, ToolSpec};
use crate::llm::{CompletionError, CompletionRequest, CompletionService, Message, Usage};
use crate::metrics::Metrics;
use crate::supervisor::{
    CodeError, ConventionExtractor, SchemaExtractor, Supervisor, SupervisorError, ToolSchema,
};

#[derive(Debug, Error)]
pub enum CodegenError {
    #[error("unit {unit} still fails to compile after {attempts} attempts")]
    AttemptsExhausted {
        unit: String,
        attempts: u32,
        errors: Vec<CodeError>,
    },

    #[error("token budget exhausted: {used} of {limit}")]
    BudgetExhausted { used: u64, limit: u64 },

    #[error("generation of {spec} failed: {source}")]
    Generation {
        spec: String,
        #[source]
        source: CompletionError,
    },

    #[error("generation cancelled")]
    Cancelled,

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct GeneratorSettings {
    pub model: String,
    pub max_attempts: u32,
    /// Prompt + completion + reasoning tokens across the whole run
    pub max_total_tokens: Option<u64>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            model: String::new(),
            max_attempts: 10,
            max_total_tokens: None,
            temperature: None,
            max_tokens: None,
        }
    }
}

/// Summary of a finished run
#[derive(Debug, Clone)]
pub struct GenerationReport {
    pub attempts: u32,
    pub usage: Usage,
    pub tools: Vec<ToolSchema>,
}

#[derive(Clone)]
pub struct CodeGenerator {
    completion: Arc<dyn CompletionService>,
    supervisor: Arc<Supervisor>,
    secrets: Arc<SecretStore>,
    extractor: Arc<dyn SchemaExtractor>,
    settings: GeneratorSettings,
    metrics: Option<Arc<Metrics>>,
}

impl CodeGenerator {
    pub fn new(
        completion: Arc<dyn CompletionService>,
        supervisor: Arc<Supervisor>,
        settings: GeneratorSettings,
    ) -> Self {
        Self {
            completion,
            supervisor,
            secrets: Arc::new(SecretStore::new()),
            extractor: Arc::new(ConventionExtractor),
            settings,
            metrics: None,
        }
    }

    pub fn with_secrets(mut self, secrets: Arc<SecretStore>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn SchemaExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn extension(&self) -> String {
        self.supervisor.toolchain().source_extension().to_string()
    }

    /// Fill empty specs with the sources already in the unit dir
    pub fn load_existing(&self, specs: &mut [ToolSpec]) -> usize {
        let ext = self.extension();
        let mut loaded = 0;
        for spec in specs.iter_mut().filter(|s| s.source.is_empty()) {
            let path = self.supervisor.dir().join(spec.file_name(&ext));
            if let Ok(source) = std::fs::read_to_string(&path) {
                spec.set_source(self.supervisor.name(), source, self.extractor.as_ref());
                loaded += 1;
            }
        }
        loaded
    }

    /// One completion call for `spec`; stores the new source and usage
    pub async fn generate(
        &self,
        spec: &mut ToolSpec,
        storage: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Usage, CodegenError> {
        spec.state = GenState::Generating;
        spec.attempts += 1;
        let toolchain = self.supervisor.toolchain();
        let messages = generation_messages(
            spec,
            storage,
            &self.secrets.aliases(),
            toolchain.comment_prefix(),
        );
        let request = CompletionRequest {
            model: self.settings.model.clone(),
            messages: messages.clone(),
            tools: Vec::new(),
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
        };

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(CodegenError::Cancelled),
            response = self.completion.complete(&request) => response,
        };
        let response = response
            .and_then(|r| r.into_result())
            .map_err(|source| CodegenError::Generation {
                spec: spec.name.clone(),
                source,
            })?;

        let mut usage = response.usage;
        if usage.calls == 0 {
            usage.calls = 1;
        }
        spec.usage.add(&usage);

        let code = extract_code(&response.answer);
        tracing::debug!(
            spec = %spec.name,
            attempt = spec.attempts,
            bytes = code.len(),
            tokens = usage.total_tokens(),
            "Source generated"
        );
        spec.conversation = messages;
        spec.conversation.push(Message::assistant(response.answer));
        spec.set_source(self.supervisor.name(), code, self.extractor.as_ref());
        spec.errors.clear();
        spec.build_output.clear();
        Ok(usage)
    }

    /// Write each spec whose on-disk file differs; returns files written
    pub fn write_files(&self, specs: &[ToolSpec]) -> Result<usize, CodegenError> {
        let toolchain = self.supervisor.toolchain();
        let ext = toolchain.source_extension();
        let mut written = 0;
        for spec in specs.iter().filter(|s| !s.source.is_empty()) {
            let path = self.supervisor.dir().join(spec.file_name(ext));
            let content = self
                .secrets
                .substitute(&spec.source, |alias| toolchain.secret_lookup(alias));
            let unchanged = std::fs::read_to_string(&path).is_ok_and(|current| current == content);
            if !unchanged {
                std::fs::write(&path, content)?;
                written += 1;
            }
        }
        Ok(written)
    }

    /// Compile the unit and attach diagnostics to the specs by file name
    ///
    /// Sources are read back after the build so line numbers in diagnostics
    /// match what the model sees on retry. Returns `true` when the build is
    /// clean.
    pub async fn compile(&self, specs: &mut [ToolSpec]) -> Result<bool, CodegenError> {
        let hash = self.supervisor.content_hash()?;
        let outcome = self.supervisor.compile(&hash).await?;
        let ext = self.extension();

        for spec in specs.iter_mut() {
            let file = spec.file_name(&ext);
            if !spec.source.is_empty() {
                let built = std::fs::read_to_string(self.supervisor.dir().join(&file))?;
                if built != spec.source {
                    spec.set_source(self.supervisor.name(), built, self.extractor.as_ref());
                }
            }
            spec.errors = outcome.errors.iter().filter(|e| e.file == file).cloned().collect();
            spec.build_output.clear();
        }
        for e in &outcome.errors {
            if !specs.iter().any(|s| s.file_name(&ext) == e.file) {
                tracing::warn!(file = %e.file, line = e.line, message = %e.message, "Diagnostic for a file no spec owns");
            }
        }

        if outcome.success {
            for spec in specs.iter_mut() {
                spec.state = GenState::CompileClean;
            }
            return Ok(true);
        }

        let matched = specs.iter().any(|s| !s.errors.is_empty());
        for spec in specs.iter_mut() {
            if !spec.errors.is_empty() {
                spec.state = GenState::CompileError;
            } else if !matched {
                // Nothing pinpoints a file: every spec gets the raw output
                spec.state = GenState::CompileError;
                spec.build_output = outcome.stderr.clone();
            } else {
                spec.state = GenState::CompileClean;
            }
        }
        Ok(false)
    }

    /// Generate, write and compile until clean or out of attempts
    pub async fn run(
        &self,
        specs: &mut Vec<ToolSpec>,
        cancel: &CancellationToken,
    ) -> Result<GenerationReport, CodegenError> {
        let span = tracing::info_span!("codegen", unit = %self.supervisor.name(), specs = specs.len());
        self.run_inner(specs, cancel).instrument(span).await
    }

    async fn run_inner(
        &self,
        specs: &mut Vec<ToolSpec>,
        cancel: &CancellationToken,
    ) -> Result<GenerationReport, CodegenError> {
        let mut attempts = 0;
        let mut usage = Usage::default();

        loop {
            if cancel.is_cancelled() {
                return Err(CodegenError::Cancelled);
            }
            if attempts >= self.settings.max_attempts {
                let errors: Vec<CodeError> = specs.iter().flat_map(|s| s.errors.clone()).collect();
                for spec in specs.iter_mut() {
                    spec.state = GenState::Failed;
                }
                tracing::warn!(attempts, errors = errors.len(), "Giving up on unit");
                return Err(CodegenError::AttemptsExhausted {
                    unit: self.supervisor.name().to_string(),
                    attempts,
                    errors,
                });
            }
            attempts += 1;
            if let Some(m) = &self.metrics {
                m.generation_attempts.inc();
            }

            let pending: Vec<usize> = specs
                .iter()
                .enumerate()
                .filter(|(_, s)| s.source.is_empty() || s.needs_fix())
                .map(|(i, _)| i)
                .collect();
            tracing::info!(attempt = attempts, pending = pending.len(), "Generation attempt");

            let spent = self.generate_pending(specs, &pending, cancel).await;
            let spent = match spent {
                Ok(spent) => spent,
                Err(e) => {
                    for spec in specs.iter_mut() {
                        spec.state = GenState::Failed;
                    }
                    return Err(e);
                }
            };
            usage.add(&spent);

            if let Some(limit) = self.settings.max_total_tokens {
                if usage.total_tokens() > limit {
                    for spec in specs.iter_mut() {
                        spec.state = GenState::Failed;
                    }
                    return Err(CodegenError::BudgetExhausted {
                        used: usage.total_tokens(),
                        limit,
                    });
                }
            }

            self.write_files(specs)?;
            if self.compile(specs).await? {
                for spec in specs.iter_mut() {
                    spec.state = GenState::Done;
                }
                tracing::info!(attempts, tokens = usage.total_tokens(), "Unit compiles cleanly");
                return Ok(GenerationReport {
                    attempts,
                    usage,
                    tools: self.supervisor.tools().await,
                });
            }
        }
    }

    /// Storage first, then the rest concurrently; the first failure wins
    async fn generate_pending(
        &self,
        specs: &mut [ToolSpec],
        pending: &[usize],
        cancel: &CancellationToken,
    ) -> Result<Usage, CodegenError> {
        let mut usage = Usage::default();

        if let Some(&i) = pending.iter().find(|&&i| specs[i].is_storage()) {
            usage.add(&self.generate(&mut specs[i], None, cancel).await?);
        }
        let storage = specs
            .iter()
            .find(|s| s.is_storage())
            .map(|s| s.source.clone())
            .filter(|s| !s.is_empty());

        let others: Vec<usize> = pending.iter().copied().filter(|&i| !specs[i].is_storage()).collect();
        let mut set = JoinSet::new();
        for i in others {
            let generator = self.clone();
            let mut spec = std::mem::take(&mut specs[i]);
            let storage = storage.clone();
            let cancel = cancel.clone();
            set.spawn(async move {
                let result = generator.generate(&mut spec, storage.as_deref(), &cancel).await;
                (i, spec, result)
            });
        }

        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((i, spec, result)) => {
                    specs[i] = spec;
                    match result {
                        Ok(spent) => usage.add(&spent),
                        Err(e) => {
                            tracing::warn!(spec = %specs[i].name, error = %e, "Generation failed");
                            first_error.get_or_insert(e);
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Generation task panicked");
                    first_error.get_or_insert(CodegenError::Io(std::io::Error::other(e.to_string())));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(usage),
        }
    }
}
