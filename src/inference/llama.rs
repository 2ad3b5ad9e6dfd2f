//! llama.cpp backed engine
//!
//! Loads the `.gguf` weights shipped inside a bundle and streams pieces token
//! by token, holding back bytes of characters split across tokens. The conversation lives in a [`Transcript`] that is re-rendered
//! and prefilled on every generation.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use once_cell::sync::OnceCell;

use crate::inference::engine::{
    ChatEngine, EngineError, EngineFactory, FragmentStream, GenerationParams,
};
use crate::inference::streaming::PieceDecoder;
use crate::inference::transcript::{TemplateStyle, Transcript};
use crate::types::{ConversationTurn, ModelBundle};

/// Maximum tokens per decode call; larger prefills are chunked
const PREFILL_BATCH_SIZE: usize = 512;
/// Tokens of the recent output window the repetition penalty looks at
const PENALTY_LAST_N: i32 = 64;

/// llama.cpp may only be initialised once per process
static BACKEND: OnceCell<Arc<LlamaBackend>> = OnceCell::new();

fn backend() -> Result<Arc<LlamaBackend>, EngineError> {
    BACKEND
        .get_or_try_init(|| {
            LlamaBackend::init()
                .map(Arc::new)
                .map_err(|e| EngineError::Load(format!("llama.cpp backend: {}", e)))
        })
        .cloned()
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LlamaEngineFactory;

impl EngineFactory for LlamaEngineFactory {
    fn open(&self, bundle: &ModelBundle) -> Result<Box<dyn ChatEngine>, EngineError> {
        if !bundle.library_path.is_file() {
            return Err(EngineError::MissingArtifact(format!(
                "compiled library {}",
                bundle.library_path.display()
            )));
        }
        let weights = find_gguf(&bundle.weights_dir).ok_or_else(|| {
            EngineError::MissingArtifact(format!(
                "no .gguf weights in {}",
                bundle.weights_dir.display()
            ))
        })?;

        let backend = backend()?;
        tracing::info!("Loading {} from {}", bundle.model_id, weights.display());
        let model = LlamaModel::load_from_file(&backend, &weights, &LlamaModelParams::default())
            .map_err(|e| EngineError::Load(e.to_string()))?;

        let style = TemplateStyle::from_conv_template(bundle.config.conv_template.as_deref());
        Ok(Box::new(LlamaEngine {
            backend,
            model,
            transcript: Transcript::new(style),
        }))
    }
}

/// First `.gguf` file in the weights dir, or in the bundle dir when weights live in `params/`
fn find_gguf(weights_dir: &Path) -> Option<PathBuf> {
    let mut dirs = vec![weights_dir.to_path_buf()];
    if weights_dir.file_name().map_or(false, |n| n == "params") {
        if let Some(parent) = weights_dir.parent() {
            dirs.push(parent.to_path_buf());
        }
    }

    dirs.iter().find_map(|dir| {
        let pattern = format!("{}/*.gguf", glob::Pattern::escape(&dir.to_string_lossy()));
        let mut matches: Vec<PathBuf> = glob::glob(&pattern).ok()?.filter_map(|p| p.ok()).collect();
        matches.sort();
        matches.into_iter().next()
    })
}

pub struct LlamaEngine {
    backend: Arc<LlamaBackend>,
    model: LlamaModel,
    transcript: Transcript,
}

impl LlamaEngine {
    fn build_sampler(params: &GenerationParams) -> LlamaSampler {
        let mut samplers = Vec::new();

        if let Some(penalty) = params.repetition_penalty {
            samplers.push(LlamaSampler::penalties(PENALTY_LAST_N, penalty, 0.0, 0.0));
        }

        match params.temperature {
            Some(temp) if temp <= 0.0 => samplers.push(LlamaSampler::greedy()),
            temp => {
                if let Some(top_p) = params.top_p {
                    samplers.push(LlamaSampler::top_p(top_p, 1));
                }
                if let Some(temp) = temp {
                    samplers.push(LlamaSampler::temp(temp));
                }
                samplers.push(LlamaSampler::dist(seed()));
            }
        }

        LlamaSampler::chain_simple(samplers)
    }
}

fn seed() -> u32 {
    chrono::Utc::now().timestamp_subsec_nanos()
}

impl ChatEngine for LlamaEngine {
    fn reset(&mut self, system: Option<&str>) -> Result<(), EngineError> {
        self.transcript.reset(system);
        Ok(())
    }

    fn apply_turn(&mut self, turn: &ConversationTurn) -> Result<(), EngineError> {
        self.transcript.push(turn);
        Ok(())
    }

    fn generate<'a>(
        &'a mut self,
        prompt: &'a str,
        params: &GenerationParams,
    ) -> Result<FragmentStream<'a>, EngineError> {
        let this: &'a LlamaEngine = self;
        let model = &this.model;
        let text = this.transcript.render_with_prompt(prompt);

        let tokens = model
            .str_to_token(&text, AddBos::Always)
            .map_err(|e| EngineError::Tokenize(e.to_string()))?;

        let ctx_size = tokens.len() as u32 + params.max_gen_len + 8;
        let n_ctx = NonZeroU32::new(ctx_size)
            .ok_or_else(|| EngineError::Decode("invalid context size".to_string()))?;
        let mut ctx = model
            .new_context(&this.backend, LlamaContextParams::default().with_n_ctx(Some(n_ctx)))
            .map_err(|e| EngineError::Decode(e.to_string()))?;

        let mut batch = LlamaBatch::new(PREFILL_BATCH_SIZE, 1);
        let last_pos = (tokens.len() as i32).saturating_sub(1);
        let mut pos = 0i32;
        for chunk in tokens.chunks(PREFILL_BATCH_SIZE) {
            batch.clear();
            for &token in chunk {
                batch
                    .add(token, pos, &[0], pos == last_pos)
                    .map_err(|e| EngineError::Decode(e.to_string()))?;
                pos += 1;
            }
            ctx.decode(&mut batch)
                .map_err(|e| EngineError::Decode(e.to_string()))?;
        }
        tracing::debug!("Prefilled {} tokens", tokens.len());

        let mut sampler = Self::build_sampler(params);
        let mut remaining = params.max_gen_len;
        let mut n_cur = tokens.len() as i32;
        let mut finished = false;
        let mut decoder = PieceDecoder::new();

        Ok(Box::new(std::iter::from_fn(move || {
            if finished {
                return None;
            }
            if remaining == 0 {
                finished = true;
                return flush(&mut decoder);
            }

            let token = sampler.sample(&ctx, batch.n_tokens() - 1);
            sampler.accept(token);
            if model.is_eog_token(token) {
                finished = true;
                return flush(&mut decoder);
            }

            let piece = match model.token_to_bytes(token, Special::Tokenize) {
                Ok(bytes) => decoder.push(&bytes),
                Err(e) => {
                    tracing::trace!("Token {} has no text: {}", token.0, e);
                    String::new()
                }
            };

            batch.clear();
            let step = batch
                .add(token, n_cur, &[0], true)
                .map_err(|e| EngineError::Decode(e.to_string()))
                .and_then(|_| {
                    ctx.decode(&mut batch)
                        .map_err(|e| EngineError::Decode(e.to_string()))
                });
            if let Err(e) = step {
                finished = true;
                return Some(Err(e));
            }

            n_cur += 1;
            remaining -= 1;
            Some(Ok(piece))
        })))
    }
}

/// Bytes still held by the decoder once generation stops
fn flush(decoder: &mut PieceDecoder) -> Option<Result<String, EngineError>> {
    let tail = decoder.finish();
    (!tail.is_empty()).then(|| Ok(tail))
}
