//! Prompt execution
//!
//! [`ConversationAdapter::execute`] is the entry point the host tool calls for
//! every prompt: resolve the model, get its cached session, bring the session
//! up to date with the supplied history, then stream the reply.

use std::sync::Arc;

use crate::error::MlcError;
use crate::inference::engine::{EngineError, GenerationParams};
use crate::inference::session::{EngineSession, SessionManager};
use crate::inference::streaming::TokenSink;
use crate::models::Resolver;
use crate::types::message::last_system_prompt;
use crate::types::{ConversationTurn, GenerationOptions};

/// One prompt as submitted by the host
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Prompt {
    pub text: String,
    pub system: Option<String>,
    pub options: GenerationOptions,
}

impl Prompt {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The engine finished or hit the length cap
    Stop,
    /// The sink stopped accepting fragments; nothing was committed
    Cancelled,
}

/// Result of a successful execution
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub model_id: String,
    pub text: String,
    pub finish: FinishReason,
}

pub struct ConversationAdapter {
    resolver: Resolver,
    sessions: Arc<SessionManager>,
    /// Defaults from plugin settings, layered under per-prompt options
    defaults: GenerationOptions,
}

impl ConversationAdapter {
    pub fn new(resolver: Resolver, sessions: Arc<SessionManager>, defaults: GenerationOptions) -> Self {
        Self {
            resolver,
            sessions,
            defaults,
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Run one prompt against `requested`, streaming fragments into `sink`
    ///
    /// Resolution, option and load errors are returned before anything reaches
    /// the sink. A failure during generation is returned after the fragments
    /// produced so far have been delivered, and leaves no turn committed.
    pub async fn execute<S>(
        &self,
        requested: &str,
        prompt: &Prompt,
        history: &[ConversationTurn],
        sink: S,
    ) -> Result<Completion, MlcError>
    where
        S: TokenSink + 'static,
    {
        let bundle = self.resolver.resolve_installed(requested)?;

        prompt.options.validate()?;
        let options = prompt
            .options
            .or(&self.defaults)
            .or(&bundle.default_options());
        let params = GenerationParams::from(&options);

        let system = prompt
            .system
            .clone()
            .or_else(|| last_system_prompt(history).map(str::to_string));

        let handle = self.sessions.get_or_create(&bundle).await?;
        let mut session = handle.lock_owned().await;

        let model_id = bundle.model_id.clone();
        let history = history.to_vec();
        let text = prompt.text.clone();
        tracing::debug!("Generating with {} ({} prior turns)", model_id, history.len());

        let outcome = tokio::task::spawn_blocking(move || {
            let mut sink = sink;
            let result = run_turn(&mut session, system.as_deref(), &history, &text, &params, &mut sink);
            let error = result.as_ref().err().map(|e| e.to_string());
            sink.finish(error.as_deref());
            result
        })
        .await
        .map_err(|e| EngineError::Task(e.to_string()))
        .and_then(|result| result)
        .map_err(|source| MlcError::Generation {
            model_id: model_id.clone(),
            source,
        })?;

        let (text, finish) = outcome;
        if finish == FinishReason::Cancelled {
            tracing::info!("Generation for {} cancelled by the consumer", model_id);
        }
        Ok(Completion {
            model_id,
            text,
            finish,
        })
    }
}

/// Replay, generate and commit on the blocking thread that holds the session
fn run_turn(
    session: &mut EngineSession,
    system: Option<&str>,
    history: &[ConversationTurn],
    prompt: &str,
    params: &GenerationParams,
    sink: &mut dyn TokenSink,
) -> Result<(String, FinishReason), EngineError> {
    let replayed = session.sync_history(system, history)?;
    if replayed > 0 {
        tracing::debug!("Replayed {} turns into {}", replayed, session.model_id());
    }

    let mut response = String::new();
    let mut finish = FinishReason::Stop;
    {
        let stream = session.engine_mut().generate(prompt, params)?;
        for fragment in stream {
            let fragment = fragment?;
            if fragment.is_empty() {
                continue;
            }
            response.push_str(&fragment);
            if !sink.push(&fragment) {
                finish = FinishReason::Cancelled;
                break;
            }
        }
    }

    if finish == FinishReason::Stop {
        session.commit(prompt, &response)?;
    }
    Ok((response, finish))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::session::tests::{FakeFactory, Script};
    use crate::inference::streaming::{FnSink, NullSink};
    use crate::storage::scanner::tests::{make_bundle, store};
    use crate::storage::AliasRegistry;
    use std::sync::atomic::Ordering;

    const MODEL: &str = "mlc-chat-Llama-2-7b-chat-hf-q4f16_1";

    struct Fixture {
        _dir: tempfile::TempDir,
        factory: Arc<FakeFactory>,
        adapter: ConversationAdapter,
    }

    fn fixture(script: Script) -> Fixture {
        fixture_with(FakeFactory::new(script))
    }

    fn fixture_with(factory: FakeFactory) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        make_bundle(dir.path(), MODEL, true);
        let resolver = Resolver::new(AliasRegistry::new(dir.path().join("aliases.json")), store(dir.path()));
        resolver.aliases().set("llama2", MODEL).unwrap();

        let factory = Arc::new(factory);
        let sessions = Arc::new(SessionManager::new(factory.clone()));
        Fixture {
            _dir: dir,
            factory,
            adapter: ConversationAdapter::new(resolver, sessions, GenerationOptions::default()),
        }
    }

    #[tokio::test]
    async fn test_streams_fragments_and_commits() {
        let fx = fixture(Script::Reply(vec!["Hel", "lo", "!"]));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();

        let completion = fx
            .adapter
            .execute("llama2", &Prompt::new("Say hello"), &[], tx)
            .await
            .unwrap();

        assert_eq!(completion.text, "Hello!");
        assert_eq!(completion.model_id, MODEL);
        assert_eq!(completion.finish, FinishReason::Stop);

        let mut received = Vec::new();
        while let Ok(fragment) = rx.try_recv() {
            received.push(fragment);
        }
        assert_eq!(received, vec!["Hel", "lo", "!"]);

        let bundle = fx.adapter.resolver.resolve_installed(MODEL).unwrap();
        let handle = fx.adapter.sessions().get_or_create(&bundle).await.unwrap();
        assert_eq!(
            handle.lock().await.turns(),
            &[ConversationTurn::user("Say hello"), ConversationTurn::assistant("Hello!")]
        );
    }

    #[tokio::test]
    async fn test_follow_up_does_not_replay_history_twice() {
        let fx = fixture(Script::Reply(vec!["ok"]));

        fx.adapter
            .execute(MODEL, &Prompt::new("first"), &[], NullSink)
            .await
            .unwrap();
        let history = vec![ConversationTurn::user("first"), ConversationTurn::assistant("ok")];
        fx.adapter
            .execute(MODEL, &Prompt::new("second"), &history, NullSink)
            .await
            .unwrap();

        assert_eq!(
            fx.factory.log.applied(),
            vec![
                ConversationTurn::user("first"),
                ConversationTurn::assistant("ok"),
                ConversationTurn::user("second"),
                ConversationTurn::assistant("ok"),
            ]
        );
        assert_eq!(fx.factory.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fresh_session_replays_supplied_history() {
        let fx = fixture(Script::Reply(vec!["3"]));
        let history = vec![ConversationTurn::user("1+1?"), ConversationTurn::assistant("2")];

        fx.adapter
            .execute(MODEL, &Prompt::new("1+2?"), &history, NullSink)
            .await
            .unwrap();

        let applied = fx.factory.log.applied();
        assert_eq!(&applied[..2], history.as_slice());
        assert_eq!(applied.len(), 4);
    }

    #[tokio::test]
    async fn test_mid_stream_failure_keeps_partial_output_and_commits_nothing() {
        let fx = fixture(Script::FailAfter(vec!["par", "tial"]));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();

        let err = fx
            .adapter
            .execute(MODEL, &Prompt::new("go"), &[], tx)
            .await
            .unwrap_err();
        assert!(matches!(err, MlcError::Generation { source: EngineError::Decode(_), .. }));
        assert!(!err.is_pre_output());

        let mut received = Vec::new();
        while let Ok(fragment) = rx.try_recv() {
            received.push(fragment);
        }
        assert_eq!(received, vec!["par", "tial"]);
        assert!(fx.factory.log.applied().is_empty());
    }

    #[tokio::test]
    async fn test_consumer_gone_cancels_without_commit() {
        let fx = fixture(Script::Reply(vec!["a", "b", "c"]));

        let completion = fx
            .adapter
            .execute(MODEL, &Prompt::new("go"), &[], FnSink(|s: &str| s != "b"))
            .await
            .unwrap();
        assert_eq!(completion.finish, FinishReason::Cancelled);
        assert_eq!(completion.text, "ab");
        assert!(fx.factory.log.applied().is_empty());

        // The session stays usable
        let completion = fx
            .adapter
            .execute(MODEL, &Prompt::new("again"), &[], NullSink)
            .await
            .unwrap();
        assert_eq!(completion.finish, FinishReason::Stop);
        assert_eq!(fx.factory.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_receiver_cancels() {
        let fx = fixture(Script::Reply(vec!["a", "b"]));
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        drop(rx);

        let completion = fx
            .adapter
            .execute(MODEL, &Prompt::new("go"), &[], tx)
            .await
            .unwrap();
        assert_eq!(completion.finish, FinishReason::Cancelled);
    }

    #[tokio::test]
    async fn test_unknown_model_fails_before_output() {
        let fx = fixture(Script::Reply(vec!["x"]));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();

        let err = fx
            .adapter
            .execute("nope", &Prompt::new("hi"), &[], tx)
            .await
            .unwrap_err();
        assert!(matches!(err, MlcError::UnknownModel { .. }));
        assert!(err.is_pre_output());
        assert!(rx.try_recv().is_err());
        assert_eq!(fx.factory.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_engine_load_failure_fails_before_output() {
        let fx = fixture_with(FakeFactory {
            fail: true,
            ..FakeFactory::new(Script::Reply(vec!["x"]))
        });
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();

        let err = fx
            .adapter
            .execute("llama2", &Prompt::new("hi"), &[], tx)
            .await
            .unwrap_err();
        assert!(matches!(
            &err,
            MlcError::EngineInitialization { model_id, source: EngineError::Load(_) } if model_id == MODEL
        ));
        assert!(err.is_pre_output());
        assert!(rx.try_recv().is_err());
        assert!(fx.factory.log.prompts.lock().unwrap().is_empty());
        assert_eq!(fx.factory.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_not_installed_short_name() {
        let fx = fixture(Script::Reply(vec!["x"]));
        let err = fx
            .adapter
            .execute("Llama-2-13b-chat", &Prompt::new("hi"), &[], NullSink)
            .await
            .unwrap_err();
        assert!(matches!(err, MlcError::ModelNotInstalled { .. }));
    }

    #[tokio::test]
    async fn test_invalid_option_rejected_before_load() {
        let fx = fixture(Script::Reply(vec!["x"]));
        let prompt = Prompt::new("hi").with_options(GenerationOptions {
            top_p: Some(2.0),
            ..Default::default()
        });
        let err = fx
            .adapter
            .execute(MODEL, &prompt, &[], NullSink)
            .await
            .unwrap_err();
        assert!(matches!(err, MlcError::InvalidOption(_)));
        assert_eq!(fx.factory.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_system_prompt_change_resets_session() {
        let fx = fixture(Script::Reply(vec!["ok"]));

        fx.adapter
            .execute(MODEL, &Prompt::new("a").with_system("terse"), &[], NullSink)
            .await
            .unwrap();
        let history = vec![
            ConversationTurn::system("terse"),
            ConversationTurn::user("a"),
            ConversationTurn::assistant("ok"),
        ];
        // Same system prompt taken from history: no reset
        fx.adapter
            .execute(MODEL, &Prompt::new("b"), &history, NullSink)
            .await
            .unwrap();
        assert_eq!(fx.factory.log.resets.load(Ordering::SeqCst), 1);

        fx.adapter
            .execute(MODEL, &Prompt::new("c").with_system("chatty"), &history, NullSink)
            .await
            .unwrap();
        assert_eq!(fx.factory.log.resets.load(Ordering::SeqCst), 2);
    }
}
