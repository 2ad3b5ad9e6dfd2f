//! Engine session cache
//!
//! Loading a model is by far the most expensive thing the plugin does, so each
//! loaded engine is kept for the life of the process and shared by every
//! prompt that names the same model id. Each session also remembers which
//! conversation turns it has already been fed, so a follow-up prompt only
//! replays what is new.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OnceCell};
use uuid::Uuid;

use crate::error::MlcError;
use crate::inference::engine::{ChatEngine, EngineError, EngineFactory};
use crate::system::resources;
use crate::types::{ConversationTurn, ModelBundle, Role};

/// Shared handle to a cached session; the lock serialises generations
pub type SessionHandle = Arc<Mutex<EngineSession>>;

/// A loaded engine plus the conversation it has been fed
pub struct EngineSession {
    id: Uuid,
    model_id: String,
    engine: Box<dyn ChatEngine>,
    system: Option<String>,
    turns: Vec<ConversationTurn>,
    created_at: DateTime<Utc>,
    /// Set when a replay failed part way and engine state is unknown
    stale: bool,
}

impl EngineSession {
    pub fn new(model_id: impl Into<String>, engine: Box<dyn ChatEngine>) -> Self {
        Self {
            id: Uuid::new_v4(),
            model_id: model_id.into(),
            engine,
            system: None,
            turns: Vec::new(),
            created_at: Utc::now(),
            stale: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Turns applied to the engine so far, oldest first
    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn system(&self) -> Option<&str> {
        self.system.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn engine_mut(&mut self) -> &mut dyn ChatEngine {
        self.engine.as_mut()
    }

    /// Bring the engine in line with `history`; returns how many turns were applied
    ///
    /// When the applied log is a prefix of `history` under the same system
    /// prompt only the tail is applied. Anything else resets the engine and
    /// replays the whole history. System turns in `history` are not replayed;
    /// they only feed the system prompt.
    pub fn sync_history(
        &mut self,
        system: Option<&str>,
        history: &[ConversationTurn],
    ) -> Result<usize, EngineError> {
        let history: Vec<&ConversationTurn> =
            history.iter().filter(|t| t.role != Role::System).collect();

        let reusable = !self.stale
            && self.system.as_deref() == system
            && self.turns.len() <= history.len()
            && self.turns.iter().zip(history.iter()).all(|(a, b)| a == *b);

        let start = if reusable {
            self.turns.len()
        } else {
            tracing::debug!(
                "Resetting session for {} ({} applied, {} supplied)",
                self.model_id,
                self.turns.len(),
                history.len()
            );
            self.stale = true;
            self.turns.clear();
            self.engine.reset(system)?;
            self.system = system.map(str::to_string);
            self.stale = false;
            0
        };

        for turn in &history[start..] {
            if let Err(e) = self.engine.apply_turn(turn) {
                self.stale = true;
                return Err(e);
            }
            self.turns.push((*turn).clone());
        }
        Ok(history.len() - start)
    }

    /// Record a completed exchange
    pub fn commit(&mut self, prompt: &str, response: &str) -> Result<(), EngineError> {
        for turn in [
            ConversationTurn::user(prompt),
            ConversationTurn::assistant(response),
        ] {
            if let Err(e) = self.engine.apply_turn(&turn) {
                self.stale = true;
                return Err(e);
            }
            self.turns.push(turn);
        }
        Ok(())
    }
}

impl std::fmt::Debug for EngineSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineSession")
            .field("id", &self.id)
            .field("model_id", &self.model_id)
            .field("turns", &self.turns.len())
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Process-wide cache of loaded engines, keyed by canonical model id
pub struct SessionManager {
    factory: Arc<dyn EngineFactory>,
    sessions: DashMap<String, Arc<OnceCell<SessionHandle>>>,
}

impl SessionManager {
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            factory,
            sessions: DashMap::new(),
        }
    }

    /// Cached session for the bundle, loading the engine on first use
    ///
    /// Concurrent callers for the same id wait on a single load. A failed load
    /// leaves nothing cached, so the next call tries again.
    pub async fn get_or_create(&self, bundle: &ModelBundle) -> Result<SessionHandle, MlcError> {
        let cell = self
            .sessions
            .entry(bundle.model_id.clone())
            .or_default()
            .clone();

        let handle = cell
            .get_or_try_init(|| self.open(bundle))
            .await
            .map_err(|source| MlcError::EngineInitialization {
                model_id: bundle.model_id.clone(),
                source,
            })?;
        Ok(handle.clone())
    }

    /// Drop a cached session; the next request loads the model again
    pub fn reset(&self, model_id: &str) -> bool {
        let removed = self.sessions.remove(model_id).is_some();
        if removed {
            tracing::info!("Dropped session for {}", model_id);
        }
        removed
    }

    /// Ids with a loaded engine, sorted
    pub fn loaded(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().initialized())
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    async fn open(&self, bundle: &ModelBundle) -> Result<SessionHandle, EngineError> {
        log_memory(bundle);

        let factory = self.factory.clone();
        let owned = bundle.clone();
        let started = std::time::Instant::now();
        let engine = tokio::task::spawn_blocking(move || factory.open(&owned))
            .await
            .map_err(|e| EngineError::Task(e.to_string()))??;

        let session = EngineSession::new(bundle.model_id.clone(), engine);
        tracing::info!(
            "Loaded {} in {:.1}s (session {})",
            bundle.model_id,
            started.elapsed().as_secs_f32(),
            session.id()
        );
        Ok(Arc::new(Mutex::new(session)))
    }
}

fn log_memory(bundle: &ModelBundle) {
    let usage = resources::get_resource_usage();
    let weights_mb = resources::directory_size_bytes(&bundle.weights_dir) / 1024 / 1024;
    if !usage.is_known() {
        tracing::debug!("Loading {} ({} MB of weights)", bundle.model_id, weights_mb);
        return;
    }
    tracing::info!(
        "Loading {}: {} MB of weights, {} / {} MB RAM available",
        bundle.model_id,
        weights_mb,
        usage.ram_available_mb,
        usage.ram_total_mb
    );
    if weights_mb > usage.ram_available_mb {
        tracing::warn!(
            "{} may not fit in memory ({} MB needed, {} MB available)",
            bundle.model_id,
            weights_mb,
            usage.ram_available_mb
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::inference::engine::{FragmentStream, GenerationParams};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// What a fake engine should do when asked to generate
    #[derive(Debug, Clone)]
    pub(crate) enum Script {
        /// Stream these fragments and stop
        Reply(Vec<&'static str>),
        /// Stream these fragments, then fail
        FailAfter(Vec<&'static str>),
    }

    /// Everything the fake engines did, shared with the test
    #[derive(Debug, Default)]
    pub(crate) struct EngineLog {
        pub resets: AtomicUsize,
        pub applied: StdMutex<Vec<ConversationTurn>>,
        pub prompts: StdMutex<Vec<String>>,
    }

    impl EngineLog {
        pub(crate) fn applied(&self) -> Vec<ConversationTurn> {
            self.applied.lock().unwrap().clone()
        }
    }

    pub(crate) struct FakeEngine {
        log: Arc<EngineLog>,
        script: Script,
    }

    impl ChatEngine for FakeEngine {
        fn reset(&mut self, _system: Option<&str>) -> Result<(), EngineError> {
            self.log.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn apply_turn(&mut self, turn: &ConversationTurn) -> Result<(), EngineError> {
            self.log.applied.lock().unwrap().push(turn.clone());
            Ok(())
        }

        fn generate<'a>(
            &'a mut self,
            prompt: &'a str,
            _params: &GenerationParams,
        ) -> Result<FragmentStream<'a>, EngineError> {
            self.log.prompts.lock().unwrap().push(prompt.to_string());
            let items: Vec<Result<String, EngineError>> = match &self.script {
                Script::Reply(parts) => parts.iter().map(|p| Ok(p.to_string())).collect(),
                Script::FailAfter(parts) => parts
                    .iter()
                    .map(|p| Ok(p.to_string()))
                    .chain(std::iter::once(Err(EngineError::Decode("boom".to_string()))))
                    .collect(),
            };
            Ok(Box::new(items.into_iter()))
        }
    }

    pub(crate) struct FakeFactory {
        pub opens: AtomicUsize,
        pub log: Arc<EngineLog>,
        pub script: Script,
        pub fail: bool,
    }

    impl FakeFactory {
        pub(crate) fn new(script: Script) -> Self {
            Self {
                opens: AtomicUsize::new(0),
                log: Arc::new(EngineLog::default()),
                script,
                fail: false,
            }
        }
    }

    impl EngineFactory for FakeFactory {
        fn open(&self, _bundle: &ModelBundle) -> Result<Box<dyn ChatEngine>, EngineError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(20));
            if self.fail {
                return Err(EngineError::Load("out of memory".to_string()));
            }
            Ok(Box::new(FakeEngine {
                log: self.log.clone(),
                script: self.script.clone(),
            }))
        }
    }

    pub(crate) fn bundle(model_id: &str) -> ModelBundle {
        ModelBundle {
            model_id: model_id.to_string(),
            local_id: model_id.to_string(),
            quantization: None,
            weights_dir: PathBuf::from("/nonexistent/weights"),
            library_path: PathBuf::from("/nonexistent/lib.so"),
            config: Default::default(),
        }
    }

    fn fake_session(log: &Arc<EngineLog>) -> EngineSession {
        EngineSession::new(
            "m",
            Box::new(FakeEngine {
                log: log.clone(),
                script: Script::Reply(vec![]),
            }),
        )
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_session() {
        let factory = Arc::new(FakeFactory::new(Script::Reply(vec!["hi"])));
        let manager = SessionManager::new(factory.clone());

        let a = manager.get_or_create(&bundle("m")).await.unwrap();
        let b = manager.get_or_create(&bundle("m")).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.opens.load(Ordering::SeqCst), 1);
        assert_eq!(manager.loaded(), vec!["m"]);
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_loads_once() {
        let factory = Arc::new(FakeFactory::new(Script::Reply(vec![])));
        let manager = Arc::new(SessionManager::new(factory.clone()));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.get_or_create(&bundle("m")).await.unwrap() })
            })
            .collect();

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap());
        }
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
        assert_eq!(factory.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_models_get_different_sessions() {
        let factory = Arc::new(FakeFactory::new(Script::Reply(vec![])));
        let manager = SessionManager::new(factory.clone());

        let a = manager.get_or_create(&bundle("a")).await.unwrap();
        let b = manager.get_or_create(&bundle("b")).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(factory.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_load_is_engine_initialization_and_not_cached() {
        let mut factory = FakeFactory::new(Script::Reply(vec![]));
        factory.fail = true;
        let factory = Arc::new(factory);
        let manager = SessionManager::new(factory.clone());

        let err = manager.get_or_create(&bundle("m")).await.unwrap_err();
        assert!(matches!(
            err,
            MlcError::EngineInitialization { ref model_id, source: EngineError::Load(_) } if model_id == "m"
        ));
        assert!(manager.loaded().is_empty());

        let _ = manager.get_or_create(&bundle("m")).await;
        assert_eq!(factory.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reset_forces_reload() {
        let factory = Arc::new(FakeFactory::new(Script::Reply(vec![])));
        let manager = SessionManager::new(factory.clone());

        let a = manager.get_or_create(&bundle("m")).await.unwrap();
        assert!(manager.reset("m"));
        assert!(!manager.reset("m"));
        let b = manager.get_or_create(&bundle("m")).await.unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(factory.opens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_sync_history_applies_only_the_tail() {
        let log = Arc::new(EngineLog::default());
        let mut session = fake_session(&log);

        let first = vec![ConversationTurn::user("a"), ConversationTurn::assistant("b")];
        assert_eq!(session.sync_history(None, &first).unwrap(), 2);

        let mut second = first.clone();
        second.push(ConversationTurn::user("c"));
        second.push(ConversationTurn::assistant("d"));
        assert_eq!(session.sync_history(None, &second).unwrap(), 2);

        assert_eq!(log.applied(), second);
        assert_eq!(log.resets.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_sync_history_replays_on_divergence() {
        let log = Arc::new(EngineLog::default());
        let mut session = fake_session(&log);

        session
            .sync_history(None, &[ConversationTurn::user("a"), ConversationTurn::assistant("b")])
            .unwrap();
        let edited = vec![ConversationTurn::user("a"), ConversationTurn::assistant("B")];
        assert_eq!(session.sync_history(None, &edited).unwrap(), 2);

        assert_eq!(session.turns(), edited.as_slice());
        assert_eq!(log.resets.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_system_change_resets_and_system_turns_are_not_replayed() {
        let log = Arc::new(EngineLog::default());
        let mut session = fake_session(&log);

        let history = vec![
            ConversationTurn::system("be terse"),
            ConversationTurn::user("a"),
            ConversationTurn::assistant("b"),
        ];
        session.sync_history(Some("be terse"), &history).unwrap();
        assert_eq!(session.sync_history(Some("be terse"), &history).unwrap(), 0);
        assert_eq!(session.sync_history(Some("be verbose"), &history).unwrap(), 2);

        assert_eq!(session.system(), Some("be verbose"));
        assert_eq!(session.turns().len(), 2);
        assert_eq!(log.resets.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_commit_extends_log() {
        let log = Arc::new(EngineLog::default());
        let mut session = fake_session(&log);
        session.sync_history(None, &[]).unwrap();
        session.commit("q", "a").unwrap();

        assert_eq!(
            session.turns(),
            &[ConversationTurn::user("q"), ConversationTurn::assistant("a")]
        );
        assert_eq!(
            session
                .sync_history(None, &[ConversationTurn::user("q"), ConversationTurn::assistant("a")])
                .unwrap(),
            0
        );
    }
}
