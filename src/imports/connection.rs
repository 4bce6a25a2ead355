//! Import Connection Handler
//!
//! Routes commands from the imports UI to the progress manager and reports
//! progress back over the same connection. Owns the job configuration and
//! the durable in-progress flag.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{BackgroundError, ImportError};
use crate::imports::{
    ImportItemProcessor, ImportProgressFlag, ImportStateManager, ProgressManager, ProgressObserver,
};
use crate::telemetry::{log_error, BackgroundMetrics};
use crate::types::{
    AllowTypes, ImportCommand, ImportConfig, ImportOptions, InboundMessage, ItemResult,
    OutboundMessage, RecalcPayload, StartPayload,
};

/// Outbound side of the UI connection.
#[async_trait]
pub trait MessagePort: Send + Sync {
    async fn post_message(&self, message: OutboundMessage) -> Result<(), BackgroundError>;
}

/// [`MessagePort`] backed by an unbounded tokio channel.
#[derive(Clone)]
pub struct ChannelPort {
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl ChannelPort {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl MessagePort for ChannelPort {
    async fn post_message(&self, message: OutboundMessage) -> Result<(), BackgroundError> {
        self.tx
            .send(message)
            .map_err(|_| ImportError::PortClosed.into())
    }
}

/// Connection state as seen by the UI.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    EstimatingOrInit,
    Running,
    Paused,
    Completed,
}

/// Job configuration owned by the handler.
#[derive(Clone, Debug)]
pub struct ImportJobState {
    pub concurrency: usize,
    pub allow_types: AllowTypes,
    pub options: ImportOptions,
    pub include_errors: bool,
}

/// Collaborators of an import connection.
#[derive(Clone)]
pub struct ImportServices {
    pub state_manager: Arc<dyn ImportStateManager>,
    pub processor: Arc<dyn ImportItemProcessor>,
    pub flag: ImportProgressFlag,
    pub metrics: Option<Arc<BackgroundMetrics>>,
}

/// State shared with the progress manager through its observer.
struct ConnectionShared {
    port: Arc<dyn MessagePort>,
    flag: ImportProgressFlag,
    state: Mutex<ConnectionState>,
    /// Held for every flag write. Holds the id of the run the UI follows.
    active_run: tokio::sync::Mutex<u64>,
}

impl ConnectionShared {
    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: ConnectionState) {
        self.transition(next, |_| true);
    }

    /// Move to `next` only when the current state satisfies `from`.
    fn transition(&self, next: ConnectionState, from: impl Fn(ConnectionState) -> bool) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !from(*state) {
            return false;
        }
        if *state != next {
            debug!(from = ?*state, to = ?next, "Import connection state change");
            *state = next;
        }
        true
    }

    async fn post(&self, message: OutboundMessage) {
        if let Err(e) = self.port.post_message(message).await {
            warn!(error = %e, "Dropping message for disconnected imports UI");
        }
    }
}

#[async_trait]
impl ProgressObserver for ConnectionShared {
    async fn next(&self, result: ItemResult) {
        self.post(OutboundMessage::Next(result)).await;
    }

    async fn complete(&self, run: u64) {
        let active = self.active_run.lock().await;
        if *active != run {
            debug!(run, active = *active, "Ignoring completion of a superseded run");
            return;
        }

        if let Err(e) = self.flag.clear().await {
            log_error(&e, "Clearing import progress flag on completion");
        }
        self.set_state(ConnectionState::Completed);
        self.post(OutboundMessage::Complete).await;
    }
}

/// Stateful command router for one imports UI connection.
pub struct ImportConnectionHandler {
    shared: Arc<ConnectionShared>,
    engine: ProgressManager,
    state_manager: Arc<dyn ImportStateManager>,
    job: ImportJobState,
    quick_mode: bool,
    metrics: Option<Arc<BackgroundMetrics>>,
}

impl ImportConnectionHandler {
    /// Attach to a UI connection and bring it up to date.
    ///
    /// When a previous run is still flagged as in progress the UI is told to
    /// show it paused; the run is not resumed automatically. Otherwise fresh
    /// estimates are posted.
    pub async fn connect(
        port: Arc<dyn MessagePort>,
        services: ImportServices,
        config: ImportConfig,
    ) -> Result<Self, BackgroundError> {
        let shared = Arc::new(ConnectionShared {
            port,
            flag: services.flag,
            state: Mutex::new(ConnectionState::Idle),
            active_run: tokio::sync::Mutex::new(0),
        });

        let mut engine = ProgressManager::new(
            services.state_manager.clone(),
            services.processor,
            shared.clone(),
            config.concurrency,
        );
        if let Some(metrics) = &services.metrics {
            engine = engine.with_metrics(metrics.clone());
        }

        let handler = Self {
            job: ImportJobState {
                concurrency: engine.concurrency(),
                allow_types: AllowTypes::default(),
                options: ImportOptions::default(),
                include_errors: false,
            },
            shared,
            engine,
            state_manager: services.state_manager,
            quick_mode: config.quick_mode,
            metrics: services.metrics,
        };

        handler.rehydrate().await?;
        Ok(handler)
    }

    async fn rehydrate(&self) -> Result<(), BackgroundError> {
        if self.shared.flag.is_set().await? {
            info!("Import in progress from an earlier connection; showing it paused");
            self.shared.post(OutboundMessage::Pause).await;
            self.shared.set_state(ConnectionState::Paused);
        } else {
            self.shared.set_state(ConnectionState::EstimatingOrInit);
            self.post_estimates(None).await?;
            self.shared.set_state(ConnectionState::Idle);
        }
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn job(&self) -> &ImportJobState {
        &self.job
    }

    pub fn engine(&self) -> &ProgressManager {
        &self.engine
    }

    pub fn quick_mode(&self) -> bool {
        self.quick_mode
    }

    /// Read the durable in-progress flag.
    pub async fn is_import_in_progress(&self) -> Result<bool, BackgroundError> {
        self.shared.flag.is_set().await
    }

    /// Decode and apply one inbound message.
    ///
    /// Unknown commands and malformed payloads are logged and ignored.
    pub async fn handle_message(&mut self, message: InboundMessage) -> Result<(), BackgroundError> {
        match ImportCommand::from_message(message) {
            Ok(command) => self.handle_command(command).await,
            Err(e) => {
                error!(error = %e, "Ignoring imports UI message");
                if let Some(metrics) = &self.metrics {
                    metrics.record_unknown_command();
                }
                Ok(())
            }
        }
    }

    pub async fn handle_command(&mut self, command: ImportCommand) -> Result<(), BackgroundError> {
        debug!(cmd = command.name(), state = ?self.state(), "Handling import command");

        match command {
            ImportCommand::Start(payload) => self.start_import(payload).await,
            ImportCommand::Resume => {
                let shared = self.shared.clone();
                let mut active = shared.active_run.lock().await;
                shared.set_state(ConnectionState::Running);
                *active = self.engine.start();
                Ok(())
            }
            ImportCommand::Pause => {
                let _active = self.shared.active_run.lock().await;
                self.engine.stop();
                self.shared
                    .transition(ConnectionState::Paused, |s| s != ConnectionState::Completed);
                Ok(())
            }
            ImportCommand::Cancel => self.cancel_import().await,
            ImportCommand::Finish => self.finish_import().await,
            ImportCommand::Recalc(RecalcPayload {
                allow_types,
                blob_url,
            }) => self.recalc(allow_types, blob_url.as_deref()).await,
            ImportCommand::SetConcurrency(concurrency) => {
                self.job.concurrency = self.engine.set_concurrency(concurrency);
                Ok(())
            }
            ImportCommand::SetProcessErrs(include) => {
                self.job.include_errors = include;
                self.engine.set_include_errors(include);
                self.recalc(None, None).await
            }
        }
    }

    /// Drain inbound messages until the UI disconnects.
    pub async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<InboundMessage>) {
        while let Some(message) = inbound.recv().await {
            let cmd = message.cmd.clone();
            if let Err(e) = self.handle_message(message).await {
                log_error(&e, &format!("Handling {} command", cmd));
            }
        }
        self.disconnect();
    }

    /// UI went away: stop dispatching, keep the in-progress flag.
    pub fn disconnect(&mut self) {
        info!("Imports UI disconnected");
        self.engine.stop();
        self.shared.transition(ConnectionState::Paused, |s| {
            matches!(s, ConnectionState::Running | ConnectionState::EstimatingOrInit)
        });
    }

    async fn start_import(&mut self, payload: StartPayload) -> Result<(), BackgroundError> {
        let StartPayload {
            allow_types,
            blob_url,
            options,
        } = payload;

        let shared = self.shared.clone();
        let mut active = shared.active_run.lock().await;

        self.state_manager.set_allow_types(allow_types.clone()).await;
        self.state_manager.set_options(options.clone()).await;
        self.job.allow_types = allow_types;
        self.job.options = options;

        if !shared.flag.is_set().await? {
            shared.set_state(ConnectionState::EstimatingOrInit);
            self.state_manager
                .fetch_estimates(blob_url.as_deref(), self.quick_mode, self.job.include_errors)
                .await?;
        }

        shared.post(OutboundMessage::Start).await;
        shared.flag.set().await?;
        shared.set_state(ConnectionState::Running);
        *active = self.engine.start();
        info!(run = *active, allow_types = ?self.job.allow_types, "Import started");
        Ok(())
    }

    async fn cancel_import(&mut self) -> Result<(), BackgroundError> {
        self.engine.stop();
        // A completing run takes the lock on its way out, so drain first.
        self.engine.wait_idle().await;

        let _active = self.shared.active_run.lock().await;
        self.shared.flag.clear().await?;

        if self
            .shared
            .transition(ConnectionState::Completed, |s| s != ConnectionState::Completed)
        {
            self.shared.post(OutboundMessage::Complete).await;
        }
        info!("Import cancelled");
        Ok(())
    }

    async fn finish_import(&mut self) -> Result<(), BackgroundError> {
        let shared = self.shared.clone();
        let _active = shared.active_run.lock().await;
        shared.flag.clear().await?;
        self.post_estimates(None).await?;
        self.shared.set_state(ConnectionState::Idle);
        Ok(())
    }

    async fn recalc(
        &mut self,
        allow_types: Option<AllowTypes>,
        blob_url: Option<&str>,
    ) -> Result<(), BackgroundError> {
        self.state_manager.dirty_estimates_cache().await;
        if let Some(allow_types) = allow_types {
            self.state_manager.set_allow_types(allow_types.clone()).await;
            self.job.allow_types = allow_types;
        }
        self.post_estimates(blob_url).await
    }

    async fn post_estimates(&self, blob_url: Option<&str>) -> Result<(), BackgroundError> {
        let estimates = self
            .state_manager
            .fetch_estimates(blob_url, self.quick_mode, self.job.include_errors)
            .await?;
        self.shared.post(OutboundMessage::Init(estimates)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{InMemoryKeyValueStore, KeyValueStore};
    use crate::imports::{InMemoryImportStateManager, MockItemProcessor};
    use crate::types::{cmds, ImportItem, ImportType};
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        store: Arc<dyn KeyValueStore>,
        state: Arc<InMemoryImportStateManager>,
        processor: Arc<MockItemProcessor>,
        metrics: Arc<BackgroundMetrics>,
    }

    impl Fixture {
        fn new(items: usize) -> Self {
            Self::with_processor(items, MockItemProcessor::new())
        }

        /// Items take long enough to still be in flight when the next command lands.
        fn slow(items: usize) -> Self {
            Self::with_processor(
                items,
                MockItemProcessor::new().with_delay(Duration::from_millis(200)),
            )
        }

        fn with_processor(items: usize, processor: MockItemProcessor) -> Self {
            let state = Arc::new(InMemoryImportStateManager::new());
            state.add_items((0..items).map(|i| {
                ImportItem::new(i.to_string(), format!("https://example.com/{}", i), ImportType::History)
            }));
            Self {
                store: Arc::new(InMemoryKeyValueStore::new()),
                state,
                processor: Arc::new(processor),
                metrics: Arc::new(BackgroundMetrics::new()),
            }
        }

        fn services(&self) -> ImportServices {
            ImportServices {
                state_manager: self.state.clone(),
                processor: self.processor.clone(),
                flag: ImportProgressFlag::new(self.store.clone()),
                metrics: Some(self.metrics.clone()),
            }
        }

        async fn connect(
            &self,
        ) -> (
            ImportConnectionHandler,
            mpsc::UnboundedReceiver<OutboundMessage>,
        ) {
            let (port, rx) = ChannelPort::new();
            let handler =
                ImportConnectionHandler::connect(Arc::new(port), self.services(), ImportConfig::default())
                    .await
                    .unwrap();
            (handler, rx)
        }
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<OutboundMessage>) -> OutboundMessage {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for outbound message")
            .expect("port closed")
    }

    async fn wait_for_dispatch(handler: &ImportConnectionHandler) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while handler.engine().in_flight() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("no item was dispatched");
    }

    fn start_message() -> InboundMessage {
        InboundMessage::new(
            cmds::START,
            json!({"allowTypes": {"h": true, "b": true, "o": true}}),
        )
    }

    #[tokio::test]
    async fn test_connect_posts_init_when_idle() {
        let fixture = Fixture::new(2);
        let (handler, mut rx) = fixture.connect().await;

        match recv(&mut rx).await {
            OutboundMessage::Init(estimates) => assert_eq!(estimates.total_remaining(), 2),
            other => panic!("unexpected message {:?}", other),
        }
        assert_eq!(handler.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_connect_posts_pause_when_flagged() {
        let fixture = Fixture::new(2);
        ImportProgressFlag::new(fixture.store.clone()).set().await.unwrap();

        let (handler, mut rx) = fixture.connect().await;
        assert_eq!(recv(&mut rx).await, OutboundMessage::Pause);
        assert_eq!(handler.state(), ConnectionState::Paused);
        assert!(!handler.engine().is_running());
    }

    #[tokio::test]
    async fn test_start_runs_to_completion_and_clears_flag() {
        let fixture = Fixture::new(3);
        let (mut handler, mut rx) = fixture.connect().await;
        recv(&mut rx).await;

        handler.handle_message(start_message()).await.unwrap();
        assert_eq!(recv(&mut rx).await, OutboundMessage::Start);

        let mut next = 0;
        loop {
            match recv(&mut rx).await {
                OutboundMessage::Next(_) => next += 1,
                OutboundMessage::Complete => break,
                other => panic!("unexpected message {:?}", other),
            }
        }

        assert_eq!(next, 3);
        assert_eq!(handler.state(), ConnectionState::Completed);
        assert!(!handler.is_import_in_progress().await.unwrap());
        assert!(handler.job().allow_types.allows(ImportType::Bookmark));
    }

    #[tokio::test]
    async fn test_cancel_drains_clears_flag_and_posts_complete() {
        let fixture = Fixture::slow(3);
        let (mut handler, mut rx) = fixture.connect().await;
        recv(&mut rx).await;

        handler.handle_message(start_message()).await.unwrap();
        assert_eq!(recv(&mut rx).await, OutboundMessage::Start);
        assert!(handler.is_import_in_progress().await.unwrap());
        wait_for_dispatch(&handler).await;

        handler.handle_command(ImportCommand::Cancel).await.unwrap();
        assert_eq!(handler.engine().in_flight(), 0);
        assert!(matches!(recv(&mut rx).await, OutboundMessage::Next(_)));
        assert_eq!(recv(&mut rx).await, OutboundMessage::Complete);
        assert_eq!(handler.state(), ConnectionState::Completed);
        assert!(!handler.is_import_in_progress().await.unwrap());
        assert_eq!(fixture.processor.process_count(), 1);

        // A second cancel after completion posts nothing more.
        handler.handle_command(ImportCommand::Cancel).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_finish_clears_flag_and_posts_init() {
        let fixture = Fixture::new(1);
        ImportProgressFlag::new(fixture.store.clone()).set().await.unwrap();
        let (mut handler, mut rx) = fixture.connect().await;
        assert_eq!(recv(&mut rx).await, OutboundMessage::Pause);

        handler.handle_command(ImportCommand::Finish).await.unwrap();
        assert!(matches!(recv(&mut rx).await, OutboundMessage::Init(_)));
        assert_eq!(handler.state(), ConnectionState::Idle);
        assert!(!handler.is_import_in_progress().await.unwrap());
    }

    #[tokio::test]
    async fn test_recalc_keeps_allow_types_when_absent() {
        let fixture = Fixture::new(1);
        let (mut handler, mut rx) = fixture.connect().await;
        recv(&mut rx).await;

        handler
            .handle_message(InboundMessage::new(
                cmds::RECALC,
                json!({"allowTypes": {"h": true, "b": false, "o": false}}),
            ))
            .await
            .unwrap();
        assert!(matches!(recv(&mut rx).await, OutboundMessage::Init(_)));
        assert!(fixture.state.allow_types().allows(ImportType::History));

        handler
            .handle_message(InboundMessage::new(cmds::RECALC, json!(null)))
            .await
            .unwrap();
        assert!(matches!(recv(&mut rx).await, OutboundMessage::Init(_)));
        assert!(fixture.state.allow_types().allows(ImportType::History));
        assert!(!fixture.state.allow_types().allows(ImportType::Bookmark));
        assert_eq!(handler.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_set_concurrency_and_process_errs() {
        let fixture = Fixture::new(1);
        let (mut handler, mut rx) = fixture.connect().await;
        recv(&mut rx).await;

        handler
            .handle_message(InboundMessage::new(cmds::SET_CONCURRENCY, json!(5)))
            .await
            .unwrap();
        assert_eq!(handler.job().concurrency, 5);
        assert_eq!(handler.engine().concurrency(), 5);

        handler
            .handle_message(InboundMessage::new(cmds::SET_PROCESS_ERRS, json!(true)))
            .await
            .unwrap();
        assert!(handler.job().include_errors);
        assert!(handler.engine().include_errors());
        assert!(matches!(recv(&mut rx).await, OutboundMessage::Init(_)));
    }

    #[tokio::test]
    async fn test_unknown_command_is_ignored() {
        let fixture = Fixture::new(1);
        let (mut handler, mut rx) = fixture.connect().await;
        recv(&mut rx).await;

        handler
            .handle_message(InboundMessage::new("DANCE", json!(null)))
            .await
            .unwrap();
        handler
            .handle_message(InboundMessage::new(cmds::SET_CONCURRENCY, json!("many")))
            .await
            .unwrap();

        assert_eq!(handler.state(), ConnectionState::Idle);
        assert_eq!(handler.job().concurrency, 1);
        assert_eq!(fixture.metrics.snapshot().unknown_commands, 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_completed_state_survives_fast_run_on_worker_threads() {
        for _ in 0..100 {
            let fixture = Fixture::new(0);
            let (mut handler, mut rx) = fixture.connect().await;
            assert!(matches!(recv(&mut rx).await, OutboundMessage::Init(_)));

            handler.handle_message(start_message()).await.unwrap();
            assert_eq!(recv(&mut rx).await, OutboundMessage::Start);
            assert_eq!(recv(&mut rx).await, OutboundMessage::Complete);
            handler.engine().wait_idle().await;
            assert_eq!(handler.state(), ConnectionState::Completed);

            handler.handle_command(ImportCommand::Cancel).await.unwrap();
            assert!(rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn test_superseded_completion_leaves_new_run_alone() {
        let fixture = Fixture::slow(2);
        let (mut handler, mut rx) = fixture.connect().await;
        recv(&mut rx).await;

        handler.handle_message(start_message()).await.unwrap();
        assert_eq!(recv(&mut rx).await, OutboundMessage::Start);
        let run = *handler.shared.active_run.lock().await;

        // Completion of the previous run arriving after the new START.
        handler.shared.complete(run - 1).await;

        assert_eq!(handler.state(), ConnectionState::Running);
        assert!(handler.is_import_in_progress().await.unwrap());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_pause_after_completion_keeps_completed() {
        let fixture = Fixture::new(0);
        let (mut handler, mut rx) = fixture.connect().await;
        recv(&mut rx).await;

        handler.handle_message(start_message()).await.unwrap();
        assert_eq!(recv(&mut rx).await, OutboundMessage::Start);
        assert_eq!(recv(&mut rx).await, OutboundMessage::Complete);

        handler.handle_command(ImportCommand::Pause).await.unwrap();
        assert_eq!(handler.state(), ConnectionState::Completed);
    }

    #[tokio::test]
    async fn test_disconnect_stops_engine_and_keeps_flag() {
        let fixture = Fixture::slow(2);
        let (mut handler, mut rx) = fixture.connect().await;
        recv(&mut rx).await;

        handler.handle_message(start_message()).await.unwrap();
        assert_eq!(recv(&mut rx).await, OutboundMessage::Start);
        assert_eq!(handler.state(), ConnectionState::Running);
        wait_for_dispatch(&handler).await;

        handler.disconnect();
        assert!(!handler.engine().is_running());
        assert_eq!(handler.state(), ConnectionState::Paused);
        assert!(handler.is_import_in_progress().await.unwrap());
    }
}
