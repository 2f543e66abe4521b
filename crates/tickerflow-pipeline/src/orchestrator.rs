//! Async orchestrator actor
//!
//! One tokio task owns the [`Pipeline`], the [`AutoChatTrigger`] and the chat
//! [`Transcript`]. It `select!`s over user commands and stage completions, so
//! every mutation happens on a single control flow. Stage calls run on their
//! own tasks and report back through an event channel; nothing they do can
//! touch the session directly.
//!
//! Each generation gets a child [`CancellationToken`] of the actor's root
//! token. With `cancel_superseded` enabled a new request cancels the previous
//! generation's token and its in-flight calls are dropped. The generation
//! guard in the reconciler still discards anything stale that gets through.

use crate::auto_chat::AutoChatTrigger;
use crate::chat::{ChatOrigin, ChatRequest, ChatTurn, Transcript};
use crate::config::PipelineConfig;
use crate::digest::build_digest;
use crate::error::{PipelineError, Result, ValidationError};
use crate::outcome::StageOutcome;
use crate::pipeline::{Dispatch, Pipeline, Reconciliation};
use crate::session::Generation;
use crate::snapshot::PipelineSnapshot;
use crate::stages::{
    DerivedIndicators, NarrativeTakeaways, RawMarketData, StageResult, StageSet,
};
use crate::subject::Subject;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

enum Command {
    Submit {
        subject: Subject,
        wants_auto_chat: bool,
        reply: oneshot::Sender<Generation>,
    },
    Chat {
        prompt: String,
        reply: oneshot::Sender<Result<()>>,
    },
    ClearTranscript {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

enum StageEvent {
    Fetched(StageOutcome<RawMarketData>),
    Derived(StageOutcome<DerivedIndicators>),
    Analyzed(StageOutcome<NarrativeTakeaways>),
    ChatReplied {
        epoch: u64,
        result: StageResult<String>,
    },
}

enum Step {
    Command(Command),
    Event(StageEvent),
    Stop,
}

/// The actor owning the session
pub struct Orchestrator {
    stages: StageSet,
    pipeline: Pipeline,
    trigger: AutoChatTrigger,
    transcript: Transcript,
    /// Bumped on every clear; replies started under an older epoch are not recorded
    transcript_epoch: u64,
    chat_pending: bool,
    cancel_superseded: bool,
    root_token: CancellationToken,
    generation_token: CancellationToken,
    command_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::UnboundedSender<StageEvent>,
    event_rx: mpsc::UnboundedReceiver<StageEvent>,
    snapshot_tx: watch::Sender<PipelineSnapshot>,
}

impl Orchestrator {
    /// Validate `config`, spawn the actor and return its handle
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: PipelineConfig, stages: StageSet) -> Result<OrchestratorHandle> {
        config.validate()?;

        let (command_tx, command_rx) = mpsc::channel(config.command_buffer);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(PipelineSnapshot::default());
        let root_token = CancellationToken::new();

        let actor = Self {
            stages,
            pipeline: Pipeline::new(),
            trigger: AutoChatTrigger::new(),
            transcript: Transcript::with_limit(config.transcript_limit),
            transcript_epoch: 0,
            chat_pending: false,
            cancel_superseded: config.cancel_superseded,
            generation_token: root_token.child_token(),
            root_token,
            command_rx,
            event_tx,
            event_rx,
            snapshot_tx,
        };

        tokio::spawn(actor.run());

        Ok(OrchestratorHandle {
            command_tx,
            snapshot_rx,
        })
    }

    async fn run(mut self) {
        info!(cancel_superseded = self.cancel_superseded, "Pipeline orchestrator started");

        loop {
            let step = tokio::select! {
                command = self.command_rx.recv() => command.map_or(Step::Stop, Step::Command),
                Some(event) = self.event_rx.recv() => Step::Event(event),
            };

            match step {
                Step::Command(Command::Shutdown) | Step::Stop => break,
                Step::Command(command) => self.handle_command(command),
                Step::Event(event) => {
                    self.handle_event(event);
                    self.after_mutation();
                }
            }
        }

        self.root_token.cancel();
        info!("Pipeline orchestrator stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit {
                subject,
                wants_auto_chat,
                reply,
            } => {
                let dispatch = self.pipeline.begin_request(subject, wants_auto_chat);
                if self.cancel_superseded {
                    self.generation_token.cancel();
                }
                self.generation_token = self.root_token.child_token();
                let generation = dispatch.generation();
                self.dispatch(dispatch);
                self.after_mutation();
                let _ = reply.send(generation);
            }
            Command::Chat { prompt, reply } => {
                if self.chat_pending {
                    let _ = reply.send(Err(PipelineError::ChatBusy));
                    return;
                }
                let session = self.pipeline.session();
                let request = ChatRequest::new(prompt, ChatOrigin::User)
                    .with_digest(build_digest(session))
                    .with_subject(session.subject().cloned());
                self.start_chat(request);
                self.after_mutation();
                let _ = reply.send(Ok(()));
            }
            Command::ClearTranscript { reply } => {
                self.transcript.clear();
                self.transcript_epoch += 1;
                debug!(
                    epoch = self.transcript_epoch,
                    chat_pending = self.chat_pending,
                    "Chat transcript cleared"
                );
                self.after_mutation();
                let _ = reply.send(());
            }
            Command::Shutdown => {}
        }
    }

    fn handle_event(&mut self, event: StageEvent) {
        let reconciliation = match event {
            StageEvent::Fetched(outcome) => self.pipeline.apply_fetch(outcome),
            StageEvent::Derived(outcome) => self.pipeline.apply_derive(outcome),
            StageEvent::Analyzed(outcome) => self.pipeline.apply_analyze(outcome),
            StageEvent::ChatReplied { epoch, result } => {
                self.finish_chat(epoch, result);
                return;
            }
        };

        if let Reconciliation::Applied {
            next: Some(dispatch),
            ..
        } = reconciliation
        {
            self.dispatch(dispatch);
        }
    }

    /// Run observers and publish the new state
    ///
    /// Commands publish before replying, so a caller that awaited a command
    /// always observes its effect in the next snapshot read.
    fn after_mutation(&mut self) {
        if let Some(request) = self
            .trigger
            .evaluate(self.pipeline.session_mut(), self.chat_pending)
        {
            self.start_chat(request);
        }
        self.snapshot_tx.send_replace(self.snapshot());
    }

    fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            session: self.pipeline.session().clone(),
            stats: self.pipeline.stats(),
            transcript: self.transcript.to_vec(),
            chat_pending: self.chat_pending,
        }
    }

    fn dispatch(&self, dispatch: Dispatch) {
        debug!(stage = %dispatch.stage(), generation = %dispatch.generation(), "Dispatching stage");
        match dispatch {
            Dispatch::Fetch {
                generation,
                subject,
            } => {
                let fetcher = Arc::clone(&self.stages.fetcher);
                self.spawn_stage(
                    generation,
                    subject,
                    move |subject| async move { fetcher.fetch(&subject).await },
                    StageEvent::Fetched,
                );
            }
            Dispatch::Derive {
                generation,
                subject,
                data,
            } => {
                let deriver = Arc::clone(&self.stages.deriver);
                self.spawn_stage(
                    generation,
                    subject,
                    move |subject| async move { deriver.derive(&data, &subject).await },
                    StageEvent::Derived,
                );
            }
            Dispatch::Analyze {
                generation,
                subject,
                data,
                derived,
            } => {
                let analyzer = Arc::clone(&self.stages.analyzer);
                self.spawn_stage(
                    generation,
                    subject,
                    move |subject| async move { analyzer.analyze(&data, &derived, &subject).await },
                    StageEvent::Analyzed,
                );
            }
        }
    }

    /// Run one stage call raced against the current generation's token
    fn spawn_stage<T, F, Fut>(
        &self,
        generation: Generation,
        subject: Subject,
        work: F,
        wrap: fn(StageOutcome<T>) -> StageEvent,
    ) where
        T: Send + 'static,
        F: FnOnce(Subject) -> Fut + Send + 'static,
        Fut: Future<Output = StageResult<T>> + Send + 'static,
    {
        let token = self.generation_token.clone();
        let events = self.event_tx.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                () = token.cancelled() => {
                    debug!(%generation, %subject, "Stage call cancelled");
                    return;
                }
                result = work(subject.clone()) => result,
            };
            let _ = events.send(wrap(StageOutcome::new(generation, subject, result)));
        });
    }

    fn start_chat(&mut self, request: ChatRequest) {
        let history = self.transcript.to_vec();
        self.transcript.push(ChatTurn::user(request.prompt.clone()));
        self.chat_pending = true;
        debug!(origin = ?request.origin, has_digest = request.digest.is_some(), "Starting chat turn");

        let chat = Arc::clone(&self.stages.chat);
        let token = self.root_token.clone();
        let events = self.event_tx.clone();
        let epoch = self.transcript_epoch;

        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                () = token.cancelled() => return,
                result = chat.respond(&request, &history) => result,
            };
            let _ = events.send(StageEvent::ChatReplied { epoch, result });
        });
    }

    /// Record a chat reply
    ///
    /// Usage is always folded. The turn is only appended when the transcript
    /// has not been cleared since the request started.
    fn finish_chat(&mut self, epoch: u64, result: StageResult<String>) {
        self.chat_pending = false;
        let current = epoch == self.transcript_epoch;
        let turn = match result {
            Ok(success) => {
                if let Some(usage) = &success.usage {
                    self.pipeline.fold_chat_usage(usage);
                }
                ChatTurn::assistant(success.payload, success.usage)
            }
            Err(err) => {
                warn!(error = %err, "Chat turn failed");
                ChatTurn::error(err.to_string())
            }
        };
        if current {
            self.transcript.push(turn);
        } else {
            debug!(
                epoch,
                current = self.transcript_epoch,
                "Dropping chat reply for a cleared transcript"
            );
        }
    }
}

/// Cloneable handle to a running orchestrator
#[derive(Clone)]
pub struct OrchestratorHandle {
    command_tx: mpsc::Sender<Command>,
    snapshot_rx: watch::Receiver<PipelineSnapshot>,
}

impl OrchestratorHandle {
    async fn send(&self, command: Command) -> Result<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| PipelineError::Shutdown)
    }

    /// Validate `raw` and start a new generation for it
    ///
    /// Returns the generation opened for the request.
    pub async fn submit_top_level_request(&self, raw: &str, wants_auto_chat: bool) -> Result<Generation> {
        let subject = Subject::parse(raw)?;
        let (reply, response) = oneshot::channel();
        self.send(Command::Submit {
            subject,
            wants_auto_chat,
            reply,
        })
        .await?;
        response.await.map_err(|_| PipelineError::Shutdown)
    }

    /// Submit a user chat turn
    ///
    /// Fails with [`PipelineError::ChatBusy`] while another turn is pending.
    pub async fn submit_chat_turn(&self, prompt: &str) -> Result<()> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(ValidationError::EmptyPrompt.into());
        }
        let (reply, response) = oneshot::channel();
        self.send(Command::Chat {
            prompt: prompt.to_string(),
            reply,
        })
        .await?;
        response.await.map_err(|_| PipelineError::Shutdown)?
    }

    /// Drop every transcript turn
    ///
    /// A reply still in flight is billed but not recorded.
    pub async fn clear_chat_transcript(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.send(Command::ClearTranscript { reply }).await?;
        response.await.map_err(|_| PipelineError::Shutdown)
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> PipelineSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Receiver notified after every mutation
    pub fn subscribe(&self) -> watch::Receiver<PipelineSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Wait for the first snapshot matching `predicate`
    pub async fn wait_until<F>(&self, predicate: F) -> Result<PipelineSnapshot>
    where
        F: Fn(&PipelineSnapshot) -> bool,
    {
        let mut rx = self.snapshot_rx.clone();
        let snapshot = rx
            .wait_for(|snapshot| predicate(snapshot))
            .await
            .map_err(|_| PipelineError::Shutdown)?;
        Ok(snapshot.clone())
    }

    /// Stop the actor and cancel every in-flight stage call
    pub async fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Sender;
    use crate::error::StageError;
    use crate::session::PipelineStage;
    use crate::stages::{
        MockChatResponder, MockIndicatorDeriver, MockMarketDataFetcher, MockNarrativeAnalyzer,
        StageKind, StageSuccess,
    };
    use crate::test_support::{sample_derived, sample_market_data, sample_takeaways, test_pricing};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::assert_err;

    struct Counters {
        fetch: Arc<AtomicUsize>,
        derive: Arc<AtomicUsize>,
        analyze: Arc<AtomicUsize>,
        chat: Arc<AtomicUsize>,
    }

    fn counted_stages(fetch_fails: bool) -> (StageSet, Counters) {
        let counters = Counters {
            fetch: Arc::new(AtomicUsize::new(0)),
            derive: Arc::new(AtomicUsize::new(0)),
            analyze: Arc::new(AtomicUsize::new(0)),
            chat: Arc::new(AtomicUsize::new(0)),
        };
        let pricing = test_pricing();

        let mut fetcher = MockMarketDataFetcher::new();
        let calls = Arc::clone(&counters.fetch);
        let usage = pricing.price(StageKind::Fetch, 100, 50);
        fetcher.expect_fetch().returning(move |subject| {
            calls.fetch_add(1, Ordering::SeqCst);
            if fetch_fails {
                Err(StageError::remote("connection refused"))
            } else {
                Ok(StageSuccess::new(sample_market_data(subject.as_str())).with_usage(usage))
            }
        });

        let mut deriver = MockIndicatorDeriver::new();
        let calls = Arc::clone(&counters.derive);
        let usage = pricing.price(StageKind::Derive, 80, 40);
        deriver.expect_derive().returning(move |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(StageSuccess::new(sample_derived()).with_usage(usage))
        });

        let mut analyzer = MockNarrativeAnalyzer::new();
        let calls = Arc::clone(&counters.analyze);
        let usage = pricing.price(StageKind::Analyze, 500, 300);
        analyzer.expect_analyze().returning(move |_, _, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(StageSuccess::new(sample_takeaways()).with_usage(usage))
        });

        let mut chat = MockChatResponder::new();
        let calls = Arc::clone(&counters.chat);
        let usage = pricing.price(StageKind::Chat, 10, 10);
        chat.expect_respond().returning(move |request, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            let reply = match &request.digest {
                Some(_) => "Here is the full picture.",
                None => "General answer.",
            };
            Ok(StageSuccess::new(reply.to_string()).with_usage(usage))
        });

        let stages = StageSet::new(
            Arc::new(fetcher),
            Arc::new(deriver),
            Arc::new(analyzer),
            Arc::new(chat),
        );
        (stages, counters)
    }

    fn settled(snapshot: &PipelineSnapshot) -> bool {
        snapshot.session.stage().is_terminal() && !snapshot.chat_pending
    }

    #[tokio::test]
    async fn test_complete_run_with_auto_chat() {
        let (stages, counters) = counted_stages(false);
        let handle = Orchestrator::spawn(PipelineConfig::default(), stages).unwrap();

        let generation = handle.submit_top_level_request("aapl", true).await.unwrap();
        assert_eq!(generation.value(), 1);

        let snapshot = handle
            .wait_until(|s| settled(s) && s.transcript.len() == 2)
            .await
            .unwrap();

        assert_eq!(snapshot.session.stage(), PipelineStage::Complete);
        assert_eq!(snapshot.stats.call_count, 4);
        assert_eq!(snapshot.transcript[1].text, "Here is the full picture.");
        assert_eq!(counters.chat.load(Ordering::SeqCst), 1);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_fetch_failure_short_circuits() {
        let (stages, counters) = counted_stages(true);
        let handle = Orchestrator::spawn(PipelineConfig::default(), stages).unwrap();

        handle.submit_top_level_request("AAPL", true).await.unwrap();
        let snapshot = handle.wait_until(settled).await.unwrap();

        assert_eq!(snapshot.session.stage(), PipelineStage::FetchFailed);
        assert_eq!(
            snapshot.session.failure().unwrap().to_string(),
            "Fetch failed for AAPL: Remote call failed: connection refused"
        );
        assert!(!snapshot.session.wants_auto_chat());
        assert_eq!(counters.fetch.load(Ordering::SeqCst), 1);
        assert_eq!(counters.derive.load(Ordering::SeqCst), 0);
        assert_eq!(counters.analyze.load(Ordering::SeqCst), 0);
        assert_eq!(counters.chat.load(Ordering::SeqCst), 0);
        assert!(snapshot.transcript.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_subject_starts_nothing() {
        let (stages, counters) = counted_stages(false);
        let handle = Orchestrator::spawn(PipelineConfig::default(), stages).unwrap();

        let err = assert_err!(handle.submit_top_level_request("  ", false).await);
        assert!(matches!(err, PipelineError::Validation(ValidationError::EmptySubject)));
        let err = assert_err!(handle.submit_chat_turn("   ").await);
        assert!(matches!(err, PipelineError::Validation(ValidationError::EmptyPrompt)));

        assert_eq!(handle.snapshot().session.generation(), Generation::INITIAL);
        assert_eq!(counters.fetch.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_chat_without_analysis_has_no_digest() {
        let (stages, _counters) = counted_stages(false);
        let handle = Orchestrator::spawn(PipelineConfig::default(), stages).unwrap();

        handle.submit_chat_turn("What is a pivot point?").await.unwrap();
        let snapshot = handle
            .wait_until(|s| !s.chat_pending && s.transcript.len() == 2)
            .await
            .unwrap();

        assert_eq!(snapshot.transcript[0].text, "What is a pivot point?");
        assert_eq!(snapshot.transcript[1].text, "General answer.");
        assert_eq!(snapshot.stats.call_count, 1);
        assert_eq!(snapshot.session.stage(), PipelineStage::Idle);
    }

    #[tokio::test]
    async fn test_clear_transcript() {
        let (stages, _counters) = counted_stages(false);
        let handle = Orchestrator::spawn(PipelineConfig::default(), stages).unwrap();

        handle.submit_chat_turn("hello").await.unwrap();
        handle
            .wait_until(|s| !s.chat_pending && s.transcript.len() == 2)
            .await
            .unwrap();

        handle.clear_chat_transcript().await.unwrap();
        let snapshot = handle.snapshot();
        assert!(snapshot.transcript.is_empty());
        assert_eq!(snapshot.stats.call_count, 1);
    }

    #[tokio::test]
    async fn test_failed_chat_turn_is_recorded() {
        let (mut stages, _counters) = counted_stages(false);
        let histories: Arc<std::sync::Mutex<Vec<Vec<ChatTurn>>>> = Arc::default();

        let mut chat = MockChatResponder::new();
        let seen = Arc::clone(&histories);
        let usage = test_pricing().price(StageKind::Chat, 10, 10);
        chat.expect_respond().returning(move |_, history| {
            let mut seen = seen.lock().unwrap();
            seen.push(history.to_vec());
            if seen.len() == 1 {
                Err(StageError::remote("upstream timeout"))
            } else {
                Ok(StageSuccess::new("Second try worked.".to_string()).with_usage(usage))
            }
        });
        stages.chat = Arc::new(chat);
        let handle = Orchestrator::spawn(PipelineConfig::default(), stages).unwrap();

        handle.submit_chat_turn("first question").await.unwrap();
        let snapshot = handle
            .wait_until(|s| !s.chat_pending && s.transcript.len() == 2)
            .await
            .unwrap();

        assert_eq!(snapshot.transcript[0].sender, Sender::User);
        assert!(!snapshot.transcript[0].is_error);
        assert_eq!(snapshot.transcript[1].sender, Sender::Assistant);
        assert!(snapshot.transcript[1].is_error);
        assert!(snapshot.transcript[1].text.contains("upstream timeout"));
        assert_eq!(snapshot.stats.call_count, 0);

        // The failure does not block the next turn
        handle.submit_chat_turn("second question").await.unwrap();
        let snapshot = handle
            .wait_until(|s| !s.chat_pending && s.transcript.len() == 4)
            .await
            .unwrap();

        assert!(!snapshot.transcript[3].is_error);
        assert_eq!(snapshot.transcript[3].text, "Second try worked.");
        assert_eq!(snapshot.stats.call_count, 1);

        let histories = histories.lock().unwrap();
        assert_eq!(histories.len(), 2);
        assert!(histories[0].is_empty());
        assert_eq!(histories[1].len(), 2);
        let messages = Transcript::history(&histories[1]);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text(), "first question");

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let (stages, _counters) = counted_stages(false);
        let config = PipelineConfig {
            command_buffer: 0,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            Orchestrator::spawn(config, stages),
            Err(PipelineError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_commands_after_shutdown_fail() {
        let (stages, _counters) = counted_stages(false);
        let handle = Orchestrator::spawn(PipelineConfig::default(), stages).unwrap();
        handle.shutdown().await.unwrap();

        let err = handle
            .wait_until(|_| false)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Shutdown));
        assert!(matches!(
            handle.submit_top_level_request("AAPL", false).await,
            Err(PipelineError::Shutdown)
        ));
    }
}
