//! Turn orchestrator: drives microphone frames through wake gating,
//! utterance capture, transcription, the language model, and speech
//! output as a single synchronous state machine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audio::FrameSource;
use crate::config::ConfigStore;
use crate::error::Result;
use crate::history::{ConversationStore, Turn};
use crate::llm::{FALLBACK_REPLY, LlmRequest, QueryLlm, RETRY_BACKOFF, ask_with_retry};
use crate::speech::SpeechQueue;
use crate::stt::Transcribe;
use crate::utterance::{CaptureStatus, Utterance, UtteranceCapturer};
use crate::vad::VoiceActivity;
use crate::wakeword::{DetectionResult, WakeDetector, WakeGate};

/// Where the pipeline currently is in a turn.
pub enum PipelineState {
    /// Assistant disabled: frames are drained and discarded.
    Idle,
    /// Listening for the wake word.
    Armed,
    /// Wake word heard; collecting the utterance.
    Capturing(UtteranceCapturer),
    /// Utterance complete; awaiting transcription.
    Transcribing(Utterance),
    /// Transcript ready; querying the language model.
    Querying(String),
    /// Reply ready; handing it to the speech queue.
    Speaking(String),
}

impl PipelineState {
    /// Short name for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Armed => "armed",
            Self::Capturing(_) => "capturing",
            Self::Transcribing(_) => "transcribing",
            Self::Querying(_) => "querying",
            Self::Speaking(_) => "speaking",
        }
    }
}

/// Shared services the orchestrator reads and writes during a turn.
pub struct PipelineContext {
    pub config: ConfigStore,
    pub history: Arc<ConversationStore>,
    pub speech: SpeechQueue,
    pub stop: Arc<AtomicBool>,
}

/// The turn state machine. Generic over its stages so tests can drive it
/// with scripted fakes.
pub struct Pipeline<S, D, V, T, L>
where
    S: FrameSource,
    D: WakeDetector,
    V: VoiceActivity,
    T: Transcribe,
    L: QueryLlm,
{
    frames: S,
    gate: WakeGate<D>,
    vad: V,
    transcriber: T,
    llm: L,
    ctx: PipelineContext,
    state: PipelineState,
    turn_id: Option<Uuid>,
}

impl<S, D, V, T, L> Pipeline<S, D, V, T, L>
where
    S: FrameSource,
    D: WakeDetector,
    V: VoiceActivity,
    T: Transcribe,
    L: QueryLlm,
{
    pub fn new(
        frames: S,
        gate: WakeGate<D>,
        vad: V,
        transcriber: T,
        llm: L,
        ctx: PipelineContext,
    ) -> Self {
        Self {
            frames,
            gate,
            vad,
            transcriber,
            llm,
            ctx,
            state: PipelineState::Idle,
            turn_id: None,
        }
    }

    /// Run until the stop flag is set or the audio device fails.
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` or `DeviceLost` when the frame source
    /// fails; every other stage failure is absorbed and logged.
    pub fn run(&mut self) -> Result<()> {
        info!("pipeline started");
        while !self.ctx.stop.load(Ordering::Relaxed) {
            self.step()?;
        }
        info!("pipeline stopped");
        Ok(())
    }

    /// Advance the state machine by one transition.
    fn step(&mut self) -> Result<()> {
        let state = std::mem::replace(&mut self.state, PipelineState::Idle);
        self.state = match state {
            PipelineState::Idle => self.step_idle()?,
            PipelineState::Armed => self.step_armed()?,
            PipelineState::Capturing(capturer) => self.step_capturing(capturer)?,
            PipelineState::Transcribing(utterance) => self.step_transcribing(&utterance),
            PipelineState::Querying(prompt) => self.step_querying(&prompt),
            PipelineState::Speaking(reply) => self.step_speaking(reply),
        };
        Ok(())
    }

    /// Disabled: keep the device flowing but discard every frame without
    /// feeding the detector.
    fn step_idle(&mut self) -> Result<PipelineState> {
        if self.ctx.config.get().enabled {
            info!("assistant enabled, arming wake gate");
            return Ok(PipelineState::Armed);
        }
        let _ = self.frames.next_frame()?;
        Ok(PipelineState::Idle)
    }

    fn step_armed(&mut self) -> Result<PipelineState> {
        let cfg = self.ctx.config.get();
        if !cfg.enabled {
            info!("assistant disabled, going idle");
            self.gate.reset();
            return Ok(PipelineState::Idle);
        }

        self.gate.ensure_bound(&cfg.wake_word);
        let frame = self.frames.next_frame()?;
        if self.gate.feed(&frame) == DetectionResult::Wake {
            let turn = Uuid::new_v4();
            self.turn_id = Some(turn);
            info!(%turn, wake_word = %cfg.wake_word, "wake word detected, capturing");
            self.vad.set_aggressiveness(cfg.vad_aggressiveness);
            let capturer = UtteranceCapturer::begin(&cfg, frame.sample_rate);
            return Ok(PipelineState::Capturing(capturer));
        }
        Ok(PipelineState::Armed)
    }

    /// An in-flight capture runs to completion even if the assistant is
    /// disabled mid-turn.
    fn step_capturing(&mut self, mut capturer: UtteranceCapturer) -> Result<PipelineState> {
        let frame = self.frames.next_frame()?;
        let is_speech = self.vad.is_speech(&frame);
        match capturer.feed(&frame, is_speech) {
            CaptureStatus::Continue => Ok(PipelineState::Capturing(capturer)),
            CaptureStatus::Done(utterance) => {
                self.gate.reset();
                info!(
                    reason = ?utterance.end_reason,
                    duration_ms = utterance.duration().as_millis() as u64,
                    heard_speech = capturer.heard_speech(),
                    "utterance captured"
                );
                Ok(PipelineState::Transcribing(utterance))
            }
        }
    }

    fn step_transcribing(&mut self, utterance: &Utterance) -> PipelineState {
        match self.transcriber.transcribe(utterance) {
            Ok(Some(text)) => {
                info!(text = %text, "transcript");
                let cfg = self.ctx.config.get();
                self.ctx.history.set_capacity(cfg.history_capacity());
                self.ctx.history.append(Turn::user(text.clone()));
                PipelineState::Querying(text)
            }
            Ok(None) => {
                debug!("nothing recognized, rearming");
                PipelineState::Armed
            }
            Err(e) => {
                warn!(error = %e, "transcription failed, rearming");
                PipelineState::Armed
            }
        }
    }

    fn step_querying(&mut self, prompt: &str) -> PipelineState {
        let cfg = self.ctx.config.get();

        // Prior turns only: the prompt itself was appended to history when
        // transcription finished.
        let prior = cfg.history_enabled.then(|| {
            let mut turns = self.ctx.history.snapshot();
            turns.pop();
            turns
        });

        let request = LlmRequest {
            endpoint: cfg.endpoint_url(),
            model: &cfg.model_name,
            prompt,
            history: prior.as_deref(),
            timeout: Duration::from_secs(cfg.request_timeout_secs),
        };

        match ask_with_retry(&mut self.llm, &request, RETRY_BACKOFF) {
            Ok(reply) => {
                self.ctx.history.append(Turn::assistant(reply.clone()));
                PipelineState::Speaking(reply)
            }
            Err(e) => {
                warn!(error = %e, "language model query failed, speaking fallback");
                self.ctx.speech.enqueue(FALLBACK_REPLY);
                PipelineState::Armed
            }
        }
    }

    fn step_speaking(&mut self, reply: String) -> PipelineState {
        self.ctx.speech.enqueue(reply);
        if let Some(turn) = self.turn_id.take() {
            debug!(%turn, "turn complete");
        }
        PipelineState::Armed
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::audio::{Frame, frame_samples};
    use crate::config::RuntimeConfig;
    use crate::error::{HarkError, LlmError};
    use crate::history::Role;
    use crossbeam_channel::Receiver;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    const RATE: u32 = 16_000;

    fn silent_frame() -> Frame {
        Frame {
            samples: vec![0.0; frame_samples(RATE)],
            sample_rate: RATE,
            captured_at: Instant::now(),
        }
    }

    struct ScriptedFrames {
        frames: VecDeque<Frame>,
        endless: bool,
    }

    impl ScriptedFrames {
        fn with_count(n: usize) -> Self {
            Self {
                frames: (0..n).map(|_| silent_frame()).collect(),
                endless: false,
            }
        }

        fn endless() -> Self {
            Self {
                frames: VecDeque::new(),
                endless: true,
            }
        }
    }

    impl FrameSource for ScriptedFrames {
        fn next_frame(&mut self) -> Result<Frame> {
            if let Some(frame) = self.frames.pop_front() {
                return Ok(frame);
            }
            if self.endless {
                std::thread::sleep(Duration::from_millis(1));
                return Ok(silent_frame());
            }
            Err(HarkError::DeviceLost("frame script exhausted".to_owned()))
        }
    }

    struct CountingDetector {
        calls: Arc<AtomicUsize>,
        fire_at: Option<usize>,
    }

    impl CountingDetector {
        fn new(fire_at: Option<usize>) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    calls: Arc::clone(&calls),
                    fire_at,
                },
                calls,
            )
        }
    }

    impl WakeDetector for CountingDetector {
        fn detect(&mut self, _frame: &Frame) -> bool {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.fire_at == Some(n)
        }

        fn reset(&mut self) {}
    }

    struct ScriptedVad {
        speech: VecDeque<bool>,
        applied_aggressiveness: Vec<u8>,
    }

    impl ScriptedVad {
        fn new(speech: Vec<bool>) -> Self {
            Self {
                speech: speech.into(),
                applied_aggressiveness: Vec::new(),
            }
        }
    }

    impl VoiceActivity for ScriptedVad {
        fn is_speech(&mut self, _frame: &Frame) -> bool {
            self.speech.pop_front().unwrap_or(false)
        }

        fn set_aggressiveness(&mut self, level: u8) {
            self.applied_aggressiveness.push(level);
        }
    }

    struct ScriptedTranscriber {
        results: VecDeque<Result<Option<String>>>,
    }

    impl Transcribe for ScriptedTranscriber {
        fn transcribe(&mut self, _utterance: &Utterance) -> Result<Option<String>> {
            self.results.pop_front().unwrap_or(Ok(None))
        }
    }

    struct RecordingLlm {
        replies: VecDeque<std::result::Result<String, LlmError>>,
        seen_prompts: Vec<String>,
        seen_history: Vec<Option<Vec<Turn>>>,
    }

    impl RecordingLlm {
        fn new(replies: Vec<std::result::Result<String, LlmError>>) -> Self {
            Self {
                replies: replies.into(),
                seen_prompts: Vec::new(),
                seen_history: Vec::new(),
            }
        }
    }

    impl QueryLlm for RecordingLlm {
        fn ask(&mut self, request: &LlmRequest<'_>) -> std::result::Result<String, LlmError> {
            self.seen_prompts.push(request.prompt.to_owned());
            self.seen_history
                .push(request.history.map(<[Turn]>::to_vec));
            self.replies
                .pop_front()
                .unwrap_or(Err(LlmError::ServerError(500)))
        }
    }

    type TestPipeline =
        Pipeline<ScriptedFrames, CountingDetector, ScriptedVad, ScriptedTranscriber, RecordingLlm>;

    struct Fixture {
        pipeline: TestPipeline,
        speech_rx: Receiver<String>,
        detector_calls: Arc<AtomicUsize>,
    }

    fn fixture(
        config: RuntimeConfig,
        frames: ScriptedFrames,
        fire_at: Option<usize>,
        speech: Vec<bool>,
        transcripts: Vec<Result<Option<String>>>,
        replies: Vec<std::result::Result<String, LlmError>>,
    ) -> Fixture {
        let (detector, detector_calls) = CountingDetector::new(fire_at);
        let gate = WakeGate::new(detector, &config.wake_word);
        let (speech_queue, speech_rx) = SpeechQueue::channel();
        let ctx = PipelineContext {
            config: ConfigStore::new(config),
            history: Arc::new(ConversationStore::new(20)),
            speech: speech_queue,
            stop: Arc::new(AtomicBool::new(false)),
        };
        let pipeline = Pipeline::new(
            frames,
            gate,
            ScriptedVad::new(speech),
            ScriptedTranscriber {
                results: transcripts.into(),
            },
            RecordingLlm::new(replies),
            ctx,
        );
        Fixture {
            pipeline,
            speech_rx,
            detector_calls,
        }
    }

    fn turn_config() -> RuntimeConfig {
        RuntimeConfig {
            enabled: true,
            // 3 frames of trailing silence end the utterance.
            silence_timeout_ms: 90,
            max_utterance_secs: 2,
            ..RuntimeConfig::default()
        }
    }

    #[test]
    fn disabled_pipeline_drains_frames_without_detection() {
        let config = RuntimeConfig {
            enabled: false,
            ..RuntimeConfig::default()
        };
        let mut f = fixture(config, ScriptedFrames::with_count(5), Some(1), vec![], vec![], vec![]);

        for _ in 0..5 {
            f.pipeline.step().unwrap();
        }

        assert_eq!(f.detector_calls.load(Ordering::SeqCst), 0);
        assert!(f.pipeline.frames.frames.is_empty());
        assert_eq!(f.pipeline.state.name(), "idle");
    }

    #[test]
    fn wake_turn_runs_to_a_spoken_reply() {
        let mut f = fixture(
            turn_config(),
            ScriptedFrames::with_count(6),
            Some(2),
            vec![true, false, false, false],
            vec![Ok(Some("what time is it".to_owned()))],
            vec![Ok("It is noon.".to_owned())],
        );

        // Idle -> Armed on the first step, then two armed frames.
        f.pipeline.step().unwrap();
        f.pipeline.step().unwrap();
        f.pipeline.step().unwrap();
        assert_eq!(f.pipeline.state.name(), "capturing");
        assert_eq!(f.pipeline.vad.applied_aggressiveness, vec![3]);

        // One speech frame, then three silent frames end the capture.
        for _ in 0..4 {
            f.pipeline.step().unwrap();
        }
        assert_eq!(f.pipeline.state.name(), "transcribing");

        f.pipeline.step().unwrap();
        assert_eq!(f.pipeline.state.name(), "querying");
        f.pipeline.step().unwrap();
        assert_eq!(f.pipeline.state.name(), "speaking");
        f.pipeline.step().unwrap();
        assert_eq!(f.pipeline.state.name(), "armed");

        assert_eq!(f.speech_rx.try_recv().unwrap(), "It is noon.");
        assert_eq!(f.pipeline.llm.seen_prompts, vec!["what time is it"]);
        // First turn of a conversation: no prior turns accompany the prompt.
        assert_eq!(f.pipeline.llm.seen_history, vec![Some(Vec::new())]);

        let turns = f.pipeline.ctx.history.snapshot();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[0].text, "what time is it");
        assert_eq!(turns[1].role, Role::Assistant);
        assert_eq!(turns[1].text, "It is noon.");
    }

    #[test]
    fn llm_failure_speaks_fallback_and_keeps_user_turn() {
        let mut f = fixture(
            turn_config(),
            ScriptedFrames::with_count(5),
            Some(1),
            vec![false, false, false],
            vec![Ok(Some("hello".to_owned()))],
            vec![Err(LlmError::ServerError(500))],
        );

        // Idle -> Armed, wake on the first armed frame, three silent
        // frames, transcription, then the failing query.
        for _ in 0..7 {
            f.pipeline.step().unwrap();
        }

        assert_eq!(f.pipeline.state.name(), "armed");
        assert_eq!(f.speech_rx.try_recv().unwrap(), FALLBACK_REPLY);

        let turns = f.pipeline.ctx.history.snapshot();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].role, Role::User);
    }

    #[test]
    fn empty_transcript_rearms_without_querying() {
        let mut f = fixture(
            turn_config(),
            ScriptedFrames::with_count(5),
            Some(1),
            vec![false, false, false],
            vec![Ok(None)],
            vec![],
        );

        for _ in 0..6 {
            f.pipeline.step().unwrap();
        }

        assert_eq!(f.pipeline.state.name(), "armed");
        assert!(f.pipeline.llm.seen_prompts.is_empty());
        assert!(f.pipeline.ctx.history.is_empty());
        assert!(f.speech_rx.try_recv().is_err());
    }

    #[test]
    fn transcription_error_rearms_without_querying() {
        let mut f = fixture(
            turn_config(),
            ScriptedFrames::with_count(5),
            Some(1),
            vec![false, false, false],
            vec![Err(HarkError::Transcription("asr sidecar down".to_owned()))],
            vec![],
        );

        for _ in 0..6 {
            f.pipeline.step().unwrap();
        }

        assert_eq!(f.pipeline.state.name(), "armed");
        assert!(f.pipeline.llm.seen_prompts.is_empty());
        assert!(f.pipeline.ctx.history.is_empty());
    }

    #[test]
    fn disable_mid_turn_still_delivers_the_reply() {
        let mut f = fixture(
            turn_config(),
            ScriptedFrames::with_count(5),
            Some(1),
            vec![false, false, false],
            vec![Ok(Some("hello".to_owned()))],
            vec![Ok("Hi there.".to_owned())],
        );

        // Reach the querying state, then disable the assistant.
        for _ in 0..6 {
            f.pipeline.step().unwrap();
        }
        assert_eq!(f.pipeline.state.name(), "querying");

        let patch = crate::config::ConfigPatch {
            enabled: Some(false),
            ..crate::config::ConfigPatch::default()
        };
        f.pipeline.ctx.config.update(&patch).unwrap();

        // The in-flight turn finishes: query, speak, then park idle.
        f.pipeline.step().unwrap();
        f.pipeline.step().unwrap();
        assert_eq!(f.speech_rx.try_recv().unwrap(), "Hi there.");
        f.pipeline.step().unwrap();
        assert_eq!(f.pipeline.state.name(), "idle");
    }

    #[test]
    fn prior_turns_accompany_the_prompt() {
        let mut f = fixture(
            turn_config(),
            ScriptedFrames::with_count(5),
            Some(1),
            vec![false, false, false],
            vec![Ok(Some("and tomorrow?".to_owned()))],
            vec![Ok("Also sunny.".to_owned())],
        );
        f.pipeline.ctx.history.append(Turn::user("weather today?"));
        f.pipeline
            .ctx
            .history
            .append(Turn::assistant("Sunny."));

        for _ in 0..7 {
            f.pipeline.step().unwrap();
        }

        let sent = f.pipeline.llm.seen_history[0].as_ref().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].text, "weather today?");
        assert_eq!(sent[1].text, "Sunny.");
        assert_eq!(f.pipeline.llm.seen_prompts, vec!["and tomorrow?"]);
    }

    #[test]
    fn history_disabled_sends_no_context_but_still_records() {
        let config = RuntimeConfig {
            history_enabled: false,
            ..turn_config()
        };
        let mut f = fixture(
            config,
            ScriptedFrames::with_count(5),
            Some(1),
            vec![false, false, false],
            vec![Ok(Some("hello".to_owned()))],
            vec![Ok("Hi.".to_owned())],
        );

        for _ in 0..8 {
            f.pipeline.step().unwrap();
        }

        assert_eq!(f.pipeline.llm.seen_history, vec![None]);
        // Turns are still recorded for the control surface.
        assert_eq!(f.pipeline.ctx.history.len(), 2);
    }

    #[test]
    fn device_loss_propagates_out_of_the_loop() {
        let mut f = fixture(
            turn_config(),
            ScriptedFrames::with_count(0),
            None,
            vec![],
            vec![],
            vec![],
        );

        f.pipeline.step().unwrap();
        let err = f.pipeline.step().unwrap_err();
        assert!(matches!(err, HarkError::DeviceLost(_)));
    }

    #[test]
    fn run_stops_when_the_flag_is_set() {
        let mut f = fixture(
            turn_config(),
            ScriptedFrames::endless(),
            None,
            vec![],
            vec![],
            vec![],
        );
        let stop = Arc::clone(&f.pipeline.ctx.stop);

        let handle = std::thread::spawn(move || f.pipeline.run());
        std::thread::sleep(Duration::from_millis(30));
        stop.store(true, Ordering::Relaxed);

        handle.join().unwrap().unwrap();
    }
}
