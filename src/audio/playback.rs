//! Gapless playback of inbound audio chunks
//!
//! Chunks are decoded one at a time by a single worker task and placed
//! back-to-back on the sink clock. A generation counter invalidates any
//! decode that straddles a cancel.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::audio::buffer::{AudioChunk, OutputQueue, PcmBuffer};
use crate::audio::meter::LevelSource;
use crate::audio::sink::{AudioSink, EngineState, Routing, ScheduledSource, SourceId, Tap};
use crate::codec::ChunkDecoder;

/// Shortest sleep of the end-of-playback watcher
const WATCH_MIN_POLL: Duration = Duration::from_millis(20);

/// Single-cursor scheduling clock
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackClock {
    next_play_time: f64,
    lookahead: f64,
}

impl PlaybackClock {
    pub fn new(lookahead: Duration) -> Self {
        Self {
            next_play_time: 0.0,
            lookahead: lookahead.as_secs_f64(),
        }
    }

    /// Start time for a buffer of `duration` seconds; advances the cursor
    pub fn schedule(&mut self, now: f64, duration: f64) -> f64 {
        let start = (now + self.lookahead).max(self.next_play_time);
        self.next_play_time = start + duration;
        start
    }

    pub fn reset(&mut self, now: f64) {
        self.next_play_time = now;
    }

    pub fn next_play_time(&self) -> f64 {
        self.next_play_time
    }

    pub fn lookahead(&self) -> f64 {
        self.lookahead
    }
}

/// A decoded chunk bound to the sink clock
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackSource {
    pub id: SourceId,
    pub start: f64,
    pub end: f64,
    pub routing: Routing,
}

struct PlaybackState {
    queue: OutputQueue,
    clock: PlaybackClock,
    sources: Vec<PlaybackSource>,
    next_source_id: SourceId,
    muted: bool,
    worker_running: bool,
    watcher_running: bool,
    decoding: bool,
    generation: u64,
}

impl PlaybackState {
    fn prune(&mut self, now: f64) {
        self.sources.retain(|source| source.end > now);
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty() && !self.worker_running && self.sources.is_empty()
    }
}

pub struct PlaybackScheduler {
    sink: RwLock<Arc<dyn AudioSink>>,
    decoder: ChunkDecoder,
    state: Mutex<PlaybackState>,
    playing: watch::Sender<bool>,
}

impl PlaybackScheduler {
    pub fn new(sink: Arc<dyn AudioSink>, decoder: ChunkDecoder, lookahead: Duration) -> Arc<Self> {
        let (playing, _) = watch::channel(false);
        Arc::new(Self {
            sink: RwLock::new(sink),
            decoder,
            state: Mutex::new(PlaybackState {
                queue: OutputQueue::new(),
                clock: PlaybackClock::new(lookahead),
                sources: Vec::new(),
                next_source_id: 1,
                muted: false,
                worker_running: false,
                watcher_running: false,
                decoding: false,
                generation: 0,
            }),
            playing,
        })
    }

    pub fn sink(&self) -> Arc<dyn AudioSink> {
        self.sink.read().clone()
    }

    /// Queue a chunk and make sure the worker is running
    pub fn enqueue(self: &Arc<Self>, chunk: AudioChunk) {
        let spawn = {
            let mut state = self.state.lock();
            let sequence = state.queue.push(chunk);
            tracing::debug!("Queued output chunk {} ({} pending)", sequence, state.queue.len());
            !std::mem::replace(&mut state.worker_running, true)
        };
        self.playing.send_replace(true);

        if spawn {
            let scheduler = self.clone();
            tokio::spawn(async move { scheduler.drain().await });
        }
    }

    async fn drain(self: Arc<Self>) {
        loop {
            let (chunk, generation) = {
                let mut state = self.state.lock();
                match state.queue.pop() {
                    Some(chunk) => {
                        state.decoding = true;
                        (chunk, state.generation)
                    }
                    None => {
                        state.worker_running = false;
                        state.decoding = false;
                        break;
                    }
                }
            };

            let sink = self.sink();
            if sink.state() == EngineState::Suspended {
                if let Err(e) = sink.resume().await {
                    tracing::warn!("Audio engine resume failed: {}", e);
                }
            }

            let buffer = self.decoder.decode(&chunk, sink.sample_rate()).await;

            let mut state = self.state.lock();
            state.decoding = false;
            if state.generation != generation {
                tracing::debug!("Discarding chunk {} decoded across a cancel", chunk.sequence);
                continue;
            }
            if buffer.is_empty() {
                continue;
            }
            self.schedule(&mut state, sink.as_ref(), buffer);
        }

        self.watch_until_idle();
    }

    fn schedule(&self, state: &mut PlaybackState, sink: &dyn AudioSink, buffer: PcmBuffer) {
        let now = sink.current_time();
        state.prune(now);

        let duration = buffer.duration();
        let start = state.clock.schedule(now, duration);
        let id = state.next_source_id;
        state.next_source_id += 1;
        let routing = Routing::for_mute_state(state.muted);

        sink.start_source(ScheduledSource {
            id,
            buffer: Arc::new(buffer),
            start,
            routing,
        });
        state.sources.push(PlaybackSource {
            id,
            start,
            end: start + duration,
            routing,
        });

        tracing::debug!(
            "Scheduled source {} at {:.3}s for {:.3}s (speaker: {})",
            id,
            start,
            duration,
            routing.speaker
        );
    }

    /// Flip `playing` off once every scheduled source has ended
    fn watch_until_idle(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if std::mem::replace(&mut state.watcher_running, true) {
                return;
            }
        }

        let scheduler = self.clone();
        tokio::spawn(async move {
            loop {
                let sink = scheduler.sink();
                let now = sink.current_time();
                let remaining = {
                    let mut state = scheduler.state.lock();
                    state.prune(now);
                    if state.is_idle() {
                        state.watcher_running = false;
                        None
                    } else {
                        let last_end = state.sources.iter().map(|s| s.end).fold(now, f64::max);
                        Some(Duration::from_secs_f64(last_end - now))
                    }
                };
                match remaining {
                    Some(remaining) => tokio::time::sleep(remaining.max(WATCH_MIN_POLL)).await,
                    None => {
                        scheduler.playing.send_replace(false);
                        break;
                    }
                }
            }
        });
    }

    /// Stop everything scheduled and drop the queue
    ///
    /// Returns whether anything was playing, queued or decoding.
    pub fn cancel(&self) -> bool {
        let sink = self.sink();
        let now = sink.current_time();
        let interrupted = {
            let mut state = self.state.lock();
            state.prune(now);
            let interrupted =
                !state.sources.is_empty() || !state.queue.is_empty() || state.decoding;

            for source in state.sources.drain(..) {
                sink.stop_source(source.id);
            }
            let dropped = state.queue.clear();
            state.generation += 1;
            state.clock.reset(now);

            if interrupted {
                tracing::info!("Playback cancelled ({} queued chunks dropped)", dropped);
            }
            interrupted
        };
        self.playing.send_replace(false);
        interrupted
    }

    /// Affects routing of sources scheduled from now on
    pub fn set_muted(&self, muted: bool) {
        self.state.lock().muted = muted;
    }

    pub fn is_muted(&self) -> bool {
        self.state.lock().muted
    }

    /// Swap in a new sink (provider switch)
    pub fn rebuild(&self, sink: Arc<dyn AudioSink>) {
        self.cancel();
        let old = std::mem::replace(&mut *self.sink.write(), sink.clone());
        old.close();
        self.state.lock().clock.reset(sink.current_time());
        tracing::info!("Playback sink rebuilt at {} Hz", sink.sample_rate());
    }

    /// Anything scheduled that has not ended yet
    pub fn is_playing(&self) -> bool {
        let now = self.sink().current_time();
        let mut state = self.state.lock();
        state.prune(now);
        !state.sources.is_empty()
    }

    pub fn subscribe_playing(&self) -> watch::Receiver<bool> {
        self.playing.subscribe()
    }

    /// Resolve once the queue is drained and every source has ended
    pub async fn wait_idle(&self) {
        let mut playing = self.playing.subscribe();
        let _ = playing.wait_for(|playing| !*playing).await;
    }

    pub fn next_play_time(&self) -> f64 {
        self.state.lock().clock.next_play_time()
    }

    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Sources that have not ended at the current clock position
    pub fn active_sources(&self) -> Vec<PlaybackSource> {
        let now = self.sink().current_time();
        let mut state = self.state.lock();
        state.prune(now);
        state.sources.clone()
    }

    pub fn close(&self) {
        self.cancel();
        self.sink().close();
    }
}

impl LevelSource for PlaybackScheduler {
    fn fill_levels(&self, out: &mut [u8]) -> bool {
        let sink = self.sink();
        let now = sink.current_time();
        let tap = {
            let mut state = self.state.lock();
            state.prune(now);
            if state.sources.is_empty() {
                return false;
            }
            let audible = state
                .sources
                .iter()
                .any(|source| source.start <= now && source.routing.speaker);
            if audible {
                Tap::Speaker
            } else {
                Tap::Visualizer
            }
        };
        sink.frequency_data(tap, out);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::virtual_sink::VirtualSink;
    use crate::codec::ContainerDecoder;
    use crate::error::CodecError;
    use crate::protocol::AudioEncoding;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use tokio::sync::Semaphore;

    const RATE: u32 = 24_000;
    const LOOKAHEAD: Duration = Duration::from_millis(50);

    /// Raw PCM chunk lasting `ms` at the test rate
    fn pcm_chunk(ms: u64) -> AudioChunk {
        let samples = RATE as u64 * ms / 1000;
        AudioChunk::new(vec![0x10u8; samples as usize * 2], AudioEncoding::Pcm)
    }

    /// Container decoder that blocks until a permit is released
    struct GatedDecoder {
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl ContainerDecoder for GatedDecoder {
        async fn decode(&self, data: bytes::Bytes, _mime: &str) -> Result<PcmBuffer, CodecError> {
            let _permit = self.gate.acquire().await;
            Ok(PcmBuffer::new(vec![0.1; data.len()], RATE))
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!((actual - expected).abs() < 1e-6, "{} != {}", actual, expected);
    }

    #[tokio::test]
    async fn test_second_chunk_starts_at_first_end() {
        let sink = VirtualSink::manual(RATE);
        let scheduler = PlaybackScheduler::new(sink.clone(), ChunkDecoder::default(), LOOKAHEAD);

        scheduler.enqueue(pcm_chunk(200));
        settle().await;
        sink.advance(Duration::from_millis(50));
        scheduler.enqueue(pcm_chunk(150));
        settle().await;

        let started = sink.started();
        assert_eq!(started.len(), 2);
        assert_close(started[0].start, 0.05);
        assert_close(started[1].start, started[0].end());
        assert_close(scheduler.next_play_time(), 0.4);
    }

    #[tokio::test]
    async fn test_start_after_silence_uses_lookahead() {
        let sink = VirtualSink::manual(RATE);
        let scheduler = PlaybackScheduler::new(sink.clone(), ChunkDecoder::default(), LOOKAHEAD);

        scheduler.enqueue(pcm_chunk(100));
        settle().await;
        sink.advance(Duration::from_secs(1));
        scheduler.enqueue(pcm_chunk(100));
        settle().await;

        let started = sink.started();
        assert_close(started[1].start, 1.05);
    }

    #[tokio::test]
    async fn test_cancel_while_chunk_queued() {
        let sink = VirtualSink::manual(RATE);
        let gate = Arc::new(Semaphore::new(0));
        let decoder = ChunkDecoder::new(Arc::new(GatedDecoder { gate: gate.clone() }));
        let scheduler = PlaybackScheduler::new(sink.clone(), decoder, LOOKAHEAD);

        scheduler.enqueue(pcm_chunk(200));
        settle().await;
        scheduler.enqueue(AudioChunk::new(vec![0u8; 480], AudioEncoding::Container("audio/wav".into())));
        scheduler.enqueue(pcm_chunk(150));
        settle().await;
        assert_eq!(scheduler.queued(), 1);

        sink.advance(Duration::from_millis(100));
        assert!(scheduler.cancel());

        assert_eq!(scheduler.queued(), 0);
        assert!(scheduler.active_sources().is_empty());
        assert_eq!(sink.stopped(), vec![1]);
        assert_close(scheduler.next_play_time(), 0.1);

        // The in-flight decode completes after the cancel and is dropped
        gate.add_permits(1);
        settle().await;
        assert_eq!(sink.started().len(), 1);
        assert!(sink.active_ids().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_with_nothing_playing() {
        let sink = VirtualSink::manual(RATE);
        let scheduler = PlaybackScheduler::new(sink.clone(), ChunkDecoder::default(), LOOKAHEAD);

        assert!(!scheduler.cancel());

        scheduler.enqueue(pcm_chunk(100));
        settle().await;
        sink.advance(Duration::from_secs(1));
        assert!(!scheduler.cancel());
    }

    #[tokio::test]
    async fn test_mute_routes_only_future_sources() {
        let sink = VirtualSink::manual(RATE);
        let scheduler = PlaybackScheduler::new(sink.clone(), ChunkDecoder::default(), LOOKAHEAD);

        scheduler.enqueue(pcm_chunk(100));
        settle().await;
        scheduler.set_muted(true);
        scheduler.enqueue(pcm_chunk(100));
        settle().await;

        let started = sink.started();
        assert!(started[0].routing.speaker);
        assert!(!started[1].routing.speaker);
        assert!(started.iter().all(|s| s.routing.visualizer));
        assert!(sink.stopped().is_empty());
        assert_close(started[1].start, started[0].end());
    }

    #[tokio::test]
    async fn test_suspended_engine_is_resumed() {
        let sink = VirtualSink::manual(RATE);
        sink.set_suspended(true);
        sink.fail_resume(true);
        let scheduler = PlaybackScheduler::new(sink.clone(), ChunkDecoder::default(), LOOKAHEAD);

        scheduler.enqueue(pcm_chunk(100));
        settle().await;
        assert_eq!(sink.resume_calls(), 1);
        assert_eq!(sink.started().len(), 1);

        sink.fail_resume(false);
        scheduler.enqueue(pcm_chunk(100));
        settle().await;
        assert_eq!(sink.state(), EngineState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_idle_after_playback_ends() {
        let sink = VirtualSink::realtime(RATE);
        let scheduler = PlaybackScheduler::new(sink.clone(), ChunkDecoder::default(), LOOKAHEAD);
        let playing = scheduler.subscribe_playing();

        scheduler.enqueue(pcm_chunk(200));
        assert!(*playing.borrow());
        settle().await;
        assert!(scheduler.is_playing());

        tokio::time::timeout(Duration::from_secs(1), scheduler.wait_idle())
            .await
            .unwrap();
        assert!(!scheduler.is_playing());
        assert!(sink.current_time() >= 0.25);
    }

    #[tokio::test]
    async fn test_rebuild_closes_old_sink() {
        let old = VirtualSink::manual(16_000);
        let scheduler = PlaybackScheduler::new(old.clone(), ChunkDecoder::default(), LOOKAHEAD);
        scheduler.enqueue(pcm_chunk(100));
        settle().await;

        let new = VirtualSink::manual(RATE);
        scheduler.rebuild(new.clone());

        assert_eq!(old.state(), EngineState::Closed);
        assert_eq!(scheduler.sink().sample_rate(), RATE);
        assert!(scheduler.active_sources().is_empty());
    }

    #[tokio::test]
    async fn test_levels_prefer_speaker_tap() {
        let sink = VirtualSink::manual(RATE);
        let scheduler = PlaybackScheduler::new(sink.clone(), ChunkDecoder::default(), LOOKAHEAD);
        let mut levels = [0u8; 128];
        assert!(!scheduler.fill_levels(&mut levels));

        scheduler.set_muted(true);
        scheduler.enqueue(pcm_chunk(500));
        settle().await;
        sink.advance(Duration::from_millis(200));
        assert!(scheduler.fill_levels(&mut levels));
    }

    proptest! {
        #[test]
        fn prop_back_to_back_chunks_are_gapless(
            durations in prop::collection::vec(0.001f64..0.5, 1..40),
            steps in prop::collection::vec(0.0f64..0.01, 40),
        ) {
            let mut clock = PlaybackClock::new(LOOKAHEAD);
            let mut now = 0.0;
            let mut previous_end: Option<f64> = None;

            for (duration, step) in durations.iter().zip(&steps) {
                now += step;
                let start = clock.schedule(now, *duration);

                if let Some(end) = previous_end {
                    // Clock stayed behind the cursor, so playback is continuous
                    if now + clock.lookahead() <= end {
                        prop_assert!((start - end).abs() < 1e-9);
                    }
                    prop_assert!(start >= end - 1e-9);
                }
                prop_assert!(start >= now + clock.lookahead() - 1e-9);
                previous_end = Some(start + duration);
            }
        }

        #[test]
        fn prop_sources_never_overlap(
            durations in prop::collection::vec(0.001f64..0.3, 1..30),
            steps in prop::collection::vec(0.0f64..1.0, 30),
        ) {
            let mut clock = PlaybackClock::new(LOOKAHEAD);
            let mut now = 0.0;
            let mut spans = Vec::new();

            for (duration, step) in durations.iter().zip(&steps) {
                now += step;
                let start = clock.schedule(now, *duration);
                spans.push((start, start + duration));
            }

            for pair in spans.windows(2) {
                prop_assert!(pair[1].0 >= pair[0].1 - 1e-9);
            }
        }
    }
}
