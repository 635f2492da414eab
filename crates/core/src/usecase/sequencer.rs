use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::error::PlaybackError;
use crate::domain::key::SelectionKey;
use crate::domain::media::{
    AudioChunk, AudioPayload, AudioSource, LoadedChunk, MediaControl, MediaEvent, MediaPlayer,
};
use crate::domain::settings::PlayerSettings;
use crate::domain::state::{
    PlaybackState, PlayerEvent, PlayerStatus, Progress, StateTransition, SubElement,
    SubElementKind,
};
use crate::domain::step::{RawStep, Sequence, Step};
use crate::infra::cache::{DurationResolver, MediaCache};
use crate::infra::metrics::{Metrics, MetricsSummary};
use crate::infra::timer::{PausableTimer, PauseGate, TimerOutcome};

use super::state_store::StateStore;

/// `load` の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionChange {
    /// 最初のセッション
    Started,
    /// ストーリーが変わった（キャッシュを破棄）
    StoryChanged,
    /// 同じストーリーでステップ列が変わった（状態だけリセット）
    SequenceChanged,
    Unchanged,
}

struct Session {
    session_id: String,
    story_id: String,
    sequence: Sequence,
}

struct ActiveRun {
    run: u64,
    token: CancellationToken,
    _handle: JoinHandle<()>,
}

#[derive(Default)]
struct RunControl {
    session: Option<Arc<Session>>,
    active: Option<ActiveRun>,
    /// 再生中のメディア（pause/resume の対象）
    media: Option<Arc<dyn MediaControl>>,
    /// select の長さプレビュー
    preview: Option<CancellationToken>,
}

struct Inner {
    settings: PlayerSettings,
    store: StateStore,
    media: MediaCache,
    durations: DurationResolver,
    player: Arc<dyn MediaPlayer>,
    timer: PausableTimer,
    pause: PauseGate,
    metrics: Arc<Metrics>,
    control: Mutex<RunControl>,
}

/// ディクテーション再生エンジン。
///
/// ステップ列を選択位置から順に再生する。1つのセッションで同時に動く再生ランは常に1つ。
pub struct Sequencer {
    inner: Arc<Inner>,
}

impl Sequencer {
    pub fn new(
        source: Arc<dyn AudioSource>,
        player: Arc<dyn MediaPlayer>,
        settings: PlayerSettings,
    ) -> Self {
        let metrics = Arc::new(Metrics::new());
        let inner = Inner {
            store: StateStore::new(settings.event_capacity),
            media: MediaCache::new(source, metrics.clone(), settings.fetch_timeout()),
            durations: DurationResolver::new(metrics.clone()),
            player,
            timer: PausableTimer::new(settings.poll_interval()),
            pause: PauseGate::new(),
            metrics,
            control: Mutex::new(RunControl::default()),
            settings,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    // ==================== Session ====================

    /// ストーリーとステップ列を読み込む。
    ///
    /// ストーリーが変われば両キャッシュを破棄して状態をリセットする。
    /// ステップ列だけが変わった場合は状態のみリセットする。
    pub fn load(&self, story_id: &str, sequence: Sequence) -> SessionChange {
        let inner = &self.inner;
        let mut control = inner.control.lock();

        let (change, session_id) = match &control.session {
            None => (SessionChange::Started, uuid::Uuid::new_v4().to_string()),
            Some(s) if s.story_id != story_id => {
                (SessionChange::StoryChanged, uuid::Uuid::new_v4().to_string())
            }
            Some(s) if sequence.has_changed(&s.sequence) => {
                (SessionChange::SequenceChanged, s.session_id.clone())
            }
            Some(_) => return SessionChange::Unchanged,
        };

        inner.cancel_active(&mut control);
        inner.cancel_preview(&mut control);
        if change == SessionChange::StoryChanged {
            inner.media.clear();
            inner.durations.clear();
        }

        log::info!(
            "Session {} loaded: story={}, {} steps ({:?})",
            session_id,
            story_id,
            sequence.len(),
            change
        );

        control.session = Some(Arc::new(Session {
            session_id: session_id.clone(),
            story_id: story_id.to_string(),
            sequence,
        }));

        let story_id = story_id.to_string();
        inner.store.apply(|state, events| {
            let prev = state.status;
            *state = PlaybackState::for_session(session_id, story_id);
            events.push(PlayerEvent::StateChanged {
                transition: StateTransition {
                    prev,
                    next: PlayerStatus::Idle,
                },
            });
        });
        change
    }

    /// 設定エディタの生ステップ列から読み込む
    pub fn load_raw(&self, story_id: &str, raw: &[RawStep]) -> Result<SessionChange, PlaybackError> {
        let sequence = Sequence::from_raw(raw, self.inner.settings.strict_steps)?;
        Ok(self.load(story_id, sequence))
    }

    /// セッションを閉じる。キャッシュも破棄する。
    pub fn close(&self) {
        let inner = &self.inner;
        let mut control = inner.control.lock();
        inner.cancel_active(&mut control);
        inner.cancel_preview(&mut control);
        if let Some(session) = control.session.take() {
            log::info!("Session {} closed", session.session_id);
        }
        inner.media.clear();
        inner.durations.clear();
        inner.store.apply(|state, events| {
            let prev = state.status;
            *state = PlaybackState::default();
            events.push(PlayerEvent::StateChanged {
                transition: StateTransition {
                    prev,
                    next: PlayerStatus::Idle,
                },
            });
        });
    }

    pub fn sequence(&self) -> Option<Sequence> {
        self.inner
            .control
            .lock()
            .session
            .as_ref()
            .map(|s| s.sequence.clone())
    }

    // ==================== Observation ====================

    pub fn snapshot(&self) -> PlaybackState {
        self.inner.store.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackState> {
        self.inner.store.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<PlayerEvent> {
        self.inner.store.events()
    }

    pub fn metrics(&self) -> MetricsSummary {
        self.inner.metrics.summary()
    }

    pub fn settings(&self) -> &PlayerSettings {
        &self.inner.settings
    }

    /// 現在の再生ランが終わる（再生中でなくなる）まで待つ
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.store.subscribe();
        let _ = rx.wait_for(|s| !s.status.is_running()).await;
    }

    // ==================== Commands ====================

    /// 選択中のステップから再生する
    pub fn play(&self) -> Result<(), PlaybackError> {
        let index = self.inner.store.snapshot().active_step_index;
        self.play_from(index)
    }

    /// `index` のステップから最後まで再生する。tokio ランタイム上で呼ぶこと。
    pub fn play_from(&self, index: usize) -> Result<(), PlaybackError> {
        let inner = &self.inner;
        let mut control = inner.control.lock();
        let session = control
            .session
            .clone()
            .ok_or_else(|| PlaybackError::invalid_state("no sequence loaded"))?;
        if index > 0 && index >= session.sequence.len() {
            return Err(PlaybackError::invalid_step(index, "step index out of range"));
        }

        let snapshot = inner.store.snapshot();
        if snapshot.status.is_running() {
            return Err(PlaybackError::invalid_state(format!(
                "play is not allowed while {}",
                snapshot.status.as_str()
            )));
        }
        // 選択済みのサブ要素があればそこから始める
        let resume_from = if snapshot.active_step_index == index {
            snapshot.active_sub_element.clone()
        } else {
            None
        };

        inner.cancel_preview(&mut control);
        inner.pause.set_paused(false);
        let run = inner.store.next_run();
        let mut started = Ok(());
        inner.store.apply_for_run(run, |state, events| match state.start(index) {
            Ok(transition) => events.push(PlayerEvent::StateChanged { transition }),
            Err(e) => started = Err(e),
        });
        started?;

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_sequence(
            inner.clone(),
            session,
            run,
            index,
            resume_from,
            token.clone(),
        ));
        control.active = Some(ActiveRun {
            run,
            token,
            _handle: handle,
        });
        Ok(())
    }

    /// 一時停止。タイマーを止め、再生中のメディアを止める（キャンセルはしない）
    pub fn pause(&self) -> Result<(), PlaybackError> {
        let inner = &self.inner;
        let control = inner.control.lock();
        let mut result = Ok(());
        inner.store.apply(|state, events| match state.pause() {
            Ok(transition) => events.push(PlayerEvent::StateChanged { transition }),
            Err(e) => result = Err(e),
        });
        result?;

        inner.pause.set_paused(true);
        if let Some(media) = &control.media {
            media.pause();
        }
        log::debug!("Playback paused");
        Ok(())
    }

    /// 一時停止から再開する。経過時間は保持したまま続ける。
    pub fn resume(&self) -> Result<(), PlaybackError> {
        let inner = &self.inner;
        let control = inner.control.lock();
        let mut result = Ok(());
        inner.store.apply(|state, events| match state.resume() {
            Ok(transition) => events.push(PlayerEvent::StateChanged { transition }),
            Err(e) => result = Err(e),
        });
        result?;

        inner.pause.set_paused(false);
        if let Some(media) = &control.media {
            media.resume();
        }
        log::debug!("Playback resumed");
        Ok(())
    }

    /// 再生を打ち切り、カーソルを先頭に戻す。何度呼んでもよい。
    pub fn stop(&self) {
        let inner = &self.inner;
        let mut control = inner.control.lock();
        let cancelled = inner.cancel_active(&mut control);
        inner.cancel_preview(&mut control);
        inner.store.apply(|state, events| {
            let transition = state.stop();
            events.push(PlayerEvent::StateChanged { transition });
            if let Some(run) = cancelled {
                events.push(PlayerEvent::Stopped { run });
            }
        });
    }

    /// ステップを選択する（再生中なら打ち切る）。
    ///
    /// 長さを解決して `selected_duration_ms` に公開し、その値を返す。
    /// 解決中に別の選択がされた場合は `None`。
    pub async fn select(&self, index: usize) -> Result<Option<u64>, PlaybackError> {
        let inner = &self.inner;
        let (session, step, token) = {
            let mut control = inner.control.lock();
            let session = control
                .session
                .clone()
                .ok_or_else(|| PlaybackError::invalid_state("no sequence loaded"))?;
            let step = session
                .sequence
                .get(index)
                .cloned()
                .ok_or_else(|| PlaybackError::invalid_step(index, "step index out of range"))?;

            inner.cancel_active(&mut control);
            let token = inner.begin_preview(&mut control);
            inner.store.apply(|state, events| {
                let transition = state.select(index);
                events.push(PlayerEvent::StateChanged { transition });
            });
            (session, step, token)
        };

        // 打ち切っても共有中の取得は止まらない
        let resolved = guard(&token, inner.preview_step(&session, index, &step)).await;
        match resolved {
            Ok((duration_ms, chunks)) => {
                let published = inner.publish_selection(&token, index, duration_ms, |state| {
                    if let Some(chunks) = chunks {
                        state.chunks = chunks;
                    }
                });
                Ok(published.then_some(duration_ms))
            }
            Err(_) if token.is_cancelled() => Ok(None),
            Err(e) => {
                log::warn!("Duration preview for step {} failed: {}", index, e);
                Err(e)
            }
        }
    }

    /// 選択中の文ごと再生ステップ内のサブ要素を選ぶ。次の `play` はそこから始まる。
    ///
    /// `Gap` の `sub_index` はその文の最後の繰り返しの後のギャップを指す。
    pub async fn select_sub_element(
        &self,
        kind: SubElementKind,
        sub_index: usize,
    ) -> Result<Option<u64>, PlaybackError> {
        let inner = &self.inner;
        let (session, index, step, previous, token) = {
            let mut control = inner.control.lock();
            let session = control
                .session
                .clone()
                .ok_or_else(|| PlaybackError::invalid_state("no sequence loaded"))?;
            let snapshot = inner.store.snapshot();
            let index = snapshot.active_step_index;
            let step = session
                .sequence
                .get(index)
                .cloned()
                .ok_or_else(|| PlaybackError::invalid_step(index, "step index out of range"))?;
            if !matches!(step, Step::SentenceBySentence { .. }) {
                return Err(PlaybackError::invalid_state(format!(
                    "step {index} is not sentence-by-sentence"
                )));
            }

            inner.cancel_active(&mut control);
            let token = inner.begin_preview(&mut control);
            inner.store.apply(|state, events| {
                let transition = state.select(index);
                events.push(PlayerEvent::StateChanged { transition });
            });
            (session, index, step, snapshot.active_sub_element, token)
        };

        let Step::SentenceBySentence {
            speed_percent,
            gap_ms,
            repeat,
        } = step
        else {
            return Err(PlaybackError::invalid_state("step is not sentence-by-sentence"));
        };
        let speed = inner.settings.effective_speed(speed_percent);

        let chunks = match guard(&token, inner.media.get_or_fetch_chunks(&session.story_id, speed)).await {
            Ok(chunks) => chunks,
            Err(_) if token.is_cancelled() => return Ok(None),
            Err(e) => return Err(e),
        };
        if sub_index >= chunks.len() {
            return Err(PlaybackError::invalid_step(
                index,
                format!("sentence {sub_index} does not exist ({} sentences)", chunks.len()),
            ));
        }

        let mut sub = match kind {
            SubElementKind::Audio => SubElement::audio(sub_index, 1),
            SubElementKind::Gap => {
                if gap_ms == 0 {
                    return Err(PlaybackError::invalid_step(index, "step has no gap"));
                }
                if sub_index + 1 == chunks.len() {
                    return Err(PlaybackError::invalid_step(
                        index,
                        "there is no gap after the last sentence",
                    ));
                }
                SubElement::gap(sub_index, repeat.max(1))
            }
        };
        // 途中まで進んだ同じギャップなら経過を引き継ぐ
        if let Some(prev) = previous.filter(|p| p.same_position(&sub)) {
            sub.progress = prev.progress;
        }

        let resolved = match kind {
            SubElementKind::Audio => {
                let key = SelectionKey::audio(&session.story_id, index, speed, sub_index);
                let payload = chunks[sub_index].payload.clone();
                let player = inner.player.clone();
                inner
                    .durations
                    .resolve(key, move || async move { player.measure_duration(&payload) })
                    .await
            }
            SubElementKind::Gap => {
                let key = SelectionKey::gap(&session.story_id, index, speed, sub_index, gap_ms);
                inner.durations.resolve(key, move || async move { Ok(gap_ms) }).await
            }
        };
        let duration_ms = match resolved {
            Ok(ms) => ms,
            Err(_) if token.is_cancelled() => return Ok(None),
            Err(e) => return Err(e),
        };

        let chunk_list = chunk_list(&chunks);
        let published = inner.publish_selection(&token, index, duration_ms, |state| {
            state.chunks = chunk_list;
            state.active_sub_element = Some(sub);
        });
        Ok(published.then_some(duration_ms))
    }
}

impl Drop for Sequencer {
    fn drop(&mut self) {
        let mut control = self.inner.control.lock();
        self.inner.cancel_active(&mut control);
        self.inner.cancel_preview(&mut control);
    }
}

// ==================== Inner helpers ====================

impl Inner {
    /// 進行中のランを打ち切る。打ち切ったランの番号を返す。
    fn cancel_active(&self, control: &mut RunControl) -> Option<u64> {
        if let Some(media) = control.media.take() {
            media.stop();
        }
        self.pause.set_paused(false);
        let active = control.active.take()?;
        // 以後このランの書き込みは無視される
        self.store.next_run();
        if !active.token.is_cancelled() {
            active.token.cancel();
            self.metrics.inc_runs_cancelled();
            log::debug!("Playback run {} cancelled", active.run);
        }
        Some(active.run)
    }

    fn cancel_preview(&self, control: &mut RunControl) {
        if let Some(token) = control.preview.take() {
            token.cancel();
        }
    }

    fn begin_preview(&self, control: &mut RunControl) -> CancellationToken {
        self.cancel_preview(control);
        let token = CancellationToken::new();
        control.preview = Some(token.clone());
        token
    }

    /// プレビュー結果を公開する。取り消されていたら何もしない。
    fn publish_selection<F>(&self, token: &CancellationToken, index: usize, duration_ms: u64, f: F) -> bool
    where
        F: FnOnce(&mut PlaybackState),
    {
        let mut published = false;
        self.store.apply(|state, events| {
            if token.is_cancelled() || state.active_step_index != index {
                return;
            }
            f(state);
            state.selected_duration_ms = Some(duration_ms);
            events.push(PlayerEvent::SelectionResolved {
                index,
                duration_ms: Some(duration_ms),
            });
            published = true;
        });
        published
    }

    /// 選択したステップの長さを解決する。文ごと再生ならチャンク一覧も返す。
    async fn preview_step(
        &self,
        session: &Session,
        index: usize,
        step: &Step,
    ) -> Result<(u64, Option<Vec<AudioChunk>>), PlaybackError> {
        let key = SelectionKey::step(&session.story_id, index, step);
        match *step {
            Step::Wait { wait_ms } => {
                let ms = self.durations.resolve(key, || async move { Ok(wait_ms) }).await?;
                Ok((ms, None))
            }
            Step::FullDictation { speed_percent } => {
                let speed = self.settings.effective_speed(speed_percent);
                let media = self.media.clone();
                let player = self.player.clone();
                let story_id = session.story_id.clone();
                let ms = self
                    .durations
                    .resolve(key, move || async move {
                        let payload = media.resolve_full_audio(&story_id, speed).await?;
                        player.measure_duration(&payload)
                    })
                    .await?;
                Ok((ms, None))
            }
            Step::SentenceBySentence { speed_percent, .. } => {
                let speed = self.settings.effective_speed(speed_percent);
                let chunks = self.media.get_or_fetch_chunks(&session.story_id, speed).await?;
                let Some(first) = chunks.first() else {
                    return Ok((0, Some(Vec::new())));
                };
                let key = SelectionKey::audio(&session.story_id, index, speed, 0);
                let payload = first.payload.clone();
                let player = self.player.clone();
                let ms = self
                    .durations
                    .resolve(key, move || async move { player.measure_duration(&payload) })
                    .await?;
                Ok((ms, Some(chunk_list(&chunks))))
            }
        }
    }

    /// ランが最新ならメディアを登録して再生を始める
    fn attach_media(&self, run: u64, media: Arc<dyn MediaControl>) -> Result<(), PlaybackError> {
        let mut control = self.control.lock();
        if control.active.as_ref().map(|a| a.run) != Some(run) {
            media.stop();
            return Err(PlaybackError::Cancelled);
        }
        media.start();
        if self.pause.is_paused() {
            media.pause();
        }
        control.media = Some(media);
        Ok(())
    }

    fn detach_media(&self, run: u64) {
        let mut control = self.control.lock();
        if control.active.as_ref().map(|a| a.run) == Some(run) {
            control.media = None;
        }
    }

    /// ランが自然に終わった
    fn finish_run(&self, run: u64) {
        let mut control = self.control.lock();
        if control.active.as_ref().map(|a| a.run) == Some(run) {
            control.active = None;
            control.media = None;
        }
    }
}

fn chunk_list(chunks: &[LoadedChunk]) -> Vec<AudioChunk> {
    chunks.iter().map(|c| c.chunk.clone()).collect()
}

/// キャンセルされたら `Cancelled` を返す。完了後にも確認する。
async fn guard<T, Fut>(token: &CancellationToken, fut: Fut) -> Result<T, PlaybackError>
where
    Fut: Future<Output = Result<T, PlaybackError>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(PlaybackError::Cancelled),
        result = fut => {
            if token.is_cancelled() {
                Err(PlaybackError::Cancelled)
            } else {
                result
            }
        }
    }
}

// ==================== Run loop ====================

async fn run_sequence(
    inner: Arc<Inner>,
    session: Arc<Session>,
    run: u64,
    from: usize,
    resume_from: Option<SubElement>,
    token: CancellationToken,
) {
    inner.metrics.inc_runs_started();
    log::info!(
        "Playback run {} started at step {} (story={})",
        run,
        from,
        session.story_id
    );

    let mut resume_from = resume_from;
    for (index, step) in session.sequence.iter().enumerate().skip(from) {
        let entered = inner.store.apply_for_run(run, |state, events| {
            state.enter_step(index);
            events.push(PlayerEvent::StepStarted {
                run,
                index,
                kind: step.kind(),
            });
        });
        if !entered || token.is_cancelled() {
            return;
        }
        log::debug!("Step {} ({}) started", index, step.kind().as_str());

        let ctx = StepRun {
            inner: &inner,
            session: &session,
            run,
            index,
            token: &token,
        };
        match ctx.play_step(step, resume_from.take()).await {
            Ok(()) => {
                inner.metrics.inc_steps_completed();
                log::debug!("Step {} completed", index);
            }
            Err(e) if e.is_cancelled() => {
                log::debug!("Playback run {} stopped at step {}", run, index);
                return;
            }
            Err(e) => {
                log::error!("Step {} failed: {}", index, e);
                inner.metrics.inc_error(e.code());
                inner.store.apply_for_run(run, |state, events| {
                    let transition = state.fail(index, &e);
                    events.push(PlayerEvent::Failed {
                        run,
                        index,
                        error: e.to_info(),
                    });
                    events.push(PlayerEvent::StateChanged { transition });
                });
                inner.finish_run(run);
                return;
            }
        }
    }

    let finished = inner.store.apply_for_run(run, |state, events| {
        let transition = state.finish();
        events.push(PlayerEvent::Finished { run });
        events.push(PlayerEvent::StateChanged { transition });
    });
    if finished {
        inner.metrics.inc_sequences_finished();
        log::info!("Playback run {} finished", run);
    }
    inner.finish_run(run);
}

/// 1ステップ分の再生コンテキスト
struct StepRun<'a> {
    inner: &'a Inner,
    session: &'a Session,
    run: u64,
    index: usize,
    token: &'a CancellationToken,
}

impl StepRun<'_> {
    async fn play_step(&self, step: &Step, resume_from: Option<SubElement>) -> Result<(), PlaybackError> {
        match *step {
            Step::Wait { wait_ms } => self.wait(wait_ms, 0).await,
            Step::FullDictation { speed_percent } => {
                let speed = self.inner.settings.effective_speed(speed_percent);
                let payload = guard(
                    self.token,
                    self.inner.media.resolve_full_audio(&self.session.story_id, speed),
                )
                .await?;
                self.play_audio(&payload).await
            }
            Step::SentenceBySentence {
                speed_percent,
                gap_ms,
                repeat,
            } => {
                self.play_sentences(speed_percent, gap_ms, repeat, resume_from)
                    .await
            }
        }
    }

    fn publish<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut PlaybackState, &mut Vec<PlayerEvent>),
    {
        self.inner.store.apply_for_run(self.run, f)
    }

    fn publish_progress(&self, progress: Progress) {
        let (run, index) = (self.run, self.index);
        self.publish(|state, events| {
            state.progress = Some(progress);
            if let Some(sub) = state.active_sub_element.as_mut() {
                sub.progress = Some(progress);
            }
            events.push(PlayerEvent::Progress {
                run,
                index,
                progress,
            });
        });
    }

    fn set_sub_element(&self, sub: Option<SubElement>) {
        let (run, index) = (self.run, self.index);
        self.publish(|state, events| {
            state.active_sub_element = sub.clone();
            state.progress = None;
            events.push(PlayerEvent::SubElementChanged {
                run,
                index,
                sub_element: sub,
            });
        });
    }

    /// 一時停止可能なタイマーで待つ（Wait ステップとギャップ）
    async fn wait(&self, total_ms: u64, already_elapsed_ms: u64) -> Result<(), PlaybackError> {
        let already = already_elapsed_ms.min(total_ms);
        self.publish_progress(Progress::new(already, total_ms));
        let outcome = self
            .inner
            .timer
            .wait(
                total_ms,
                already,
                |p| self.publish_progress(p),
                &self.inner.pause,
                self.token,
            )
            .await;
        match outcome {
            TimerOutcome::Completed => Ok(()),
            TimerOutcome::Cancelled => Err(PlaybackError::Cancelled),
        }
    }

    /// メディアを最後まで再生する。進捗はメディアの time-update から公開する。
    async fn play_audio(&self, payload: &AudioPayload) -> Result<(), PlaybackError> {
        let inner = self.inner;
        let duration_ms = inner.player.measure_duration(payload)?;
        let mut media = inner.player.open(payload).await?;
        inner.attach_media(self.run, media.control.clone())?;
        self.publish_progress(Progress::start(duration_ms));

        let mut last = 0u64;
        let result = loop {
            let event = tokio::select! {
                _ = self.token.cancelled() => break Err(PlaybackError::Cancelled),
                event = media.events.recv() => event,
            };
            match event {
                Some(MediaEvent::TimeUpdate(ms)) => {
                    let ms = ms.min(duration_ms);
                    if ms > last {
                        last = ms;
                        self.publish_progress(Progress::new(ms, duration_ms));
                    }
                }
                Some(MediaEvent::Ended) => {
                    if last < duration_ms {
                        self.publish_progress(Progress::new(duration_ms, duration_ms));
                    }
                    break Ok(());
                }
                Some(MediaEvent::Error(message)) => {
                    break Err(PlaybackError::decode(format!(
                        "{} could not be played: {}",
                        payload.audio_id(),
                        message
                    )));
                }
                None if self.token.is_cancelled() => break Err(PlaybackError::Cancelled),
                None => {
                    break Err(PlaybackError::decode(format!(
                        "{} stopped before the end",
                        payload.audio_id()
                    )));
                }
            }
        };

        if result.is_err() {
            media.control.stop();
        }
        inner.detach_media(self.run);
        result
    }

    async fn play_sentences(
        &self,
        speed_percent: u32,
        gap_ms: u64,
        repeat: u32,
        resume_from: Option<SubElement>,
    ) -> Result<(), PlaybackError> {
        let inner = self.inner;
        let speed = inner.settings.effective_speed(speed_percent);
        let chunks = guard(
            self.token,
            inner.media.get_or_fetch_chunks(&self.session.story_id, speed),
        )
        .await?;

        let list = chunk_list(&chunks);
        self.publish(|state, _| state.chunks = list);
        if chunks.is_empty() {
            log::debug!("Step {} has no sentences", self.index);
            return Ok(());
        }

        let repeat = repeat.max(1);
        let last_chunk = chunks.len() - 1;

        // 開始位置（チャンク, サイクル）と途中のギャップの経過時間
        let (start_chunk, start_cycle, mut gap_resume) = match resume_from {
            Some(sub) if sub.chunk_index < chunks.len() => {
                let cycle = sub.cycle.clamp(1, repeat);
                match sub.kind {
                    SubElementKind::Audio => (sub.chunk_index, cycle, None),
                    SubElementKind::Gap => (
                        sub.chunk_index,
                        cycle,
                        Some(sub.progress.map(|p| p.current).unwrap_or(0)),
                    ),
                }
            }
            _ => (0, 1, None),
        };

        for (chunk_index, chunk) in chunks.iter().enumerate().skip(start_chunk) {
            let first_cycle = if chunk_index == start_chunk { start_cycle } else { 1 };
            for cycle in first_cycle..=repeat {
                let resumed_gap = if chunk_index == start_chunk && cycle == first_cycle {
                    gap_resume.take()
                } else {
                    None
                };

                if resumed_gap.is_none() {
                    self.set_sub_element(Some(SubElement::audio(chunk_index, cycle)));
                    self.play_audio(&chunk.payload).await?;
                }

                let is_final = chunk_index == last_chunk && cycle == repeat;
                if !is_final && gap_ms > 0 {
                    self.set_sub_element(Some(SubElement::gap(chunk_index, cycle)));
                    self.wait(gap_ms, resumed_gap.unwrap_or(0)).await?;
                }
                self.set_sub_element(None);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::ErrorCode;
    use crate::infra::media::ClockMediaPlayer;
    use crate::infra::source::StaticAudioSource;
    use std::time::Duration;

    fn settings() -> PlayerSettings {
        PlayerSettings {
            time_update_interval_ms: 100,
            ..Default::default()
        }
    }

    fn sequencer(source: Arc<StaticAudioSource>) -> Sequencer {
        let settings = settings();
        let player = Arc::new(ClockMediaPlayer::from_settings(&settings));
        Sequencer::new(source, player, settings)
    }

    fn seq(raw: &[RawStep]) -> Sequence {
        Sequence::from_raw(raw, false).unwrap()
    }

    #[tokio::test]
    async fn test_load_lifecycle() {
        let seqr = sequencer(Arc::new(StaticAudioSource::new()));
        let steps = seq(&[RawStep::wait(1.0)]);

        assert_eq!(seqr.load("s1", steps.clone()), SessionChange::Started);
        let first_session = seqr.snapshot().session_id.clone();
        assert!(first_session.is_some());

        assert_eq!(seqr.load("s1", steps.clone()), SessionChange::Unchanged);
        assert_eq!(
            seqr.load("s1", seq(&[RawStep::wait(2.0)])),
            SessionChange::SequenceChanged
        );
        assert_eq!(seqr.snapshot().session_id, first_session);

        assert_eq!(seqr.load("s2", steps), SessionChange::StoryChanged);
        assert_ne!(seqr.snapshot().session_id, first_session);
        assert_eq!(seqr.snapshot().story_id.as_deref(), Some("s2"));
    }

    #[tokio::test]
    async fn test_play_without_session() {
        let seqr = sequencer(Arc::new(StaticAudioSource::new()));
        let err = seqr.play().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidState);
    }

    #[tokio::test]
    async fn test_strict_load_rejects_malformed() {
        let source = Arc::new(StaticAudioSource::new());
        let settings = PlayerSettings {
            strict_steps: true,
            ..settings()
        };
        let player = Arc::new(ClockMediaPlayer::from_settings(&settings));
        let seqr = Sequencer::new(source, player, settings);

        let err = seqr
            .load_raw("s1", &[RawStep::wait(1.0), RawStep::default()])
            .unwrap_err();
        assert_eq!(err, PlaybackError::invalid_step(1, "step has neither wait nor speed"));
        assert!(seqr.sequence().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_while_playing_rejected() {
        let seqr = sequencer(Arc::new(StaticAudioSource::new()));
        seqr.load("s1", seq(&[RawStep::wait(5.0)]));
        seqr.play().unwrap();
        let err = seqr.play().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidState);
        seqr.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_sequence_finishes_immediately() {
        let seqr = sequencer(Arc::new(StaticAudioSource::new()));
        seqr.load("s1", Sequence::default());
        seqr.play().unwrap();
        seqr.wait_idle().await;
        assert_eq!(seqr.snapshot().status, PlayerStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume_wait() {
        let seqr = sequencer(Arc::new(StaticAudioSource::new()));
        seqr.load("s1", seq(&[RawStep::wait(1.0)]));
        seqr.play().unwrap();

        tokio::time::sleep(Duration::from_millis(420)).await;
        seqr.pause().unwrap();
        let frozen = seqr.snapshot().progress.unwrap();
        assert!(seqr.snapshot().is_paused);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(seqr.snapshot().progress.unwrap(), frozen);

        seqr.resume().unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let after = seqr.snapshot().progress.unwrap();
        assert!(after.current > frozen.current);

        seqr.wait_idle().await;
        assert_eq!(seqr.snapshot().status, PlayerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_pause_when_idle_rejected() {
        let seqr = sequencer(Arc::new(StaticAudioSource::new()));
        seqr.load("s1", seq(&[RawStep::wait(1.0)]));
        assert_eq!(seqr.pause().unwrap_err().code(), ErrorCode::InvalidState);
        assert_eq!(seqr.resume().unwrap_err().code(), ErrorCode::InvalidState);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_keeps_cursor() {
        let source = Arc::new(StaticAudioSource::new());
        let seqr = sequencer(source.clone());
        seqr.load("s1", seq(&[RawStep::wait(0.1), RawStep::full(100.0)]));
        seqr.play().unwrap();
        seqr.wait_idle().await;

        let state = seqr.snapshot();
        assert_eq!(state.status, PlayerStatus::Idle);
        assert_eq!(state.active_step_index, 1);
        let err = state.last_error.unwrap();
        assert_eq!(err.code, ErrorCode::Fetch);
        assert!(err.recoverable);
        assert_eq!(seqr.metrics().error_counts.fetch, 1);

        // 音声を用意してリトライすると失敗したステップから再開できる
        source.insert_silent_full("s1", 100, 300).unwrap();
        seqr.play().unwrap();
        seqr.wait_idle().await;
        let state = seqr.snapshot();
        assert_eq!(state.status, PlayerStatus::Stopped);
        assert!(state.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_failure() {
        let source = Arc::new(StaticAudioSource::new());
        source.insert_full("s1", 100, "broken", b"not audio".to_vec());
        let seqr = sequencer(source);
        seqr.load("s1", seq(&[RawStep::full(100.0)]));
        seqr.play().unwrap();
        seqr.wait_idle().await;

        let err = seqr.snapshot().last_error.unwrap();
        assert_eq!(err.code, ErrorCode::Decode);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_speed_uses_default() {
        let source = Arc::new(StaticAudioSource::new());
        source.insert_silent_full("s1", 100, 200).unwrap();
        let seqr = sequencer(source.clone());
        seqr.load("s1", seq(&[RawStep::full(-5.0)]));
        seqr.play().unwrap();
        seqr.wait_idle().await;
        assert_eq!(seqr.snapshot().status, PlayerStatus::Stopped);
        assert!(seqr.snapshot().last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_previews_duration() {
        let source = Arc::new(StaticAudioSource::new());
        source.insert_silent_full("s1", 90, 1500).unwrap();
        source.insert_silent_sentences("s1", 80, &[400, 600]).unwrap();
        let seqr = sequencer(source.clone());
        seqr.load(
            "s1",
            seq(&[
                RawStep::wait(2.5),
                RawStep::full(90.0),
                RawStep::sentence(1.0, 80.0, 1),
            ]),
        );

        assert_eq!(seqr.select(0).await.unwrap(), Some(2500));
        assert_eq!(seqr.select(1).await.unwrap(), Some(1500));
        assert_eq!(seqr.snapshot().selected_duration_ms, Some(1500));

        assert_eq!(seqr.select(2).await.unwrap(), Some(400));
        let state = seqr.snapshot();
        assert_eq!(state.chunks.len(), 2);
        assert_eq!(state.active_step_index, 2);
        assert_eq!(state.status, PlayerStatus::Idle);

        // 2回目はキャッシュから
        assert_eq!(seqr.select(1).await.unwrap(), Some(1500));
        assert_eq!(source.metadata_fetches(), 1);
        assert_eq!(source.byte_fetches(), 3);
    }

    #[tokio::test]
    async fn test_select_out_of_range() {
        let seqr = sequencer(Arc::new(StaticAudioSource::new()));
        seqr.load("s1", seq(&[RawStep::wait(1.0)]));
        let err = seqr.select(3).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidStep);
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_sub_element_validation() {
        let source = Arc::new(StaticAudioSource::new());
        source.insert_silent_sentences("s1", 100, &[300, 300]).unwrap();
        let seqr = sequencer(source);
        seqr.load(
            "s1",
            seq(&[RawStep::wait(1.0), RawStep::sentence(0.5, 100.0, 2)]),
        );

        // Wait ステップにはサブ要素が無い
        let err = seqr.select_sub_element(SubElementKind::Audio, 0).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidState);

        seqr.select(1).await.unwrap();
        assert_eq!(
            seqr.select_sub_element(SubElementKind::Gap, 0).await.unwrap(),
            Some(500)
        );
        let sub = seqr.snapshot().active_sub_element.unwrap();
        assert_eq!(sub, SubElement::gap(0, 2));

        let err = seqr.select_sub_element(SubElementKind::Gap, 1).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidStep);
        let err = seqr.select_sub_element(SubElementKind::Audio, 2).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidStep);

        assert_eq!(
            seqr.select_sub_element(SubElementKind::Audio, 1).await.unwrap(),
            Some(300)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_edited_gap_is_resolved_again() {
        let source = Arc::new(StaticAudioSource::new());
        source.insert_silent_sentences("s1", 100, &[300, 300]).unwrap();
        let seqr = sequencer(source.clone());

        seqr.load("s1", seq(&[RawStep::sentence(1.0, 100.0, 1)]));
        seqr.select(0).await.unwrap();
        assert_eq!(
            seqr.select_sub_element(SubElementKind::Gap, 0).await.unwrap(),
            Some(1000)
        );

        // 同じストーリーでギャップだけ編集する（キャッシュは残る）
        assert_eq!(
            seqr.load("s1", seq(&[RawStep::sentence(2.0, 100.0, 1)])),
            SessionChange::SequenceChanged
        );
        seqr.select(0).await.unwrap();
        assert_eq!(
            seqr.select_sub_element(SubElementKind::Gap, 0).await.unwrap(),
            Some(2000)
        );
        assert_eq!(seqr.snapshot().selected_duration_ms, Some(2000));
        assert_eq!(source.sentence_fetches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_from_selected_sub_element() {
        let source = Arc::new(StaticAudioSource::new());
        source.insert_silent_sentences("s1", 100, &[200, 200, 200]).unwrap();
        let seqr = sequencer(source);
        seqr.load("s1", seq(&[RawStep::sentence(0.0, 100.0, 1)]));
        seqr.select(0).await.unwrap();
        seqr.select_sub_element(SubElementKind::Audio, 2).await.unwrap();

        let mut events = seqr.events();
        seqr.play().unwrap();
        seqr.wait_idle().await;

        let mut audio = Vec::new();
        while let Ok(ev) = events.try_recv() {
            if let PlayerEvent::SubElementChanged {
                sub_element: Some(sub),
                ..
            } = ev
            {
                audio.push(sub.chunk_index);
            }
        }
        assert_eq!(audio, vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let seqr = sequencer(Arc::new(StaticAudioSource::new()));
        seqr.load("s1", seq(&[RawStep::wait(1.0)]));
        seqr.stop();
        seqr.stop();
        assert_eq!(seqr.snapshot().status, PlayerStatus::Idle);
        assert_eq!(seqr.metrics().runs_cancelled, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_story_change_clears_caches() {
        let source = Arc::new(StaticAudioSource::new());
        source.insert_silent_full("s1", 100, 100).unwrap();
        source.insert_silent_full("s2", 100, 100).unwrap();
        let seqr = sequencer(source.clone());

        seqr.load("s1", seq(&[RawStep::full(100.0)]));
        seqr.select(0).await.unwrap();
        seqr.load("s2", seq(&[RawStep::full(100.0)]));
        seqr.load("s1", seq(&[RawStep::full(100.0)]));
        seqr.select(0).await.unwrap();

        assert_eq!(source.metadata_fetches(), 2);
    }
}
