//! Session lifecycle state machine and its one-second clock.
//!
//! # Transition table
//!
//! | From | Event | To | Effect |
//! |---|---|---|---|
//! | `Idle` | `Start` | `Running` | needs a config; clock starts at 0 s |
//! | `Running` | `Pause` | `Paused` | clock frozen, pause instant recorded |
//! | `Running` | `Stop` | `Stopped` | clock stopped, completion emitted |
//! | `Running` | `Tick` | `Running` | elapsed +1 s, remaining −1 s |
//! | `Paused` | `Resume` | `Running` | pause interval added to the paused total |
//! | `Paused` | `Stop` | `Stopped` | completion emitted |
//! | `Stopped` | `Reset` | `Idle` | config and clock history cleared |
//!
//! Every other pair is rejected with [`SessionError::InvalidTransition`] and
//! leaves the machine untouched.  Only the internal clock advances the timer:
//! a `Tick` passed to [`SessionStateMachine::transition`] in `Running`
//! succeeds without touching it.  An internal tick in any state other than
//! `Running` is dropped silently, which absorbs a tick racing a pause or stop.
//!
//! When the remaining time reaches zero the machine stops itself *before*
//! the timer listeners hear about that tick, so no listener ever sees a
//! running session with nothing left on the clock.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{ConfigError, SessionError};
use crate::protocol::{ENTRAINMENT_FREQUENCY_RANGE, VOLUME_RANGE};
use crate::registry::{ListenerHandle, ListenerRegistry};
use crate::types::now_ms;

// ── States and events ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Running,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionEvent {
    Start,
    Pause,
    Resume,
    Stop,
    Reset,
    Tick,
}

impl SessionEvent {
    pub const ALL: [SessionEvent; 6] = [
        SessionEvent::Start,
        SessionEvent::Pause,
        SessionEvent::Resume,
        SessionEvent::Stop,
        SessionEvent::Reset,
        SessionEvent::Tick,
    ];
}

impl SessionState {
    pub const ALL: [SessionState; 4] = [
        SessionState::Idle,
        SessionState::Running,
        SessionState::Paused,
        SessionState::Stopped,
    ];

    /// The transition table.  `None` means the pair is illegal.
    pub const fn next(self, event: SessionEvent) -> Option<SessionState> {
        use SessionEvent as E;
        use SessionState as S;
        match (self, event) {
            (S::Idle, E::Start) => Some(S::Running),
            (S::Running, E::Pause) => Some(S::Paused),
            (S::Running, E::Stop) => Some(S::Stopped),
            (S::Running, E::Tick) => Some(S::Running),
            (S::Paused, E::Resume) => Some(S::Running),
            (S::Paused, E::Stop) => Some(S::Stopped),
            (S::Stopped, E::Reset) => Some(S::Idle),
            _ => None,
        }
    }

    pub const fn can_start(self) -> bool {
        self.next(SessionEvent::Start).is_some()
    }

    pub const fn can_pause(self) -> bool {
        self.next(SessionEvent::Pause).is_some()
    }

    pub const fn can_resume(self) -> bool {
        self.next(SessionEvent::Resume).is_some()
    }

    pub const fn can_stop(self) -> bool {
        self.next(SessionEvent::Stop).is_some()
    }

    pub const fn can_reset(self) -> bool {
        self.next(SessionEvent::Reset).is_some()
    }
}

// ── Config ────────────────────────────────────────────────────────────────────

/// What kind of session is being run.  Stored with the completion record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    /// Baseline recording without entrainment.
    Calibration,
    /// Entrainment switched on and off from the measured theta z-score.
    ClosedLoop,
    /// Entrainment on for the whole session.
    OpenLoop,
}

/// Session parameters, fixed once the session leaves `Idle`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub session_type: SessionType,
    /// Target length in minutes; `None` runs until stopped.
    pub duration_minutes: Option<f64>,
    /// Entrainment frequency in Hz, within the device band.
    pub target_frequency_hz: f32,
    /// Entrainment volume, 0–1.
    pub target_volume: f32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_type: SessionType::ClosedLoop,
            duration_minutes: Some(20.0),
            target_frequency_hz: 6.0,
            target_volume: 0.5,
        }
    }
}

impl SessionConfig {
    /// Target length in whole seconds, rounded to the nearest second.
    pub fn duration_seconds(&self) -> Option<u64> {
        self.duration_minutes.map(|m| (m * 60.0).round() as u64)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(m) = self.duration_minutes {
            if !m.is_finite() || m <= 0.0 || self.duration_seconds() == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "duration must be at least one second, got {m} min"
                )));
            }
        }
        if !ENTRAINMENT_FREQUENCY_RANGE.contains(&self.target_frequency_hz) {
            return Err(ConfigError::Invalid(format!(
                "target frequency {} Hz outside {:?}",
                self.target_frequency_hz, ENTRAINMENT_FREQUENCY_RANGE
            )));
        }
        if !VOLUME_RANGE.contains(&self.target_volume) {
            return Err(ConfigError::Invalid(format!(
                "target volume {} outside {:?}",
                self.target_volume, VOLUME_RANGE
            )));
        }
        Ok(())
    }
}

// ── Listener payloads ─────────────────────────────────────────────────────────

/// Read-only view of the clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerState {
    pub state: SessionState,
    pub elapsed_seconds: u64,
    /// `None` for open-ended sessions.  Never below zero.
    pub remaining_seconds: Option<u64>,
    /// Sum of completed pause intervals.
    pub total_paused: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub from: SessionState,
    pub to: SessionState,
    pub event: SessionEvent,
}

/// Emitted once when a session reaches `Stopped`.  Downstream persistence
/// stores this together with the aggregator summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCompletion {
    pub config: SessionConfig,
    pub elapsed_seconds: u64,
    pub total_paused: Duration,
    /// `true` when the target duration ran out, `false` for an explicit stop.
    pub expired: bool,
    /// Wall-clock end of the session, ms since Unix epoch.
    pub ended_at_ms: u64,
}

// ── Machine ───────────────────────────────────────────────────────────────────

struct Core {
    state: SessionState,
    config: Option<SessionConfig>,
    elapsed: u64,
    target: Option<u64>,
    total_paused: Duration,
    paused_at: Option<Instant>,
    completed: bool,
    /// Bumped whenever the clock is (re)started or stopped.  A clock task
    /// carrying an older value is stale and its ticks are ignored.
    generation: u64,
    clock: Option<JoinHandle<()>>,
}

impl Core {
    fn timer_state(&self) -> TimerState {
        TimerState {
            state: self.state,
            elapsed_seconds: self.elapsed,
            remaining_seconds: self.target.map(|t| t.saturating_sub(self.elapsed)),
            total_paused: self.total_paused,
        }
    }

    fn halt_clock(&mut self) {
        self.generation += 1;
        if let Some(task) = self.clock.take() {
            task.abort();
        }
    }
}

/// Notifications gathered under the lock and delivered after it is released.
#[derive(Default)]
struct Outbox {
    change: Option<StateChange>,
    completion: Option<SessionCompletion>,
    tick: Option<TimerState>,
}

struct Inner {
    core: Mutex<Core>,
    /// `None` disables the internal clock (unit tests step it by hand).
    tick_period: Option<Duration>,
    state_listeners: ListenerRegistry<StateChange>,
    timer_listeners: ListenerRegistry<TimerState>,
    completion_listeners: ListenerRegistry<SessionCompletion>,
}

/// The authority on session phase and time.
///
/// All methods take `&self`; wrap the machine in an `Arc` to share it between
/// the UI layer and the task feeding the aggregator.  Listeners run after the
/// internal lock is released, so they may call back into the machine.
///
/// Starting or resuming spawns the clock on the current tokio runtime.
pub struct SessionStateMachine {
    inner: Arc<Inner>,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    /// Machine with the standard one-second clock.
    pub fn new() -> Self {
        Self::with_tick_period(Duration::from_secs(1))
    }

    /// Machine whose clock advances one "second" every `period` of real time.
    /// Shorter periods compress a session for demos and soak runs.
    pub fn with_tick_period(period: Duration) -> Self {
        Self::build(Some(period.max(Duration::from_millis(1))))
    }

    #[cfg(test)]
    pub(crate) fn manual() -> Self {
        Self::build(None)
    }

    fn build(tick_period: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                core: Mutex::new(Core {
                    state: SessionState::Idle,
                    config: None,
                    elapsed: 0,
                    target: None,
                    total_paused: Duration::ZERO,
                    paused_at: None,
                    completed: false,
                    generation: 0,
                    clock: None,
                }),
                tick_period,
                state_listeners: ListenerRegistry::new("session state"),
                timer_listeners: ListenerRegistry::new("session timer"),
                completion_listeners: ListenerRegistry::new("session completion"),
            }),
        }
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        self.inner.core().state
    }

    pub fn config(&self) -> Option<SessionConfig> {
        self.inner.core().config.clone()
    }

    pub fn timer_state(&self) -> TimerState {
        self.inner.core().timer_state()
    }

    // ── Config ────────────────────────────────────────────────────────────────

    /// Attach the session config.  Only legal while `Idle`.
    pub fn set_config(&self, config: SessionConfig) -> Result<(), ConfigError> {
        let mut core = self.inner.core();
        if core.state != SessionState::Idle {
            return Err(ConfigError::NotIdle(core.state));
        }
        config.validate()?;
        core.target = config.duration_seconds();
        core.config = Some(config);
        Ok(())
    }

    // ── Events ────────────────────────────────────────────────────────────────

    pub fn start(&self) -> Result<SessionState, SessionError> {
        self.transition(SessionEvent::Start)
    }

    pub fn pause(&self) -> Result<SessionState, SessionError> {
        self.transition(SessionEvent::Pause)
    }

    pub fn resume(&self) -> Result<SessionState, SessionError> {
        self.transition(SessionEvent::Resume)
    }

    pub fn stop(&self) -> Result<SessionState, SessionError> {
        self.transition(SessionEvent::Stop)
    }

    pub fn reset(&self) -> Result<SessionState, SessionError> {
        self.transition(SessionEvent::Reset)
    }

    /// Apply a user event.  On error nothing has changed.
    ///
    /// `Tick` belongs to the internal clock: in `Running` it is accepted
    /// here as a no-op and the timer is left alone; elsewhere it is rejected.
    pub fn transition(&self, event: SessionEvent) -> Result<SessionState, SessionError> {
        let mut out = Outbox::default();
        let result = {
            let mut core = self.inner.core();
            let from = core.state;
            match from.next(event) {
                Some(to) if event == SessionEvent::Tick => Ok(to),
                Some(to) => self.apply(&mut core, event, to, &mut out).map(|()| to),
                None => Err(SessionError::InvalidTransition { from, event }),
            }
        };
        if let Err(e) = &result {
            debug!("session: rejected {event:?}: {e}");
        }
        self.inner.deliver(out);
        result
    }

    fn apply(
        &self,
        core: &mut Core,
        event: SessionEvent,
        to: SessionState,
        out: &mut Outbox,
    ) -> Result<(), SessionError> {
        let from = core.state;
        match event {
            SessionEvent::Start => {
                if core.config.is_none() {
                    return Err(ConfigError::Missing.into());
                }
                if self.inner.tick_period.is_some() && tokio::runtime::Handle::try_current().is_err()
                {
                    return Err(SessionError::NoRuntime);
                }
                core.elapsed = 0;
                core.total_paused = Duration::ZERO;
                core.paused_at = None;
                core.completed = false;
                core.state = to;
                self.spawn_clock(core);
            }
            SessionEvent::Pause => {
                core.halt_clock();
                core.paused_at = Some(Instant::now());
                core.state = to;
            }
            SessionEvent::Resume => {
                if self.inner.tick_period.is_some() && tokio::runtime::Handle::try_current().is_err()
                {
                    return Err(SessionError::NoRuntime);
                }
                if let Some(at) = core.paused_at.take() {
                    core.total_paused += at.elapsed();
                }
                core.state = to;
                self.spawn_clock(core);
            }
            SessionEvent::Stop => {
                core.state = to;
                Inner::finish(core, false, out);
            }
            SessionEvent::Reset => {
                core.halt_clock();
                core.config = None;
                core.target = None;
                core.elapsed = 0;
                core.total_paused = Duration::ZERO;
                core.paused_at = None;
                core.completed = false;
                core.state = to;
            }
            // Ticks are routed through `Inner::tick`.
            SessionEvent::Tick => return Err(SessionError::InvalidTransition { from, event }),
        }
        info!("session: {from:?} --{event:?}--> {to:?}");
        out.change = Some(StateChange { from, to, event });
        Ok(())
    }

    fn spawn_clock(&self, core: &mut Core) {
        core.halt_clock();
        let Some(period) = self.inner.tick_period else {
            return;
        };
        let generation = core.generation;
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        core.clock = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if !inner.tick(generation) {
                    break;
                }
            }
        }));
    }

    #[cfg(test)]
    pub(crate) fn tick_now(&self) -> bool {
        let generation = self.inner.core().generation;
        self.inner.tick(generation)
    }

    // ── Listeners ─────────────────────────────────────────────────────────────

    pub fn add_state_listener(
        &self,
        listener: impl Fn(&StateChange) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.inner.state_listeners.add(listener)
    }

    pub fn add_timer_listener(
        &self,
        listener: impl Fn(&TimerState) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.inner.timer_listeners.add(listener)
    }

    pub fn add_completion_listener(
        &self,
        listener: impl Fn(&SessionCompletion) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.inner.completion_listeners.add(listener)
    }

    /// Stop the clock and drop every listener.  Call before discarding the
    /// owning session object; the machine stays usable but silent.
    pub fn destroy(&self) {
        self.inner.core().halt_clock();
        self.inner.state_listeners.clear();
        self.inner.timer_listeners.clear();
        self.inner.completion_listeners.clear();
    }
}

impl Drop for SessionStateMachine {
    fn drop(&mut self) {
        self.inner.core().halt_clock();
    }
}

impl Inner {
    fn core(&self) -> MutexGuard<'_, Core> {
        // Listeners never run under this lock, so poisoning can only come from
        // a bug inside this module; the state is still the last committed one.
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// One clock tick.  Returns whether the clock should keep running.
    fn tick(&self, generation: u64) -> bool {
        let mut out = Outbox::default();
        let keep_going = {
            let mut core = self.core();
            if core.generation != generation || core.state != SessionState::Running {
                return false;
            }
            core.elapsed += 1;
            if core.target.is_some_and(|t| core.elapsed >= t) {
                core.state = SessionState::Stopped;
                info!(
                    "session: time expired after {} s --Stop--> Stopped",
                    core.elapsed
                );
                out.change = Some(StateChange {
                    from: SessionState::Running,
                    to: SessionState::Stopped,
                    event: SessionEvent::Stop,
                });
                Self::finish(&mut core, true, &mut out);
            }
            out.tick = Some(core.timer_state());
            core.state == SessionState::Running
        };
        debug!("session: tick {:?}", out.tick);
        self.deliver(out);
        keep_going
    }

    /// Stop the clock and, once per session, build the completion record.
    fn finish(core: &mut Core, expired: bool, out: &mut Outbox) {
        core.halt_clock();
        if let Some(at) = core.paused_at.take() {
            core.total_paused += at.elapsed();
        }
        if core.completed {
            warn!("session: completion already emitted; not emitting again");
            return;
        }
        core.completed = true;
        if let Some(config) = core.config.clone() {
            out.completion = Some(SessionCompletion {
                config,
                elapsed_seconds: core.elapsed,
                total_paused: core.total_paused,
                expired,
                ended_at_ms: now_ms(),
            });
        }
    }

    /// State change, then completion, then the tick.
    fn deliver(&self, out: Outbox) {
        if let Some(change) = out.change {
            self.state_listeners.emit(&change);
        }
        if let Some(completion) = out.completion {
            self.completion_listeners.emit(&completion);
        }
        if let Some(tick) = out.tick {
            self.timer_listeners.emit(&tick);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn config(minutes: f64) -> SessionConfig {
        SessionConfig {
            duration_minutes: Some(minutes),
            ..SessionConfig::default()
        }
    }

    /// Drive a manual machine into `state`.
    fn machine_in(state: SessionState) -> SessionStateMachine {
        let m = SessionStateMachine::manual();
        m.set_config(config(5.0)).unwrap();
        match state {
            SessionState::Idle => {}
            SessionState::Running => {
                m.start().unwrap();
            }
            SessionState::Paused => {
                m.start().unwrap();
                m.pause().unwrap();
            }
            SessionState::Stopped => {
                m.start().unwrap();
                m.stop().unwrap();
            }
        }
        assert_eq!(m.state(), state);
        m
    }

    #[test]
    fn test_transition_table_matches_predicates() {
        for s in SessionState::ALL {
            assert_eq!(s.can_start(), s == SessionState::Idle);
            assert_eq!(s.can_pause(), s == SessionState::Running);
            assert_eq!(s.can_resume(), s == SessionState::Paused);
            assert_eq!(
                s.can_stop(),
                matches!(s, SessionState::Running | SessionState::Paused)
            );
            assert_eq!(s.can_reset(), s == SessionState::Stopped);
        }
        assert_eq!(
            SessionState::Running.next(SessionEvent::Tick),
            Some(SessionState::Running)
        );
        let legal = SessionState::ALL
            .iter()
            .flat_map(|s| SessionEvent::ALL.iter().map(move |e| s.next(*e)))
            .filter(Option::is_some)
            .count();
        assert_eq!(legal, 7);
    }

    #[test]
    fn test_every_user_event_follows_the_table() {
        for from in SessionState::ALL {
            for event in SessionEvent::ALL {
                let m = machine_in(from);
                let before = m.timer_state();
                let result = m.transition(event);
                match from.next(event) {
                    Some(to) => {
                        assert_eq!(result, Ok(to), "{from:?} + {event:?}");
                        assert_eq!(m.state(), to);
                    }
                    None => {
                        assert_eq!(
                            result,
                            Err(SessionError::InvalidTransition { from, event }),
                            "{from:?} + {event:?}"
                        );
                        assert_eq!(m.state(), from);
                        assert_eq!(m.timer_state(), before);
                    }
                }
            }
        }
    }

    #[test]
    fn test_external_tick_leaves_timer_alone() {
        let m = machine_in(SessionState::Running);
        let before = m.timer_state();
        let changes = Arc::new(Mutex::new(0));
        let c = Arc::clone(&changes);
        m.add_state_listener(move |_| *c.lock().unwrap() += 1);
        assert_eq!(m.transition(SessionEvent::Tick), Ok(SessionState::Running));
        assert_eq!(m.timer_state(), before);
        assert_eq!(*changes.lock().unwrap(), 0);
        assert!(m.tick_now());
        assert_eq!(m.timer_state().elapsed_seconds, before.elapsed_seconds + 1);
    }

    #[test]
    fn test_start_requires_config() {
        let m = SessionStateMachine::manual();
        assert_eq!(m.start(), Err(SessionError::Config(ConfigError::Missing)));
        assert_eq!(m.state(), SessionState::Idle);
    }

    #[test]
    fn test_set_config_only_while_idle() {
        let m = machine_in(SessionState::Running);
        assert_eq!(
            m.set_config(config(1.0)),
            Err(ConfigError::NotIdle(SessionState::Running))
        );
        assert_eq!(m.config(), Some(config(5.0)));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let m = SessionStateMachine::manual();
        assert!(m.set_config(config(0.0)).is_err());
        assert!(m.set_config(config(-1.0)).is_err());
        assert!(m.set_config(config(f64::NAN)).is_err());
        assert!(m
            .set_config(SessionConfig {
                target_frequency_hz: 10.0,
                ..SessionConfig::default()
            })
            .is_err());
        assert!(m
            .set_config(SessionConfig {
                target_volume: 1.2,
                ..SessionConfig::default()
            })
            .is_err());
        assert_eq!(m.config(), None);
    }

    #[test]
    fn test_manual_ticks_count_down() {
        let m = machine_in(SessionState::Running);
        for _ in 0..125 {
            assert!(m.tick_now());
        }
        let t = m.timer_state();
        assert_eq!(t.elapsed_seconds, 125);
        assert_eq!(t.remaining_seconds, Some(175));
    }

    #[test]
    fn test_tick_outside_running_is_noop() {
        for state in [SessionState::Idle, SessionState::Paused, SessionState::Stopped] {
            let m = machine_in(state);
            let before = m.timer_state();
            assert!(!m.tick_now());
            assert_eq!(m.timer_state(), before);
        }
    }

    #[test]
    fn test_open_ended_session_has_no_remaining() {
        let m = SessionStateMachine::manual();
        m.set_config(SessionConfig {
            duration_minutes: None,
            ..SessionConfig::default()
        })
        .unwrap();
        m.start().unwrap();
        for _ in 0..10 {
            m.tick_now();
        }
        let t = m.timer_state();
        assert_eq!(t.elapsed_seconds, 10);
        assert_eq!(t.remaining_seconds, None);
        assert_eq!(m.state(), SessionState::Running);
    }

    #[test]
    fn test_expiry_stops_before_tick_listener_runs() {
        let m = SessionStateMachine::manual();
        m.set_config(config(0.1)).unwrap();
        m.start().unwrap();

        let completions = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&completions);
        m.add_completion_listener(move |done| {
            assert!(done.expired);
            assert_eq!(done.elapsed_seconds, 6);
            c.fetch_add(1, Ordering::SeqCst);
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        m.add_timer_listener(move |t| s.lock().unwrap().push(t.clone()));

        for _ in 0..10 {
            m.tick_now();
        }
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 6);
        let last = seen.last().unwrap();
        assert_eq!(last.state, SessionState::Stopped);
        assert_eq!(last.remaining_seconds, Some(0));
        assert!(seen[..5].iter().all(|t| t.state == SessionState::Running));
        assert_eq!(completions.load(Ordering::SeqCst), 1);
        assert_eq!(m.state(), SessionState::Stopped);
    }

    #[test]
    fn test_stop_emits_completion_once_per_session() {
        let m = machine_in(SessionState::Running);
        let completions = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&completions);
        m.add_completion_listener(move |done| {
            assert!(!done.expired);
            c.fetch_add(1, Ordering::SeqCst);
        });
        m.tick_now();
        m.stop().unwrap();
        assert!(m.stop().is_err());
        assert_eq!(completions.load(Ordering::SeqCst), 1);

        m.reset().unwrap();
        assert_eq!(m.config(), None);
        assert_eq!(m.timer_state().elapsed_seconds, 0);
        m.set_config(config(1.0)).unwrap();
        m.start().unwrap();
        m.stop().unwrap();
        assert_eq!(completions.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_state_listener_sees_every_transition() {
        let m = SessionStateMachine::manual();
        m.set_config(config(1.0)).unwrap();
        let changes = Arc::new(Mutex::new(Vec::new()));
        let c = Arc::clone(&changes);
        let handle = m.add_state_listener(move |ch| c.lock().unwrap().push((ch.from, ch.to)));
        m.start().unwrap();
        m.pause().unwrap();
        m.resume().unwrap();
        m.stop().unwrap();
        handle.unsubscribe();
        m.reset().unwrap();
        use SessionState::*;
        assert_eq!(
            *changes.lock().unwrap(),
            vec![
                (Idle, Running),
                (Running, Paused),
                (Paused, Running),
                (Running, Stopped)
            ]
        );
    }

    #[test]
    fn test_listener_may_call_back_into_machine() {
        let m = Arc::new(SessionStateMachine::manual());
        m.set_config(config(1.0)).unwrap();
        let weak = Arc::downgrade(&m);
        m.add_timer_listener(move |t| {
            if t.elapsed_seconds == 3 {
                if let Some(m) = weak.upgrade() {
                    m.pause().unwrap();
                }
            }
        });
        m.start().unwrap();
        for _ in 0..5 {
            m.tick_now();
        }
        assert_eq!(m.state(), SessionState::Paused);
        assert_eq!(m.timer_state().elapsed_seconds, 3);
    }

    #[test]
    fn test_panicking_listener_leaves_machine_consistent() {
        let m = machine_in(SessionState::Idle);
        m.add_state_listener(|_| panic!("listener bug"));
        assert_eq!(m.start(), Ok(SessionState::Running));
        assert_eq!(m.state(), SessionState::Running);
        assert_eq!(m.pause(), Ok(SessionState::Paused));
    }

    #[test]
    fn test_destroy_clears_listeners() {
        let m = machine_in(SessionState::Running);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        m.add_timer_listener(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        m.destroy();
        m.tick_now();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_clock_needs_runtime() {
        let m = SessionStateMachine::new();
        m.set_config(config(1.0)).unwrap();
        assert_eq!(m.start(), Err(SessionError::NoRuntime));
        assert_eq!(m.state(), SessionState::Idle);
    }

    // ── Internal clock, on tokio's paused test clock ──────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_clock_elapsed_and_remaining() {
        let m = SessionStateMachine::new();
        m.set_config(config(5.0)).unwrap();
        m.start().unwrap();

        tokio::time::sleep(Duration::from_millis(125_500)).await;
        let t = m.timer_state();
        assert_eq!(t.elapsed_seconds, 125);
        assert_eq!(t.remaining_seconds, Some(175));

        m.pause().unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(m.timer_state().elapsed_seconds, 125);
        m.resume().unwrap();
        assert_eq!(m.timer_state().total_paused, Duration::from_secs(10));

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(m.timer_state().elapsed_seconds, 127);
        assert_eq!(m.timer_state().total_paused, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_auto_completes_exactly_once() {
        let m = SessionStateMachine::new();
        m.set_config(config(0.1)).unwrap();

        let stops = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&stops);
        m.add_state_listener(move |ch| {
            if ch.to == SessionState::Stopped {
                s.fetch_add(1, Ordering::SeqCst);
            }
        });
        let completions = Arc::new(Mutex::new(Vec::new()));
        let c = Arc::clone(&completions);
        m.add_completion_listener(move |done| c.lock().unwrap().push(done.clone()));

        m.start().unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(m.state(), SessionState::Stopped);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        let completions = completions.lock().unwrap();
        assert_eq!(completions.len(), 1);
        assert!(completions[0].expired);
        assert_eq!(completions[0].elapsed_seconds, 6);
        let t = m.timer_state();
        assert_eq!(t.elapsed_seconds, 6);
        assert_eq!(t.remaining_seconds, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_freezes_clock_until_resume() {
        let m = SessionStateMachine::new();
        m.set_config(config(1.0)).unwrap();
        m.start().unwrap();
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        m.pause().unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(m.timer_state().elapsed_seconds, 3);
        m.stop().unwrap();
        assert_eq!(m.timer_state().total_paused, Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(m.timer_state().elapsed_seconds, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_stops_clock() {
        let m = SessionStateMachine::new();
        m.set_config(config(1.0)).unwrap();
        m.start().unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        m.destroy();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(m.timer_state().elapsed_seconds, 2);
    }
}
