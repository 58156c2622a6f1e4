//! The event-transform core: per-key state table, deferred-edge scheduler,
//! chord detection, tap/hold classifier, and the main loop that couples
//! input readiness with the earliest pending timer.
//!
//! This module is deliberately independent of `evdev`/`uinput` — it consumes
//! `RawEvent`s through the `InputSource` trait and produces edges through
//! the `OutputSink` trait (`crate::sink`), so the whole state machine is
//! unit-testable without real hardware.

use std::time::Duration;

use anyhow::Result;
use log::trace;

use crate::clock::{Clock, Instant, MonotonicClock};
use crate::sink::OutputSink;

/// A single incoming key event: `(code, value)` with `value ∈ {0, 1, 2}`
/// (up, down, held-repeat).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEvent {
    pub code: u16,
    pub value: u8,
}

impl RawEvent {
    pub fn new(code: u16, value: u8) -> Self {
        Self { code, value }
    }
}

/// What happened on one pass of waiting for input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// An event was read and is ready for classification.
    Ready(RawEvent),
    /// The wait deadline elapsed with no event; armed timers should still
    /// be checked.
    TimedOut,
    /// The source reported a dropped-event condition and has fully
    /// resynced; every event drained during resync was discarded without
    /// transformation.
    Resynced,
    /// The source is exhausted; the loop should return.
    Eof,
}

/// Source of raw key events the core consumes.
///
/// `poll` must wait for an event with the given absolute `deadline` (`None`
/// means wait indefinitely), performing any resync protocol transparently
/// and reporting it via `PollOutcome::Resynced` rather than surfacing the
/// dropped events themselves.
pub trait InputSource {
    fn poll(&mut self, deadline: Option<Instant>) -> Result<PollOutcome>;
}

/// Physical state of a mod-map row's source key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Up,
    Down,
    Held,
}

impl KeyState {
    fn from_value(value: u8) -> Self {
        match value {
            0 => KeyState::Up,
            1 => KeyState::Down,
            // Any repeat value (2, or an out-of-range value a permissive
            // source might forward) is logically "still held".
            _ => KeyState::Held,
        }
    }

    /// True for `Down` or `Held`: the key is physically down right now,
    /// whether or not it has repeated yet.
    fn is_active(self) -> bool {
        matches!(self, KeyState::Down | KeyState::Held)
    }
}

/// Static configuration for one mod-map row, as loaded from `config::Config`.
#[derive(Debug, Clone, Copy)]
pub struct ModKeyConfig {
    pub key: u16,
    /// `0` means "emit `key` itself".
    pub primary_function: u16,
    /// `0` means "no secondary — tap-only remap", i.e. not a janus key.
    pub secondary_function: u16,
}

/// One row of the mod map, with its live timing/physical state.
#[derive(Debug, Clone)]
pub struct ModKeyRow {
    pub key: u16,
    pub primary_function: u16,
    pub secondary_function: u16,

    state: KeyState,
    last_time_down: Instant,
    delayed_down_pending: bool,
    send_down_at: Instant,
    last_secondary_value_sent: u8,
}

impl ModKeyRow {
    fn new(cfg: ModKeyConfig, epoch: Instant) -> Self {
        Self {
            key: cfg.key,
            primary_function: cfg.primary_function,
            secondary_function: cfg.secondary_function,
            state: KeyState::Up,
            last_time_down: epoch,
            delayed_down_pending: false,
            send_down_at: epoch,
            last_secondary_value_sent: 0,
        }
    }

    /// A janus key iff it has a non-zero secondary function.
    fn is_janus(&self) -> bool {
        self.secondary_function != 0
    }

    fn is_active(&self) -> bool {
        self.is_janus() && self.state.is_active()
    }

    /// The code to emit on tap: `primary_function`, or `key` itself when
    /// `primary_function == 0`.
    fn primary_code(&self) -> u16 {
        if self.primary_function != 0 {
            self.primary_function
        } else {
            self.key
        }
    }
}

/// The event-transform core. Holds the mod map, `max_delay`, and the
/// chord flag that remembers whether the last release closed out a chord
/// (so a following tap-speed release of the same janus key isn't
/// mistaken for a second, unrelated tap).
pub struct Engine<C: Clock = MonotonicClock> {
    clock: C,
    rows: Vec<ModKeyRow>,
    max_delay: Duration,
    last_input_was_chord: bool,
}

impl Engine<MonotonicClock> {
    pub fn new(rows: Vec<ModKeyConfig>, max_delay: Duration) -> Self {
        Self::with_clock(MonotonicClock, rows, max_delay)
    }
}

impl<C: Clock> Engine<C> {
    pub fn with_clock(clock: C, rows: Vec<ModKeyConfig>, max_delay: Duration) -> Self {
        let epoch = clock.now();
        let rows = rows.into_iter().map(|r| ModKeyRow::new(r, epoch)).collect();
        Self {
            clock,
            rows,
            max_delay,
            last_input_was_chord: false,
        }
    }

    /// Consumes `input` until exhaustion or fatal error, emitting the
    /// derived synthetic stream to `output`.
    pub fn run(&mut self, input: &mut impl InputSource, output: &mut impl OutputSink) -> Result<()> {
        loop {
            let deadline = self.earliest_deadline();
            match input.poll(deadline)? {
                PollOutcome::Eof => return Ok(()),
                PollOutcome::TimedOut => {
                    self.fire_expired_timers(output)?;
                }
                PollOutcome::Resynced => {
                    // Drained events were discarded without transformation;
                    // still let any timer that matured during the drain fire.
                    self.fire_expired_timers(output)?;
                }
                PollOutcome::Ready(event) => {
                    // Any timer that matured while we were waiting fires
                    // before the freshly arrived event is handled, so a
                    // deferred secondary-down never arrives out of order.
                    self.fire_expired_timers(output)?;
                    self.handle_event(event, output)?;
                }
            }
        }
    }

    /// The earliest `send_down_at` among armed timers, or `None` if the set
    /// is empty (wait indefinitely).
    fn earliest_deadline(&self) -> Option<Instant> {
        self.rows
            .iter()
            .filter(|r| r.delayed_down_pending)
            .map(|r| r.send_down_at)
            .min()
    }

    /// For every row whose deferred secondary-down has matured, emit it
    /// (unless already emitted) and disarm it.
    fn fire_expired_timers(&mut self, output: &mut impl OutputSink) -> Result<()> {
        let now = self.clock.now();
        for row in &mut self.rows {
            if row.delayed_down_pending && now >= row.send_down_at {
                if row.last_secondary_value_sent != 1 {
                    trace!(
                        "deferred secondary down: key={} secondary={}",
                        row.key, row.secondary_function
                    );
                    output.emit(row.secondary_function, 1)?;
                    row.last_secondary_value_sent = 1;
                }
                row.delayed_down_pending = false;
            }
        }
        Ok(())
    }

    fn find_row(&self, code: u16) -> Option<usize> {
        self.rows.iter().position(|r| r.key == code)
    }

    /// The first janus row that is currently down or held, if any.
    fn any_janus_active(&self) -> Option<usize> {
        self.rows.iter().position(|r| r.is_active())
    }

    /// Asserts or releases the secondary function of every currently
    /// active janus row, skipping any row whose secondary is already at
    /// `value` so the same edge is never emitted twice in a row.
    fn force_secondary_edges(&mut self, value: u8, output: &mut impl OutputSink) -> Result<()> {
        for row in &mut self.rows {
            if row.is_active() {
                row.delayed_down_pending = false;
                if row.last_secondary_value_sent != value {
                    output.emit(row.secondary_function, value)?;
                    row.last_secondary_value_sent = value;
                }
            }
        }
        Ok(())
    }

    /// Emits `value` for `code`'s mapped primary function, or for `code`
    /// itself when it isn't a mod-map row.
    fn emit_primary(&self, code: u16, value: u8, output: &mut impl OutputSink) -> Result<()> {
        let out_code = match self.find_row(code) {
            Some(idx) => self.rows[idx].primary_code(),
            None => code,
        };
        output.emit(out_code, value)
    }

    /// Release of a janus row whose secondary may already have been
    /// asserted: close it if so, otherwise there is nothing to undo.
    fn close_secondary(&mut self, idx: usize, output: &mut impl OutputSink) -> Result<()> {
        let row = &mut self.rows[idx];
        if row.last_secondary_value_sent != 0 {
            output.emit(row.secondary_function, 0)?;
            row.last_secondary_value_sent = 0;
        }
        Ok(())
    }

    fn handle_event(&mut self, event: RawEvent, output: &mut impl OutputSink) -> Result<()> {
        trace!("IN code={} value={}", event.code, event.value);
        match self.find_row(event.code) {
            Some(idx) if self.rows[idx].is_janus() => self.handle_janus(idx, event.value, output),
            _ => self.handle_non_janus(event.code, event.value, output),
        }
    }

    /// Handles a key that is either unmapped or a primary-only remap row;
    /// both pass straight through to `emit_primary` and only differ in
    /// what code that resolves to. A co-press while a janus key is active
    /// forces that janus key's secondary function open, turning the pair
    /// into a chord.
    fn handle_non_janus(&mut self, code: u16, value: u8, output: &mut impl OutputSink) -> Result<()> {
        match value {
            1 | 2 => {
                if self.any_janus_active().is_some() {
                    self.last_input_was_chord = true;
                    self.force_secondary_edges(1, output)?;
                } else {
                    self.last_input_was_chord = false;
                }
                self.emit_primary(code, value, output)
            }
            _ => self.emit_primary(code, 0, output),
        }
    }

    /// Janus-key down/held/up handling.
    fn handle_janus(&mut self, idx: usize, value: u8, output: &mut impl OutputSink) -> Result<()> {
        match value {
            1 => {
                let now = self.clock.now();
                let row = &mut self.rows[idx];
                row.state = KeyState::Down;
                row.last_time_down = now;
                row.send_down_at = now.add(self.max_delay);
                row.delayed_down_pending = true;
                self.last_input_was_chord = false;
                Ok(())
            }
            2 => {
                self.rows[idx].state = KeyState::Held;
                self.last_input_was_chord = false;
                Ok(())
            }
            _ => self.handle_janus_up(idx, output),
        }
    }

    fn handle_janus_up(&mut self, idx: usize, output: &mut impl OutputSink) -> Result<()> {
        let now = self.clock.now();
        let last_time_down = self.rows[idx].last_time_down;
        self.rows[idx].delayed_down_pending = false;
        self.rows[idx].state = KeyState::Up;

        let elapsed = now.sub(last_time_down);
        let tap = elapsed < self.max_delay;

        if !tap {
            return self.close_secondary(idx, output);
        }

        if self.last_input_was_chord {
            return self.close_secondary(idx, output);
        }

        if self.any_janus_active().is_some() {
            self.last_input_was_chord = true;
            self.force_secondary_edges(1, output)?;
        } else {
            self.force_secondary_edges(0, output)?;
        }

        let key = self.rows[idx].key;
        self.emit_primary(key, 1, output)?;
        self.emit_primary(key, 0, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::RecordingSink;
    use std::cell::Cell;
    use std::rc::Rc;

    /// A clock whose `now()` is set by the test driving it, so scenarios
    /// can be expressed in terms of millisecond offsets rather than real
    /// elapsed time. Shares its cell via `Rc` so the handle retained by
    /// the test and the one moved into the `Engine` observe the same
    /// value.
    #[derive(Clone)]
    struct FixedClock(Rc<Cell<Instant>>);

    impl FixedClock {
        fn at(ms: u64) -> Self {
            Self(Rc::new(Cell::new(Instant::from_ms(ms))))
        }

        fn set(&self, ms: u64) {
            self.0.set(Instant::from_ms(ms));
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> Instant {
            self.0.get()
        }
    }

    const ESC: u16 = 1;
    const LEFTALT: u16 = 56;
    const CAPSLOCK: u16 = 58;
    const ENTER: u16 = 28;
    const RIGHTALT: u16 = 100;
    const A: u16 = 30;

    fn caps_row() -> ModKeyConfig {
        ModKeyConfig {
            key: CAPSLOCK,
            primary_function: ESC,
            secondary_function: LEFTALT,
        }
    }

    fn enter_row() -> ModKeyConfig {
        ModKeyConfig {
            key: ENTER,
            primary_function: 0,
            secondary_function: RIGHTALT,
        }
    }

    fn engine_with(rows: Vec<ModKeyConfig>, clock: FixedClock) -> Engine<FixedClock> {
        Engine::with_clock(clock, rows, Duration::from_millis(300))
    }

    /// Drives `Engine::handle_event`/timer firing directly, without going
    /// through `InputSource`, since these tests exercise the state machine
    /// at specific instants rather than the main loop's readiness wait.
    fn fire_timers(engine: &mut Engine<FixedClock>, output: &mut RecordingSink) {
        engine.fire_expired_timers(output).unwrap();
    }

    #[test]
    fn short_tap_emits_primary_pulse() {
        let clock = FixedClock::at(0);
        let mut engine = engine_with(vec![caps_row()], clock.clone());
        let mut out = RecordingSink::new();

        engine.handle_event(RawEvent::new(CAPSLOCK, 1), &mut out).unwrap();
        clock.set(50);
        fire_timers(&mut engine, &mut out);
        engine.handle_event(RawEvent::new(CAPSLOCK, 0), &mut out).unwrap();

        assert_eq!(out.edges, vec![(ESC, 1), (ESC, 0)]);
    }

    #[test]
    fn long_hold_emits_secondary_at_deadline_then_closes() {
        let clock = FixedClock::at(0);
        let mut engine = engine_with(vec![caps_row()], clock.clone());
        let mut out = RecordingSink::new();

        engine.handle_event(RawEvent::new(CAPSLOCK, 1), &mut out).unwrap();
        clock.set(300);
        fire_timers(&mut engine, &mut out);
        clock.set(500);
        fire_timers(&mut engine, &mut out);
        engine.handle_event(RawEvent::new(CAPSLOCK, 0), &mut out).unwrap();

        assert_eq!(out.edges, vec![(LEFTALT, 1), (LEFTALT, 0)]);
    }

    #[test]
    fn chord_with_non_janus_key_forces_secondary() {
        let clock = FixedClock::at(0);
        let mut engine = engine_with(vec![caps_row()], clock.clone());
        let mut out = RecordingSink::new();

        engine.handle_event(RawEvent::new(CAPSLOCK, 1), &mut out).unwrap();
        clock.set(100);
        fire_timers(&mut engine, &mut out);
        engine.handle_event(RawEvent::new(A, 1), &mut out).unwrap();
        clock.set(120);
        fire_timers(&mut engine, &mut out);
        engine.handle_event(RawEvent::new(A, 0), &mut out).unwrap();
        clock.set(150);
        fire_timers(&mut engine, &mut out);
        engine.handle_event(RawEvent::new(CAPSLOCK, 0), &mut out).unwrap();

        assert_eq!(
            out.edges,
            vec![(LEFTALT, 1), (A, 1), (A, 0), (LEFTALT, 0)]
        );
    }

    #[test]
    fn two_janus_keys_chorded() {
        let clock = FixedClock::at(0);
        let mut engine = engine_with(vec![caps_row(), enter_row()], clock.clone());
        let mut out = RecordingSink::new();

        engine.handle_event(RawEvent::new(CAPSLOCK, 1), &mut out).unwrap();
        clock.set(50);
        fire_timers(&mut engine, &mut out);
        engine.handle_event(RawEvent::new(ENTER, 1), &mut out).unwrap();
        clock.set(60);
        fire_timers(&mut engine, &mut out);
        engine.handle_event(RawEvent::new(ENTER, 0), &mut out).unwrap();
        clock.set(80);
        fire_timers(&mut engine, &mut out);
        engine.handle_event(RawEvent::new(CAPSLOCK, 0), &mut out).unwrap();

        assert_eq!(
            out.edges,
            vec![(LEFTALT, 1), (ENTER, 1), (ENTER, 0), (LEFTALT, 0)]
        );
    }

    #[test]
    fn deferred_down_with_no_co_press_then_release() {
        let clock = FixedClock::at(0);
        let mut engine = engine_with(vec![caps_row()], clock.clone());
        let mut out = RecordingSink::new();

        engine.handle_event(RawEvent::new(CAPSLOCK, 1), &mut out).unwrap();
        clock.set(300);
        fire_timers(&mut engine, &mut out);
        clock.set(350);
        fire_timers(&mut engine, &mut out);
        engine.handle_event(RawEvent::new(CAPSLOCK, 0), &mut out).unwrap();

        assert_eq!(out.edges, vec![(LEFTALT, 1), (LEFTALT, 0)]);
    }

    #[test]
    fn rapid_re_tap() {
        let clock = FixedClock::at(0);
        let mut engine = engine_with(vec![caps_row()], clock.clone());
        let mut out = RecordingSink::new();

        engine.handle_event(RawEvent::new(CAPSLOCK, 1), &mut out).unwrap();
        clock.set(40);
        fire_timers(&mut engine, &mut out);
        engine.handle_event(RawEvent::new(CAPSLOCK, 0), &mut out).unwrap();
        clock.set(80);
        fire_timers(&mut engine, &mut out);
        engine.handle_event(RawEvent::new(CAPSLOCK, 1), &mut out).unwrap();
        clock.set(120);
        fire_timers(&mut engine, &mut out);
        engine.handle_event(RawEvent::new(CAPSLOCK, 0), &mut out).unwrap();

        assert_eq!(
            out.edges,
            vec![(ESC, 1), (ESC, 0), (ESC, 1), (ESC, 0)]
        );
    }

    #[test]
    fn elapsed_equal_to_max_delay_is_a_hold_not_a_tap() {
        let clock = FixedClock::at(0);
        let mut engine = engine_with(vec![caps_row()], clock.clone());
        let mut out = RecordingSink::new();

        engine.handle_event(RawEvent::new(CAPSLOCK, 1), &mut out).unwrap();
        // The timer matures exactly at max_delay and fires before release.
        clock.set(300);
        fire_timers(&mut engine, &mut out);
        engine.handle_event(RawEvent::new(CAPSLOCK, 0), &mut out).unwrap();

        // Boundary is a hold: secondary asserted, never a primary pulse.
        assert_eq!(out.edges, vec![(LEFTALT, 1), (LEFTALT, 0)]);
    }

    #[test]
    fn held_repeat_before_deadline_does_not_fire_the_deferred_down() {
        let clock = FixedClock::at(0);
        let mut engine = engine_with(vec![caps_row()], clock.clone());
        let mut out = RecordingSink::new();

        engine.handle_event(RawEvent::new(CAPSLOCK, 1), &mut out).unwrap();
        clock.set(100);
        engine.handle_event(RawEvent::new(CAPSLOCK, 2), &mut out).unwrap();
        assert!(out.edges.is_empty());
        assert!(engine.rows[0].delayed_down_pending);
    }

    #[test]
    fn primary_only_remap_row_behaves_like_passthrough() {
        let clock = FixedClock::at(0);
        let rows = vec![ModKeyConfig {
            key: CAPSLOCK,
            primary_function: ESC,
            secondary_function: 0,
        }];
        let mut engine = engine_with(rows, clock.clone());
        let mut out = RecordingSink::new();

        engine.handle_event(RawEvent::new(CAPSLOCK, 1), &mut out).unwrap();
        engine.handle_event(RawEvent::new(CAPSLOCK, 0), &mut out).unwrap();

        assert_eq!(out.edges, vec![(ESC, 1), (ESC, 0)]);
    }

    #[test]
    fn unmapped_key_passes_through_unchanged() {
        let clock = FixedClock::at(0);
        let mut engine = engine_with(vec![caps_row()], clock.clone());
        let mut out = RecordingSink::new();

        engine.handle_event(RawEvent::new(A, 1), &mut out).unwrap();
        engine.handle_event(RawEvent::new(A, 0), &mut out).unwrap();

        assert_eq!(out.edges, vec![(A, 1), (A, 0)]);
    }

    #[test]
    fn dedup_never_emits_same_secondary_value_twice_in_a_row() {
        let clock = FixedClock::at(0);
        let mut engine = engine_with(vec![caps_row()], clock.clone());
        let mut out = RecordingSink::new();

        engine.handle_event(RawEvent::new(CAPSLOCK, 1), &mut out).unwrap();
        clock.set(100);
        fire_timers(&mut engine, &mut out);
        // A second co-press while the secondary is already asserted must
        // not re-emit secondary=1.
        engine.handle_event(RawEvent::new(A, 1), &mut out).unwrap();
        engine.handle_event(RawEvent::new(A, 0), &mut out).unwrap();
        clock.set(150);
        engine.handle_event(RawEvent::new(CAPSLOCK, 0), &mut out).unwrap();

        assert_eq!(
            out.edges,
            vec![(LEFTALT, 1), (A, 1), (A, 0), (LEFTALT, 0)]
        );
    }

    #[test]
    fn empty_input_produces_no_output() {
        let clock = FixedClock::at(0);
        let mut engine = engine_with(vec![caps_row()], clock);
        let mut out = RecordingSink::new();
        fire_timers(&mut engine, &mut out);
        assert!(out.edges.is_empty());
    }
}
