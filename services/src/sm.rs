// Licensed under the Apache-2.0 license

//! Cooperative state machine engine driven by the E51 superloop.
//!
//! Each service is a set of per-state handlers. On every pass the engine
//! notices state changes made by the previous handler (or from outside via
//! [`StateMachine::set_state`]), runs the old state's exit hook and the new
//! state's entry hook, then runs the current handler once.

use core::fmt::{self, Write};

use hss_hal::{Clock, Ticks};
use log::{debug, error, warn};

/// Timing of the current state, handed to every handler.
#[derive(Clone, Copy, Debug, Default)]
pub struct StateTimes {
    /// First time the machine ran at all.
    pub machine_start: Ticks,
    /// When the current state was entered.
    pub state_entered: Ticks,
    /// Handler invocations since the current state was entered.
    pub execution_count: u64,
}

pub trait Service {
    type State: Copy + PartialEq + fmt::Debug + Into<&'static str>;
}

/// Per-state hooks of a service, run against environment `E`.
pub trait StateHandlers<E: ?Sized>: Service {
    fn entry(&mut self, _state: Self::State, _env: &mut E) {}

    /// Runs once per pass and returns the state to be in afterwards.
    fn handler(&mut self, state: Self::State, times: &StateTimes, env: &mut E) -> Self::State;

    fn exit(&mut self, _state: Self::State, _env: &mut E) {}
}

pub struct StateMachine<S: Service> {
    name: &'static str,
    service: S,
    state: S::State,
    prev_state: Option<S::State>,
    times: StateTimes,
    started: bool,
    last_delta_execution_time: Ticks,
    max_execution_time: Ticks,
    max_state: Option<S::State>,
    debug: bool,
}

impl<S: Service> StateMachine<S> {
    pub fn new(name: &'static str, service: S, initial: S::State) -> Self {
        Self {
            name,
            service,
            state: initial,
            prev_state: None,
            times: StateTimes::default(),
            started: false,
            last_delta_execution_time: 0,
            max_execution_time: 0,
            max_state: None,
            debug: true,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> S::State {
        self.state
    }

    /// Forces a transition; entry/exit hooks run on the next pass.
    pub fn set_state(&mut self, state: S::State) {
        self.state = state;
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn service_mut(&mut self) -> &mut S {
        &mut self.service
    }

    pub fn times(&self) -> &StateTimes {
        &self.times
    }

    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    pub fn stats(&self) -> MachineStats {
        MachineStats {
            name: self.name,
            state: self.state.into(),
            max_state: self.max_state.map(Into::into).unwrap_or("-"),
            max_execution_time: self.max_execution_time,
            last_delta_execution_time: self.last_delta_execution_time,
            execution_count: self.times.execution_count,
        }
    }

    /// Runs one pass of the machine.
    pub fn run<E: ?Sized>(&mut self, env: &mut E, clock: &dyn Clock)
    where
        S: StateHandlers<E>,
    {
        let last_entry = clock.now();
        if !self.started {
            self.times.machine_start = last_entry;
            self.started = true;
        }

        if self.prev_state != Some(self.state) {
            if let Some(prev) = self.prev_state {
                self.service.exit(prev, env);
            }
            self.service.entry(self.state, env);
            self.times.state_entered = last_entry;
            self.times.execution_count = 0;
            self.prev_state = Some(self.state);
        }

        let current = self.state;
        self.state = self.service.handler(current, &self.times, env);
        self.times.execution_count += 1;

        self.last_delta_execution_time = clock.now().saturating_sub(last_entry);
        if self.last_delta_execution_time > self.max_execution_time {
            self.max_execution_time = self.last_delta_execution_time;
            self.max_state = Some(current);
        }

        if self.debug && self.state != current {
            debug!(
                "{} :: {} -> {}",
                self.name,
                Into::<&'static str>::into(current),
                Into::<&'static str>::into(self.state)
            );
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MachineStats {
    pub name: &'static str,
    pub state: &'static str,
    pub max_state: &'static str,
    pub max_execution_time: Ticks,
    pub last_delta_execution_time: Ticks,
    pub execution_count: u64,
}

/// Object-safe handle the superloop uses to drive heterogeneous machines.
pub trait Runnable<E: ?Sized> {
    fn run(&mut self, env: &mut E, clock: &dyn Clock);

    /// Reports the statistics of every machine behind this handle.
    fn report(&self, sink: &mut dyn FnMut(&MachineStats));
}

impl<S, E> Runnable<E> for StateMachine<S>
where
    S: StateHandlers<E>,
    E: ?Sized,
{
    fn run(&mut self, env: &mut E, clock: &dyn Clock) {
        StateMachine::run(self, env, clock)
    }

    fn report(&self, sink: &mut dyn FnMut(&MachineStats)) {
        sink(&self.stats());
    }
}

/// Loop bookkeeping for the superloop.
#[derive(Debug, Default)]
pub struct Scheduler {
    loop_count: u64,
    max_loop_time: Ticks,
    loop_time_budget: Ticks,
    dump_interval: u64,
}

impl Scheduler {
    pub fn new(loop_time_budget: Ticks, dump_interval: u64) -> Self {
        Self {
            loop_time_budget,
            dump_interval,
            ..Default::default()
        }
    }

    pub fn loop_count(&self) -> u64 {
        self.loop_count
    }

    pub fn max_loop_time(&self) -> Ticks {
        self.max_loop_time
    }

    /// Runs every machine once and updates loop statistics.
    pub fn run_all<E: ?Sized>(
        &mut self,
        machines: &mut [&mut dyn Runnable<E>],
        env: &mut E,
        clock: &dyn Clock,
    ) {
        let start = clock.now();
        for machine in machines.iter_mut() {
            machine.run(env, clock);
        }
        self.loop_count += 1;

        let delta = clock.now().saturating_sub(start);
        if delta > self.max_loop_time {
            self.max_loop_time = delta;
            if delta > self.loop_time_budget {
                warn!(
                    "loop {} took {} ticks (max {} ticks)",
                    self.loop_count, delta, self.max_loop_time
                );
            }
        }
        if self.dump_interval != 0 && self.loop_count % self.dump_interval == 0 {
            debug!(
                "loop {} took {} ticks (max {} ticks)",
                self.loop_count, delta, self.max_loop_time
            );
        }
    }
}

/// Prints one line per machine.
pub fn dump_stats<E: ?Sized>(
    machines: &[&dyn Runnable<E>],
    out: &mut dyn Write,
) -> fmt::Result {
    writeln!(
        out,
        " State Machine Name: Max Exec Time / State : Last Delta Time / Current State"
    )?;
    let mut result = Ok(());
    for machine in machines {
        machine.report(&mut |s| {
            if result.is_ok() {
                result = writeln!(
                    out,
                    "{:>19}: {:>13} / {:>12} : {:>15} / {}",
                    s.name, s.max_execution_time, s.max_state, s.last_delta_execution_time, s.state
                );
            }
        });
    }
    result
}

/// One step of system bring-up.
pub struct InitFunction<E: ?Sized> {
    pub name: &'static str,
    pub handler: fn(&mut E) -> bool,
    pub halt_on_failure: bool,
    pub restart_on_failure: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitOutcome {
    Completed,
    /// A step failed that must stop the boot.
    Halt(&'static str),
    /// A step failed that asks for a restart.
    Restart(&'static str),
}

/// Runs bring-up steps in order; failures without halt or restart set are
/// logged and skipped.
pub fn run_init_functions<E: ?Sized>(functions: &[InitFunction<E>], env: &mut E) -> InitOutcome {
    for f in functions {
        if (f.handler)(env) {
            continue;
        }
        error!("{}() returned false", f.name);
        if f.halt_on_failure {
            return InitOutcome::Halt(f.name);
        }
        if f.restart_on_failure {
            return InitOutcome::Restart(f.name);
        }
    }
    InitOutcome::Completed
}

#[cfg(test)]
mod tests {
    use super::*;
    use hss_hal::mock::MockClock;
    use strum_macros::IntoStaticStr;

    #[derive(Clone, Copy, Debug, PartialEq, IntoStaticStr)]
    enum Light {
        Red,
        Green,
    }

    #[derive(Default)]
    struct Traffic {
        log: Vec<&'static str>,
    }

    impl Service for Traffic {
        type State = Light;
    }

    impl StateHandlers<u32> for Traffic {
        fn entry(&mut self, state: Light, _env: &mut u32) {
            self.log.push(if state == Light::Red { "enter red" } else { "enter green" });
        }

        fn handler(&mut self, state: Light, times: &StateTimes, env: &mut u32) -> Light {
            *env += 1;
            match state {
                Light::Red if times.execution_count == 1 => Light::Green,
                s => s,
            }
        }

        fn exit(&mut self, state: Light, _env: &mut u32) {
            self.log.push(if state == Light::Red { "exit red" } else { "exit green" });
        }
    }

    #[test]
    fn test_entry_exit_ordering() {
        let clock = MockClock::new(1000);
        let mut sm = StateMachine::new("traffic", Traffic::default(), Light::Red);
        let mut calls = 0u32;

        sm.run(&mut calls, &clock);
        assert_eq!(sm.state(), Light::Red);
        sm.run(&mut calls, &clock);
        assert_eq!(sm.state(), Light::Green);
        sm.run(&mut calls, &clock);
        assert_eq!(sm.times().execution_count, 1);

        assert_eq!(calls, 3);
        assert_eq!(sm.service().log, ["enter red", "exit red", "enter green"]);
    }

    #[test]
    fn test_set_state_runs_hooks() {
        let clock = MockClock::new(1000);
        let mut sm = StateMachine::new("traffic", Traffic::default(), Light::Green);
        let mut calls = 0u32;
        sm.run(&mut calls, &clock);
        sm.set_state(Light::Red);
        clock.advance(50);
        sm.run(&mut calls, &clock);
        assert_eq!(sm.times().state_entered, 50);
        assert_eq!(sm.times().machine_start, 0);
        assert_eq!(
            sm.service().log,
            ["enter green", "exit green", "enter red"]
        );
    }

    #[test]
    fn test_max_execution_time() {
        let clock = MockClock::new(1000);
        clock.set_auto_step(7);
        let mut sm = StateMachine::new("traffic", Traffic::default(), Light::Red);
        let mut calls = 0u32;
        sm.run(&mut calls, &clock);
        let stats = sm.stats();
        assert_eq!(stats.max_execution_time, 7);
        assert_eq!(stats.max_state, "Red");
        assert_eq!(stats.name, "traffic");
    }

    #[test]
    fn test_scheduler_and_dump() {
        let clock = MockClock::new(1000);
        let mut a = StateMachine::new("a", Traffic::default(), Light::Red);
        let mut b = StateMachine::new("b", Traffic::default(), Light::Green);
        let mut scheduler = Scheduler::new(100, 0);
        let mut calls = 0u32;
        for _ in 0..3 {
            scheduler.run_all::<u32>(&mut [&mut a, &mut b], &mut calls, &clock);
        }
        assert_eq!(scheduler.loop_count(), 3);
        assert_eq!(calls, 6);

        let mut out = String::new();
        dump_stats::<u32>(&[&a, &b], &mut out).unwrap();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].trim_start().starts_with("a:"));
        assert!(lines[1].ends_with("Green"));
    }

    fn ok(_: &mut u32) -> bool {
        true
    }
    fn fail(_: &mut u32) -> bool {
        false
    }

    #[test]
    fn test_init_functions() {
        let mut env = 0u32;
        let steps = [
            InitFunction { name: "ok", handler: ok, halt_on_failure: true, restart_on_failure: false },
            InitFunction { name: "soft", handler: fail, halt_on_failure: false, restart_on_failure: false },
            InitFunction { name: "restart", handler: fail, halt_on_failure: false, restart_on_failure: true },
            InitFunction { name: "halt", handler: fail, halt_on_failure: true, restart_on_failure: false },
        ];
        assert_eq!(run_init_functions(&steps[..2], &mut env), InitOutcome::Completed);
        assert_eq!(run_init_functions(&steps, &mut env), InitOutcome::Restart("restart"));
        assert_eq!(run_init_functions(&steps[3..], &mut env), InitOutcome::Halt("halt"));
    }
}
