//! C4 — the controller state machine. `SocketUnit` is the thin public
//! handle; its `enter_*` methods set state, arm/disarm watches and timers,
//! and notify the collaborator manager, in the manner of the `SocketMng`/
//! `enter_*` split used by the `sysmaster` reference implementation, but
//! without the `Rc<RefCell<_>>` sharing that file needs for its
//! multi-owner design — here there is exactly one owner (the manager
//! shim), so state lives directly on `SocketUnit`.

use nix::sys::signal::Signal as NixSignal;
use nix::unistd::Pid;
use tracing::{info, warn};

use crate::config::{Phase, SocketUnitConfig};
use crate::environment::Environment;
use crate::error::{SocketError, SocketResult};
use crate::events::{ControllerEvent, ExitStatus, UnitManager, WatchHandle};
use crate::port::PortTable;
use crate::serialize::{self, DeserializedState, FdSet};
use crate::state::SocketState;

/// What a `start()`/`stop()` request did, per §4.4's tie-break rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Applied,
    NoOp,
    TryAgain,
}

/// The socket unit: one configuration block, its port table, and the FSM
/// state that drives them (§3).
pub struct SocketUnit {
    config: SocketUnitConfig,
    state: SocketState,
    result: SocketResult,
    ports: PortTable,
    control_pid: Option<Pid>,
    control_command: Option<Phase>,
    command_index: usize,
    timer: Option<WatchHandle>,
    n_accepted: u64,
    n_connections: u32,
    service_active: bool,
    pending_inactive: bool,
}

impl SocketUnit {
    pub fn new(config: SocketUnitConfig) -> Result<Self, SocketError> {
        config.validate()?;
        let ports = PortTable::new(config.build_ports());
        Ok(Self {
            config,
            state: SocketState::Dead,
            result: SocketResult::Success,
            ports,
            control_pid: None,
            control_command: None,
            command_index: 0,
            timer: None,
            n_accepted: 0,
            n_connections: 0,
            service_active: false,
            pending_inactive: false,
        })
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn result(&self) -> SocketResult {
        self.result
    }

    pub fn n_accepted(&self) -> u64 {
        self.n_accepted
    }

    pub fn n_connections(&self) -> u32 {
        self.n_connections
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    /// Currently listening descriptors, for a non-accept service to
    /// inherit (§6's `collect_fds`).
    pub fn collect_fds(&self) -> Vec<std::os::fd::RawFd> {
        self.ports.collect_fds()
    }

    /// The unit is garbage-collectable once it holds no live
    /// per-connection accounting (§3's lifecycle rule).
    pub fn collectable(&self) -> bool {
        self.n_connections == 0
    }

    fn set_state(&mut self, state: SocketState, manager: &mut dyn UnitManager) {
        let old = self.state;
        self.state = state;
        info!(unit = %self.config.identity, from = old.as_str(), to = state.as_str(), "state transition");
        manager.notify_state_change(state.as_str(), self.result.as_str());
        manager.queue_dbus_property_change("ActiveState");
    }

    fn record_failure(&mut self, error: &SocketError) {
        let result: SocketResult = error.into();
        warn!(unit = %self.config.identity, %error, ?result, "recording non-success result");
        self.result = result;
    }

    // ---- public requests (§6's start()/stop()) --------------------------

    pub fn start(&mut self, manager: &mut dyn UnitManager) -> Result<RequestOutcome, SocketError> {
        match self.state {
            SocketState::Dead | SocketState::Failed => {
                self.result = SocketResult::Success;
                self.enter_start_pre(manager)?;
                Ok(RequestOutcome::Applied)
            }
            s if s.is_stopping() => Ok(RequestOutcome::TryAgain),
            _ => Ok(RequestOutcome::NoOp),
        }
    }

    pub fn stop(&mut self, manager: &mut dyn UnitManager) -> Result<RequestOutcome, SocketError> {
        match self.state {
            SocketState::StartPre | SocketState::StartPost => {
                self.enter_signal_phase(NixSignal::SIGTERM, manager)?;
                self.state = SocketState::StopPreSigterm;
                manager.notify_state_change(self.state.as_str(), self.result.as_str());
                Ok(RequestOutcome::Applied)
            }
            SocketState::Listening | SocketState::Running => {
                self.enter_stop_pre(manager)?;
                Ok(RequestOutcome::Applied)
            }
            s if s.is_stopping() => Ok(RequestOutcome::NoOp),
            _ => Ok(RequestOutcome::NoOp),
        }
    }

    /// `failed` → `dead`, clearing the recorded result.
    pub fn reset_failed(&mut self, manager: &mut dyn UnitManager) {
        if self.state == SocketState::Failed {
            self.result = SocketResult::Success;
            self.set_state(SocketState::Dead, manager);
        }
    }

    // ---- event dispatch ---------------------------------------------------

    pub fn dispatch(&mut self, event: ControllerEvent, manager: &mut dyn UnitManager) -> Result<(), SocketError> {
        match event {
            ControllerEvent::TimerExpired(handle) => {
                if self.timer == Some(handle) {
                    self.handle_timeout(manager)?;
                }
            }
            ControllerEvent::ChildExited { pid, status } => {
                if self.control_pid == Some(pid) {
                    self.handle_control_exit(status, manager)?;
                }
            }
            ControllerEvent::DescriptorReady(fd) => {
                self.handle_fd_readable(fd, manager)?;
            }
        }
        Ok(())
    }

    fn handle_fd_readable(&mut self, fd: std::os::fd::RawFd, manager: &mut dyn UnitManager) -> Result<(), SocketError> {
        if self.state != SocketState::Listening {
            return Ok(());
        }

        if self.pending_inactive {
            self.ports.unwatch_all(manager);
            self.ports.close_all();
            self.ports.open_all(&self.config.options)?;
            self.ports.watch_all(manager)?;
            self.pending_inactive = false;
            return Ok(());
        }

        if self.config.accept {
            let outcomes = crate::dispatch::drain_accept(fd, &mut self.n_accepted, &mut self.n_connections, self.config.max_connections);
            let outcomes = match outcomes {
                Ok(o) => o,
                Err(e) => {
                    self.record_failure(&e);
                    return self.enter_stop_pre(manager);
                }
            };
            for outcome in outcomes {
                if let crate::dispatch::AcceptOutcome::Accepted { fd, instance } = outcome {
                    let name = crate::dispatch::instanced_service_name(&self.config.identity, &instance);
                    let raw = std::os::fd::IntoRawFd::into_raw_fd(fd);
                    if let Err(e) = manager.add_job(vec![raw], Some(name)) {
                        self.record_failure(&e);
                        return self.enter_stop_pre(manager);
                    }
                }
            }
            if self.n_connections >= self.config.max_connections {
                self.ports.unwatch_all(manager);
                self.set_state(SocketState::Running, manager);
            }
        } else if !self.service_active {
            let fds = self.ports.collect_fds();
            if let Err(e) = manager.add_job(fds, self.config.shared_service.clone()) {
                self.record_failure(&e);
                return self.enter_stop_pre(manager);
            }
            self.service_active = true;
            self.ports.unwatch_all(manager);
            self.set_state(SocketState::Running, manager);
        }
        Ok(())
    }

    /// From the per-connection service, when it ends.
    pub fn connection_released(&mut self, manager: &mut dyn UnitManager) -> Result<(), SocketError> {
        self.n_connections = self.n_connections.saturating_sub(1);
        if self.state == SocketState::Running && self.config.accept && self.n_connections < self.config.max_connections {
            self.ports.watch_all(manager)?;
            self.set_state(SocketState::Listening, manager);
        }
        Ok(())
    }

    /// From the shared (non-accept) triggered service.
    pub fn notify_service_dead(&mut self, failed_permanent: bool, manager: &mut dyn UnitManager) -> Result<(), SocketError> {
        self.service_active = false;
        if failed_permanent {
            self.result = SocketResult::ServiceFailedPermanent;
            self.enter_stop_pre(manager)
        } else {
            self.ports.watch_all(manager)?;
            self.set_state(SocketState::Listening, manager);
            Ok(())
        }
    }

    // ---- phase machinery ---------------------------------------------------

    fn build_environment(&self) -> Vec<(String, String)> {
        let mut env = Environment::new();
        let fds = self.ports.collect_fds();
        if !fds.is_empty() {
            env.set("LISTEN_FDS", fds.len().to_string());
            env.set("LISTEN_PID", std::process::id().to_string());
        }
        env.into_inner().into_iter().collect()
    }

    fn run_phase(&mut self, phase: Phase, manager: &mut dyn UnitManager) -> Result<(), SocketError> {
        self.control_command = Some(phase);
        self.command_index = 0;
        self.run_next_command(manager)
    }

    fn run_next_command(&mut self, manager: &mut dyn UnitManager) -> Result<(), SocketError> {
        let phase = self.control_command.expect("run_next_command requires an active phase");
        let commands = self.config.commands_for(phase);
        if self.command_index >= commands.len() {
            self.control_command = None;
            self.control_pid = None;
            return self.phase_complete(phase, manager);
        }
        let command = commands[self.command_index].clone();
        let env = self.build_environment();
        let pid = manager.spawn_child(&command.path, &command.args, &env)?;
        self.control_pid = Some(pid);
        manager.watch_pid(pid)?;
        self.arm_timer(manager)
    }

    fn arm_timer(&mut self, manager: &mut dyn UnitManager) -> Result<(), SocketError> {
        if let Some(handle) = self.timer.take() {
            manager.unwatch_timer(handle);
        }
        self.timer = Some(manager.watch_timer(self.config.timeout)?);
        Ok(())
    }

    fn disarm_timer(&mut self, manager: &mut dyn UnitManager) {
        if let Some(handle) = self.timer.take() {
            manager.unwatch_timer(handle);
        }
    }

    fn handle_control_exit(&mut self, status: ExitStatus, manager: &mut dyn UnitManager) -> Result<(), SocketError> {
        self.disarm_timer(manager);
        self.control_pid = None;

        // Once a phase has been escalated (stop() forced it, or a timeout
        // did), any exit of the signalled process is forward progress
        // regardless of its own exit code — it is no longer running the
        // command sequence `control_command` names, so `run_next_command`
        // must not be consulted.
        if self.state.is_escalated() {
            if let Some(error) = status.into_error() {
                self.record_failure(&error);
            }
            self.control_command = None;
            return self.advance_after_failure(manager);
        }

        match status.into_error() {
            None => {
                self.command_index += 1;
                self.run_next_command(manager)
            }
            Some(error) => {
                self.record_failure(&error);
                self.control_command = None;
                self.advance_after_failure(manager)
            }
        }
    }

    fn phase_complete(&mut self, phase: Phase, manager: &mut dyn UnitManager) -> Result<(), SocketError> {
        match phase {
            Phase::StartPre => self.open_ports_and_enter(SocketState::StartPost, manager, Phase::StartPost),
            Phase::StartPost => self.enter_listening(manager),
            Phase::StopPre => self.enter_stop_post(manager),
            Phase::StopPost => self.enter_dead_or_failed(manager),
        }
    }

    fn advance_after_failure(&mut self, manager: &mut dyn UnitManager) -> Result<(), SocketError> {
        match self.state {
            SocketState::StartPre | SocketState::StartPost => self.enter_stop_pre(manager),
            SocketState::StopPre | SocketState::StopPreSigterm | SocketState::StopPreSigkill => {
                self.enter_stop_post(manager)
            }
            SocketState::StopPost | SocketState::FinalSigterm | SocketState::FinalSigkill => {
                self.enter_dead_or_failed(manager)
            }
            _ => Ok(()),
        }
    }

    fn handle_timeout(&mut self, manager: &mut dyn UnitManager) -> Result<(), SocketError> {
        self.record_failure(&SocketError::Timeout);
        match self.state {
            SocketState::StartPre => {
                self.enter_signal_phase(NixSignal::SIGTERM, manager)?;
                self.state = SocketState::FinalSigterm;
                manager.notify_state_change(self.state.as_str(), self.result.as_str());
                Ok(())
            }
            SocketState::StartPost => self.enter_stop_pre(manager),
            SocketState::StopPre => {
                self.enter_signal_phase(NixSignal::SIGTERM, manager)?;
                self.state = SocketState::StopPreSigterm;
                manager.notify_state_change(self.state.as_str(), self.result.as_str());
                Ok(())
            }
            SocketState::StopPreSigterm => {
                if self.config.kill_mode_send_sigkill {
                    self.enter_signal_phase(NixSignal::SIGKILL, manager)?;
                    self.state = SocketState::StopPreSigkill;
                    manager.notify_state_change(self.state.as_str(), self.result.as_str());
                    Ok(())
                } else {
                    self.enter_stop_post(manager)
                }
            }
            SocketState::StopPreSigkill => self.enter_stop_post(manager),
            SocketState::StopPost => {
                self.enter_signal_phase(NixSignal::SIGTERM, manager)?;
                self.state = SocketState::FinalSigterm;
                manager.notify_state_change(self.state.as_str(), self.result.as_str());
                Ok(())
            }
            SocketState::FinalSigterm => {
                if self.config.kill_mode_send_sigkill {
                    self.enter_signal_phase(NixSignal::SIGKILL, manager)?;
                    self.state = SocketState::FinalSigkill;
                    manager.notify_state_change(self.state.as_str(), self.result.as_str());
                    Ok(())
                } else {
                    self.enter_dead_or_failed(manager)
                }
            }
            SocketState::FinalSigkill => self.enter_dead_or_failed(manager),
            _ => Ok(()),
        }
    }

    /// Sends `signal` to the current control process group (if any) and
    /// rearms the phase timeout; does not itself change `self.state` (the
    /// caller sets the specific escalation state to keep the mapping in
    /// `handle_timeout`/`stop` legible).
    fn enter_signal_phase(&mut self, signal: NixSignal, manager: &mut dyn UnitManager) -> Result<(), SocketError> {
        if let Some(pid) = self.control_pid {
            manager.kill_process_group(pid, signal)?;
        }
        self.arm_timer(manager)
    }

    // ---- enter_* transitions -----------------------------------------------

    fn enter_start_pre(&mut self, manager: &mut dyn UnitManager) -> Result<(), SocketError> {
        self.set_state(SocketState::StartPre, manager);
        self.run_phase(Phase::StartPre, manager)
    }

    fn open_ports_and_enter(&mut self, state: SocketState, manager: &mut dyn UnitManager, phase: Phase) -> Result<(), SocketError> {
        match self.ports.open_all(&self.config.options) {
            Ok(()) => {
                self.set_state(state, manager);
                self.run_phase(phase, manager)
            }
            Err(e) => {
                self.record_failure(&e);
                self.enter_stop_pre(manager)
            }
        }
    }

    fn enter_listening(&mut self, manager: &mut dyn UnitManager) -> Result<(), SocketError> {
        self.disarm_timer(manager);
        match self.ports.watch_all(manager) {
            Ok(()) => {
                self.set_state(SocketState::Listening, manager);
                Ok(())
            }
            Err(e) => {
                self.record_failure(&e);
                self.enter_stop_pre(manager)
            }
        }
    }

    fn enter_stop_pre(&mut self, manager: &mut dyn UnitManager) -> Result<(), SocketError> {
        self.set_state(SocketState::StopPre, manager);
        self.run_phase(Phase::StopPre, manager)
    }

    fn enter_stop_post(&mut self, manager: &mut dyn UnitManager) -> Result<(), SocketError> {
        self.disarm_timer(manager);
        self.ports.unwatch_all(manager);
        self.ports.close_all();
        self.set_state(SocketState::StopPost, manager);
        self.run_phase(Phase::StopPost, manager)
    }

    fn enter_dead_or_failed(&mut self, manager: &mut dyn UnitManager) -> Result<(), SocketError> {
        self.disarm_timer(manager);
        self.control_pid = None;
        self.control_command = None;
        let target = if self.result.is_success() {
            SocketState::Dead
        } else {
            SocketState::Failed
        };
        self.set_state(target, manager);
        Ok(())
    }

    // ---- serialization (C7) ------------------------------------------------

    pub fn serialize(&self, fds: &mut FdSet) -> Result<String, SocketError> {
        serialize::serialize(
            self.state,
            self.result,
            self.n_accepted,
            self.control_pid,
            self.control_command,
            &self.ports,
            fds,
        )
    }

    /// Restores a freshly constructed unit (state = `dead`) from a parsed
    /// snapshot. Must be followed by `distribute_fds`/`coldplug`.
    pub fn deserialize(&mut self, shadow: &DeserializedState) {
        if let Some(state) = shadow.state {
            self.state = state;
        }
        if let Some(result) = shadow.result {
            self.result = result;
        }
        self.n_accepted += shadow.n_accepted;
        self.control_pid = shadow.control_pid;
        self.control_command = shadow.control_command;
    }

    pub fn distribute_fds(&mut self, shadow: &DeserializedState, fds: &mut FdSet) {
        serialize::distribute_fds(shadow, &mut self.ports, fds);
    }

    /// Post-deserialization reconciliation (§4.7's cold-plug rule): opens
    /// any ports the recovered state implies should be open but that
    /// weren't matched to a restored descriptor, re-watches any recovered
    /// control pid, and asserts the state.
    pub fn coldplug(&mut self, manager: &mut dyn UnitManager) -> Result<(), SocketError> {
        if !self.ports.ports().is_empty() && self.ports.ports().iter().any(|p| p.is_open()) {
            // Any port that did receive a restored descriptor forces listening,
            // per §4.7: "matching ports...force the deserialized state to listening".
            self.state = SocketState::Listening;
        }

        if self.state.holds_open_ports() {
            self.ports.open_all(&self.config.options)?;
            self.ports.watch_all(manager)?;
        }

        if let Some(pid) = self.control_pid {
            manager.watch_pid(pid)?;
            self.arm_timer(manager)?;
        }

        manager.notify_state_change(self.state.as_str(), self.result.as_str());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::config::{accept_stream_config, shared_service_config, ListenDirective};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::os::fd::RawFd;
    use std::rc::Rc;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeManager {
        next_handle: u64,
        timers: HashMap<u64, Duration>,
        watched_fds: HashMap<u64, RawFd>,
        jobs: Vec<(Vec<RawFd>, Option<String>)>,
        state_log: Rc<RefCell<Vec<(String, String)>>>,
    }

    impl FakeManager {
        fn handle(&mut self) -> WatchHandle {
            self.next_handle += 1;
            WatchHandle(self.next_handle)
        }
    }

    impl UnitManager for FakeManager {
        fn watch_fd(&mut self, fd: RawFd) -> Result<WatchHandle, SocketError> {
            let h = self.handle();
            self.watched_fds.insert(h.0, fd);
            Ok(h)
        }
        fn unwatch_fd(&mut self, handle: WatchHandle) {
            self.watched_fds.remove(&handle.0);
        }
        fn watch_pid(&mut self, _pid: Pid) -> Result<WatchHandle, SocketError> {
            Ok(self.handle())
        }
        fn unwatch_pid(&mut self, _handle: WatchHandle) {}
        fn watch_timer(&mut self, timeout: Duration) -> Result<WatchHandle, SocketError> {
            let h = self.handle();
            self.timers.insert(h.0, timeout);
            Ok(h)
        }
        fn unwatch_timer(&mut self, handle: WatchHandle) {
            self.timers.remove(&handle.0);
        }
        fn spawn_child(&mut self, _command: &str, _args: &[String], _env: &[(String, String)]) -> Result<Pid, SocketError> {
            Ok(Pid::from_raw(1))
        }
        fn kill_process_group(&mut self, _pid: Pid, _signal: NixSignal) -> Result<(), SocketError> {
            Ok(())
        }
        fn add_job(&mut self, fds: Vec<RawFd>, instance: Option<String>) -> Result<(), SocketError> {
            self.jobs.push((fds, instance));
            Ok(())
        }
        fn notify_state_change(&mut self, state: &str, result: &str) {
            self.state_log.borrow_mut().push((state.to_string(), result.to_string()));
        }
        fn queue_dbus_property_change(&mut self, _property: &str) {}
    }

    fn loopback_config() -> SocketUnitConfig {
        accept_stream_config(
            "echo.socket".into(),
            Address::parse("127.0.0.1:0").unwrap(),
            2,
            Duration::from_secs(5),
        )
    }

    #[test]
    fn start_with_no_phase_commands_reaches_listening_directly() {
        let mut manager = FakeManager::default();
        let mut unit = SocketUnit::new(loopback_config()).unwrap();
        unit.start(&mut manager).unwrap();
        assert_eq!(unit.state(), SocketState::Listening);
        assert!(unit.ports.all_open());
    }

    #[test]
    fn stop_from_listening_with_no_stop_commands_reaches_dead() {
        let mut manager = FakeManager::default();
        let mut unit = SocketUnit::new(loopback_config()).unwrap();
        unit.start(&mut manager).unwrap();
        unit.stop(&mut manager).unwrap();
        assert_eq!(unit.state(), SocketState::Dead);
        assert!(unit.ports.all_closed());
    }

    #[test]
    fn starting_while_already_starting_is_a_no_op() {
        let mut manager = FakeManager::default();
        let mut unit = SocketUnit::new(loopback_config()).unwrap();
        unit.start(&mut manager).unwrap();
        let outcome = unit.start(&mut manager).unwrap();
        assert_eq!(outcome, RequestOutcome::NoOp);
    }

    #[test]
    fn fd_readable_outside_listening_makes_no_state_change() {
        let mut manager = FakeManager::default();
        let mut unit = SocketUnit::new(loopback_config()).unwrap();
        assert_eq!(unit.state(), SocketState::Dead);
        unit.handle_fd_readable(999, &mut manager).unwrap();
        assert_eq!(unit.state(), SocketState::Dead);
    }

    #[test]
    fn shared_service_job_is_enqueued_once_per_readiness_burst() {
        let mut manager = FakeManager::default();
        let cfg = shared_service_config(
            "x.socket".into(),
            ListenDirective::Fifo("/tmp/does-not-matter-for-this-test.fifo".into()),
            "x.service".into(),
            Duration::from_secs(5),
        );
        let mut unit = SocketUnit::new(cfg).unwrap();
        unit.state = SocketState::Listening;
        unit.handle_fd_readable(0, &mut manager).unwrap();
        assert_eq!(unit.state(), SocketState::Running);
        assert_eq!(manager.jobs.len(), 1);
        assert_eq!(manager.jobs[0].1, Some("x.service".to_string()));
    }
}
