// src/group.rs
//! Per-group alarm state machine.
//!
//! A group reacts to committed input edges with OFF → PREALARM → ALARM
//! escalation, overlaid by the enable flag, inhibitor inputs and the
//! inhibit-by-command window. Transitions fan out to the switch-output
//! arbiters and text outputs bound to the new phase.

use std::time::Duration;

use log::{error, info};
use serde_json::{json, Map, Value};

use crate::condition::is_on_token;
use crate::input::{InputId, InputRole, InputState};
use crate::service::AlarmService;
use crate::switch_output::ArbiterId;
use crate::text_output::TextId;
use crate::timer::{TimerId, TimerVerdict};

/// Handle into the service's group arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmState {
    Off,
    Prealarm,
    Alarm,
}

impl AlarmState {
    /// Lowercase form used in topics and published payloads.
    pub fn key(&self) -> &'static str {
        match self {
            AlarmState::Off => "off",
            AlarmState::Prealarm => "prealarm",
            AlarmState::Alarm => "alarm",
        }
    }

    /// Uppercase form used in text-output summaries.
    pub fn name(&self) -> &'static str {
        match self {
            AlarmState::Off => "OFF",
            AlarmState::Prealarm => "PREALARM",
            AlarmState::Alarm => "ALARM",
        }
    }
}

/// Outputs bound to one alarm phase.
#[derive(Default, Clone)]
pub struct PhaseBindings {
    pub switch: Vec<(ArbiterId, String)>,
    pub text: Vec<TextId>,
}

#[derive(Default, Clone)]
pub struct OutputBindings {
    pub prealarm: PhaseBindings,
    pub alarm: PhaseBindings,
    pub off: PhaseBindings,
}

impl OutputBindings {
    pub fn for_state(&self, state: AlarmState) -> &PhaseBindings {
        match state {
            AlarmState::Off => &self.off,
            AlarmState::Prealarm => &self.prealarm,
            AlarmState::Alarm => &self.alarm,
        }
    }

    /// Every switch output bound to any phase, for reset fan-out.
    pub fn all_switch(&self) -> Vec<ArbiterId> {
        let mut out = Vec::new();
        for phase in [&self.prealarm, &self.alarm, &self.off] {
            for (aid, _) in &phase.switch {
                if !out.contains(aid) {
                    out.push(*aid);
                }
            }
        }
        out
    }
}

/// Commands addressed to a single group over the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupCommand {
    Enabled,
    Inhibited,
    Reset,
    Auto,
}

pub struct AlarmGroup {
    /// Short name used in topics and state keys.
    pub name: String,
    pub label: String,
    /// Lower wins at shared outputs.
    pub priority: i64,
    pub inputs: Vec<InputId>,
    pub inhibitors: Vec<InputId>,
    pub liveness: Vec<InputId>,
    pub bindings: OutputBindings,
    pub state: AlarmState,
    /// Persisted across restarts.
    pub enabled: bool,
    /// Volatile; set by the inhibit command, cleared by its timeout.
    pub inhibited_by_command: bool,
    /// Present iff a prealarm duration is configured.
    pub escalate_timer: Option<TimerId>,
    /// Present iff a reset delay is configured.
    pub reset_timer: Option<TimerId>,
    pub inhibit_timer: TimerId,
}

impl AlarmService {
    /// An input committed to true.
    pub(crate) fn group_on(&mut self, gid: GroupId, input: InputId) {
        let state = self.groups[gid.0].state;
        info!(
            "{} | {} is on, from state: {}",
            self.groups[gid.0].label,
            self.inputs[input.0].label,
            state.key()
        );

        // Inhibitors never escalate; kicking in during PREALARM resets,
        // during ALARM it is too late.
        if self.inputs[input.0].role == InputRole::Inhibitor {
            if state == AlarmState::Prealarm {
                self.do_reset(gid, "inhibitor activated");
            }
            return;
        }

        if let Some(timer) = self.groups[gid.0].reset_timer {
            self.timers.stop(timer);
        }

        let group = &self.groups[gid.0];
        if !group.enabled {
            info!("{} is disabled, ignoring", group.label);
            return;
        }
        if group.inhibited_by_command {
            info!("{} is inhibited by command, ignoring", group.label);
            return;
        }
        if group
            .inhibitors
            .iter()
            .any(|&i| self.input_value(i) == Some(true))
        {
            info!("{} is inhibited by inhibitor, ignoring", group.label);
            return;
        }

        match state {
            AlarmState::Off => {
                let trigger = self.input_display(input);
                self.do_prealarm(gid, &trigger);
            }
            AlarmState::Prealarm | AlarmState::Alarm => self.update_outputs(gid),
        }
    }

    /// An input committed to false.
    pub(crate) fn group_off(&mut self, gid: GroupId, input: InputId) {
        let state = self.groups[gid.0].state;
        if !matches!(state, AlarmState::Prealarm | AlarmState::Alarm) {
            return;
        }
        info!(
            "{} | {} is off, from state: {}",
            self.groups[gid.0].label,
            self.inputs[input.0].label,
            state.key()
        );

        self.update_outputs(gid);

        let Some(reset_timer) = self.groups[gid.0].reset_timer else {
            // Never reset this alarm automatically.
            return;
        };

        let inputs = self.groups[gid.0].inputs.clone();
        let all_clear = inputs.iter().all(|&i| {
            self.input_state(i) != InputState::Online || self.input_value(i) == Some(false)
        });
        if all_clear {
            info!("{} | Starting timeout for alarm reset", self.groups[gid.0].label);
            self.timers.start(reset_timer, true);
        }
    }

    pub(crate) fn do_prealarm(&mut self, gid: GroupId, trigger: &str) {
        if self.groups[gid.0].escalate_timer.is_none() {
            // No prealarm phase configured: straight to alarm.
            self.do_alarm(gid, trigger);
            return;
        }

        let state = self.groups[gid.0].state;
        if state == AlarmState::Prealarm {
            debug_assert!(false, "prealarm requested while already in prealarm");
            error!(
                "{} | Prealarm requested while already in prealarm, skipping",
                self.groups[gid.0].label
            );
            return;
        }
        info!(
            ">> {} | Prealarm triggered by '{trigger}', from state: {}",
            self.groups[gid.0].label,
            state.key()
        );

        self.groups[gid.0].state = AlarmState::Prealarm;
        self.update_outputs(gid);
        self.request_publish_info();

        let timer = self.groups[gid.0].escalate_timer.expect("checked above");
        self.timers.start(timer, true);
    }

    /// Also the escalation-timer handler, hence the verdict: a timer
    /// that raised the alarm must not fire again.
    pub(crate) fn do_alarm(&mut self, gid: GroupId, trigger: &str) -> TimerVerdict {
        let state = self.groups[gid.0].state;
        if state == AlarmState::Alarm {
            debug_assert!(false, "alarm requested while already in alarm");
            error!(
                "{} | Alarm requested while already in alarm, skipping",
                self.groups[gid.0].label
            );
            return TimerVerdict::Stop;
        }
        info!(
            ">> {} | Alarm triggered by '{trigger}', from state: {}",
            self.groups[gid.0].label,
            state.key()
        );

        self.groups[gid.0].state = AlarmState::Alarm;
        self.update_outputs(gid);
        self.request_publish_info();

        if let Some(timer) = self.groups[gid.0].escalate_timer {
            self.timers.stop(timer);
        }
        TimerVerdict::Stop
    }

    pub(crate) fn do_reset(&mut self, gid: GroupId, trigger: &str) -> TimerVerdict {
        let state = self.groups[gid.0].state;
        if !matches!(state, AlarmState::Prealarm | AlarmState::Alarm) {
            debug_assert!(false, "reset requested while off");
            error!(
                "{} | Reset requested while off, skipping",
                self.groups[gid.0].label
            );
            return TimerVerdict::Stop;
        }
        info!(
            ">> {} | Reset triggered by '{trigger}', from state: {}",
            self.groups[gid.0].label,
            state.key()
        );

        self.groups[gid.0].state = AlarmState::Off;
        self.reset_outputs(gid);
        self.request_publish_info();

        if let Some(timer) = self.groups[gid.0].escalate_timer {
            self.timers.stop(timer);
        }
        if let Some(timer) = self.groups[gid.0].reset_timer {
            self.timers.stop(timer);
        }
        TimerVerdict::Stop
    }

    /// Refresh every output bound to the current phase.
    pub(crate) fn update_outputs(&mut self, gid: GroupId) {
        let state = self.groups[gid.0].state;
        let phase = self.groups[gid.0].bindings.for_state(state);
        let switches = phase.switch.clone();
        let texts = phase.text.clone();

        for (aid, schedule) in switches {
            self.output_request(aid, gid, state, Some(&schedule));
        }
        for tid in texts {
            self.text_update(tid);
        }
    }

    /// Drop this group's request from every arbiter it ever binds.
    pub(crate) fn reset_outputs(&mut self, gid: GroupId) {
        let state = self.groups[gid.0].state;
        for aid in self.groups[gid.0].bindings.all_switch() {
            self.output_request(aid, gid, state, None);
        }
    }

    pub(crate) fn inhibit_timeout_fired(&mut self, gid: GroupId) -> TimerVerdict {
        self.groups[gid.0].inhibited_by_command = false;
        info!(
            "{} | Inhibit by command timed out, state: {}",
            self.groups[gid.0].label,
            self.groups[gid.0].state.key()
        );
        self.request_publish_info();
        TimerVerdict::Stop
    }

    pub(crate) fn handle_group_command(&mut self, gid: GroupId, command: GroupCommand, payload: &str) {
        match command {
            GroupCommand::Enabled => self.handle_enabled_command(gid, payload),
            GroupCommand::Inhibited => self.handle_inhibit_command(gid, payload),
            GroupCommand::Reset => self.handle_reset_command(gid, payload),
            GroupCommand::Auto => self.handle_auto_command(gid, payload),
        }
    }

    fn handle_enabled_command(&mut self, gid: GroupId, payload: &str) {
        let enable = is_on_token(payload);
        self.set_enabled(gid, enable);

        if !enable
            && matches!(
                self.groups[gid.0].state,
                AlarmState::Prealarm | AlarmState::Alarm
            )
        {
            self.do_reset(gid, "enabled command");
        }
        if enable {
            self.groups[gid.0].inhibited_by_command = false;
        }

        info!(
            "{} | Enabled: {}",
            self.groups[gid.0].label, self.groups[gid.0].enabled
        );
        self.request_publish_info();
    }

    /// Numeric payload > 0 inhibits for that many seconds; zero or a
    /// non-numeric payload clears the inhibit.
    fn handle_inhibit_command(&mut self, gid: GroupId, payload: &str) {
        let seconds = payload.parse::<u64>().ok().filter(|&s| s > 0);
        self.groups[gid.0].inhibited_by_command = seconds.is_some();

        if seconds.is_some() && self.groups[gid.0].state == AlarmState::Prealarm {
            self.do_reset(gid, "inhibit command");
        }
        if let Some(seconds) = seconds {
            let timer = self.groups[gid.0].inhibit_timer;
            self.timers.set_interval(timer, Duration::from_secs(seconds));
            self.timers.start(timer, true);
        }

        info!(
            "{} | Inhibited: {}",
            self.groups[gid.0].label, self.groups[gid.0].inhibited_by_command
        );
        self.request_publish_info();
    }

    pub(crate) fn handle_reset_command(&mut self, gid: GroupId, payload: &str) {
        if is_on_token(payload)
            && matches!(
                self.groups[gid.0].state,
                AlarmState::Prealarm | AlarmState::Alarm
            )
        {
            self.do_reset(gid, "reset command");
        }
    }

    /// One button for the operator panel: resets an active alarm,
    /// otherwise toggles the enable flag.
    fn handle_auto_command(&mut self, gid: GroupId, payload: &str) {
        if !is_on_token(payload) {
            return;
        }
        if matches!(
            self.groups[gid.0].state,
            AlarmState::Prealarm | AlarmState::Alarm
        ) {
            self.do_reset(gid, "auto command");
            return;
        }

        let enable = !self.groups[gid.0].enabled;
        self.set_enabled(gid, enable);
        info!(
            "{} | Enabled via auto: {}",
            self.groups[gid.0].label, self.groups[gid.0].enabled
        );
        self.request_publish_info();
    }

    /// Persisted immediately: the enable flag must survive a crash.
    pub(crate) fn set_enabled(&mut self, gid: GroupId, enabled: bool) {
        self.groups[gid.0].enabled = enabled;
        let name = self.groups[gid.0].name.clone();
        self.store
            .set_path(&["group_enabled", &name], Value::Bool(enabled));
        if let Err(e) = self.store.save() {
            error!("State save failed: {e}");
        }
    }

    fn any_inhibitor_active(&self, gid: GroupId) -> bool {
        let group = &self.groups[gid.0];
        group.inhibited_by_command
            || group
                .inhibitors
                .iter()
                .any(|&i| self.input_value(i) == Some(true))
    }

    /// Structured snapshot for the info topics.
    pub(crate) fn group_state_json(&self, gid: GroupId) -> Value {
        let group = &self.groups[gid.0];

        let any_inhibitor = self.any_inhibitor_active(gid);
        let display_state = match group.state {
            AlarmState::Prealarm => "prealarm",
            AlarmState::Alarm => "alarm",
            AlarmState::Off => {
                if !group.enabled {
                    "disabled"
                } else if any_inhibitor {
                    "inhibited"
                } else {
                    "enabled"
                }
            }
        };

        let all_ok = group
            .inputs
            .iter()
            .chain(&group.liveness)
            .chain(&group.inhibitors)
            .all(|&i| self.input_state(i) == InputState::Online);
        let live = group
            .liveness
            .iter()
            .all(|&i| self.input_state(i) == InputState::Online);

        let mut data = Map::new();
        data.insert("all_inputs_online".into(), json!(all_ok));
        data.insert("enabled/state".into(), json!(group.enabled));
        data.insert("inhibited/state".into(), json!(group.inhibited_by_command));
        data.insert("any_inhibitor_active".into(), json!(any_inhibitor));
        data.insert("state".into(), json!(group.state.key()));
        data.insert("display_state".into(), json!(display_state));
        data.insert("live".into(), json!(live));
        data.insert("label".into(), json!(group.label));

        for (category, members) in [
            ("input", &group.inputs),
            ("inhibitor", &group.inhibitors),
            ("liveness", &group.liveness),
        ] {
            let mut tree = Map::new();
            for &i in members {
                tree.insert(
                    self.inputs[i.0].label.clone(),
                    json!({
                        "state": self.input_state(i).key(),
                        "value": self.input_value(i),
                    }),
                );
            }
            data.insert(category.into(), Value::Object(tree));
        }

        Value::Object(data)
    }
}
