// src/service.rs
//! Service orchestrator.
//!
//! Owns every arena (groups, inputs, effects, arbiters, text outputs),
//! the timer set and the state store, and runs the single-threaded
//! event loop: inbound bus messages and due timers are processed one at
//! a time, so no other synchronization exists anywhere in the core.
//! The other modules extend [`AlarmService`] with the behavior for
//! their part of the graph; this one wires the graph from the config
//! and drives it.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::bus::{topic_matches, Publisher};
use crate::condition::Condition;
use crate::config::{Config, InputConfig, LivenessConfig, OutputBinding, SwitchOutputConfig};
use crate::error::{Result, VigilError};
use crate::group::{AlarmGroup, AlarmState, GroupCommand, GroupId, OutputBindings};
use crate::input::{
    Debounce, InputId, InputKind, InputNode, InputRole, InputState, LivenessInput, Notify,
    TopicFeed, TopicInput,
};
use crate::store::StateStore;
use crate::switch_output::{
    ArbiterId, EffectId, ScheduleEffects, SwitchOutput, SwitchOutputGroup,
};
use crate::text_output::{TextId, TextOutput};
use crate::timer::{TimerSet, TimerVerdict};

/// Everything a timer can mean; the loop dispatches these back into the
/// arenas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerEvent {
    Debounce(InputId),
    Silence(InputId),
    InvalidResponse(InputId),
    Escalate(GroupId),
    ResetDelay(GroupId),
    InhibitTimeout(GroupId),
    Repeat(EffectId),
    InfoInterval,
    InfoPoll,
    SaveState,
    FlushInputs,
}

/// Where an inbound topic is delivered.
#[derive(Debug, Clone, Copy)]
enum Route {
    Input(InputId),
    Command(GroupId, GroupCommand),
    ServiceReset,
}

pub struct AlarmService {
    pub(crate) name: String,
    /// Topic root, `service/{name}/`.
    pub(crate) root: String,
    pub(crate) publisher: Box<dyn Publisher + Send>,
    pub(crate) store: StateStore,
    pub(crate) timers: TimerSet<TimerEvent>,
    pub(crate) groups: Vec<AlarmGroup>,
    pub(crate) inputs: Vec<InputNode>,
    pub(crate) arbiters: Vec<SwitchOutputGroup>,
    pub(crate) effects: Vec<SwitchOutput>,
    pub(crate) texts: Vec<TextOutput>,
    routes: Vec<(String, Route)>,
    subscriptions: Vec<String>,
    pub(crate) http: reqwest::Client,
    probe: Option<EffectId>,
    publish_info_requested: bool,
    /// Test hook: disables the periodic info request, leaving only
    /// explicit requests.
    pub suppress_periodic_info: bool,
    pub(crate) started_at: Instant,
    /// Per-topic change gate for the info publication.
    last_published: HashMap<String, (String, Instant)>,
}

const INFO_INTERVAL: Duration = Duration::from_secs(180);
const INFO_POLL: Duration = Duration::from_millis(200);
const SAVE_INTERVAL: Duration = Duration::from_secs(300);
const FLUSH_INTERVAL: Duration = Duration::from_secs(30);
const INFO_CHANGE_WINDOW: Duration = Duration::from_secs(60);
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

impl AlarmService {
    pub fn new(
        config: &Config,
        publisher: Box<dyn Publisher + Send>,
        store: StateStore,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| VigilError::Runtime(format!("cannot build HTTP client: {e}")))?;

        let mut service = Self {
            name: config.service_name.clone(),
            root: format!("service/{}/", config.service_name),
            publisher,
            store,
            timers: TimerSet::new(),
            groups: Vec::new(),
            inputs: Vec::new(),
            arbiters: Vec::new(),
            effects: Vec::new(),
            texts: Vec::new(),
            routes: Vec::new(),
            subscriptions: Vec::new(),
            http,
            probe: None,
            publish_info_requested: false,
            suppress_periodic_info: false,
            started_at: Instant::now(),
            last_published: HashMap::new(),
        };
        service.build(config)?;
        Ok(service)
    }

    /// Topics the transport must subscribe to.
    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    fn build(&mut self, config: &Config) -> Result<()> {
        let mut text_ids = BTreeMap::new();
        for (name, cfg) in &config.text_outputs {
            debug!("Creating text output: {name}");
            let tid = TextId(self.texts.len());
            self.texts.push(TextOutput {
                name: name.clone(),
                topic: cfg.mqtt.clone(),
                info: cfg.info,
                groups: Vec::new(),
                published: None,
            });
            text_ids.insert(name.clone(), tid);
        }

        let mut arbiter_ids = BTreeMap::new();
        for (name, schedules) in &config.switch_outputs {
            debug!("Creating switch output: {name}");
            let mut arbiter = SwitchOutputGroup::new(name.clone());
            for (schedule, entry) in schedules {
                let mut effects = ScheduleEffects::default();
                if let Some(cfg) = &entry.prealarm {
                    effects.prealarm =
                        Some(self.build_effect(format!("{name}/{schedule}/prealarm"), cfg));
                }
                if let Some(cfg) = &entry.alarm {
                    effects.alarm = Some(self.build_effect(format!("{name}/{schedule}/alarm"), cfg));
                }
                if let Some(cfg) = &entry.reset {
                    let reset = self.build_effect(format!("{name}/{schedule}/reset"), cfg);
                    arbiter.resets.insert(schedule.clone(), reset);
                }
                arbiter.schedules.insert(schedule.clone(), effects);
            }
            let aid = ArbiterId(self.arbiters.len());
            self.arbiters.push(arbiter);
            arbiter_ids.insert(name.clone(), aid);
        }

        if let Some(cfg) = &config.probe {
            self.probe = Some(self.build_effect("probe".to_string(), cfg));
        }

        let mut fallback_priority = 100;
        for group_cfg in &config.groups {
            fallback_priority += 1;
            debug!("Creating group: {}", group_cfg.name);
            let gid = GroupId(self.groups.len());

            let inhibit_timer =
                self.timers
                    .every(Duration::from_secs(60), TimerEvent::InhibitTimeout(gid), false);
            let escalate_timer = group_cfg
                .prealarm
                .map(|d| self.timers.every(d.to_duration(), TimerEvent::Escalate(gid), false));
            let reset_timer = group_cfg
                .reset_delay
                .map(|d| self.timers.every(d.to_duration(), TimerEvent::ResetDelay(gid), false));

            let enabled = self
                .store
                .get_bool(&["group_enabled", &group_cfg.name], group_cfg.default_enabled);

            self.groups.push(AlarmGroup {
                name: group_cfg.name.clone(),
                label: group_cfg.label.clone(),
                priority: group_cfg.priority.unwrap_or(fallback_priority),
                inputs: Vec::new(),
                inhibitors: Vec::new(),
                liveness: Vec::new(),
                bindings: OutputBindings::default(),
                state: AlarmState::Off,
                enabled,
                inhibited_by_command: false,
                escalate_timer,
                reset_timer,
                inhibit_timer,
            });

            let inputs = group_cfg
                .inputs
                .iter()
                .map(|cfg| self.build_input(cfg, Notify::Group(gid), gid, InputRole::Trigger))
                .collect::<Result<Vec<_>>>()?;
            let inhibitors = group_cfg
                .inhibitors
                .iter()
                .map(|cfg| self.build_input(cfg, Notify::Group(gid), gid, InputRole::Inhibitor))
                .collect::<Result<Vec<_>>>()?;
            let liveness = group_cfg
                .liveness
                .iter()
                .map(|cfg| self.build_liveness(cfg, gid))
                .collect::<Result<Vec<_>>>()?;
            self.groups[gid.0].inputs = inputs;
            self.groups[gid.0].inhibitors = inhibitors;
            self.groups[gid.0].liveness = liveness;

            let mut bindings = OutputBindings::default();
            for (phase, outs) in &group_cfg.outputs {
                for binding in outs {
                    match binding {
                        OutputBinding::Text(name) => {
                            let tid = *text_ids.get(name).ok_or_else(|| {
                                VigilError::Config(format!("unknown text output '{name}'"))
                            })?;
                            phase_bindings(&mut bindings, phase)?.text.push(tid);
                            self.text_add_group(tid, gid);
                        }
                        OutputBinding::Switch(map) => {
                            let (output, schedule) = map.iter().next().ok_or_else(|| {
                                VigilError::Config("empty switch binding".to_string())
                            })?;
                            let aid = *arbiter_ids.get(output).ok_or_else(|| {
                                VigilError::Config(format!("unknown switch output '{output}'"))
                            })?;
                            phase_bindings(&mut bindings, phase)?
                                .switch
                                .push((aid, schedule.clone()));
                        }
                    }
                }
            }
            self.groups[gid.0].bindings = bindings;

            for (suffix, command) in [
                ("enabled", GroupCommand::Enabled),
                ("inhibited", GroupCommand::Inhibited),
                ("reset", GroupCommand::Reset),
                ("auto", GroupCommand::Auto),
            ] {
                self.routes.push((
                    format!("{}{}/{suffix}/command", self.root, group_cfg.name),
                    Route::Command(gid, command),
                ));
            }
        }

        self.routes
            .push((format!("{}reset/command", self.root), Route::ServiceReset));

        let mut subscriptions: Vec<String> =
            self.routes.iter().map(|(topic, _)| topic.clone()).collect();
        subscriptions.sort();
        subscriptions.dedup();
        self.subscriptions = subscriptions;

        for (interval, event) in [
            (INFO_INTERVAL, TimerEvent::InfoInterval),
            (INFO_POLL, TimerEvent::InfoPoll),
            (SAVE_INTERVAL, TimerEvent::SaveState),
            (FLUSH_INTERVAL, TimerEvent::FlushInputs),
        ] {
            let timer = self.timers.every(interval, event, false);
            self.timers.start(timer, true);
        }

        self.publish_info_requested = true;
        Ok(())
    }

    fn build_effect(&mut self, name: String, cfg: &SwitchOutputConfig) -> EffectId {
        let eid = EffectId(self.effects.len());
        let repeat_timer = cfg
            .repeat
            .map(|d| self.timers.every(d.to_duration(), TimerEvent::Repeat(eid), false));
        self.effects.push(SwitchOutput {
            name,
            mqtt: cfg.mqtt.clone(),
            message: cfg.message.clone(),
            http_post: cfg.http_post.clone(),
            repeat_timer,
        });
        eid
    }

    fn build_input(
        &mut self,
        cfg: &InputConfig,
        parent: Notify,
        gid: GroupId,
        role: InputRole,
    ) -> Result<InputId> {
        match cfg {
            InputConfig::Topic(topic_cfg) => {
                let id = InputId(self.inputs.len());
                let condition = Condition::parse(&topic_cfg.when)?;
                let debounce = topic_cfg.debounce.map(|d| Debounce {
                    timer: self
                        .timers
                        .every(d.to_duration(), TimerEvent::Debounce(id), false),
                    observed: None,
                });
                let silence_timer = topic_cfg
                    .silence_timeout
                    .map(|d| self.timers.every(d.to_duration(), TimerEvent::Silence(id), false));

                self.inputs.push(InputNode {
                    label: topic_cfg.label.clone(),
                    parent,
                    group: gid,
                    role,
                    committed: None,
                    state: InputState::Unknown,
                    debounce,
                    kind: InputKind::Topic(TopicInput {
                        feed: TopicFeed {
                            topic: topic_cfg.mqtt.clone(),
                            condition,
                            condition_src: topic_cfg.when.clone(),
                            raw: None,
                            last_update: None,
                            last_seen: None,
                            silence_timer,
                        },
                        format: topic_cfg.format.clone(),
                    }),
                });
                self.routes
                    .push((topic_cfg.mqtt.clone(), Route::Input(id)));
                if let Some(timer) = silence_timer {
                    self.timers.start(timer, true);
                }
                self.hydrate_input(id);
                Ok(id)
            }
            InputConfig::Composite(composite_cfg) => {
                let id = InputId(self.inputs.len());
                let debounce = composite_cfg.debounce.map(|d| Debounce {
                    timer: self
                        .timers
                        .every(d.to_duration(), TimerEvent::Debounce(id), false),
                    observed: None,
                });
                self.inputs.push(InputNode {
                    label: composite_cfg.label.clone(),
                    parent,
                    group: gid,
                    role,
                    committed: None,
                    state: InputState::Unknown,
                    debounce,
                    kind: InputKind::Composite(crate::input::CompositeInput {
                        children: Vec::new(),
                        mode: composite_cfg.mode,
                    }),
                });

                let children = composite_cfg
                    .inputs
                    .iter()
                    .map(|child| self.build_input(child, Notify::Composite(id), gid, role))
                    .collect::<Result<Vec<_>>>()?;
                match &mut self.inputs[id.0].kind {
                    InputKind::Composite(composite) => composite.children = children,
                    _ => unreachable!("slot was just created as a composite"),
                }
                Ok(id)
            }
        }
    }

    fn build_liveness(&mut self, cfg: &LivenessConfig, gid: GroupId) -> Result<InputId> {
        let id = InputId(self.inputs.len());
        let condition = Condition::parse(&cfg.when)?;
        let silence_timer =
            self.timers
                .every(cfg.silence_timeout.to_duration(), TimerEvent::Silence(id), false);
        let invalid_timer = self.timers.every(
            cfg.invalid_response_timeout.to_duration(),
            TimerEvent::InvalidResponse(id),
            false,
        );

        self.inputs.push(InputNode {
            label: cfg.label.clone(),
            parent: Notify::Group(gid),
            group: gid,
            role: InputRole::Liveness,
            committed: None,
            state: InputState::Unknown,
            debounce: None,
            kind: InputKind::Liveness(LivenessInput {
                feed: TopicFeed {
                    topic: cfg.mqtt.clone(),
                    condition,
                    condition_src: cfg.when.clone(),
                    raw: None,
                    last_update: None,
                    last_seen: None,
                    silence_timer: Some(silence_timer),
                },
                invalid_timer,
            }),
        });
        self.routes.push((cfg.mqtt.clone(), Route::Input(id)));
        self.timers.start(silence_timer, true);
        self.hydrate_input(id);
        Ok(id)
    }

    /// Announce the service and fire the probe. Called once by `run`;
    /// tests call it directly.
    pub fn start(&mut self) {
        info!("Alarm service '{}' starting", self.name);
        let online_topic = format!("{}online", self.root);
        self.publisher.publish(&online_topic, "1");
        if let Some(probe) = self.probe {
            self.effect_on(probe);
        }
        self.request_publish_info();
    }

    /// The core event loop. Returns when the transport side of the
    /// channel is dropped.
    pub async fn run(&mut self, mut inbound: mpsc::UnboundedReceiver<(String, String)>) -> Result<()> {
        self.start();
        loop {
            self.run_due_timers();
            let deadline = self.timers.next_deadline();
            tokio::select! {
                message = inbound.recv() => match message {
                    Some((topic, payload)) => self.handle_message(&topic, &payload),
                    None => {
                        info!("Bus channel closed, shutting down");
                        if let Err(e) = self.store.save() {
                            error!("Final state save failed: {e}");
                        }
                        return Ok(());
                    }
                },
                _ = sleep_until_deadline(deadline) => {}
            }
        }
    }

    /// Deliver one bus message. Every matching route gets the payload
    /// independently; several inputs may share a topic.
    pub fn handle_message(&mut self, topic: &str, payload: &str) {
        debug!("Message on '{topic}': {payload}");
        let targets: Vec<Route> = self
            .routes
            .iter()
            .filter(|(pattern, _)| topic_matches(pattern, topic))
            .map(|(_, route)| *route)
            .collect();

        for route in targets {
            match route {
                Route::Input(id) => self.handle_input(id, payload),
                Route::Command(gid, command) => self.handle_group_command(gid, command, payload),
                Route::ServiceReset => {
                    for i in 0..self.groups.len() {
                        self.handle_reset_command(GroupId(i), payload);
                    }
                }
            }
        }
    }

    /// Fire every due timer in deadline order.
    pub fn run_due_timers(&mut self) {
        let now = Instant::now();
        while let Some((id, event)) = self.timers.pop_due(now) {
            if self.dispatch_timer(event) == TimerVerdict::Stop {
                self.timers.stop(id);
            }
        }
    }

    fn dispatch_timer(&mut self, event: TimerEvent) -> TimerVerdict {
        match event {
            TimerEvent::Debounce(id) => self.debounce_fired(id),
            TimerEvent::Silence(id) => self.silence_fired(id),
            TimerEvent::InvalidResponse(id) => self.invalid_response_fired(id),
            TimerEvent::Escalate(gid) => self.do_alarm(gid, "prealarm timeout"),
            TimerEvent::ResetDelay(gid) => self.do_reset(gid, "reset delay elapsed"),
            TimerEvent::InhibitTimeout(gid) => self.inhibit_timeout_fired(gid),
            TimerEvent::Repeat(eid) => self.repeat_fired(eid),
            TimerEvent::InfoInterval => {
                if !self.suppress_periodic_info {
                    self.request_publish_info();
                }
                TimerVerdict::Continue
            }
            TimerEvent::InfoPoll => {
                if self.publish_info_requested {
                    self.publish_info_requested = false;
                    self.publish_info();
                }
                TimerVerdict::Continue
            }
            TimerEvent::SaveState | TimerEvent::FlushInputs => {
                if let Err(e) = self.store.save() {
                    error!("State save failed: {e}");
                }
                TimerVerdict::Continue
            }
        }
    }

    pub(crate) fn request_publish_info(&mut self) {
        self.publish_info_requested = true;
    }

    /// Emit the composite JSON snapshot and the flattened per-key
    /// topics, each gated by the per-topic change window.
    pub fn publish_info(&mut self) {
        let mut data = Map::new();
        for i in 0..self.groups.len() {
            data.insert(
                self.groups[i].name.clone(),
                self.group_state_json(GroupId(i)),
            );
        }
        let payload = Value::Object(data);

        let info_topic = format!("{}info", self.root);
        self.publish_gated(&info_topic, &payload.to_string());

        if let Value::Object(map) = &payload {
            for (group, tree) in map {
                let prefix = format!("{}{group}", self.root);
                self.flatten_publish(&prefix, tree);
            }
        }
    }

    fn flatten_publish(&mut self, prefix: &str, value: &Value) {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    self.flatten_publish(&format!("{prefix}/{key}"), child);
                }
            }
            // An input that never evaluated has no value to publish.
            Value::Null => {}
            Value::Bool(b) => self.publish_gated(prefix, if *b { "1" } else { "0" }),
            Value::String(s) => self.publish_gated(prefix, s),
            other => {
                let text = other.to_string();
                self.publish_gated(prefix, &text);
            }
        }
    }

    /// Suppress republication of an unchanged payload within the change
    /// window; changed payloads always go out.
    fn publish_gated(&mut self, topic: &str, payload: &str) {
        let now = Instant::now();
        if let Some((last, at)) = self.last_published.get(topic) {
            if last == payload && now.duration_since(*at) < INFO_CHANGE_WINDOW {
                return;
            }
        }
        self.publisher.publish(topic, payload);
        self.last_published
            .insert(topic.to_string(), (payload.to_string(), now));
    }

    /// Log a warning and forward it to every `info` text output.
    pub(crate) fn warning(&self, message: &str) {
        warn!("{message}");
        for i in 0..self.texts.len() {
            if self.texts[i].info {
                self.text_send_info(TextId(i), message);
            }
        }
    }
}

fn phase_bindings<'a>(
    bindings: &'a mut OutputBindings,
    phase: &str,
) -> Result<&'a mut crate::group::PhaseBindings> {
    match phase {
        "prealarm" => Ok(&mut bindings.prealarm),
        "alarm" => Ok(&mut bindings.alarm),
        "off" => Ok(&mut bindings.off),
        other => Err(VigilError::Config(format!("unknown output phase '{other}'"))),
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
