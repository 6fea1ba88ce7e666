// src/input.rs
//! Input evaluation pipeline.
//!
//! Inputs live in an arena on the service and come in three kinds:
//! topic-driven leaves, AND/OR composites over child inputs, and
//! liveness feeds. A leaf evaluates its predicate per message, runs the
//! result through the debounce filter and, on commit, notifies its
//! parent: either the owning alarm group or an enclosing composite.
//! Liveness feeds share the topic plumbing but only track health; they
//! never drive the alarm state machine.

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::condition::{Condition, PayloadEnv};
use crate::config::CompositeMode;
use crate::group::GroupId;
use crate::service::AlarmService;
use crate::timer::{TimerId, TimerVerdict};

/// Handle into the service's input arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputState {
    Unknown,
    Offline,
    Online,
    InvalidResponse,
}

impl InputState {
    pub fn key(&self) -> &'static str {
        match self {
            InputState::Unknown => "unknown",
            InputState::Offline => "offline",
            InputState::Online => "online",
            InputState::InvalidResponse => "invalid_response",
        }
    }

    pub fn from_key(key: &str) -> Option<InputState> {
        match key {
            "unknown" => Some(InputState::Unknown),
            "offline" => Some(InputState::Offline),
            "online" => Some(InputState::Online),
            "invalid_response" => Some(InputState::InvalidResponse),
            _ => None,
        }
    }

    /// Severity used when a composite aggregates child states.
    fn severity(&self) -> u8 {
        match self {
            InputState::InvalidResponse => 3,
            InputState::Offline => 2,
            InputState::Online => 1,
            InputState::Unknown => 0,
        }
    }
}

/// Where a commit is delivered.
#[derive(Debug, Clone, Copy)]
pub enum Notify {
    Group(GroupId),
    Composite(InputId),
}

/// Which list of its group an input chain belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputRole {
    Trigger,
    Inhibitor,
    Liveness,
}

/// Debounce observation; present only when a debounce is configured.
pub struct Debounce {
    pub timer: TimerId,
    pub observed: Option<bool>,
}

/// Topic plumbing shared by leaf and liveness inputs.
pub struct TopicFeed {
    pub topic: String,
    pub condition: Condition,
    /// Original predicate text; part of the persistence key.
    pub condition_src: String,
    pub raw: Option<String>,
    /// Wall-clock stamp of the latest payload; persisted.
    pub last_update: Option<DateTime<Utc>>,
    /// Monotonic stamp of the latest payload; drives silence spans.
    pub last_seen: Option<Instant>,
    pub silence_timer: Option<TimerId>,
}

pub struct TopicInput {
    pub feed: TopicFeed,
    /// Display template with `{value}` / `{value_float}` placeholders.
    pub format: Option<String>,
}

pub struct CompositeInput {
    pub children: Vec<InputId>,
    pub mode: CompositeMode,
}

pub struct LivenessInput {
    pub feed: TopicFeed,
    pub invalid_timer: TimerId,
}

pub enum InputKind {
    Topic(TopicInput),
    Composite(CompositeInput),
    Liveness(LivenessInput),
}

pub struct InputNode {
    pub label: String,
    pub parent: Notify,
    pub group: GroupId,
    pub role: InputRole,
    /// Last committed evaluation; `None` until the first commit.
    pub committed: Option<bool>,
    pub state: InputState,
    pub debounce: Option<Debounce>,
    pub kind: InputKind,
}

impl InputNode {
    pub fn feed(&self) -> Option<&TopicFeed> {
        match &self.kind {
            InputKind::Topic(t) => Some(&t.feed),
            InputKind::Liveness(l) => Some(&l.feed),
            InputKind::Composite(_) => None,
        }
    }

    fn feed_mut(&mut self) -> Option<&mut TopicFeed> {
        match &mut self.kind {
            InputKind::Topic(t) => Some(&mut t.feed),
            InputKind::Liveness(l) => Some(&mut l.feed),
            InputKind::Composite(_) => None,
        }
    }
}

impl AlarmService {
    /// Last committed value; composites derive live from their children
    /// (an unset child counts as false).
    pub(crate) fn input_value(&self, id: InputId) -> Option<bool> {
        let node = &self.inputs[id.0];
        match &node.kind {
            InputKind::Composite(c) => Some(self.composite_value(c)),
            _ => node.committed,
        }
    }

    fn composite_value(&self, composite: &CompositeInput) -> bool {
        let mut values = composite
            .children
            .iter()
            .map(|&child| self.input_value(child).unwrap_or(false));
        match composite.mode {
            CompositeMode::And => values.all(|v| v),
            CompositeMode::Or => values.any(|v| v),
        }
    }

    /// Input health; composites report the most severe child state.
    pub(crate) fn input_state(&self, id: InputId) -> InputState {
        let node = &self.inputs[id.0];
        match &node.kind {
            InputKind::Composite(c) => c
                .children
                .iter()
                .map(|&child| self.input_state(child))
                .max_by_key(InputState::severity)
                .unwrap_or(InputState::Unknown),
            _ => node.state,
        }
    }

    /// Human-readable form used in text outputs and warnings.
    pub(crate) fn input_display(&self, id: InputId) -> String {
        let node = &self.inputs[id.0];
        match &node.kind {
            InputKind::Composite(c) => {
                format!("{} ({} inputs, '{}')", node.label, c.children.len(), c.mode)
            }
            InputKind::Topic(t) => match &t.format {
                Some(template) => {
                    let raw = t.feed.raw.as_deref().unwrap_or("");
                    let float = raw.trim().parse::<f64>().unwrap_or(f64::NAN);
                    let rendered = template
                        .replace("{value}", raw)
                        .replace("{value_float}", &float.to_string());
                    format!("{} ({})", node.label, rendered)
                }
                None => node.label.clone(),
            },
            InputKind::Liveness(_) => node.label.clone(),
        }
    }

    /// A payload arrived for this input's topic.
    pub(crate) fn handle_input(&mut self, id: InputId, payload: &str) {
        match &self.inputs[id.0].kind {
            InputKind::Topic(_) => self.topic_message(id, payload),
            InputKind::Liveness(_) => self.liveness_message(id, payload),
            InputKind::Composite(_) => {
                debug_assert!(false, "composite inputs have no topic");
            }
        }
    }

    fn topic_message(&mut self, id: InputId, payload: &str) {
        let silence_timer;
        {
            let node = &mut self.inputs[id.0];
            let feed = node.feed_mut().expect("topic input has a feed");
            feed.last_update = Some(Utc::now());
            feed.last_seen = Some(Instant::now());
            feed.raw = Some(payload.to_string());
            silence_timer = feed.silence_timer;
            node.state = InputState::Online;
        }
        if let Some(timer) = silence_timer {
            self.timers.restart(timer, true);
        }

        let new_value = self.evaluate(id, payload);
        if let Some(value) = new_value {
            self.handle_change(id, value);
        }
        self.store_input_state(id);
    }

    fn liveness_message(&mut self, id: InputId, payload: &str) {
        let silence_timer;
        {
            let node = &mut self.inputs[id.0];
            let feed = node.feed_mut().expect("liveness input has a feed");
            feed.last_update = Some(Utc::now());
            feed.last_seen = Some(Instant::now());
            feed.raw = Some(payload.to_string());
            silence_timer = feed.silence_timer;
        }
        if let Some(timer) = silence_timer {
            self.timers.restart(timer, true);
        }

        if let Some(value) = self.evaluate(id, payload) {
            self.liveness_change(id, value);
        }
        self.store_input_state(id);
    }

    /// Run the predicate. On error keep the last committed value, which
    /// may itself be unset.
    fn evaluate(&self, id: InputId, payload: &str) -> Option<bool> {
        let node = &self.inputs[id.0];
        let feed = node.feed().expect("evaluate needs a feed");
        let env = PayloadEnv::new(payload);
        match feed.condition.eval(&env) {
            Ok(value) => Some(value),
            Err(e) => {
                self.warning(&format!(
                    "Group {}, input {} | Evaluation of input '{payload}' failed: {e}",
                    self.groups[node.group.0].label,
                    self.input_display(id)
                ));
                node.committed
            }
        }
    }

    /// Debounce filter. Without a configured debounce, a changed value
    /// commits immediately; otherwise a change starts an observation
    /// that must survive the debounce window, and a revert cancels it.
    pub(crate) fn handle_change(&mut self, id: InputId, new_value: bool) {
        let committed = self.inputs[id.0].committed;
        let debounce = self.inputs[id.0]
            .debounce
            .as_ref()
            .map(|db| (db.timer, db.observed));

        match debounce {
            None => {
                if committed == Some(new_value) {
                    return;
                }
                self.commit(id, new_value);
            }
            Some((timer, None)) => {
                if committed != Some(new_value) {
                    self.inputs[id.0].debounce.as_mut().expect("checked").observed =
                        Some(new_value);
                    self.timers.start(timer, true);
                    debug!(
                        "Input {} | Value changed to {new_value}, awaiting debounce",
                        self.inputs[id.0].label
                    );
                }
            }
            Some((timer, Some(observed))) => {
                if new_value != observed {
                    // Bounced back before the window elapsed.
                    self.inputs[id.0].debounce.as_mut().expect("checked").observed = None;
                    self.timers.stop(timer);
                    debug!(
                        "Input {} | Value reverted to {new_value}, observation cancelled",
                        self.inputs[id.0].label
                    );
                }
            }
        }
    }

    fn commit(&mut self, id: InputId, value: bool) {
        let node = &mut self.inputs[id.0];
        info!(
            "Group {}, input {} | Evaluated value changed to {value}",
            self.groups[node.group.0].label, node.label
        );
        node.committed = Some(value);
        let parent = node.parent;
        match parent {
            Notify::Group(group) => {
                if value {
                    self.group_on(group, id);
                } else {
                    self.group_off(group, id);
                }
            }
            Notify::Composite(parent_id) => self.composite_reevaluate(parent_id),
        }
    }

    /// A child committed; recompute the derived value and push it
    /// through this composite's own debounce pipeline.
    fn composite_reevaluate(&mut self, id: InputId) {
        let derived = match &self.inputs[id.0].kind {
            InputKind::Composite(c) => self.composite_value(c),
            _ => {
                debug_assert!(false, "reevaluate on a non-composite");
                return;
            }
        };
        self.handle_change(id, derived);
    }

    /// Liveness commit path: no debounce, no group notification.
    fn liveness_change(&mut self, id: InputId, new_value: bool) {
        let invalid_timer;
        {
            let node = &mut self.inputs[id.0];
            if node.committed == Some(new_value) {
                return;
            }
            info!(
                "Group {}, liveness input {} | Evaluated value changed to {new_value}",
                self.groups[node.group.0].label, node.label
            );
            node.committed = Some(new_value);
            node.state = if new_value {
                InputState::Online
            } else {
                InputState::InvalidResponse
            };
            invalid_timer = match &node.kind {
                InputKind::Liveness(l) => l.invalid_timer,
                _ => unreachable!("liveness_change on a non-liveness input"),
            };
        }
        if new_value {
            self.timers.stop(invalid_timer);
        } else {
            self.timers.start(invalid_timer, true);
        }
    }

    /// Debounce window elapsed without a revert: commit the observation.
    pub(crate) fn debounce_fired(&mut self, id: InputId) -> TimerVerdict {
        let observed = self
            .inputs[id.0]
            .debounce
            .as_mut()
            .and_then(|db| db.observed.take());
        match observed {
            Some(value) => {
                info!(
                    "Input {} | Observation timed out, committing {value}",
                    self.inputs[id.0].label
                );
                self.commit(id, value);
            }
            None => debug_assert!(false, "debounce fired without an observation"),
        }
        TimerVerdict::Stop
    }

    /// No payload for the configured window: mark OFFLINE and warn. The
    /// timer stays armed, so the warning repeats while silence lasts.
    pub(crate) fn silence_fired(&mut self, id: InputId) -> TimerVerdict {
        self.inputs[id.0].state = InputState::Offline;

        let node = &self.inputs[id.0];
        let feed = node.feed().expect("silence timer implies a feed");
        let group_label = &self.groups[node.group.0].label;
        let display = self.input_display(id);

        let message = if let Some(at) = feed.last_seen {
            format!(
                "Group {group_label}, input {display}: Silent for {}",
                format_timespan(at.elapsed())
            )
        } else if let Some(stamp) = feed.last_update {
            // Hydrated from the state file; no monotonic stamp exists.
            let span = (Utc::now() - stamp).to_std().unwrap_or_default();
            format!(
                "Group {group_label}, input {display}: Silent for {}",
                format_timespan(span)
            )
        } else {
            format!(
                "Group {group_label}, input {display}: Silent since launch ({} ago)",
                format_timespan(self.started_at.elapsed())
            )
        };
        self.warning(&message);
        TimerVerdict::Continue
    }

    /// Liveness predicate has been false for the configured window.
    /// Only warns; the INVALID_RESPONSE state was set at commit time.
    pub(crate) fn invalid_response_fired(&mut self, id: InputId) -> TimerVerdict {
        let node = &self.inputs[id.0];
        let since = node
            .feed()
            .and_then(|f| f.last_update)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "launch".to_string());
        self.warning(&format!(
            "Group {}, liveness input {}: Invalid response since {since}",
            self.groups[node.group.0].label, node.label
        ));
        TimerVerdict::Continue
    }

    /// Snapshot to the state store (flushed to disk by the service's
    /// periodic timers).
    pub(crate) fn store_input_state(&mut self, id: InputId) {
        let node = &self.inputs[id.0];
        let Some(feed) = node.feed() else { return };
        let snapshot = json!({
            "last_raw_value": feed.raw.clone(),
            "last_eval_value": node.committed,
            "last_update": feed.last_update.map(|t| t.to_rfc3339()),
            "state": node.state.key(),
        });
        let topic = feed.topic.clone();
        let condition = feed.condition_src.clone();
        self.store
            .set_path(&["mqtt_input", &topic, &condition, "last_state"], snapshot);
    }

    /// Restore the last persisted snapshot, without notifying anyone.
    pub(crate) fn hydrate_input(&mut self, id: InputId) {
        let (topic, condition) = match self.inputs[id.0].feed() {
            Some(feed) => (feed.topic.clone(), feed.condition_src.clone()),
            None => return,
        };
        let Some(stored) = self
            .store
            .get_path(&["mqtt_input", &topic, &condition, "last_state"])
            .cloned()
        else {
            return;
        };

        let node = &mut self.inputs[id.0];
        node.committed = stored.get("last_eval_value").and_then(Value::as_bool);
        if let Some(state) = stored
            .get("state")
            .and_then(Value::as_str)
            .and_then(InputState::from_key)
        {
            node.state = state;
        }
        let feed = node.feed_mut().expect("checked above");
        feed.raw = stored
            .get("last_raw_value")
            .and_then(Value::as_str)
            .map(String::from);
        feed.last_update = stored
            .get("last_update")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));
    }
}

/// Render a duration the way a human would say it: the two largest
/// non-zero units, e.g. "2 seconds" or "1 hour and 10 minutes".
pub(crate) fn format_timespan(span: std::time::Duration) -> String {
    const UNITS: [(u64, &str); 4] = [
        (86_400, "day"),
        (3_600, "hour"),
        (60, "minute"),
        (1, "second"),
    ];

    let total = span.as_secs();
    if total == 0 {
        return "0 seconds".to_string();
    }

    let mut parts = Vec::new();
    let mut remaining = total;
    for (size, name) in UNITS {
        let count = remaining / size;
        if count > 0 {
            let plural = if count == 1 { "" } else { "s" };
            parts.push(format!("{count} {name}{plural}"));
            remaining %= size;
        }
        if parts.len() == 2 {
            break;
        }
    }
    parts.join(" and ")
}
