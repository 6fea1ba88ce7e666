// src/config.rs
//! Operator-facing configuration.
//!
//! The YAML file names the whole alarm graph: broker settings, text and
//! switch outputs, and the alarm groups with their inputs, inhibitors,
//! liveness feeds and per-phase output bindings. Loading is strict;
//! anything structurally wrong refuses to start the service.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, VigilError};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Service name; topic root is `service/{name}/`.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    #[serde(default)]
    pub broker: BrokerConfig,

    /// Persistent state file (JSON).
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Optional heartbeat output switched on at startup.
    #[serde(default)]
    pub probe: Option<SwitchOutputConfig>,

    #[serde(default)]
    pub text_outputs: BTreeMap<String, TextOutputConfig>,

    /// Physical switch outputs: name → schedule name → effects.
    #[serde(default)]
    pub switch_outputs: BTreeMap<String, BTreeMap<String, ScheduleConfig>>,

    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

fn default_service_name() -> String {
    "alarm".to_string()
}

fn default_state_file() -> PathBuf {
    PathBuf::from("vigil-state.json")
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    1883
}
fn default_client_id() -> String {
    "vigil".to_string()
}
fn default_keep_alive() -> u64 {
    60
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_id: default_client_id(),
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TextOutputConfig {
    /// Topic the summary is published to.
    pub mqtt: String,
    /// Receive service warnings in addition to alarm summaries.
    #[serde(default)]
    pub info: bool,
}

/// One named schedule on a switch output: which effect to run per alarm
/// phase, plus an optional back-to-normal pulse.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub prealarm: Option<SwitchOutputConfig>,
    #[serde(default)]
    pub alarm: Option<SwitchOutputConfig>,
    #[serde(default)]
    pub reset: Option<SwitchOutputConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SwitchOutputConfig {
    #[serde(default)]
    pub mqtt: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub http_post: Option<String>,
    #[serde(default)]
    pub repeat: Option<DurationSpec>,
}

/// Duration written as calendar-ish fields, e.g. `{minutes: 3}` or
/// `{seconds: 0.2}`.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DurationSpec {
    #[serde(default)]
    pub days: f64,
    #[serde(default)]
    pub hours: f64,
    #[serde(default)]
    pub minutes: f64,
    #[serde(default)]
    pub seconds: f64,
}

impl DurationSpec {
    pub fn to_duration(self) -> Duration {
        let secs = self.days * 86_400.0 + self.hours * 3_600.0 + self.minutes * 60.0 + self.seconds;
        Duration::from_secs_f64(secs.max(0.0))
    }

    pub fn days(days: f64) -> Self {
        Self {
            days,
            ..Self::default()
        }
    }

    pub fn hours(hours: f64) -> Self {
        Self {
            hours,
            ..Self::default()
        }
    }

    pub fn minutes(minutes: f64) -> Self {
        Self {
            minutes,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupConfig {
    /// Short name used in topics and state keys.
    pub name: String,
    /// Human-readable label used in text outputs.
    pub label: String,
    /// Lower number wins at shared outputs. Defaults assigned in config
    /// order starting at 101.
    #[serde(default)]
    pub priority: Option<i64>,
    /// Prealarm phase length; unset means triggers go straight to alarm.
    #[serde(default)]
    pub prealarm: Option<DurationSpec>,
    /// Auto-reset delay once all inputs are clear; unset disables
    /// automatic reset.
    #[serde(default)]
    pub reset_delay: Option<DurationSpec>,
    #[serde(default)]
    pub default_enabled: bool,
    #[serde(default)]
    pub inputs: Vec<InputConfig>,
    #[serde(default)]
    pub inhibitors: Vec<InputConfig>,
    #[serde(default)]
    pub liveness: Vec<LivenessConfig>,
    /// Phase (`prealarm` / `alarm` / `off`) → output bindings.
    #[serde(default)]
    pub outputs: BTreeMap<String, Vec<OutputBinding>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InputConfig {
    Topic(TopicInputConfig),
    Composite(CompositeInputConfig),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopicInputConfig {
    /// Topic to subscribe to.
    pub mqtt: String,
    /// Predicate over the payload (see `condition`).
    pub when: String,
    pub label: String,
    #[serde(default)]
    pub debounce: Option<DurationSpec>,
    /// Display template; `{value}` and `{value_float}` are substituted.
    #[serde(default)]
    pub format: Option<String>,
    /// Mark OFFLINE after this long without a payload. Explicit null
    /// disables the watchdog.
    #[serde(default = "default_silence_timeout")]
    pub silence_timeout: Option<DurationSpec>,
}

fn default_silence_timeout() -> Option<DurationSpec> {
    Some(DurationSpec::days(7.0))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompositeInputConfig {
    pub label: String,
    pub mode: CompositeMode,
    pub inputs: Vec<InputConfig>,
    #[serde(default)]
    pub debounce: Option<DurationSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompositeMode {
    And,
    Or,
}

impl std::fmt::Display for CompositeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompositeMode::And => write!(f, "and"),
            CompositeMode::Or => write!(f, "or"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LivenessConfig {
    pub mqtt: String,
    pub when: String,
    pub label: String,
    #[serde(default = "default_liveness_silence")]
    pub silence_timeout: DurationSpec,
    #[serde(default = "default_invalid_response")]
    pub invalid_response_timeout: DurationSpec,
}

fn default_liveness_silence() -> DurationSpec {
    DurationSpec::hours(1.0)
}

fn default_invalid_response() -> DurationSpec {
    DurationSpec::minutes(3.0)
}

/// One entry in a phase's output list: either a text-output name or a
/// single-entry `{switch-output: schedule}` map.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OutputBinding {
    Text(String),
    Switch(BTreeMap<String, String>),
}

const PHASES: [&str; 3] = ["prealarm", "alarm", "off"];

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(text).map_err(|e| VigilError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if let Some(probe) = &self.probe {
            validate_effect("probe", probe)?;
        }

        for (name, schedules) in &self.switch_outputs {
            for (schedule, entry) in schedules {
                let at = format!("switch output '{name}', schedule '{schedule}'");
                for effect in [&entry.prealarm, &entry.alarm, &entry.reset]
                    .into_iter()
                    .flatten()
                {
                    validate_effect(&at, effect)?;
                }
            }
        }

        for group in &self.groups {
            for (phase, bindings) in &group.outputs {
                if !PHASES.contains(&phase.as_str()) {
                    return Err(VigilError::Config(format!(
                        "group '{}': unknown output phase '{phase}'",
                        group.name
                    )));
                }
                for binding in bindings {
                    match binding {
                        OutputBinding::Text(name) => {
                            if !self.text_outputs.contains_key(name) {
                                return Err(VigilError::Config(format!(
                                    "group '{}': unknown text output '{name}'",
                                    group.name
                                )));
                            }
                        }
                        OutputBinding::Switch(map) => {
                            if map.len() != 1 {
                                return Err(VigilError::Config(format!(
                                    "group '{}': switch binding must be a single \
                                     'output: schedule' entry",
                                    group.name
                                )));
                            }
                            let (output, schedule) = map.iter().next().expect("len checked");
                            let schedules =
                                self.switch_outputs.get(output).ok_or_else(|| {
                                    VigilError::Config(format!(
                                        "group '{}': unknown switch output '{output}'",
                                        group.name
                                    ))
                                })?;
                            if !schedules.contains_key(schedule) {
                                return Err(VigilError::Config(format!(
                                    "group '{}': switch output '{output}' has no \
                                     schedule '{schedule}'",
                                    group.name
                                )));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn validate_effect(at: &str, effect: &SwitchOutputConfig) -> Result<()> {
    if effect.mqtt.is_some() && effect.message.is_none() {
        return Err(VigilError::Config(format!(
            "{at}: mqtt is set but message is not"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"
service_name: alarm
state_file: /tmp/vigil-test-state.json
text_outputs:
  to1: {mqtt: "text/to1", info: true}
switch_outputs:
  sw1:
    schedule1:
      prealarm: {mqtt: "switch/sw1", message: "schedule1-prealarm", repeat: {seconds: 0.5}}
      reset: {mqtt: "switch/sw1", message: "schedule1-reset"}
    schedule2:
      alarm: {mqtt: "switch/sw1", message: "schedule2-alarm"}
groups:
  - name: g1
    label: Group 1
    prealarm: {seconds: 1}
    inputs:
      - mqtt: group1/input1
        when: is_on(value)
        label: Input 1
      - label: Multi
        mode: or
        inputs:
          - {mqtt: group1/m1, when: is_on(value), label: M 1}
          - {mqtt: group1/m2, when: is_on(value), label: M 2}
    outputs:
      prealarm: [{sw1: schedule1}, to1]
      alarm: [{sw1: schedule2}, to1]
      off: [to1]
"#;

    #[test]
    fn parses_full_fixture() {
        let config = Config::from_yaml(FIXTURE).unwrap();
        assert_eq!(config.groups.len(), 1);
        let g1 = &config.groups[0];
        assert_eq!(g1.inputs.len(), 2);
        assert!(matches!(g1.inputs[0], InputConfig::Topic(_)));
        match &g1.inputs[1] {
            InputConfig::Composite(c) => {
                assert_eq!(c.mode, CompositeMode::Or);
                assert_eq!(c.inputs.len(), 2);
            }
            other => panic!("expected composite, got {other:?}"),
        }
        assert_eq!(g1.outputs["prealarm"].len(), 2);
    }

    #[test]
    fn duration_spec_converts() {
        let spec: DurationSpec = serde_yaml::from_str("{minutes: 1, seconds: 30}").unwrap();
        assert_eq!(spec.to_duration(), Duration::from_secs(90));
        assert_eq!(
            DurationSpec::days(7.0).to_duration(),
            Duration::from_secs(7 * 86_400)
        );
    }

    #[test]
    fn silence_timeout_defaults_and_disables() {
        let with_default: TopicInputConfig =
            serde_yaml::from_str("{mqtt: a, when: is_on(value), label: A}").unwrap();
        assert!(with_default.silence_timeout.is_some());

        let disabled: TopicInputConfig =
            serde_yaml::from_str("{mqtt: a, when: is_on(value), label: A, silence_timeout: null}")
                .unwrap();
        assert!(disabled.silence_timeout.is_none());
    }

    #[test]
    fn mqtt_without_message_is_fatal() {
        let bad = FIXTURE.replace(
            r#"reset: {mqtt: "switch/sw1", message: "schedule1-reset"}"#,
            r#"reset: {mqtt: "switch/sw1"}"#,
        );
        assert!(Config::from_yaml(&bad).is_err());
    }

    #[test]
    fn unknown_schedule_is_fatal() {
        let bad = FIXTURE.replace("{sw1: schedule1}", "{sw1: missing}");
        assert!(Config::from_yaml(&bad).is_err());
    }

    #[test]
    fn unknown_text_output_is_fatal() {
        let bad = FIXTURE.replace("off: [to1]", "off: [nope]");
        assert!(Config::from_yaml(&bad).is_err());
    }

    #[test]
    fn invalid_composite_mode_is_fatal() {
        let bad = FIXTURE.replace("mode: or", "mode: xor");
        assert!(Config::from_yaml(&bad).is_err());
    }
}
