// src/text_output.rs
//! Coalesced human-readable alarm summaries.
//!
//! A text output watches the groups bound to it and publishes one line
//! per group currently in PREALARM or ALARM, listing the inputs that
//! are asserting. It publishes only when the summary actually changes;
//! outputs flagged `info` additionally receive service warnings.

use log::info;

use crate::group::{AlarmState, GroupId};
use crate::service::AlarmService;

/// Handle into the service's text-output arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextId(pub(crate) usize);

/// One group's slice of the published summary.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupAlarmInfo {
    pub state: &'static str,
    pub inputs: Vec<String>,
}

pub struct TextOutput {
    pub name: String,
    pub topic: String,
    /// Also receives service warnings.
    pub info: bool,
    /// Member groups, ordered by priority.
    pub groups: Vec<GroupId>,
    /// Last published summary; publication is suppressed while the
    /// recomputed summary matches it.
    pub published: Option<Vec<(String, GroupAlarmInfo)>>,
}

fn format_alarm_information(entries: &[(String, GroupAlarmInfo)]) -> String {
    let lines: Vec<String> = entries
        .iter()
        .map(|(label, info)| format!("{} {label}: {}", info.state, info.inputs.join(", ")))
        .collect();
    lines.join("\n")
}

impl AlarmService {
    /// Bind a group; called while wiring the graph. Members stay sorted
    /// by priority, ties in insertion order.
    pub(crate) fn text_add_group(&mut self, tid: TextId, gid: GroupId) {
        let mut members = std::mem::take(&mut self.texts[tid.0].groups);
        if !members.contains(&gid) {
            members.push(gid);
        }
        members.sort_by_key(|&g| self.groups[g.0].priority);
        self.texts[tid.0].groups = members;
    }

    /// Recompute the summary and publish it if it changed.
    pub(crate) fn text_update(&mut self, tid: TextId) {
        let members = self.texts[tid.0].groups.clone();
        let mut entries = Vec::new();
        for gid in members {
            let group = &self.groups[gid.0];
            if !matches!(group.state, AlarmState::Prealarm | AlarmState::Alarm) {
                continue;
            }
            let inputs = group
                .inputs
                .iter()
                .filter(|&&i| self.input_value(i) == Some(true))
                .map(|&i| self.input_display(i))
                .collect();
            entries.push((
                group.label.clone(),
                GroupAlarmInfo {
                    state: group.state.name(),
                    inputs,
                },
            ));
        }

        info!(
            "TextOutput {} | Alarm information: {entries:?}",
            self.texts[tid.0].name
        );

        if self.texts[tid.0].published.as_ref() != Some(&entries) {
            let message = format_alarm_information(&entries);
            self.publisher.publish(&self.texts[tid.0].topic, &message);
            self.texts[tid.0].published = Some(entries);
        }
    }

    /// Unconditional publish; the warning channel uses this.
    pub(crate) fn text_send_info(&self, tid: TextId, message: &str) {
        self.publisher.publish(&self.texts[tid.0].topic, message);
    }
}
