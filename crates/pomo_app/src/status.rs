//! Local countdown and terminal rendering of the room.

use std::collections::HashMap;

use pomo_network::{Member, MemberState, TimerInfo};

/// The status this process broadcasts: a single phase counting down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Countdown {
    state: MemberState,
    duration_secs: u32,
    remaining_secs: u32,
    task: String,
}

impl Countdown {
    pub fn new(state: MemberState, duration_secs: u32, task: impl Into<String>) -> Self {
        Self {
            state,
            duration_secs,
            remaining_secs: duration_secs,
            task: task.into(),
        }
    }

    pub fn state(&self) -> MemberState {
        self.state
    }

    pub fn remaining_secs(&self) -> u32 {
        self.remaining_secs
    }

    fn is_running(&self) -> bool {
        self.state != MemberState::Idle && self.remaining_secs > 0
    }

    /// Move the clock forward. A finished phase drops back to idle.
    pub fn advance(&mut self, elapsed_secs: u32) {
        if !self.is_running() {
            return;
        }
        self.remaining_secs = self.remaining_secs.saturating_sub(elapsed_secs);
        if self.remaining_secs == 0 {
            self.state = MemberState::Idle;
        }
    }

    pub fn timer(&self) -> TimerInfo {
        TimerInfo {
            duration_secs: self.duration_secs,
            remaining_secs: self.remaining_secs,
            is_running: self.is_running(),
            is_work_phase: self.state == MemberState::Work,
        }
    }

    /// The member record for this node, stamped now.
    pub fn member(&self, id: &str, name: &str) -> Member {
        Member::new(id, name, self.state, self.timer(), self.task.as_str())
    }
}

/// `mm:ss`
pub fn format_clock(secs: u32) -> String {
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

/// One line per member, sorted by name then id. `self_id` is marked.
pub fn render_members(members: &HashMap<String, Member>, self_id: &str) -> Vec<String> {
    let mut sorted: Vec<&Member> = members.values().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));

    sorted
        .into_iter()
        .map(|m| {
            let marker = if m.id == self_id { '*' } else { ' ' };
            let clock = if m.timer.is_running {
                format_clock(m.timer.remaining_secs)
            } else {
                "--:--".to_string()
            };
            let line = format!("{marker} {:<16} {:<5} {clock}", m.name, m.state.as_str());
            if m.task_name.is_empty() {
                line
            } else {
                format!("{line}  {}", m.task_name)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_countdown_runs_down_to_idle() {
        let mut countdown = Countdown::new(MemberState::Work, 90, "write");
        assert!(countdown.timer().is_running);
        assert!(countdown.timer().is_work_phase);

        countdown.advance(60);
        assert_eq!(countdown.remaining_secs(), 30);
        assert_eq!(countdown.state(), MemberState::Work);

        countdown.advance(45);
        assert_eq!(countdown.remaining_secs(), 0);
        assert_eq!(countdown.state(), MemberState::Idle);
        assert!(!countdown.timer().is_running);
    }

    #[test]
    fn test_idle_countdown_does_not_move() {
        let mut countdown = Countdown::new(MemberState::Idle, 300, "");
        countdown.advance(10);
        assert_eq!(countdown.remaining_secs(), 300);
        assert!(!countdown.timer().is_running);
    }

    #[test]
    fn test_rest_is_not_work_phase() {
        let countdown = Countdown::new(MemberState::Rest, 300, "");
        let timer = countdown.timer();
        assert!(timer.is_running);
        assert!(!timer.is_work_phase);
    }

    #[test]
    fn test_member_carries_countdown() {
        let countdown = Countdown::new(MemberState::Work, 1500, "review");
        let member = countdown.member("peer-1", "alice");
        assert_eq!(member.id, "peer-1");
        assert_eq!(member.state, MemberState::Work);
        assert_eq!(member.timer.remaining_secs, 1500);
        assert_eq!(member.task_name, "review");
    }

    #[test]
    fn test_format_clock() {
        assert_eq!(format_clock(0), "00:00");
        assert_eq!(format_clock(1499), "24:59");
    }

    #[test]
    fn test_render_members_sorted_and_marked() {
        let mut members = HashMap::new();
        members.insert(
            "b".to_string(),
            Countdown::new(MemberState::Rest, 120, "").member("b", "bob"),
        );
        members.insert(
            "a".to_string(),
            Countdown::new(MemberState::Work, 61, "plan").member("a", "alice"),
        );

        let lines = render_members(&members, "b");
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("  alice"));
        assert!(lines[0].contains("work"));
        assert!(lines[0].contains("01:01"));
        assert!(lines[0].ends_with("plan"));
        assert!(lines[1].starts_with("* bob"));
    }
}
