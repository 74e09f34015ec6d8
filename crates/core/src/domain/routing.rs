use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::domain::business::BusinessId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RouteId(pub String);

impl std::fmt::Display for RouteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleId(pub String);

/// The conversational agent instance a route hands calls to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub agent_id: String,
    pub display_name: String,
    pub greeting: Option<String>,
    pub voice: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub id: RouteId,
    pub name: String,
    /// `None` matches every business.
    pub business_id: Option<BusinessId>,
    /// `*`, an exact number or name, or a regular expression.
    pub pattern: String,
    pub priority: i32,
    pub agent: AgentProfile,
    pub active: bool,
    pub is_default: bool,
    pub call_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Route {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        pattern: impl Into<String>,
        agent: AgentProfile,
    ) -> Self {
        Self {
            id: RouteId(id.into()),
            name: name.into(),
            business_id: None,
            pattern: pattern.into(),
            priority: 0,
            agent,
            active: true,
            is_default: false,
            call_count: 0,
            last_used_at: None,
        }
    }

    pub fn scoped_to(mut self, business_id: BusinessId) -> Self {
        self.business_id = Some(business_id);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }

    pub fn serves(&self, business_id: Option<&BusinessId>) -> bool {
        match (&self.business_id, business_id) {
            (None, _) => true,
            (Some(scope), Some(business_id)) => scope == business_id,
            (Some(_), None) => false,
        }
    }
}

/// Partial update applied by `update_route`; unset fields are left alone.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteUpdate {
    pub name: Option<String>,
    pub pattern: Option<String>,
    pub priority: Option<i32>,
    pub agent: Option<AgentProfile>,
    pub active: Option<bool>,
}

/// Inclusive start, exclusive end. `start > end` wraps past midnight.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConditions {
    pub time_window: Option<TimeWindow>,
    pub days_of_week: Option<Vec<Weekday>>,
    pub caller_pattern: Option<String>,
    pub business_id: Option<BusinessId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleAction {
    RouteToAgent { route_id: RouteId },
    RouteToHuman { destination: String },
    PlayMessage { message: String },
    TakeVoicemail { mailbox: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: RuleId,
    pub name: String,
    pub priority: i32,
    pub conditions: RuleConditions,
    pub action: RuleAction,
    pub active: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouteStats {
    pub route_id: RouteId,
    pub name: String,
    pub call_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub share_of_calls: f64,
}

#[cfg(test)]
mod tests {
    use chrono::NaiveTime;

    use super::TimeWindow;

    fn at(hour: u32, minute: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(hour, minute, 0).unwrap()
    }

    #[test]
    fn business_hours_window_is_half_open() {
        let window = TimeWindow { start: at(9, 0), end: at(17, 0) };
        assert!(window.contains(at(9, 0)));
        assert!(window.contains(at(16, 59)));
        assert!(!window.contains(at(17, 0)));
        assert!(!window.contains(at(8, 59)));
    }

    #[test]
    fn overnight_window_wraps_midnight() {
        let window = TimeWindow { start: at(22, 0), end: at(6, 0) };
        assert!(window.contains(at(23, 30)));
        assert!(window.contains(at(2, 15)));
        assert!(!window.contains(at(12, 0)));
    }
}
