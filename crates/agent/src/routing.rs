use chrono::{DateTime, Datelike, FixedOffset, Utc};
use frontdesk_core::domain::business::BusinessId;
use frontdesk_core::domain::call::IncomingCall;
use frontdesk_core::domain::routing::{
    Route, RouteId, RouteStats, RouteUpdate, RoutingRule, RuleAction, RuleConditions, RuleId,
};
use frontdesk_core::errors::ApplicationError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Where an inbound call goes. Only `RouteToAgent` decisions carry a route and
/// open a session; the other actions are terminal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub action: RuleAction,
    pub route: Option<Route>,
    pub matched_rule: Option<RuleId>,
    pub used_fallback: bool,
}

impl RouteDecision {
    pub fn opens_session(&self) -> bool {
        matches!(self.action, RuleAction::RouteToAgent { .. }) && self.route.is_some()
    }
}

#[derive(Debug)]
enum PatternMatcher {
    Any,
    Exact(String),
    Regex(Regex),
}

impl PatternMatcher {
    fn compile(pattern: &str) -> Result<Self, ApplicationError> {
        let pattern = pattern.trim();
        if pattern.is_empty() || pattern == "*" {
            return Ok(Self::Any);
        }
        let is_literal = pattern
            .chars()
            .all(|character| character.is_alphanumeric() || matches!(character, '+' | ' ' | '-' | '(' | ')' | '\'' | '.'));
        if is_literal {
            return Ok(Self::Exact(normalize_target(pattern)));
        }
        Regex::new(pattern)
            .map(Self::Regex)
            .map_err(|error| ApplicationError::InvalidInput(format!("invalid pattern `{pattern}`: {error}")))
    }

    fn is_wildcard(&self) -> bool {
        matches!(self, Self::Any)
    }

    fn matches(&self, candidate: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(expected) => normalize_target(candidate) == *expected,
            Self::Regex(regex) => regex.is_match(candidate),
        }
    }

    fn matches_call(&self, call: &IncomingCall) -> bool {
        self.matches(&call.to_number)
            || self.matches(&call.from_number)
            || call.caller_name.as_deref().is_some_and(|name| self.matches(name))
    }
}

/// Phone numbers compare by digits with the US country code dropped; names
/// compare case-insensitively.
fn normalize_target(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    let has_letters = raw.chars().any(char::is_alphabetic);
    if has_letters || digits.len() < 7 {
        return raw.trim().to_lowercase();
    }
    match digits.strip_prefix('1') {
        Some(rest) if digits.len() == 11 => rest.to_string(),
        _ => digits,
    }
}

#[derive(Debug)]
struct CompiledRoute {
    route: Route,
    matcher: PatternMatcher,
}

#[derive(Debug)]
struct CompiledRule {
    rule: RoutingRule,
    caller: Option<Regex>,
}

impl CompiledRule {
    fn compile(rule: RoutingRule) -> Result<Self, ApplicationError> {
        let caller = match &rule.conditions.caller_pattern {
            Some(pattern) => Some(Regex::new(pattern).map_err(|error| {
                ApplicationError::InvalidInput(format!(
                    "rule {} has invalid caller pattern `{pattern}`: {error}",
                    rule.id.0
                ))
            })?),
            None => None,
        };
        Ok(Self { rule, caller })
    }

    fn holds(&self, call: &IncomingCall, local: DateTime<FixedOffset>) -> bool {
        let RuleConditions { time_window, days_of_week, caller_pattern: _, business_id } = &self.rule.conditions;

        if let Some(window) = time_window {
            if !window.contains(local.time()) {
                return false;
            }
        }
        if let Some(days) = days_of_week {
            if !days.contains(&local.weekday()) {
                return false;
            }
        }
        if let Some(caller) = &self.caller {
            if !caller.is_match(&call.from_number) {
                return false;
            }
        }
        if let Some(business_id) = business_id {
            if call.business_id.as_ref() != Some(business_id) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Default)]
struct RoutingTable {
    routes: Vec<CompiledRoute>,
    /// Kept sorted by descending priority; ties keep insertion order.
    rules: Vec<CompiledRule>,
    default_route: Option<RouteId>,
}

impl RoutingTable {
    fn route_index(&self, route_id: &RouteId) -> Result<usize, ApplicationError> {
        self.routes
            .iter()
            .position(|compiled| &compiled.route.id == route_id)
            .ok_or_else(|| ApplicationError::not_found("route", route_id.0.clone()))
    }

    fn select(&self, call: &IncomingCall, local: DateTime<FixedOffset>) -> Result<(usize, RouteDecision), Selection> {
        for compiled in self.rules.iter().filter(|compiled| compiled.rule.active) {
            if !compiled.holds(call, local) {
                continue;
            }
            let matched_rule = Some(compiled.rule.id.clone());
            return match &compiled.rule.action {
                RuleAction::RouteToAgent { route_id } => {
                    let index = self.route_index(route_id).map_err(Selection::Failed)?;
                    if !self.routes[index].route.active {
                        return Err(Selection::Failed(ApplicationError::InvalidInput(format!(
                            "rule {} targets inactive route {}",
                            compiled.rule.id.0, route_id.0
                        ))));
                    }
                    Ok((index, self.agent_decision(index, matched_rule, false)))
                }
                terminal => Err(Selection::Terminal(RouteDecision {
                    action: terminal.clone(),
                    route: None,
                    matched_rule,
                    used_fallback: false,
                })),
            };
        }

        let candidates = || {
            self.routes
                .iter()
                .enumerate()
                .filter(|(_, compiled)| {
                    compiled.route.active
                        && (call.business_id.is_none() || compiled.route.serves(call.business_id.as_ref()))
                })
        };
        let best = |filtered: Vec<(usize, &CompiledRoute)>| {
            filtered
                .into_iter()
                .reduce(|best, next| if next.1.route.priority > best.1.route.priority { next } else { best })
                .map(|(index, _)| index)
        };

        let specific = best(
            candidates()
                .filter(|(_, compiled)| !compiled.matcher.is_wildcard() && compiled.matcher.matches_call(call))
                .collect(),
        );
        let chosen = specific
            .or_else(|| best(candidates().collect()))
            .or_else(|| self.default_index(call.business_id.as_ref()));

        match chosen {
            Some(index) => Ok((index, self.agent_decision(index, None, false))),
            None => Err(Selection::Failed(ApplicationError::not_found(
                "route",
                format!("no route for call to {}", call.to_number),
            ))),
        }
    }

    /// The default route, unless it is inactive or scoped to another business.
    fn default_index(&self, business_id: Option<&BusinessId>) -> Option<usize> {
        let default_id = self.default_route.as_ref()?;
        self.routes.iter().position(|compiled| {
            &compiled.route.id == default_id
                && compiled.route.active
                && (business_id.is_none() || compiled.route.serves(business_id))
        })
    }

    fn agent_decision(&self, index: usize, matched_rule: Option<RuleId>, used_fallback: bool) -> RouteDecision {
        let route = &self.routes[index].route;
        RouteDecision {
            action: RuleAction::RouteToAgent { route_id: route.id.clone() },
            route: Some(route.clone()),
            matched_rule,
            used_fallback,
        }
    }

    fn record_use(&mut self, index: usize, now: DateTime<Utc>) -> Route {
        let route = &mut self.routes[index].route;
        route.call_count += 1;
        route.last_used_at = Some(now);
        route.clone()
    }
}

enum Selection {
    Terminal(RouteDecision),
    Failed(ApplicationError),
}

/// Routing table shared by every inbound call. Rule conditions are evaluated
/// in the router's fixed UTC offset.
pub struct CallRouter {
    utc_offset: FixedOffset,
    table: Mutex<RoutingTable>,
}

impl CallRouter {
    pub fn new(utc_offset_minutes: i32) -> Result<Self, ApplicationError> {
        let utc_offset = utc_offset_minutes.checked_mul(60).and_then(FixedOffset::east_opt).ok_or_else(|| {
            ApplicationError::InvalidInput(format!("utc offset {utc_offset_minutes} minutes is out of range"))
        })?;
        Ok(Self { utc_offset, table: Mutex::new(RoutingTable::default()) })
    }

    pub async fn route_call(&self, call: &IncomingCall) -> Result<RouteDecision, ApplicationError> {
        self.route_call_at(call, Utc::now()).await
    }

    pub async fn route_call_at(
        &self,
        call: &IncomingCall,
        now: DateTime<Utc>,
    ) -> Result<RouteDecision, ApplicationError> {
        let local = now.with_timezone(&self.utc_offset);
        let mut table = self.table.lock().await;

        let (index, mut decision) = match table.select(call, local) {
            Ok(selected) => selected,
            Err(Selection::Terminal(decision)) => {
                info!(
                    event_name = "routing.call.handled_by_rule",
                    from_number = %call.from_number,
                    to_number = %call.to_number,
                    rule_id = decision.matched_rule.as_ref().map(|id| id.0.as_str()).unwrap_or("none"),
                    action = ?decision.action,
                    "call handled without an agent session"
                );
                return Ok(decision);
            }
            Err(Selection::Failed(error)) => {
                let Some(index) = table.default_index(call.business_id.as_ref()) else {
                    warn!(
                        event_name = "routing.call.unroutable",
                        from_number = %call.from_number,
                        to_number = %call.to_number,
                        error = %error,
                        "no route and no default route"
                    );
                    return Err(error);
                };
                warn!(
                    event_name = "routing.call.fallback",
                    from_number = %call.from_number,
                    to_number = %call.to_number,
                    error = %error,
                    "routing failed; using default route"
                );
                (index, table.agent_decision(index, None, true))
            }
        };

        let route = table.record_use(index, now);
        info!(
            event_name = "routing.call.routed",
            route_id = %route.id,
            agent_id = %route.agent.agent_id,
            from_number = %call.from_number,
            to_number = %call.to_number,
            call_count = route.call_count,
            used_fallback = decision.used_fallback,
            "call routed"
        );
        decision.route = Some(route);
        Ok(decision)
    }

    pub async fn register_route(&self, route: Route) -> Result<Route, ApplicationError> {
        let matcher = PatternMatcher::compile(&route.pattern)?;
        let mut table = self.table.lock().await;
        if table.routes.iter().any(|compiled| compiled.route.id == route.id) {
            return Err(ApplicationError::InvalidInput(format!("route {} already exists", route.id)));
        }
        if route.is_default {
            set_default(&mut table, &route.id);
        }
        info!(event_name = "routing.route.registered", route_id = %route.id, pattern = %route.pattern, "route registered");
        table.routes.push(CompiledRoute { route: route.clone(), matcher });
        if route.is_default {
            table.default_route = Some(route.id.clone());
        }
        Ok(route)
    }

    pub async fn update_route(&self, route_id: &RouteId, update: RouteUpdate) -> Result<Route, ApplicationError> {
        let matcher = update.pattern.as_deref().map(PatternMatcher::compile).transpose()?;
        let mut table = self.table.lock().await;
        let index = table.route_index(route_id)?;
        let compiled = &mut table.routes[index];

        if let Some(matcher) = matcher {
            compiled.matcher = matcher;
        }
        let RouteUpdate { name, pattern, priority, agent, active } = update;
        if let Some(name) = name {
            compiled.route.name = name;
        }
        if let Some(pattern) = pattern {
            compiled.route.pattern = pattern;
        }
        if let Some(priority) = priority {
            compiled.route.priority = priority;
        }
        if let Some(agent) = agent {
            compiled.route.agent = agent;
        }
        if let Some(active) = active {
            compiled.route.active = active;
        }
        info!(event_name = "routing.route.updated", route_id = %route_id, "route updated");
        Ok(compiled.route.clone())
    }

    pub async fn deactivate_route(&self, route_id: &RouteId) -> Result<Route, ApplicationError> {
        self.update_route(route_id, RouteUpdate { active: Some(false), ..RouteUpdate::default() }).await
    }

    pub async fn set_default_route(&self, route_id: &RouteId) -> Result<(), ApplicationError> {
        let mut table = self.table.lock().await;
        table.route_index(route_id)?;
        set_default(&mut table, route_id);
        table.default_route = Some(route_id.clone());
        Ok(())
    }

    pub async fn add_rule(&self, rule: RoutingRule) -> Result<(), ApplicationError> {
        let compiled = CompiledRule::compile(rule)?;
        let mut table = self.table.lock().await;
        if table.rules.iter().any(|existing| existing.rule.id == compiled.rule.id) {
            return Err(ApplicationError::InvalidInput(format!("rule {} already exists", compiled.rule.id.0)));
        }
        info!(event_name = "routing.rule.added", rule_id = %compiled.rule.id.0, priority = compiled.rule.priority, "routing rule added");
        table.rules.push(compiled);
        table.rules.sort_by(|left, right| right.rule.priority.cmp(&left.rule.priority));
        Ok(())
    }

    pub async fn remove_rule(&self, rule_id: &RuleId) -> Result<RoutingRule, ApplicationError> {
        let mut table = self.table.lock().await;
        let index = table
            .rules
            .iter()
            .position(|compiled| &compiled.rule.id == rule_id)
            .ok_or_else(|| ApplicationError::not_found("rule", rule_id.0.clone()))?;
        let removed = table.rules.remove(index).rule;
        info!(event_name = "routing.rule.removed", rule_id = %rule_id.0, "routing rule removed");
        Ok(removed)
    }

    /// Routes serving `business_id`, or every route when `None`.
    pub async fn routes(&self, business_id: Option<&BusinessId>) -> Vec<Route> {
        let table = self.table.lock().await;
        table
            .routes
            .iter()
            .filter(|compiled| business_id.is_none() || compiled.route.serves(business_id))
            .map(|compiled| compiled.route.clone())
            .collect()
    }

    pub async fn route(&self, route_id: &RouteId) -> Result<Route, ApplicationError> {
        let table = self.table.lock().await;
        let index = table.route_index(route_id)?;
        Ok(table.routes[index].route.clone())
    }

    /// Rules in evaluation order.
    pub async fn rules(&self) -> Vec<RoutingRule> {
        self.table.lock().await.rules.iter().map(|compiled| compiled.rule.clone()).collect()
    }

    pub async fn route_stats(&self) -> Vec<RouteStats> {
        let table = self.table.lock().await;
        let total: u64 = table.routes.iter().map(|compiled| compiled.route.call_count).sum();
        table
            .routes
            .iter()
            .map(|compiled| RouteStats {
                route_id: compiled.route.id.clone(),
                name: compiled.route.name.clone(),
                call_count: compiled.route.call_count,
                last_used_at: compiled.route.last_used_at,
                share_of_calls: if total == 0 {
                    0.0
                } else {
                    compiled.route.call_count as f64 / total as f64
                },
            })
            .collect()
    }
}

fn set_default(table: &mut RoutingTable, route_id: &RouteId) {
    for compiled in &mut table.routes {
        compiled.route.is_default = &compiled.route.id == route_id;
    }
}
