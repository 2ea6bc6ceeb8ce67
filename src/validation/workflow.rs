//! Static checks over a declared agent routing graph.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Standard,
    ErrorHandler,
    ResponsibleAi,
    Finalizer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowIssueKind {
    NoEntryPoint,
    OrphanedAgent,
    CircularDependency,
    MissingAgent,
    InvalidRouting,
    UnreachableAgent,
}

/// One finding from [`WorkflowValidator::validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowIssue {
    pub kind: WorkflowIssueKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl WorkflowIssue {
    fn new(kind: WorkflowIssueKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            agent: None,
            details: Value::Null,
        }
    }

    fn agent(mut self, agent: &str) -> Self {
        self.agent = Some(agent.to_string());
        self
    }

    fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

impl fmt::Display for WorkflowIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.agent {
            Some(agent) => write!(f, "workflow validation error for agent '{}': {}", agent, self.message),
            None => write!(f, "workflow validation error: {}", self.message),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowValidationResult {
    pub is_valid: bool,
    pub errors: Vec<WorkflowIssue>,
    pub warnings: Vec<WorkflowIssue>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("source agent '{0}' not found")]
    SourceNotFound(String),
    #[error("destination agent '{0}' not found")]
    DestinationNotFound(String),
    #[error("agent '{0}' not found")]
    AgentNotFound(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentNode {
    pub name: String,
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    pub dependencies: Vec<String>,
    pub routes: Vec<String>,
    pub is_entry_point: bool,
    pub is_endpoint: bool,
}

/// Builder-style graph of agents and the routes between them.
#[derive(Debug, Clone, Default)]
pub struct WorkflowValidator {
    agents: BTreeMap<String, AgentNode>,
    entry_points: Vec<String>,
    endpoints: Vec<String>,
    strict: bool,
}

impl WorkflowValidator {
    /// In strict mode error handlers with outgoing routes are errors.
    pub fn new(strict: bool) -> Self {
        Self {
            strict,
            ..Self::default()
        }
    }

    pub fn add_agent(&mut self, name: &str, agent_type: AgentType) -> &mut AgentNode {
        self.agents.entry(name.to_string()).or_insert_with(|| AgentNode {
            name: name.to_string(),
            agent_type,
            dependencies: Vec::new(),
            routes: Vec::new(),
            is_entry_point: false,
            is_endpoint: false,
        })
    }

    /// Declare an agent together with routes that are not checked until
    /// [`validate`](Self::validate), e.g. when loading a graph from config.
    pub fn add_agent_with_routes(&mut self, name: &str, agent_type: AgentType, routes: &[&str]) {
        let node = self.add_agent(name, agent_type);
        for route in routes {
            if !node.routes.iter().any(|r| r == route) {
                node.routes.push(route.to_string());
            }
        }
        self.link_dependencies();
    }

    pub fn add_route(&mut self, from: &str, to: &str) -> Result<(), WorkflowError> {
        if !self.agents.contains_key(from) {
            return Err(WorkflowError::SourceNotFound(from.to_string()));
        }
        let target = self
            .agents
            .get_mut(to)
            .ok_or_else(|| WorkflowError::DestinationNotFound(to.to_string()))?;
        if !target.dependencies.iter().any(|d| d == from) {
            target.dependencies.push(from.to_string());
        }
        if let Some(source) = self.agents.get_mut(from) {
            if !source.routes.iter().any(|r| r == to) {
                source.routes.push(to.to_string());
            }
        }
        Ok(())
    }

    pub fn set_entry_point(&mut self, name: &str) -> Result<(), WorkflowError> {
        let node = self
            .agents
            .get_mut(name)
            .ok_or_else(|| WorkflowError::AgentNotFound(name.to_string()))?;
        node.is_entry_point = true;
        if !self.entry_points.iter().any(|e| e == name) {
            self.entry_points.push(name.to_string());
        }
        Ok(())
    }

    pub fn set_endpoint(&mut self, name: &str) -> Result<(), WorkflowError> {
        let node = self
            .agents
            .get_mut(name)
            .ok_or_else(|| WorkflowError::AgentNotFound(name.to_string()))?;
        node.is_endpoint = true;
        if !self.endpoints.iter().any(|e| e == name) {
            self.endpoints.push(name.to_string());
        }
        Ok(())
    }

    pub fn agent(&self, name: &str) -> Option<&AgentNode> {
        self.agents.get(name)
    }

    fn link_dependencies(&mut self) {
        let edges: Vec<(String, String)> = self
            .agents
            .values()
            .flat_map(|n| n.routes.iter().map(move |r| (n.name.clone(), r.clone())))
            .collect();
        for (from, to) in edges {
            if let Some(target) = self.agents.get_mut(&to) {
                if !target.dependencies.contains(&from) {
                    target.dependencies.push(from);
                }
            }
        }
    }

    pub fn validate(&self) -> WorkflowValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if self.entry_points.is_empty() {
            errors.push(WorkflowIssue::new(
                WorkflowIssueKind::NoEntryPoint,
                "workflow has no entry points defined",
            ));
        }
        warnings.extend(self.orphaned_agents());
        errors.extend(self.circular_dependencies());
        errors.extend(self.missing_agents());
        errors.extend(self.invalid_routing());
        warnings.extend(self.unreachable_agents());

        WorkflowValidationResult {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    fn orphaned_agents(&self) -> Vec<WorkflowIssue> {
        self.agents
            .values()
            .filter(|n| {
                let incoming = !n.dependencies.is_empty() || n.is_entry_point;
                let outgoing = !n.routes.is_empty() || n.is_endpoint;
                !incoming && !outgoing
            })
            .map(|n| {
                WorkflowIssue::new(
                    WorkflowIssueKind::OrphanedAgent,
                    "agent has no incoming or outgoing connections",
                )
                .agent(&n.name)
            })
            .collect()
    }

    fn circular_dependencies(&self) -> Vec<WorkflowIssue> {
        let mut visited = HashSet::new();
        let mut issues = Vec::new();
        for name in self.agents.keys() {
            if visited.contains(name.as_str()) {
                continue;
            }
            let mut on_stack = Vec::new();
            if let Some(cycle) = self.find_cycle(name, &mut visited, &mut on_stack) {
                issues.push(
                    WorkflowIssue::new(
                        WorkflowIssueKind::CircularDependency,
                        format!("circular dependency detected in path: {}", cycle.join(" -> ")),
                    )
                    .details(json!({ "cycle_path": cycle })),
                );
            }
        }
        issues
    }

    fn find_cycle<'a>(
        &'a self,
        name: &'a str,
        visited: &mut HashSet<&'a str>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        visited.insert(name);
        stack.push(name);
        if let Some(node) = self.agents.get(name) {
            for route in &node.routes {
                if let Some(start) = stack.iter().position(|s| *s == route.as_str()) {
                    let mut cycle: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
                    cycle.push(route.clone());
                    return Some(cycle);
                }
                if !visited.contains(route.as_str()) && self.agents.contains_key(route) {
                    if let Some(cycle) = self.find_cycle(route, visited, stack) {
                        return Some(cycle);
                    }
                }
            }
        }
        stack.pop();
        None
    }

    fn missing_agents(&self) -> Vec<WorkflowIssue> {
        self.agents
            .values()
            .flat_map(|n| {
                n.routes
                    .iter()
                    .filter(|r| !self.agents.contains_key(r.as_str()))
                    .map(move |r| {
                        WorkflowIssue::new(
                            WorkflowIssueKind::MissingAgent,
                            format!("routes to non-existent agent '{}'", r),
                        )
                        .agent(&n.name)
                        .details(json!({ "missing_agent": r }))
                    })
            })
            .collect()
    }

    fn invalid_routing(&self) -> Vec<WorkflowIssue> {
        let mut issues = Vec::new();
        for node in self.agents.values().filter(|n| !n.routes.is_empty()) {
            match node.agent_type {
                AgentType::Finalizer => issues.push(
                    WorkflowIssue::new(
                        WorkflowIssueKind::InvalidRouting,
                        "finalizer agent should not have outgoing routes",
                    )
                    .agent(&node.name)
                    .details(json!({ "routes": node.routes })),
                ),
                AgentType::ErrorHandler if self.strict => issues.push(
                    WorkflowIssue::new(
                        WorkflowIssueKind::InvalidRouting,
                        "error handler should be an endpoint in strict mode",
                    )
                    .agent(&node.name)
                    .details(json!({ "routes": node.routes })),
                ),
                _ => {}
            }
        }
        issues
    }

    fn unreachable_agents(&self) -> Vec<WorkflowIssue> {
        if self.entry_points.is_empty() {
            return Vec::new();
        }
        let mut reachable: HashSet<&str> = self.entry_points.iter().map(String::as_str).collect();
        let mut queue: VecDeque<&str> = self.entry_points.iter().map(String::as_str).collect();
        while let Some(current) = queue.pop_front() {
            let Some(node) = self.agents.get(current) else {
                continue;
            };
            for route in &node.routes {
                if reachable.insert(route.as_str()) {
                    queue.push_back(route.as_str());
                }
            }
        }
        self.agents
            .keys()
            .filter(|name| !reachable.contains(name.as_str()))
            .map(|name| {
                WorkflowIssue::new(
                    WorkflowIssueKind::UnreachableAgent,
                    "agent is unreachable from entry points",
                )
                .agent(name)
                .details(json!({ "entry_points": self.entry_points }))
            })
            .collect()
    }

    /// Agent counts and names grouped by type.
    pub fn summary(&self) -> Value {
        let mut by_type: BTreeMap<AgentType, Vec<&str>> = BTreeMap::new();
        for node in self.agents.values() {
            by_type.entry(node.agent_type).or_default().push(&node.name);
        }
        let by_type: serde_json::Map<String, Value> = by_type
            .into_iter()
            .map(|(t, names)| {
                let key = serde_json::to_value(t)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                (key, json!(names))
            })
            .collect();
        json!({
            "total_agents": self.agents.len(),
            "entry_points": self.entry_points,
            "endpoints": self.endpoints,
            "strict_mode": self.strict,
            "agents_by_type": by_type,
        })
    }

    /// Nodes and edges, for visualisation.
    pub fn graph(&self) -> Value {
        let nodes: Vec<Value> = self
            .agents
            .values()
            .map(|n| {
                json!({
                    "id": n.name,
                    "type": n.agent_type,
                    "is_entry_point": n.is_entry_point,
                    "is_endpoint": n.is_endpoint,
                })
            })
            .collect();
        let edges: Vec<Value> = self
            .agents
            .values()
            .flat_map(|n| n.routes.iter().map(move |r| json!({ "source": n.name, "target": r })))
            .collect();
        json!({ "nodes": nodes, "edges": edges })
    }
}
