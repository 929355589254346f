//! Team-scoped access control.
//!
//! Scope strings from the gateway parse once into a [`Capability`] set; every
//! decision goes through [`Policy::evaluate`]. The named helpers
//! (`has_permission`, `can_access_team`, `resolve_team`, `can_access_version`)
//! are thin wrappers over it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::{RegistryError, Result};
use crate::model::{ModelVersion, Visibility};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability { Read, Write, Deploy, Admin }

impl Capability {
    pub fn scope(&self) -> &'static str {
        match self {
            Capability::Read => "models:read",
            Capability::Write => "models:write",
            Capability::Deploy => "models:deploy",
            Capability::Admin => "admin",
        }
    }

    /// Exact string match only; unknown scopes are ignored.
    pub fn from_scope(scope: &str) -> Option<Self> {
        match scope {
            "models:read" => Some(Capability::Read),
            "models:write" => Some(Capability::Write),
            "models:deploy" => Some(Capability::Deploy),
            "admin" => Some(Capability::Admin),
            _ => None,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.scope()) }
}

/// Caller identity derived from an authenticated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessContext {
    pub team: String,
    capabilities: BTreeSet<Capability>,
}

impl AccessContext {
    pub fn new<I, S>(team: impl Into<String>, scopes: I) -> Self
    where I: IntoIterator<Item = S>, S: AsRef<str> {
        let capabilities = scopes.into_iter().filter_map(|s| Capability::from_scope(s.as_ref())).collect();
        Self { team: team.into(), capabilities }
    }

    pub fn is_admin(&self) -> bool { self.capabilities.contains(&Capability::Admin) }
}

/// What an operation wants to do with a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action { Read, Write, Deploy }

impl Action {
    fn capability(self) -> Capability {
        match self { Action::Read => Capability::Read, Action::Write => Capability::Write, Action::Deploy => Capability::Deploy }
    }
}

/// The resource a decision is about.
#[derive(Debug, Clone, Copy)]
pub enum Resource<'a> {
    /// Anything under a team, e.g. a team-scoped listing or a history entry.
    Team(&'a str),
    /// A concrete model version with its visibility flag.
    Version { team: &'a str, visibility: Visibility },
}

impl<'a> From<&'a ModelVersion> for Resource<'a> {
    fn from(v: &'a ModelVersion) -> Self { Resource::Version { team: &v.team, visibility: v.visibility } }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision { Allow, Deny(String) }

impl Decision {
    pub fn is_allowed(&self) -> bool { matches!(self, Decision::Allow) }
    pub fn into_result(self) -> Result<()> {
        match self { Decision::Allow => Ok(()), Decision::Deny(why) => Err(RegistryError::Unauthorized(why)) }
    }
}

pub struct Policy;

impl Policy {
    /// Single decision point: capability check first, then team scoping.
    /// Shared versions are readable by any caller holding read.
    pub fn evaluate(ctx: &AccessContext, resource: Resource<'_>, action: Action) -> Decision {
        if ctx.is_admin() { return Decision::Allow; }
        let needed = action.capability();
        if !ctx.capabilities.contains(&needed) {
            return Decision::Deny(format!("missing scope {needed}"));
        }
        let (team, visibility) = match resource {
            Resource::Team(team) => (team, Visibility::Team),
            Resource::Version { team, visibility } => (team, visibility),
        };
        if ctx.team == team { return Decision::Allow; }
        if action == Action::Read && visibility == Visibility::Shared { return Decision::Allow; }
        Decision::Deny(format!("team {} cannot access resources of team {team}", ctx.team))
    }
}

pub fn has_permission(ctx: &AccessContext, required: Capability) -> bool {
    ctx.is_admin() || ctx.capabilities.contains(&required)
}

pub fn require_permission(ctx: &AccessContext, required: Capability) -> Result<()> {
    if has_permission(ctx, required) { Ok(()) } else { Err(RegistryError::Unauthorized(format!("missing scope {required}"))) }
}

pub fn can_access_team(ctx: &AccessContext, target_team: &str) -> bool {
    ctx.is_admin() || ctx.team == target_team
}

/// Team a request acts on: the requested one if allowed, else the caller's own.
pub fn resolve_team(ctx: &AccessContext, requested: Option<&str>) -> Result<String> {
    match requested {
        None => Ok(ctx.team.clone()),
        Some(team) if can_access_team(ctx, team) => Ok(team.to_string()),
        Some(team) => Err(RegistryError::Unauthorized(format!("team {} cannot act for team {team}", ctx.team))),
    }
}

pub fn can_access_version(ctx: &AccessContext, version: &ModelVersion, action: Action) -> bool {
    Policy::evaluate(ctx, version.into(), action).is_allowed()
}

/// Throwing form used by direct lookups. A caller that cannot even read the
/// version gets NotFound; one that can read it but not act on it gets
/// Unauthorized.
pub fn authorize_version(ctx: &AccessContext, version: &ModelVersion, action: Action) -> Result<()> {
    match Policy::evaluate(ctx, version.into(), action) {
        Decision::Allow => Ok(()),
        Decision::Deny(why) if action != Action::Read && can_access_version(ctx, version, Action::Read) => Err(RegistryError::Unauthorized(why)),
        Decision::Deny(_) => Err(RegistryError::NotFound(format!("model version {}", version.label()))),
    }
}
