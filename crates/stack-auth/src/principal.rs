//! Principals and their tenant scope
//!
//! A principal is a user (or machine actor) inside one project. Tokens for a
//! principal carry an issuer and audience derived from the project id and the
//! principal's user type, so a verifier scoped to a project can reject tokens
//! minted for any other project or user population.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Population a user belongs to. Restricted and anonymous users get their
/// own issuer and audience so they can't be mistaken for full users.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    #[default]
    Normal,
    Restricted,
    Anonymous,
}

impl UserType {
    fn audience_suffix(self) -> &'static str {
        match self {
            UserType::Normal => "",
            UserType::Restricted => ":restricted",
            UserType::Anonymous => ":anon",
        }
    }

    fn issuer_segment(self) -> &'static str {
        match self {
            UserType::Normal => "projects",
            UserType::Restricted => "projects-restricted-users",
            UserType::Anonymous => "projects-anonymous-users",
        }
    }
}

/// An authenticated actor within a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
    pub project_id: String,
    #[serde(default)]
    pub roles: BTreeSet<String>,
    #[serde(default)]
    pub user_type: UserType,
}

impl Principal {
    pub fn new(user_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            project_id: project_id.into(),
            roles: BTreeSet::new(),
            user_type: UserType::Normal,
        }
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_user_type(mut self, user_type: UserType) -> Self {
        self.user_type = user_type;
        self
    }

    /// Check the principal has a resolvable tenant scope.
    pub fn validate(&self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(Error::InvalidPrincipal("user_id is empty".into()));
        }
        if self.project_id.trim().is_empty() {
            return Err(Error::InvalidPrincipal("project_id is empty".into()));
        }
        if self.project_id.contains(':') {
            return Err(Error::InvalidPrincipal(format!(
                "project_id must not contain ':', got {}",
                self.project_id
            )));
        }
        Ok(())
    }

    pub fn audience(&self) -> String {
        audience_for(&self.project_id, self.user_type)
    }

    pub fn issuer(&self, api_url: &str) -> String {
        issuer_for(api_url, &self.project_id, self.user_type)
    }
}

/// Issuer URL for tokens of a project's user population.
pub fn issuer_for(api_url: &str, project_id: &str, user_type: UserType) -> String {
    format!(
        "{}/api/v1/{}/{}",
        api_url.trim_end_matches('/'),
        user_type.issuer_segment(),
        project_id
    )
}

/// Audience claim for a project's user population.
pub fn audience_for(project_id: &str, user_type: UserType) -> String {
    format!("{project_id}{}", user_type.audience_suffix())
}

/// Split an audience claim back into project id and user type.
pub fn parse_audience(aud: &str) -> (String, UserType) {
    if let Some(project) = aud.strip_suffix(":anon") {
        (project.to_owned(), UserType::Anonymous)
    } else if let Some(project) = aud.strip_suffix(":restricted") {
        (project.to_owned(), UserType::Restricted)
    } else {
        (aud.to_owned(), UserType::Normal)
    }
}

/// Which tokens a verifier accepts: one project, and optionally its
/// restricted and anonymous populations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantScope {
    pub project_id: String,
    pub allow_restricted: bool,
    pub allow_anonymous: bool,
}

impl TenantScope {
    /// Accept only normal users of `project_id`.
    pub fn project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            allow_restricted: false,
            allow_anonymous: false,
        }
    }

    pub fn allow_restricted(mut self) -> Self {
        self.allow_restricted = true;
        self
    }

    /// Anonymous users are a subset of restricted users, so allowing them
    /// also allows restricted users.
    pub fn allow_anonymous(mut self) -> Self {
        self.allow_restricted = true;
        self.allow_anonymous = true;
        self
    }

    pub fn accepts(&self, user_type: UserType) -> bool {
        match user_type {
            UserType::Normal => true,
            UserType::Restricted => self.allow_restricted,
            UserType::Anonymous => self.allow_anonymous,
        }
    }
}
