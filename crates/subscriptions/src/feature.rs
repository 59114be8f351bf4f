//! Plan features and their limits

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Whether a feature is a plain authorization or a metered limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureKind {
    /// On/off capability, cannot be consumed
    Feature,
    /// Metered with a numeric limit (0 = unlimited)
    Limit,
}

impl FeatureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureKind::Feature => "feature",
            FeatureKind::Limit => "limit",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "feature" => Some(FeatureKind::Feature),
            "limit" => Some(FeatureKind::Limit),
            _ => None,
        }
    }
}

/// Owner relation whose size is capped by a limit feature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestrictedRelation {
    /// Owner type the limit applies to
    pub model: String,
    /// Relation name on that owner type
    pub relation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub code: String,
    pub kind: FeatureKind,
    pub limit: u64,
    pub position: u32,
    pub name: String,
    pub description: Option<String>,
    pub restricted: Option<RestrictedRelation>,
}

impl Feature {
    pub fn authorization(plan_id: Uuid, code: impl Into<String>) -> Self {
        let code = code.into();
        Self {
            id: Uuid::new_v4(),
            plan_id,
            name: code.clone(),
            code,
            kind: FeatureKind::Feature,
            limit: 0,
            position: 0,
            description: None,
            restricted: None,
        }
    }

    pub fn limit(plan_id: Uuid, code: impl Into<String>, limit: u64) -> Self {
        Self {
            kind: FeatureKind::Limit,
            limit,
            ..Self::authorization(plan_id, code)
        }
    }

    pub fn with_position(mut self, position: u32) -> Self {
        self.position = position;
        self
    }

    pub fn restricted_to(mut self, model: impl Into<String>, relation: impl Into<String>) -> Self {
        self.restricted = Some(RestrictedRelation {
            model: model.into(),
            relation: relation.into(),
        });
        self
    }

    pub fn is_limit(&self) -> bool {
        self.kind == FeatureKind::Limit
    }

    pub fn is_unlimited(&self) -> bool {
        self.is_limit() && self.limit == 0
    }

    /// Remaining allowance given the amount already used
    pub fn remaining_after(&self, used: i64) -> Remaining {
        if self.limit == 0 {
            Remaining::Unlimited
        } else {
            Remaining::Limited(self.limit_as_i64() - used)
        }
    }

    /// Ceiling for an atomic increment, `None` when unlimited
    pub fn ceiling(&self) -> Option<i64> {
        (self.limit > 0).then(|| self.limit_as_i64())
    }

    fn limit_as_i64(&self) -> i64 {
        i64::try_from(self.limit).unwrap_or(i64::MAX)
    }

    pub fn restricts(&self, model: &str, relation: &str) -> bool {
        self.is_limit()
            && self
                .restricted
                .as_ref()
                .is_some_and(|r| r.model == model && r.relation == relation)
    }
}

/// How much of a limit is left. May be negative after a plan downgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Remaining {
    Unlimited,
    Limited(i64),
}

impl Remaining {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Remaining::Unlimited)
    }

    /// Inclusive: consuming exactly the remaining amount is allowed.
    pub fn allows(&self, amount: u64) -> bool {
        match self {
            Remaining::Unlimited => true,
            Remaining::Limited(left) => i128::from(amount) <= i128::from(*left),
        }
    }

    pub fn as_limited(&self) -> Option<i64> {
        match self {
            Remaining::Unlimited => None,
            Remaining::Limited(left) => Some(*left),
        }
    }
}
