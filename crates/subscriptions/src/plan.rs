//! Plans: price, cadence and the features they grant

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::feature::Feature;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanState {
    Active,
    /// Subscribable but hidden from public listings
    ActiveInvisible,
    Inactive,
}

impl PlanState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanState::Active => "active",
            PlanState::ActiveInvisible => "active_invisible",
            PlanState::Inactive => "inactive",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(PlanState::Active),
            "active_invisible" => Some(PlanState::ActiveInvisible),
            "inactive" => Some(PlanState::Inactive),
            _ => None,
        }
    }

    pub fn is_subscribable(&self) -> bool {
        matches!(self, PlanState::Active | PlanState::ActiveInvisible)
    }
}

/// Cadence used to compute the expiration of a new subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanType {
    Duration,
    Monthly,
    Yearly,
}

impl PlanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanType::Duration => "duration",
            PlanType::Monthly => "monthly",
            PlanType::Yearly => "yearly",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "duration" => Some(PlanType::Duration),
            "monthly" => Some(PlanType::Monthly),
            "yearly" => Some(PlanType::Yearly),
            _ => None,
        }
    }
}

/// Which plans a listing returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanListing {
    /// Active and active-invisible
    Active,
    /// Active only
    Visible,
    /// Inactive only
    Disabled,
}

impl PlanListing {
    pub fn includes(&self, state: PlanState) -> bool {
        match self {
            PlanListing::Active => state.is_subscribable(),
            PlanListing::Visible => state == PlanState::Active,
            PlanListing::Disabled => state == PlanState::Inactive,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub position: u32,
    pub state: PlanState,
    pub name: String,
    pub description: Option<String>,
    /// Minor currency units
    pub price: i64,
    pub currency: String,
    pub plan_type: PlanType,
    pub duration_days: Option<u32>,
    pub features: Vec<Feature>,
}

impl Plan {
    pub fn new(name: impl Into<String>, plan_type: PlanType, price: i64, currency: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            position: 0,
            state: PlanState::Active,
            name: name.into(),
            description: None,
            price,
            currency: currency.into(),
            plan_type,
            duration_days: None,
            features: Vec::new(),
        }
    }

    pub fn with_duration_days(mut self, days: u32) -> Self {
        self.duration_days = Some(days);
        self
    }

    pub fn with_state(mut self, state: PlanState) -> Self {
        self.state = state;
        self
    }

    pub fn with_position(mut self, position: u32) -> Self {
        self.position = position;
        self
    }

    /// Attach a feature, re-parenting it to this plan and keeping position order
    pub fn with_feature(mut self, mut feature: Feature) -> Self {
        feature.plan_id = self.id;
        self.features.push(feature);
        self.features.sort_by_key(|f| f.position);
        self
    }

    pub fn is_free(&self) -> bool {
        self.price == 0
    }

    pub fn feature(&self, code: &str) -> Option<&Feature> {
        self.features.iter().find(|f| f.code == code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listing_filters_by_state() {
        assert!(PlanListing::Active.includes(PlanState::ActiveInvisible));
        assert!(!PlanListing::Visible.includes(PlanState::ActiveInvisible));
        assert!(PlanListing::Disabled.includes(PlanState::Inactive));
        assert!(!PlanListing::Active.includes(PlanState::Inactive));
    }

    #[test]
    fn test_features_are_reparented_and_ordered() {
        let plan = Plan::new("Pro", PlanType::Monthly, 1500, "EUR")
            .with_feature(Feature::limit(Uuid::nil(), "posts", 10).with_position(2))
            .with_feature(Feature::authorization(Uuid::nil(), "sso").with_position(1));

        assert!(plan.features.iter().all(|f| f.plan_id == plan.id));
        assert_eq!(plan.features[0].code, "sso");
        assert_eq!(plan.feature("posts").map(|f| f.limit), Some(10));
        assert!(plan.feature("missing").is_none());
    }

    #[test]
    fn test_state_text_round_trip() {
        for state in [PlanState::Active, PlanState::ActiveInvisible, PlanState::Inactive] {
            assert_eq!(PlanState::parse(state.as_str()), Some(state));
        }
        assert_eq!(PlanType::parse("weekly"), None);
    }
}
