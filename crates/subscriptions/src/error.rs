//! Subscription engine errors

use thiserror::Error;

/// Result alias used across the engine
pub type SubscriptionResult<T> = Result<T, SubscriptionError>;

/// Coarse error family, used by callers to branch without matching every variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Lifecycle validation or conflict (overlap, double cancel, renewal preconditions)
    Subscription,
    /// Plan lookup or plan configuration problem
    Plan,
    /// The feature code does not exist on the subscription's plan
    FeatureNotFound,
    /// The feature exists but cannot be metered, or is exhausted
    Feature,
    /// Bad argument to a pure computation (date processors)
    InvalidArgument,
    /// Backing store failure
    Storage,
    /// Host configuration problem
    Config,
}

#[derive(Debug, Error)]
pub enum SubscriptionError {
    // Lifecycle validation
    #[error("No active subscription found")]
    NoActiveSubscription,

    #[error("No subscriptions found")]
    NoSubscriptions,

    #[error("Active subscription found")]
    ActiveSubscriptionExists,

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(uuid::Uuid),

    #[error("Duration must be a positive number of days, got {0}")]
    InvalidDuration(u32),

    #[error("Subscription has not started yet")]
    NotStarted,

    // Lifecycle conflicts
    #[error("The owner has a conflicting active subscription")]
    ConflictingActiveSubscription,

    #[error("The owner has a conflicting upcoming subscription")]
    ConflictingUpcomingSubscription,

    #[error("Subscription is already cancelled")]
    AlreadyCancelled,

    #[error("A subscription in the testing phase can only be migrated immediately")]
    TestingMigrationMustBeImmediate,

    #[error("Renewing is not possible if the active subscription is not paid")]
    RenewalNotPaid,

    #[error("Renewing is only possible for a subscription expiring at the end of tomorrow")]
    RenewalNotExpiring,

    #[error("Renewing a non-recurring subscription is not possible")]
    RenewalNotRecurring,

    #[error("Renewing a subscription that is pending cancellation is not possible")]
    RenewalPendingCancellation,

    // Plans
    #[error("Plan not found: {0}")]
    PlanNotFound(uuid::Uuid),

    // Features
    #[error("No feature found with code {0}")]
    FeatureNotFound(String),

    #[error("Feature {0} is not limited and thus can not be consumed")]
    FeatureNotMeterable(String),

    #[error("Usage exceeds the allowed amount for {code}: tried to use {requested}, remaining {remaining}")]
    UsageExceeded {
        code: String,
        requested: u64,
        remaining: i64,
    },

    #[error("Restricted relation {relation} not found on {owner_type}")]
    RelationNotFound {
        relation: String,
        owner_type: String,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Infrastructure
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SubscriptionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoActiveSubscription
            | Self::NoSubscriptions
            | Self::ActiveSubscriptionExists
            | Self::SubscriptionNotFound(_)
            | Self::InvalidDuration(_)
            | Self::NotStarted
            | Self::ConflictingActiveSubscription
            | Self::ConflictingUpcomingSubscription
            | Self::AlreadyCancelled
            | Self::TestingMigrationMustBeImmediate
            | Self::RenewalNotPaid
            | Self::RenewalNotExpiring
            | Self::RenewalNotRecurring
            | Self::RenewalPendingCancellation => ErrorKind::Subscription,
            Self::PlanNotFound(_) => ErrorKind::Plan,
            Self::FeatureNotFound(_) => ErrorKind::FeatureNotFound,
            Self::FeatureNotMeterable(_) | Self::UsageExceeded { .. } | Self::RelationNotFound { .. } => {
                ErrorKind::Feature
            }
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Database(_) | Self::Storage(_) => ErrorKind::Storage,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Stable machine-readable code
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NoActiveSubscription => "NO_ACTIVE_SUBSCRIPTION",
            Self::NoSubscriptions => "NO_SUBSCRIPTIONS",
            Self::ActiveSubscriptionExists => "ACTIVE_SUBSCRIPTION_EXISTS",
            Self::SubscriptionNotFound(_) => "SUBSCRIPTION_NOT_FOUND",
            Self::InvalidDuration(_) => "INVALID_DURATION",
            Self::NotStarted => "NOT_STARTED",
            Self::ConflictingActiveSubscription => "CONFLICTING_ACTIVE_SUBSCRIPTION",
            Self::ConflictingUpcomingSubscription => "CONFLICTING_UPCOMING_SUBSCRIPTION",
            Self::AlreadyCancelled => "ALREADY_CANCELLED",
            Self::TestingMigrationMustBeImmediate => "TESTING_MIGRATION_MUST_BE_IMMEDIATE",
            Self::RenewalNotPaid => "RENEWAL_NOT_PAID",
            Self::RenewalNotExpiring => "RENEWAL_NOT_EXPIRING",
            Self::RenewalNotRecurring => "RENEWAL_NOT_RECURRING",
            Self::RenewalPendingCancellation => "RENEWAL_PENDING_CANCELLATION",
            Self::PlanNotFound(_) => "PLAN_NOT_FOUND",
            Self::FeatureNotFound(_) => "FEATURE_NOT_FOUND",
            Self::FeatureNotMeterable(_) => "FEATURE_NOT_METERABLE",
            Self::UsageExceeded { .. } => "USAGE_EXCEEDED",
            Self::RelationNotFound { .. } => "RELATION_NOT_FOUND",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Conflict and validation errors are terminal for the caller: retrying the same call
    /// against the same state yields the same error.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Storage)
    }
}
