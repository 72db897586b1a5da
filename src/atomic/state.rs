//! Atomic operation unit states.

/// Lifecycle of an atomic operation unit.
///
/// `NotStarted -> Active -> Committing -> Committed`, or
/// `Active -> RollingBack -> RolledBack`. A unit whose commit record could
/// not be appended returns from `Committing` to `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    NotStarted,
    /// The unit is recording operations.
    Active,
    /// The commit record is being made durable.
    Committing,
    Committed,
    /// Operations are being compensated.
    RollingBack,
    RolledBack,
}

impl UnitState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Returns true once the unit reached a terminal record.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }

    /// Whether the unit may move to `next`.
    pub fn can_transition_to(&self, next: UnitState) -> bool {
        matches!(
            (self, next),
            (Self::NotStarted, Self::Active)
                | (Self::Active, Self::Committing)
                | (Self::Committing, Self::Committed)
                | (Self::Committing, Self::Active)
                | (Self::Active, Self::RollingBack)
                | (Self::RollingBack, Self::RolledBack)
        )
    }
}

impl std::fmt::Display for UnitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NotStarted => "NotStarted",
            Self::Active => "Active",
            Self::Committing => "Committing",
            Self::Committed => "Committed",
            Self::RollingBack => "RollingBack",
            Self::RolledBack => "RolledBack",
        };
        f.write_str(name)
    }
}
