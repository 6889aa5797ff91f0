//! Classification of plan version changes between two engine reads.

/// How the on-disk version moved relative to the last version the engine knew.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionChange {
    /// Nobody wrote the plan through a version-bumping writer.
    Unchanged,
    /// Exactly one write happened; the expected case for an agent turn.
    Advanced,
    /// More than one write happened since the last read.
    Jumped { from: u64, to: u64 },
    /// The version went backwards (the document was replaced wholesale).
    Regressed { from: u64, to: u64 },
}

impl VersionChange {
    pub fn between(last_known: u64, observed: u64) -> Self {
        match observed.checked_sub(last_known) {
            Some(0) => VersionChange::Unchanged,
            Some(1) => VersionChange::Advanced,
            Some(_) => VersionChange::Jumped {
                from: last_known,
                to: observed,
            },
            None => VersionChange::Regressed {
                from: last_known,
                to: observed,
            },
        }
    }

    /// Warning text for jumps and regressions; `None` for the expected cases.
    pub fn describe(self) -> Option<String> {
        match self {
            VersionChange::Jumped { from, to } => Some(format!(
                "plan version jumped from {from} to {to}; accepting on-disk plan as authoritative"
            )),
            VersionChange::Regressed { from, to } => Some(format!(
                "plan version went backwards from {from} to {to}; accepting on-disk plan, next write continues from {from}"
            )),
            VersionChange::Unchanged | VersionChange::Advanced => None,
        }
    }
}
