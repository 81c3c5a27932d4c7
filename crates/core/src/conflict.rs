use chrono::{Days, NaiveDate};
use serde::Serialize;

use crate::types::LeaveStatus;

/// Severity of a detected planning conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictSeverity {
    Info,
    Warning,
    Blocking,
}

/// Classification of a planning conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictKind {
    UserLeaveOverlap,
    TeamAbsence,
    CriticalRole,
    HolidayProximity,
}

impl ConflictKind {
    /// Returns the canonical label used across the API and telemetry.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserLeaveOverlap => "USER_LEAVE_OVERLAP",
            Self::TeamAbsence => "TEAM_ABSENCE",
            Self::CriticalRole => "CRITICAL_ROLE",
            Self::HolidayProximity => "HOLIDAY_PROXIMITY",
        }
    }

    /// Severity attached to each conflict kind.
    pub fn severity(self) -> ConflictSeverity {
        match self {
            Self::UserLeaveOverlap => ConflictSeverity::Blocking,
            Self::TeamAbsence | Self::CriticalRole => ConflictSeverity::Warning,
            Self::HolidayProximity => ConflictSeverity::Info,
        }
    }
}

/// A single conflict raised for a candidate leave.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub severity: ConflictSeverity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leave_id: Option<String>,
}

impl Conflict {
    pub fn is_blocking(&self) -> bool {
        self.severity == ConflictSeverity::Blocking
    }
}

/// An existing leave of the requesting user overlapping the candidate range.
#[derive(Debug, Clone)]
pub struct OverlappingLeave {
    pub id: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub status: LeaveStatus,
}

/// Number of already-absent colleagues of the same professional role on a day.
#[derive(Debug, Clone, Copy)]
pub struct DayAbsence {
    pub date: NaiveDate,
    pub absent: u32,
}

/// Everything the classifier needs about a candidate leave.
///
/// The inputs are assembled by the caller from storage queries; the
/// classification itself is pure.
#[derive(Debug, Clone)]
pub struct ConflictInputs<'a> {
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// Pending or approved leaves of the same user intersecting the range.
    pub overlapping_own: &'a [OverlappingLeave],
    /// Active users sharing the requester's professional role, requester included.
    pub role_headcount: u32,
    /// Per-day absent counts for that role over the range, requester excluded.
    pub absent_by_day: &'a [DayAbsence],
    pub team_absence_threshold: f64,
    /// Public holidays in `[start - 1, end + 1]`.
    pub holidays: &'a [(NaiveDate, String)],
}

/// Classifies a candidate leave against the current planning state.
pub fn detect_conflicts(inputs: &ConflictInputs<'_>) -> Vec<Conflict> {
    let mut conflicts = Vec::new();

    for existing in inputs.overlapping_own {
        conflicts.push(Conflict {
            kind: ConflictKind::UserLeaveOverlap,
            severity: ConflictKind::UserLeaveOverlap.severity(),
            message: format!(
                "overlaps an existing {} leave from {} to {}",
                existing.status, existing.start, existing.end
            ),
            date: Some(existing.start),
            leave_id: Some(existing.id.clone()),
        });
    }

    if inputs.role_headcount > 0 {
        for day in inputs.absent_by_day {
            let rate = f64::from(day.absent + 1) / f64::from(inputs.role_headcount);
            if rate > inputs.team_absence_threshold {
                conflicts.push(Conflict {
                    kind: ConflictKind::TeamAbsence,
                    severity: ConflictKind::TeamAbsence.severity(),
                    message: format!(
                        "{} of {} colleagues absent on {}",
                        day.absent + 1,
                        inputs.role_headcount,
                        day.date
                    ),
                    date: Some(day.date),
                    leave_id: None,
                });
            }
        }
    }

    if inputs.role_headcount == 1 {
        conflicts.push(Conflict {
            kind: ConflictKind::CriticalRole,
            severity: ConflictKind::CriticalRole.severity(),
            message: "requester is the only active member of their professional role".to_string(),
            date: None,
            leave_id: None,
        });
    }

    let window_start = inputs.start.checked_sub_days(Days::new(1));
    let window_end = inputs.end.checked_add_days(Days::new(1));
    for (day, label) in inputs.holidays {
        let in_window = window_start.map_or(false, |lo| *day >= lo)
            && window_end.map_or(false, |hi| *day <= hi);
        if in_window {
            conflicts.push(Conflict {
                kind: ConflictKind::HolidayProximity,
                severity: ConflictKind::HolidayProximity.severity(),
                message: format!("adjacent to public holiday {label} on {day}"),
                date: Some(*day),
                leave_id: None,
            });
        }
    }

    conflicts
}

/// Returns `true` when any conflict in the list blocks the request.
pub fn has_blocking(conflicts: &[Conflict]) -> bool {
    conflicts.iter().any(Conflict::is_blocking)
}
