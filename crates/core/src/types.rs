use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Access level attached to an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Admin,
    Planner,
    User,
}

impl Role {
    /// Returns the canonical database representation for the role.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "ADMIN",
            Self::Planner => "PLANNER",
            Self::User => "USER",
        }
    }

    /// Returns `true` when the role may manage other users' planning.
    pub fn can_plan(self) -> bool {
        matches!(self, Self::Admin | Self::Planner)
    }

    /// Returns `true` for full administrative access.
    pub fn is_admin(self) -> bool {
        matches!(self, Self::Admin)
    }
}

impl FromStr for Role {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ADMIN" => Ok(Self::Admin),
            "PLANNER" => Ok(Self::Planner),
            "USER" => Ok(Self::User),
            _ => Err(()),
        }
    }
}

/// Clinical function of a staff member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProfessionalRole {
    Mar,
    Iade,
    Secretary,
}

impl ProfessionalRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mar => "MAR",
            Self::Iade => "IADE",
            Self::Secretary => "SECRETARY",
        }
    }
}

impl FromStr for ProfessionalRole {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "MAR" => Ok(Self::Mar),
            "IADE" => Ok(Self::Iade),
            "SECRETARY" => Ok(Self::Secretary),
            _ => Err(()),
        }
    }
}

/// Working-time pattern of a staff member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkPattern {
    FullTime,
    AlternatingWeeks,
}

impl WorkPattern {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FullTime => "FULL_TIME",
            Self::AlternatingWeeks => "ALTERNATING_WEEKS",
        }
    }
}

impl FromStr for WorkPattern {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "FULL_TIME" => Ok(Self::FullTime),
            "ALTERNATING_WEEKS" => Ok(Self::AlternatingWeeks),
            _ => Err(()),
        }
    }
}

/// Weekday schedule resolved for a single user.
///
/// `weekdays_even` applies during even ISO weeks, `weekdays_odd` during odd
/// ones. Full-time users carry the same list on both sides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkSchedule {
    pub pattern: WorkPattern,
    pub weekdays_even: Vec<Weekday>,
    pub weekdays_odd: Vec<Weekday>,
}

impl WorkSchedule {
    /// Schedule for a standard Monday-to-Friday full-timer.
    pub fn full_time() -> Self {
        let weekdays = vec![
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
        ];
        Self {
            pattern: WorkPattern::FullTime,
            weekdays_even: weekdays.clone(),
            weekdays_odd: weekdays,
        }
    }

    /// Returns `true` when the user is expected to work on the given date.
    pub fn works_on(&self, date: NaiveDate) -> bool {
        let weekdays = match self.pattern {
            WorkPattern::FullTime => &self.weekdays_even,
            WorkPattern::AlternatingWeeks => {
                if is_even_iso_week(date) {
                    &self.weekdays_even
                } else {
                    &self.weekdays_odd
                }
            }
        };
        weekdays.contains(&date.weekday())
    }
}

/// Returns `true` when the date falls in an even ISO week.
pub fn is_even_iso_week(date: NaiveDate) -> bool {
    date.iso_week().week() % 2 == 0
}

/// How leave days are counted for a given leave type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CountingMethod {
    WeekdaysIfWorking,
    ContinuousAllDays,
}

impl CountingMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WeekdaysIfWorking => "WEEKDAYS_IF_WORKING",
            Self::ContinuousAllDays => "CONTINUOUS_ALL_DAYS",
        }
    }
}

impl FromStr for CountingMethod {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "WEEKDAYS_IF_WORKING" => Ok(Self::WeekdaysIfWorking),
            "CONTINUOUS_ALL_DAYS" => Ok(Self::ContinuousAllDays),
            _ => Err(()),
        }
    }
}

/// Half-day marker attached to the first or last day of a leave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DayPart {
    Am,
    Pm,
}

impl DayPart {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Am => "AM",
            Self::Pm => "PM",
        }
    }
}

impl FromStr for DayPart {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "AM" => Ok(Self::Am),
            "PM" => Ok(Self::Pm),
            _ => Err(()),
        }
    }
}

/// Lifecycle state of a leave request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaveStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

impl LeaveStatus {
    /// Returns the canonical database representation for the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Returns `true` once no further transition is allowed.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Returns `true` when moving to `next` is a legal transition.
    ///
    /// Only `PENDING` requests may be decided or withdrawn; every other state
    /// is final.
    pub fn can_transition_to(self, next: LeaveStatus) -> bool {
        matches!(
            (self, next),
            (
                Self::Pending,
                Self::Approved | Self::Rejected | Self::Cancelled
            )
        )
    }
}

impl FromStr for LeaveStatus {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "PENDING" => Ok(Self::Pending),
            "APPROVED" => Ok(Self::Approved),
            "REJECTED" => Ok(Self::Rejected),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(()),
        }
    }
}

impl fmt::Display for LeaveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A leave request with its full decision trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leave {
    pub id: String,
    pub user_id: String,
    pub type_code: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub half_day_start: Option<DayPart>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub half_day_end: Option<DayPart>,
    pub counted_days: f64,
    pub status: LeaveStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approver_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recurrence_group: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Scheduling period inside a single day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Period {
    Morning,
    Afternoon,
    FullDay,
}

impl Period {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Morning => "MORNING",
            Self::Afternoon => "AFTERNOON",
            Self::FullDay => "FULL_DAY",
        }
    }
}

impl FromStr for Period {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "MORNING" => Ok(Self::Morning),
            "AFTERNOON" => Ok(Self::Afternoon),
            "FULL_DAY" => Ok(Self::FullDay),
            _ => Err(()),
        }
    }
}

/// Kind of activity an assignment covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityKind {
    Room,
    Duty,
    OnCall,
    Consultation,
}

impl ActivityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Room => "ROOM",
            Self::Duty => "DUTY",
            Self::OnCall => "ON_CALL",
            Self::Consultation => "CONSULTATION",
        }
    }
}

impl FromStr for ActivityKind {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ROOM" => Ok(Self::Room),
            "DUTY" => Ok(Self::Duty),
            "ON_CALL" => Ok(Self::OnCall),
            "CONSULTATION" => Ok(Self::Consultation),
            _ => Err(()),
        }
    }
}

/// Week filter carried by a trame template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WeekParity {
    All,
    Even,
    Odd,
}

impl WeekParity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "ALL",
            Self::Even => "EVEN",
            Self::Odd => "ODD",
        }
    }

    /// Returns `true` when the template applies to the week containing `date`.
    pub fn matches(self, date: NaiveDate) -> bool {
        match self {
            Self::All => true,
            Self::Even => is_even_iso_week(date),
            Self::Odd => !is_even_iso_week(date),
        }
    }
}

impl FromStr for WeekParity {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ALL" => Ok(Self::All),
            "EVEN" => Ok(Self::Even),
            "ODD" => Ok(Self::Odd),
            _ => Err(()),
        }
    }
}

/// Kind of notification delivered to a user inbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    LeaveRequested,
    LeaveApproved,
    LeaveRejected,
    LeaveCancelled,
    QuotaTransferred,
    QuotaCarriedOver,
    TrameApplied,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LeaveRequested => "leave.requested",
            Self::LeaveApproved => "leave.approved",
            Self::LeaveRejected => "leave.rejected",
            Self::LeaveCancelled => "leave.cancelled",
            Self::QuotaTransferred => "quota.transferred",
            Self::QuotaCarriedOver => "quota.carried_over",
            Self::TrameApplied => "trame.applied",
        }
    }
}

/// Parses the comma separated weekday list stored in the users table.
pub fn parse_weekdays(raw: &str) -> Vec<Weekday> {
    raw.split(',')
        .filter_map(|item| match item.trim() {
            "MON" => Some(Weekday::Mon),
            "TUE" => Some(Weekday::Tue),
            "WED" => Some(Weekday::Wed),
            "THU" => Some(Weekday::Thu),
            "FRI" => Some(Weekday::Fri),
            "SAT" => Some(Weekday::Sat),
            "SUN" => Some(Weekday::Sun),
            _ => None,
        })
        .collect()
}

/// Formats a weekday list back into the stored representation.
pub fn format_weekdays(weekdays: &[Weekday]) -> String {
    weekdays
        .iter()
        .map(|day| match day {
            Weekday::Mon => "MON",
            Weekday::Tue => "TUE",
            Weekday::Wed => "WED",
            Weekday::Thu => "THU",
            Weekday::Fri => "FRI",
            Weekday::Sat => "SAT",
            Weekday::Sun => "SUN",
        })
        .collect::<Vec<_>>()
        .join(",")
}
