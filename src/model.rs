use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, NaiveTime, TimeDelta, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for wall-clock instants (created/updated/loaded/stale).
pub type Ms = i64;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Half-open time-of-day interval `[start, end)` on a single calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeSlot {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeSlot {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "TimeSlot start must be before end");
        Self { start, end }
    }

    /// `None` unless `start < end`.
    pub fn try_new(start: NaiveTime, end: NaiveTime) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &TimeSlot) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_slot(&self, other: &TimeSlot) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl fmt::Display for TimeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}–{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

/// Inclusive calendar window `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        debug_assert!(start <= end, "DateRange start must not be after end");
        Self { start, end }
    }

    pub fn try_new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn single(date: NaiveDate) -> Self {
        Self { start: date, end: date }
    }

    /// Number of calendar days covered, both ends included.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn contains_date(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn contains_range(&self, other: &DateRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Appointment identity: a server-assigned ULID, or a client-side placeholder
/// (`temp-…`) that lives only until the create round trip resolves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AppointmentId {
    Saved(Ulid),
    Temp(String),
}

pub const TEMP_ID_PREFIX: &str = "temp-";

impl AppointmentId {
    pub fn temp(suffix: impl fmt::Display) -> Self {
        AppointmentId::Temp(format!("{TEMP_ID_PREFIX}{suffix}"))
    }

    pub fn saved(&self) -> Option<Ulid> {
        match self {
            AppointmentId::Saved(id) => Some(*id),
            AppointmentId::Temp(_) => None,
        }
    }

    pub fn is_temp(&self) -> bool {
        matches!(self, AppointmentId::Temp(_))
    }
}

impl From<Ulid> for AppointmentId {
    fn from(id: Ulid) -> Self {
        AppointmentId::Saved(id)
    }
}

impl fmt::Display for AppointmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppointmentId::Saved(id) => write!(f, "{id}"),
            AppointmentId::Temp(s) => f.write_str(s),
        }
    }
}

impl FromStr for AppointmentId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with(TEMP_ID_PREFIX) {
            return Ok(AppointmentId::Temp(s.to_string()));
        }
        Ulid::from_string(s)
            .map(AppointmentId::Saved)
            .map_err(|e| format!("bad appointment id {s:?}: {e}"))
    }
}

impl TryFrom<String> for AppointmentId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<AppointmentId> for String {
    fn from(id: AppointmentId) -> Self {
        id.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentType {
    Consultation,
    Fitting,
    Pickup,
    Delivery,
    Other,
}

impl AppointmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentType::Consultation => "consultation",
            AppointmentType::Fitting => "fitting",
            AppointmentType::Pickup => "pickup",
            AppointmentType::Delivery => "delivery",
            AppointmentType::Other => "other",
        }
    }
}

impl FromStr for AppointmentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "consultation" => Ok(AppointmentType::Consultation),
            "fitting" => Ok(AppointmentType::Fitting),
            "pickup" => Ok(AppointmentType::Pickup),
            "delivery" => Ok(AppointmentType::Delivery),
            "other" => Ok(AppointmentType::Other),
            _ => Err(format!("unknown appointment type: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Scheduled,
    Confirmed,
    Completed,
    Cancelled,
    NoShow,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::NoShow => "no_show",
        }
    }
}

impl FromStr for AppointmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "scheduled" => Ok(AppointmentStatus::Scheduled),
            "confirmed" => Ok(AppointmentStatus::Confirmed),
            "completed" => Ok(AppointmentStatus::Completed),
            "cancelled" => Ok(AppointmentStatus::Cancelled),
            "no_show" => Ok(AppointmentStatus::NoShow),
            _ => Err(format!("unknown appointment status: {s}")),
        }
    }
}

/// Weekly opening schedule, Monday first. `None` means closed all day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingHours {
    days: [Option<TimeSlot>; 7],
}

impl WorkingHours {
    /// Same window every day of the week.
    pub fn uniform(open: NaiveTime, close: NaiveTime) -> Self {
        Self {
            days: [TimeSlot::try_new(open, close); 7],
        }
    }

    pub fn closed() -> Self {
        Self { days: [None; 7] }
    }

    pub fn with_day(mut self, weekday: Weekday, window: Option<TimeSlot>) -> Self {
        self.days[weekday.num_days_from_monday() as usize] = window;
        self
    }

    pub fn window(&self, date: NaiveDate) -> Option<TimeSlot> {
        self.days[date.weekday().num_days_from_monday() as usize]
    }

    pub fn allows(&self, date: NaiveDate, slot: &TimeSlot) -> bool {
        self.window(date).is_some_and(|w| w.contains_slot(slot))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSummary {
    pub id: Ulid,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: AppointmentId,
    pub shop_id: Ulid,
    pub client_id: Option<Ulid>,
    pub order_id: Option<Ulid>,
    pub title: String,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    #[serde(rename = "type")]
    pub kind: AppointmentType,
    pub status: AppointmentStatus,
    pub notes: Option<String>,
    pub reminder_sent: bool,
    /// Joined on read; never persisted.
    pub client: Option<ClientSummary>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Appointment {
    pub fn slot(&self) -> TimeSlot {
        TimeSlot::new(self.start_time, self.end_time)
    }

    /// Cancelled appointments stay on the calendar but never block a slot.
    pub fn is_active(&self) -> bool {
        self.status != AppointmentStatus::Cancelled
    }
}

/// Create payload; the server fills in id, status and timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAppointment {
    pub shop_id: Ulid,
    pub client_id: Option<Ulid>,
    pub order_id: Option<Ulid>,
    pub title: String,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    #[serde(rename = "type")]
    pub kind: AppointmentType,
    pub notes: Option<String>,
}

/// Partial update. Nested options clear the field when set to `Some(None)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentPatch {
    pub title: Option<String>,
    pub date: Option<NaiveDate>,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    #[serde(rename = "type")]
    pub kind: Option<AppointmentType>,
    pub status: Option<AppointmentStatus>,
    pub notes: Option<Option<String>>,
    pub client_id: Option<Option<Ulid>>,
    pub order_id: Option<Option<Ulid>>,
    pub reminder_sent: Option<bool>,
}

impl AppointmentPatch {
    pub fn is_empty(&self) -> bool {
        *self == AppointmentPatch::default()
    }

    pub fn apply_to(&self, apt: &mut Appointment) {
        if let Some(title) = &self.title {
            apt.title = title.clone();
        }
        if let Some(date) = self.date {
            apt.date = date;
        }
        if let Some(start) = self.start_time {
            apt.start_time = start;
        }
        if let Some(end) = self.end_time {
            apt.end_time = end;
        }
        if let Some(kind) = self.kind {
            apt.kind = kind;
        }
        if let Some(status) = self.status {
            apt.status = status;
        }
        if let Some(notes) = &self.notes {
            apt.notes = notes.clone();
        }
        if let Some(client_id) = self.client_id {
            apt.client_id = client_id;
            if apt.client.as_ref().map(|c| Some(c.id)) != Some(client_id) {
                apt.client = None;
            }
        }
        if let Some(order_id) = self.order_id {
            apt.order_id = order_id;
        }
        if let Some(sent) = self.reminder_sent {
            apt.reminder_sent = sent;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShopInfo {
    pub id: Ulid,
    pub owner: String,
    pub name: Option<String>,
    pub hours: WorkingHours,
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ShopCreated {
        id: Ulid,
        owner: String,
        name: Option<String>,
        hours: WorkingHours,
    },
    ShopHoursUpdated {
        id: Ulid,
        hours: WorkingHours,
    },
    ClientRegistered {
        shop_id: Ulid,
        client: ClientSummary,
    },
    AppointmentBooked {
        appointment: Appointment,
    },
    AppointmentUpdated {
        appointment: Appointment,
    },
    AppointmentCancelled {
        id: Ulid,
        shop_id: Ulid,
        updated_at: Ms,
    },
}

/// Real-time push payload delivered to watching sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "appointment", rename_all = "snake_case")]
pub enum ChangeNotice {
    Created(Appointment),
    Updated(Appointment),
    Cancelled(Appointment),
}

impl ChangeNotice {
    pub fn appointment(&self) -> &Appointment {
        match self {
            ChangeNotice::Created(a) | ChangeNotice::Updated(a) | ChangeNotice::Cancelled(a) => a,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn sample() -> Appointment {
        Appointment {
            id: AppointmentId::Saved(Ulid::new()),
            shop_id: Ulid::new(),
            client_id: None,
            order_id: None,
            title: "Hem trousers".into(),
            date: d(2024, 5, 6),
            start_time: t(10, 0),
            end_time: t(11, 0),
            kind: AppointmentType::Fitting,
            status: AppointmentStatus::Scheduled,
            notes: None,
            reminder_sent: false,
            client: None,
            created_at: 1,
            updated_at: 1,
        }
    }

    #[test]
    fn slot_overlap_is_half_open() {
        let a = TimeSlot::new(t(10, 0), t(11, 0));
        let b = TimeSlot::new(t(10, 30), t(11, 30));
        let c = TimeSlot::new(t(11, 0), t(12, 0));
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert_eq!(a.duration(), TimeDelta::minutes(60));
    }

    #[test]
    fn slot_try_new_rejects_inverted() {
        assert!(TimeSlot::try_new(t(11, 0), t(10, 0)).is_none());
        assert!(TimeSlot::try_new(t(10, 0), t(10, 0)).is_none());
        assert!(TimeSlot::try_new(t(10, 0), t(10, 1)).is_some());
    }

    #[test]
    fn date_range_containment() {
        let month = DateRange::new(d(2024, 5, 1), d(2024, 5, 31));
        let week = DateRange::new(d(2024, 5, 6), d(2024, 5, 12));
        assert!(month.contains_range(&week));
        assert!(!week.contains_range(&month));
        assert!(month.contains_date(d(2024, 5, 31)));
        assert!(!month.contains_date(d(2024, 6, 1)));
        assert_eq!(week.days(), 7);
        assert_eq!(month.to_string(), "2024-05-01..2024-05-31");
    }

    #[test]
    fn appointment_id_parses_both_forms() {
        let ulid = Ulid::new();
        assert_eq!(ulid.to_string().parse::<AppointmentId>().unwrap(), AppointmentId::Saved(ulid));
        assert_eq!(
            "temp-1".parse::<AppointmentId>().unwrap(),
            AppointmentId::Temp("temp-1".into())
        );
        assert_eq!(AppointmentId::temp(7).to_string(), "temp-7");
        assert!("apt-42".parse::<AppointmentId>().is_err());
    }

    #[test]
    fn working_hours_window_per_weekday() {
        let hours = WorkingHours::uniform(t(9, 0), t(17, 0)).with_day(Weekday::Sun, None);
        let monday = d(2024, 5, 6);
        let sunday = d(2024, 5, 12);
        assert!(hours.allows(monday, &TimeSlot::new(t(9, 0), t(17, 0))));
        assert!(!hours.allows(monday, &TimeSlot::new(t(8, 0), t(8, 30))));
        assert!(!hours.allows(monday, &TimeSlot::new(t(16, 30), t(17, 30))));
        assert!(!hours.allows(sunday, &TimeSlot::new(t(10, 0), t(11, 0))));
        assert!(WorkingHours::closed().window(monday).is_none());
    }

    #[test]
    fn patch_applies_only_given_fields() {
        let mut apt = sample();
        let patch = AppointmentPatch {
            title: Some("Final fitting".into()),
            notes: Some(Some("bring shoes".into())),
            ..Default::default()
        };
        patch.apply_to(&mut apt);
        assert_eq!(apt.title, "Final fitting");
        assert_eq!(apt.notes.as_deref(), Some("bring shoes"));
        assert_eq!(apt.start_time, t(10, 0));

        let clear = AppointmentPatch {
            notes: Some(None),
            ..Default::default()
        };
        clear.apply_to(&mut apt);
        assert_eq!(apt.notes, None);
    }

    #[test]
    fn patch_changing_client_drops_stale_summary() {
        let mut apt = sample();
        let cid = Ulid::new();
        apt.client_id = Some(cid);
        apt.client = Some(ClientSummary {
            id: cid,
            name: "Ada".into(),
            phone: None,
            email: None,
        });
        AppointmentPatch {
            client_id: Some(Some(Ulid::new())),
            ..Default::default()
        }
        .apply_to(&mut apt);
        assert!(apt.client.is_none());
    }

    #[test]
    fn change_notice_json_shape() {
        let apt = sample();
        let notice = ChangeNotice::Updated(apt.clone());
        let json = serde_json::to_string(&notice).unwrap();
        assert!(json.contains("\"kind\":\"updated\""));
        assert!(json.contains("\"type\":\"fitting\""));
        assert!(json.contains(&format!("\"id\":\"{}\"", apt.id)));
        assert_eq!(serde_json::from_str::<ChangeNotice>(&json).unwrap(), notice);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::AppointmentBooked { appointment: sample() };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn status_and_type_names() {
        assert_eq!("no_show".parse::<AppointmentStatus>().unwrap(), AppointmentStatus::NoShow);
        assert_eq!(AppointmentStatus::Cancelled.as_str(), "cancelled");
        assert_eq!("Pickup".parse::<AppointmentType>().unwrap(), AppointmentType::Pickup);
        assert!("haircut".parse::<AppointmentType>().is_err());
    }
}
