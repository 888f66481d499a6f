pub mod attendance;
pub mod face_store;
pub mod run_state;

pub use attendance::{
    AttendanceFilters, AttendanceRecord, AttendanceStore, DailySummary, ExportFormat, MarkOutcome,
    MarkRequest, MarkedBy, NewDetectionEvent, NewPerson, Person, PersonPatch, ReportRow,
};
pub use face_store::{FaceEntry, FaceStore};
pub use run_state::{RunState, RunStateStore};
