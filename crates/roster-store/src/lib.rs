//! roster-store: persistence of the enrolled catalog and attendance log.

pub mod recorder;
pub mod store;

pub use recorder::{AttendanceRecorder, AttendanceSink};
pub use store::{AttendanceRow, NewIdentity, Store, StoreError};
