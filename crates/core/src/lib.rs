pub mod error;
pub mod field_value;
pub mod history;
pub mod identity;
pub mod ids;
pub mod lifecycle;
pub mod manifest;
pub mod path;
pub mod progress;
pub mod record;

pub use error::CoreError;
pub use field_value::{FieldMap, FieldValue};
pub use history::{HistoryAction, HistoryEntry};
pub use identity::{CallerIdentity, Role};
pub use ids::*;
pub use lifecycle::{ApplicationStatus, LifecycleAction, LifecycleState, TransitionPolicy};
pub use manifest::{FieldKind, FieldSpec, ManifestRegistry, ProgramManifest};
pub use path::FieldPath;
pub use progress::Progress;
pub use record::{ApplicationDraft, FieldUpdates, LoanApplicationRecord, LoanCategory, Section};
