use serde::{Deserialize, Serialize};

/// One student-activity participation record, the unit both report formats
/// render as a table row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ParticipationRow {
    pub id: String,
    pub class_id: String,
    pub student_name: String,
    pub student_email: Option<String>,
    pub activity_name: String,
    pub activity_kind: Option<String>,
    pub present: bool,
    pub hours: Option<f64>,
    pub score: Option<f64>,
    pub grade: Option<String>,
    pub evaluation_status: Option<String>,
}
