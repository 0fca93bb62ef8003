pub mod repository;
pub mod types;

pub use repository::{ParticipationRepository, SqliteParticipationRepository};
pub use types::ParticipationRow;
