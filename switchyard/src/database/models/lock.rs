//! Lock database model.

use sqlx::FromRow;

use crate::database::time::ms_to_datetime;
use crate::domain::Lock;

/// Lock database model.
#[derive(Debug, Clone, FromRow)]
pub struct LockDbModel {
    pub name: String,
    pub job_id: String,
    pub created_at: i64,
    pub abort_requested: bool,
}

impl From<LockDbModel> for Lock {
    fn from(model: LockDbModel) -> Self {
        Lock {
            name: model.name,
            job_id: model.job_id,
            created_at: ms_to_datetime(model.created_at),
            abort_requested: model.abort_requested,
        }
    }
}
