use std::{collections::HashMap, sync::LazyLock};

use super::types::{JobType, ServerStatus};

/// Statuses from which each operation may be issued. `None` stands for "no server yet".
static TRANSITIONS: LazyLock<HashMap<JobType, Vec<Option<ServerStatus>>>> = LazyLock::new(|| {
    let mut map = HashMap::new();
    map.insert(
        JobType::Create,
        vec![None, Some(ServerStatus::Creating), Some(ServerStatus::Error)],
    );
    map.insert(
        JobType::Start,
        vec![Some(ServerStatus::Stopped), Some(ServerStatus::Error)],
    );
    map.insert(
        JobType::Stop,
        vec![Some(ServerStatus::Running), Some(ServerStatus::Error)],
    );
    map.insert(
        JobType::Restart,
        vec![
            Some(ServerStatus::Running),
            Some(ServerStatus::Stopped),
            Some(ServerStatus::Error),
        ],
    );
    map.insert(
        JobType::Delete,
        vec![
            Some(ServerStatus::Creating),
            Some(ServerStatus::Stopped),
            Some(ServerStatus::Running),
            Some(ServerStatus::Error),
        ],
    );
    map
});

pub fn valid_transition(current: Option<ServerStatus>, op: JobType) -> bool {
    TRANSITIONS
        .get(&op)
        .is_some_and(|allowed| allowed.contains(&current))
}

/// Status a successful `op` leaves the server in.
pub fn target_status(op: JobType) -> ServerStatus {
    match op {
        JobType::Create | JobType::Stop => ServerStatus::Stopped,
        JobType::Start | JobType::Restart => ServerStatus::Running,
        JobType::Delete => ServerStatus::Deleted,
    }
}
