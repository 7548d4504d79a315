//! Room protocol: member records and the Join / Leave / StateUpdate messages.
//!
//! Messages travel as JSON, tagged by `type`. Validation runs before a message
//! is encoded and after it is decoded, so a peer never publishes (or applies)
//! a message without a usable member record.

use serde::{Deserialize, Serialize};

use crate::error::NetworkError;

/// Activity state a member displays to the room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberState {
    #[default]
    Idle,
    Work,
    Rest,
}

impl MemberState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Work => "work",
            Self::Rest => "rest",
        }
    }
}

impl std::fmt::Display for MemberState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemberState {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "work" => Ok(Self::Work),
            "rest" => Ok(Self::Rest),
            other => Err(NetworkError::InvalidMessage(format!(
                "unknown member state: {other}"
            ))),
        }
    }
}

/// Snapshot of a member's countdown timer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerInfo {
    /// Full length of the current phase, in seconds.
    #[serde(rename = "duration")]
    pub duration_secs: u32,
    /// Seconds left in the current phase.
    #[serde(rename = "remaining")]
    pub remaining_secs: u32,
    #[serde(rename = "isRunning")]
    pub is_running: bool,
    #[serde(rename = "isWork")]
    pub is_work_phase: bool,
}

/// A room-scoped record of one peer's displayed activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    /// Node identity of the member.
    pub id: String,
    /// Display name.
    pub name: String,
    pub state: MemberState,
    #[serde(default)]
    pub timer: TimerInfo,
    /// Name of the task currently being worked on, empty if none.
    #[serde(default)]
    pub task_name: String,
    /// Unix seconds at which the sender built this record.
    pub updated_at: i64,
}

impl Member {
    /// Build a member record stamped with the current time.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        state: MemberState,
        timer: TimerInfo,
        task_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            state,
            timer,
            task_name: task_name.into(),
            updated_at: chrono::Utc::now().timestamp(),
        }
    }

    /// An idle member with a stopped timer and no task.
    pub fn idle(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, name, MemberState::Idle, TimerInfo::default(), "")
    }
}

/// Discriminant of a [`Message`], used for logging and dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Join,
    Leave,
    StateUpdate,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Leave => "leave",
            Self::StateUpdate => "state_update",
        }
    }
}

/// A room protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// A member announces itself to the room.
    Join {
        member: Member,
        #[serde(rename = "roomKey", default, skip_serializing_if = "Option::is_none")]
        room_key: Option<String>,
    },
    /// A member departs the room.
    Leave {
        member: Member,
        #[serde(rename = "roomKey", default, skip_serializing_if = "Option::is_none")]
        room_key: Option<String>,
    },
    /// A member's full current state.
    StateUpdate { member: Member },
}

impl Message {
    pub fn join(member: Member, room_key: impl Into<String>) -> Self {
        Self::Join {
            member,
            room_key: Some(room_key.into()),
        }
    }

    pub fn leave(member: Member, room_key: impl Into<String>) -> Self {
        Self::Leave {
            member,
            room_key: Some(room_key.into()),
        }
    }

    pub fn state_update(member: Member) -> Self {
        Self::StateUpdate { member }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Join { .. } => MessageKind::Join,
            Self::Leave { .. } => MessageKind::Leave,
            Self::StateUpdate { .. } => MessageKind::StateUpdate,
        }
    }

    /// The member record carried by the message.
    pub fn member(&self) -> &Member {
        match self {
            Self::Join { member, .. } | Self::Leave { member, .. } | Self::StateUpdate { member } => {
                member
            }
        }
    }

    /// Whether the message describes the node with id `self_id`.
    pub fn is_from(&self, self_id: &str) -> bool {
        self.member().id == self_id
    }

    /// Check the message is acceptable for publishing or applying.
    ///
    /// Every kind needs a member id; Join and StateUpdate also need a name.
    pub fn validate(&self) -> Result<(), NetworkError> {
        let member = self.member();
        if member.id.is_empty() {
            return Err(NetworkError::InvalidMessage(
                "member ID cannot be empty".to_string(),
            ));
        }
        if self.kind() != MessageKind::Leave && member.name.is_empty() {
            return Err(NetworkError::InvalidMessage(format!(
                "{} message requires a member name",
                self.kind().as_str()
            )));
        }
        Ok(())
    }

    /// Validate and encode the message for the wire.
    pub fn encode(&self) -> Result<Vec<u8>, NetworkError> {
        self.validate()?;
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a message from the wire and validate it.
    pub fn decode(data: &[u8]) -> Result<Self, NetworkError> {
        let message: Self = serde_json::from_slice(data)?;
        message.validate()?;
        Ok(message)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
