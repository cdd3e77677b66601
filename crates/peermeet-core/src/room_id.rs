use std::fmt;
use std::str::FromStr;

use url::Url;

use crate::errors::MeetError;

/// Path prefix under which meetings are addressed: `/m/<roomId>`.
pub const ROOM_PATH_PREFIX: &str = "/m/";

/// Rendezvous key shared by every participant of one meeting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId(String);

impl RoomId {
    /// Generate a fresh identifier for a new meeting.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Accepts a bare identifier, a `/m/<id>` path, or a full URL with that
    /// path. Query strings and fragments are ignored.
    pub fn parse(input: &str) -> Result<Self, MeetError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(MeetError::InvalidRoomId("empty room id".into()));
        }

        let candidate = if input.contains("://") {
            let url = Url::parse(input)
                .map_err(|e| MeetError::InvalidRoomId(format!("{input}: {e}")))?;
            Self::strip_room_path(url.path())
                .ok_or_else(|| MeetError::InvalidRoomId(format!("{input}: expected /m/<room>")))?
                .to_string()
        } else if input.starts_with('/') {
            let path = input.split(['?', '#']).next().unwrap_or_default();
            Self::strip_room_path(path)
                .ok_or_else(|| MeetError::InvalidRoomId(format!("{input}: expected /m/<room>")))?
                .to_string()
        } else {
            input.trim_end_matches('/').to_string()
        };

        Self::validate(&candidate)?;
        Ok(Self(candidate))
    }

    fn strip_room_path(path: &str) -> Option<&str> {
        path.trim_end_matches('/').strip_prefix(ROOM_PATH_PREFIX)
    }

    fn validate(id: &str) -> Result<(), MeetError> {
        if id.is_empty() {
            return Err(MeetError::InvalidRoomId("empty room id".into()));
        }
        if id.contains('/') || id.chars().any(char::is_whitespace) {
            return Err(MeetError::InvalidRoomId(format!("{id}: contains '/' or whitespace")));
        }
        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Room URL path, e.g. `/m/3f2c...`.
    pub fn path(&self) -> String {
        format!("{ROOM_PATH_PREFIX}{}", self.0)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RoomId {
    type Err = MeetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for RoomId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
