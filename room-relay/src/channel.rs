use thiserror::Error;

pub const DEFAULT_CHANNEL_PREFIX: &str = "wsb:";

const MAX_ROOM_ID_LEN: usize = 256;
const GLOB_METACHARACTERS: &[char] = &['*', '?', '[', ']', '\\'];

/// Maps room ids onto bus channel names and back.
///
/// Every room lives at `prefix + room_id`, and a single `prefix*` pattern
/// subscription covers all of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelNaming {
    prefix: String,
}

impl ChannelNaming {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn channel(&self, room_id: &str) -> String {
        format!("{}{}", self.prefix, room_id)
    }

    pub fn pattern(&self) -> String {
        format!("{}*", self.prefix)
    }

    /// Recovers the room id from a channel name, or `None` if the channel is
    /// outside this prefix or names no room.
    pub fn room_id<'a>(&self, channel: &'a str) -> Option<&'a str> {
        channel
            .strip_prefix(self.prefix.as_str())
            .filter(|room_id| !room_id.is_empty())
    }
}

impl Default for ChannelNaming {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_PREFIX)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoomIdError {
    #[error("room id cannot be empty")]
    Empty,
    #[error("room id exceeds 256 bytes")]
    TooLong,
    #[error("room id contains disallowed character {0:?}")]
    InvalidChar(char),
}

/// Rejects room ids that would not survive the trip through a bus channel
/// name or that could widen a pattern subscription.
pub fn validate_room_id(room_id: &str) -> Result<(), RoomIdError> {
    if room_id.is_empty() {
        return Err(RoomIdError::Empty);
    }
    if room_id.len() > MAX_ROOM_ID_LEN {
        return Err(RoomIdError::TooLong);
    }
    if let Some(bad) = room_id
        .chars()
        .find(|c| c.is_whitespace() || c.is_control() || GLOB_METACHARACTERS.contains(c))
    {
        return Err(RoomIdError::InvalidChar(bad));
    }
    Ok(())
}
