//! Message envelope
//!
//! A [`Message`] is an action/state/time header plus an ordered list of
//! opaque content frames. Frames are [`Bytes`], so handing a message to
//! another task clones reference counts instead of buffers, and no frame is
//! ever mutated in place.

use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat};
use serde::{Deserialize, Serialize};

/// Verb carried by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Action {
    Undefined = 1,
    Init = 2,
    Refer = 3,
    Checkin = 4,
    Checkout = 5,
    Join = 6,
    Invite = 7,
    Heartbeat = 8,
    Crash = 9,
    Vote = 10,
    Upgrade = 11,
    Update = 12,
    Terminate = 13,
    Lock = 14,
    Unlock = 15,
    UserRequest = 16,
}

impl Action {
    pub const ALL: [Action; 16] = [
        Action::Undefined,
        Action::Init,
        Action::Refer,
        Action::Checkin,
        Action::Checkout,
        Action::Join,
        Action::Invite,
        Action::Heartbeat,
        Action::Crash,
        Action::Vote,
        Action::Upgrade,
        Action::Update,
        Action::Terminate,
        Action::Lock,
        Action::Unlock,
        Action::UserRequest,
    ];

    /// Decode a wire byte. Unknown values become [`Action::Undefined`].
    pub fn from_u8(value: u8) -> Self {
        match value {
            2 => Action::Init,
            3 => Action::Refer,
            4 => Action::Checkin,
            5 => Action::Checkout,
            6 => Action::Join,
            7 => Action::Invite,
            8 => Action::Heartbeat,
            9 => Action::Crash,
            10 => Action::Vote,
            11 => Action::Upgrade,
            12 => Action::Update,
            13 => Action::Terminate,
            14 => Action::Lock,
            15 => Action::Unlock,
            16 => Action::UserRequest,
            _ => Action::Undefined,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Undefined => "undefined",
            Action::Init => "init",
            Action::Refer => "refer",
            Action::Checkin => "checkin",
            Action::Checkout => "checkout",
            Action::Join => "join",
            Action::Invite => "invite",
            Action::Heartbeat => "heartbeat",
            Action::Crash => "crash",
            Action::Vote => "vote",
            Action::Upgrade => "upgrade",
            Action::Update => "update",
            Action::Terminate => "terminate",
            Action::Lock => "lock",
            Action::Unlock => "unlock",
            Action::UserRequest => "user_request",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle phase of a message.
///
/// `Probe -> {Ask, Succeed, Failed}`, `Ask -> {Succeed, Failed}`,
/// `Failed -> Probe` on retry or `Error` on escalation. `Local` never
/// crosses the wire and is used to seed a probe cycle from a timer tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum State {
    Probe = 1,
    Ask = 2,
    Succeed = 3,
    Failed = 4,
    Error = 5,
    Local = 6,
}

impl State {
    /// Decode a wire byte. Unknown values become [`State::Probe`].
    pub fn from_u8(value: u8) -> Self {
        match value {
            2 => State::Ask,
            3 => State::Succeed,
            4 => State::Failed,
            5 => State::Error,
            6 => State::Local,
            _ => State::Probe,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            State::Probe => "probe",
            State::Ask => "ask",
            State::Succeed => "succeed",
            State::Failed => "failed",
            State::Error => "error",
            State::Local => "local",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub fn now_nanos() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => i64::try_from(elapsed.as_nanos()).unwrap_or(i64::MAX),
        Err(before) => -i64::try_from(before.duration().as_nanos()).unwrap_or(i64::MAX),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    action: Action,
    state: State,
    timestamp: i64,
    contents: Vec<Bytes>,
    visit_count: u32,
}

impl Message {
    /// New message stamped with the current time.
    pub fn new(action: Action, state: State) -> Self {
        Self::with_time(action, state, now_nanos())
    }

    pub fn with_time(action: Action, state: State, timestamp: i64) -> Self {
        Self {
            action,
            state,
            timestamp,
            contents: Vec::new(),
            visit_count: 0,
        }
    }

    /// Builder-style helper appending one content frame.
    pub fn with_content(mut self, frame: impl Into<Bytes>) -> Self {
        self.contents.push(frame.into());
        self
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Nanoseconds since the Unix epoch.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn set_action(&mut self, action: Action) {
        self.action = action;
    }

    pub fn set_state(&mut self, state: State) {
        self.state = state;
    }

    pub fn set_timestamp(&mut self, timestamp: i64) {
        self.timestamp = timestamp;
    }

    /// Re-stamp with the current time.
    pub fn touch(&mut self) {
        self.timestamp = now_nanos();
    }

    pub fn visit_count(&self) -> u32 {
        self.visit_count
    }

    /// Record one more pass through the retry path.
    pub fn visit(&mut self) {
        self.visit_count = self.visit_count.saturating_add(1);
    }

    pub fn append_content(&mut self, frame: impl Into<Bytes>) {
        self.contents.push(frame.into());
    }

    pub fn clear_contents(&mut self) {
        self.contents.clear();
    }

    pub fn set_contents(&mut self, frames: Vec<Bytes>) {
        self.contents = frames;
    }

    pub fn content(&self, index: usize) -> Option<&Bytes> {
        self.contents.get(index)
    }

    pub fn contents(&self) -> &[Bytes] {
        &self.contents
    }

    pub fn into_contents(self) -> Vec<Bytes> {
        self.contents
    }

    /// Content frame as UTF-8, if present and valid.
    pub fn content_str(&self, index: usize) -> Option<&str> {
        self.contents
            .get(index)
            .and_then(|frame| std::str::from_utf8(frame).ok())
    }

    /// Copy of this message in another state, keeping visit history.
    pub fn transitioned(&self, state: State) -> Self {
        let mut next = self.clone();
        next.state = state;
        next
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let time = DateTime::from_timestamp_nanos(self.timestamp)
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        write!(
            f,
            "Message[action={} state={} time={} visits={} contents=[",
            self.action, self.state, time, self.visit_count
        )?;
        for (i, frame) in self.contents.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{:?}", String::from_utf8_lossy(frame))?;
        }
        f.write_str("]]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_normalizes_unknown_bytes() {
        assert_eq!(Action::from_u8(0), Action::Undefined);
        assert_eq!(Action::from_u8(17), Action::Undefined);
        assert_eq!(Action::from_u8(255), Action::Undefined);
        for action in Action::ALL {
            assert_eq!(Action::from_u8(action.as_u8()), action);
        }
    }

    #[test]
    fn test_state_normalizes_unknown_bytes() {
        assert_eq!(State::from_u8(0), State::Probe);
        assert_eq!(State::from_u8(7), State::Probe);
        assert_eq!(State::from_u8(4), State::Failed);
        assert_eq!(State::from_u8(6), State::Local);
    }

    #[test]
    fn test_content_mutators() {
        let mut msg = Message::new(Action::Update, State::Probe)
            .with_content("client")
            .with_content(&b"key"[..]);
        assert_eq!(msg.contents().len(), 2);
        assert_eq!(msg.content_str(0), Some("client"));
        assert_eq!(msg.content(1).map(|b| b.as_ref()), Some(&b"key"[..]));
        assert!(msg.content(2).is_none());

        msg.clear_contents();
        assert!(msg.contents().is_empty());

        msg.set_contents(vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        msg.append_content(vec![b'c']);
        assert_eq!(msg.content_str(2), Some("c"));
    }

    #[test]
    fn test_clone_shares_frames_without_aliasing_mutation() {
        let original = Message::new(Action::Lock, State::Ask).with_content("owner");
        let mut forwarded = original.clone();
        forwarded.append_content("extra");
        forwarded.set_state(State::Succeed);

        assert_eq!(original.contents().len(), 1);
        assert_eq!(original.state(), State::Ask);
        assert_eq!(forwarded.contents().len(), 2);
    }

    #[test]
    fn test_transitioned_keeps_visits() {
        let mut msg = Message::with_time(Action::Refer, State::Probe, 42);
        msg.visit();
        let failed = msg.transitioned(State::Failed);
        assert_eq!(failed.state(), State::Failed);
        assert_eq!(failed.visit_count(), 1);
        assert_eq!(failed.timestamp(), 42);
        assert_eq!(msg.state(), State::Probe);
    }

    #[test]
    fn test_display() {
        let msg = Message::with_time(Action::Heartbeat, State::Succeed, 0).with_content("hi");
        assert_eq!(
            msg.to_string(),
            "Message[action=heartbeat state=succeed time=1970-01-01T00:00:00.000Z visits=0 contents=[\"hi\"]]"
        );
    }
}
