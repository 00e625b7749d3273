//! Message protocol definitions
//!
//! Plaintext payloads carried inside encrypted frames. Requests are
//! `:`-delimited and tagged by a leading prefix; they are parsed exactly once
//! into [`Request`] so dispatch can match exhaustively on the variant.

use std::fmt;

use crate::error::ParseError;

/// Tag prefix of an entrance (register/login) request
pub const ENTRANCE_TAG: &str = "ENTRANCE:";
/// Tag prefix of a broadcast message
pub const BROADCAST_TAG: &str = "BROADCAST:";
/// Tag prefix of a private message
pub const PRIVATE_TAG: &str = "PRIVATE:";

/// Entrance accepted; followed by `-` and the history blob
pub const SUCCESSFUL_ENTRY: &str = "ENTERED SUCCESSFULLY";
/// Login credentials did not match the store
pub const WRONG_DETAILS: &str = "WRONG DETAILS";
/// Requested username is online or already registered
pub const USERNAME_TAKEN: &str = "USERNAME TAKEN";
/// Private message recipient is not connected
pub const USER_NOT_FOUND: &str = "** Requested user does not exist, or is not connected **";
/// Request could not be decoded or is not allowed in the current state
pub const INVALID_REQUEST: &str = "INVALID REQUEST";

/// Plaintext acknowledgment sent once the session key is installed
pub const KEY_ACK: &str = "got the key!";

/// How a client wants to enter the chat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntranceMode {
    /// Create a new account
    Register,
    /// Authenticate against an existing account
    Login,
}

impl EntranceMode {
    fn as_str(self) -> &'static str {
        match self {
            EntranceMode::Register => "register",
            EntranceMode::Login => "login",
        }
    }
}

/// Client → Server request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `ENTRANCE:<register|login>:<username>:<password>`
    Entrance {
        mode: EntranceMode,
        username: String,
        password: String,
    },
    /// `BROADCAST:<sender>:<message>`
    Broadcast { sender: String, body: String },
    /// `PRIVATE:<sender>:<recipient>@<message>`
    Private {
        sender: String,
        recipient: String,
        body: String,
    },
}

impl Request {
    /// Decode a decrypted payload into a request.
    ///
    /// The last field of every shape keeps any further delimiters, so
    /// passwords and message bodies may contain `:` (and `@` for bodies).
    pub fn parse(payload: &str) -> Result<Self, ParseError> {
        if let Some(rest) = payload.strip_prefix(ENTRANCE_TAG) {
            let mut fields = rest.splitn(3, ':');
            let mode = match fields.next() {
                Some("register") => EntranceMode::Register,
                Some("login") => EntranceMode::Login,
                Some(other) => return Err(ParseError::InvalidMode(other.to_string())),
                None => return Err(ParseError::MissingField("mode")),
            };
            let username = fields.next().ok_or(ParseError::MissingField("username"))?;
            let password = fields.next().ok_or(ParseError::MissingField("password"))?;
            Ok(Request::Entrance {
                mode,
                username: non_empty(username, "username")?,
                password: password.to_string(),
            })
        } else if let Some(rest) = payload.strip_prefix(BROADCAST_TAG) {
            let (sender, body) = rest
                .split_once(':')
                .ok_or(ParseError::MissingField("message"))?;
            Ok(Request::Broadcast {
                sender: non_empty(sender, "sender")?,
                body: body.to_string(),
            })
        } else if let Some(rest) = payload.strip_prefix(PRIVATE_TAG) {
            let (sender, target) = rest
                .split_once(':')
                .ok_or(ParseError::MissingField("recipient"))?;
            let (recipient, body) = target
                .split_once('@')
                .ok_or(ParseError::MissingField("message"))?;
            Ok(Request::Private {
                sender: non_empty(sender, "sender")?,
                recipient: non_empty(recipient, "recipient")?,
                body: body.to_string(),
            })
        } else {
            Err(ParseError::UnknownTag)
        }
    }
}

fn non_empty(field: &str, name: &'static str) -> Result<String, ParseError> {
    if field.is_empty() {
        Err(ParseError::EmptyField(name))
    } else {
        Ok(field.to_string())
    }
}

/// Renders the wire form of the request.
impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Entrance {
                mode,
                username,
                password,
            } => write!(f, "{}{}:{}:{}", ENTRANCE_TAG, mode.as_str(), username, password),
            Request::Broadcast { sender, body } => write!(f, "{}{}:{}", BROADCAST_TAG, sender, body),
            Request::Private {
                sender,
                recipient,
                body,
            } => write!(f, "{}{}:{}@{}", PRIVATE_TAG, sender, recipient, body),
        }
    }
}

/// Server → Client plaintext
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Entrance accepted, with the full history blob
    Entered { history: String },
    /// Login rejected
    WrongDetails,
    /// Username already online or registered
    UsernameTaken,
    /// Private message recipient missing
    UserNotFound,
    /// Malformed or out-of-state request
    InvalidRequest,
    /// Broadcast delivery
    Broadcast { sender: String, body: String },
    /// Private delivery (recipient is not repeated)
    Private { sender: String, body: String },
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Entered { history } => write!(f, "{}-{}", SUCCESSFUL_ENTRY, history),
            Response::WrongDetails => f.write_str(WRONG_DETAILS),
            Response::UsernameTaken => f.write_str(USERNAME_TAKEN),
            Response::UserNotFound => f.write_str(USER_NOT_FOUND),
            Response::InvalidRequest => f.write_str(INVALID_REQUEST),
            Response::Broadcast { sender, body } => write!(f, "{}{}:{}", BROADCAST_TAG, sender, body),
            Response::Private { sender, body } => write!(f, "{}{}:{}", PRIVATE_TAG, sender, body),
        }
    }
}

/// Every parse failure is answered with the generic marker
impl From<ParseError> for Response {
    fn from(_: ParseError) -> Self {
        Response::InvalidRequest
    }
}
