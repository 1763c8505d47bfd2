/// Connection lifecycle of a [`super::PeerSession`].
///
/// ```text
/// Startup -> Signup -> Offered -> Connected
///    \          \          \          \
///     +----------+----------+----------+--> Closed | Error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Startup,
    Signup,
    Offered,
    Connected,
    Closed,
    Error,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Error)
    }

    pub fn can_advance_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed | Error, _) => false,
            (Startup, Signup) | (Signup, Offered) | (Offered, Connected) => true,
            (_, Closed | Error) => true,
            _ => false,
        }
    }
}
