use std::fmt;

/// DTLS role this endpoint takes once the remote `a=setup:` attribute is known.
///
/// Resolution is directional, not symmetric: remote `active` means the remote
/// side will initiate the DTLS handshake, so we must be the `Server`; remote
/// `passive` means the opposite. Remote `actpass` leaves our current role
/// untouched (we haven't been told anything new).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    Client,
    Server,
}

impl Role {
    /// Applies the remote `a=setup:` value to the current role, returning the
    /// (possibly unchanged) resulting role.
    pub fn resolve(self, remote_setup: &str) -> Self {
        match remote_setup {
            "active" => Role::Server,
            "passive" => Role::Client,
            _ => self,
        }
    }

    /// The `a=setup:` value we advertise in an answer: per RFC 5763, this
    /// names the answerer's own behavior directly (`active` = answerer
    /// initiates the handshake as the DTLS client), not its complement —
    /// the offerer takes the complementary role once it parses this answer.
    pub fn answer_setup(self) -> &'static str {
        match self {
            Role::Client => "active",
            Role::Server => "passive",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Server => write!(f, "server"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_role_string() {
        assert_eq!(Role::Client.to_string(), "client");
        assert_eq!(Role::Server.to_string(), "server");
    }

    #[test]
    fn test_resolve_active_forces_server() {
        assert_eq!(Role::Client.resolve("active"), Role::Server);
        assert_eq!(Role::Server.resolve("active"), Role::Server);
    }

    #[test]
    fn test_resolve_passive_forces_client() {
        assert_eq!(Role::Server.resolve("passive"), Role::Client);
        assert_eq!(Role::Client.resolve("passive"), Role::Client);
    }

    #[test]
    fn test_resolve_actpass_keeps_current_role() {
        assert_eq!(Role::Client.resolve("actpass"), Role::Client);
        assert_eq!(Role::Server.resolve("actpass"), Role::Server);
    }

    #[test]
    fn test_default_role_is_client() {
        assert_eq!(Role::default(), Role::Client);
    }

    #[test]
    fn test_answer_setup_names_own_role_directly() {
        assert_eq!(Role::Client.answer_setup(), "active");
        assert_eq!(Role::Server.answer_setup(), "passive");
    }
}
