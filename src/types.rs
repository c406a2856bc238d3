// ABOUTME: Newtype identifiers shared across the crate.
// ABOUTME: Session ids stay unique even when host names collide.

use uuid::Uuid;

/// Unique identifier for one established session.
///
/// Sessions are routed by host name but addressed internally by id, so two
/// descriptors resolving to the same host never clash inside the multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
