use crate::error::ClientError;

/// Identity and relay address the user has committed to.
///
/// Readiness is derived on every call, so callers cannot hold a stale answer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceGate {
    identity: String,
    target: String,
    locked: bool,
}

impl PresenceGate {
    pub fn new(identity: impl AsRef<str>, target: impl AsRef<str>) -> Self {
        Self {
            identity: identity.as_ref().trim().to_string(),
            target: target.as_ref().trim().to_string(),
            locked: false,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn set_identity(&mut self, identity: &str) -> Result<(), ClientError> {
        self.ensure_unlocked()?;
        self.identity = identity.trim().to_string();
        Ok(())
    }

    pub fn set_target(&mut self, target: &str) -> Result<(), ClientError> {
        self.ensure_unlocked()?;
        self.target = target.trim().to_string();
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        !self.identity.is_empty() && !self.target.is_empty()
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn unlock(&mut self) {
        self.locked = false;
    }

    fn ensure_unlocked(&self) -> Result<(), ClientError> {
        if self.locked {
            return Err(ClientError::IdentityLocked);
        }
        Ok(())
    }
}
