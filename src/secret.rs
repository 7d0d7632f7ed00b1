/// Privilege-escalation password, read once from the environment.
///
/// Debug output is redacted and the value is zeroized on drop so it can be
/// carried through config and tasks without ending up in a log line.
use std::fmt;
use zeroize::Zeroizing;

#[derive(Clone)]
pub struct Secret(Zeroizing<String>);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    /// Read the secret from `var`. Only an unset (or non-UTF-8) variable is
    /// `None`; an empty value is a valid, if unusual, password.
    pub fn from_env(var: &str) -> Option<Self> {
        std::env::var(var).ok().map(Self::new)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([REDACTED])")
    }
}
