use std::fmt;

use uuid::Uuid;

/// Stable identity of one participating process.
///
/// This is the `owner` value in every table. It is chosen once at startup
/// and injected into every component that needs it; there is no hidden
/// global. The generated form is `host-pid-suffix`, readable enough to find
/// the holder of a stuck permit from the database alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessId(String);

impl ProcessId {
    pub fn generate() -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        ProcessId(format!(
            "{}-{}-{}",
            hostname(),
            std::process::id(),
            &suffix[..8]
        ))
    }

    /// Use an explicit identity instead of a generated one. Callers are
    /// responsible for uniqueness across all participating processes.
    pub fn from_name(name: impl Into<String>) -> Self {
        ProcessId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Get the system hostname, or "localhost" if it can't be determined.
fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| "localhost".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_unique() {
        let a = ProcessId::generate();
        let b = ProcessId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_generate_contains_pid() {
        let id = ProcessId::generate();
        assert!(id.as_str().contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_from_name_round_trips() {
        let id = ProcessId::from_name("worker-7");
        assert_eq!(id.as_str(), "worker-7");
        assert_eq!(id.to_string(), "worker-7");
    }
}
