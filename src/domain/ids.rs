use uuid::Uuid;

/// Generates an opaque id with a typed prefix, e.g. `new_id("run_")`.
///
/// The uuid is compacted to its simple (hyphen-free) form so ids stay
/// readable in log lines and URLs.
pub fn new_id(prefix: &str) -> String {
    format!("{}{}", prefix, Uuid::new_v4().simple())
}

/// Short request correlation id for log lines and error responses.
pub fn new_request_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_id_carries_prefix() {
        let id = new_id("run_");
        assert!(id.starts_with("run_"));
        assert!(id.len() > 10);
    }

    #[test]
    fn test_new_id_unique() {
        assert_ne!(new_id("conf_"), new_id("conf_"));
    }

    #[test]
    fn test_request_id_short() {
        assert_eq!(new_request_id().len(), 8);
    }
}
