use std::fmt::{Display, Formatter};

/// A request path on a CometBFT RPC node, always starting with '/'.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path(String);

impl Path {
    pub fn status() -> Self {
        Path::from("/status")
    }

    pub fn block(height: u64) -> Self {
        Path(format!("/block?height={}", height))
    }

    pub fn block_results(height: u64) -> Self {
        Path(format!("/block_results?height={}", height))
    }

    /// Route name without the query string, used as a metric label.
    pub fn route(&self) -> &str {
        match self.0.split_once('?') {
            Some((route, _)) => route,
            None => &self.0,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Path {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Path {
    fn from(path: &str) -> Self {
        if path.starts_with('/') {
            Path(path.to_string())
        } else {
            Path(format!("/{}", path))
        }
    }
}

impl AsRef<str> for Path {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leading_slash_is_added() {
        assert_eq!(Path::from("health").as_str(), "/health");
        assert_eq!(Path::from("/health").as_str(), "/health");
    }

    #[test]
    fn test_height_routes() {
        assert_eq!(Path::block(42).as_str(), "/block?height=42");
        assert_eq!(Path::block_results(7).as_str(), "/block_results?height=7");
        assert_eq!(Path::status().as_str(), "/status");
    }

    #[test]
    fn test_route_strips_query() {
        assert_eq!(Path::block(42).route(), "/block");
        assert_eq!(Path::status().route(), "/status");
    }
}
