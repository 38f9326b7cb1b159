//! Parsing of the run-mode string that selects microservices.

/// Mode keywords that select every registered or creatable microservice.
const ALL_KEYWORDS: [&str; 2] = ["all", "monolith"];

/// Which microservices a run should start.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Everything the manager knows about, in registration order.
    #[default]
    All,
    /// Exactly these names, in the order given.
    Only(Vec<String>),
}

impl RunMode {
    /// Parses `""`, `"all"`, `"monolith"`, a bare name, or a comma-separated
    /// name list. Blank and repeated entries in a list are ignored (first
    /// occurrence wins); a list with no non-blank entries means
    /// [`RunMode::All`]. Keywords are case-sensitive.
    #[must_use]
    pub fn parse(mode: &str) -> Self {
        let mode = mode.trim();
        if mode.is_empty() || ALL_KEYWORDS.contains(&mode) {
            return Self::All;
        }

        let mut names: Vec<String> = Vec::new();
        for name in mode.split(',').map(str::trim).filter(|name| !name.is_empty()) {
            if !names.iter().any(|seen| seen == name) {
                names.push(name.to_owned());
            }
        }

        if names.is_empty() {
            Self::All
        } else {
            Self::Only(names)
        }
    }

    /// Resolves the mode against the known names.
    #[must_use]
    pub fn resolve(&self, known: &[String]) -> Vec<String> {
        match self {
            Self::All => known.to_vec(),
            Self::Only(names) => names.clone(),
        }
    }
}

impl std::str::FromStr for RunMode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_keywords_resolve_to_all() {
        for mode in ["", "all", "monolith", "  ", ",", " , "] {
            assert_eq!(RunMode::parse(mode), RunMode::All, "mode {mode:?}");
        }
    }

    #[test]
    fn list_preserves_given_order() {
        assert_eq!(
            RunMode::parse("svcB,svcA"),
            RunMode::Only(vec!["svcB".into(), "svcA".into()])
        );
        assert_eq!(
            RunMode::parse(" svcA , ,svcB "),
            RunMode::Only(vec!["svcA".into(), "svcB".into()])
        );
    }

    #[test]
    fn repeated_names_collapse_to_first_occurrence() {
        assert_eq!(
            RunMode::parse("svcA,svcB,svcA, svcB"),
            RunMode::Only(vec!["svcA".into(), "svcB".into()])
        );
    }

    #[test]
    fn single_name() {
        assert_eq!(RunMode::parse("svcA"), RunMode::Only(vec!["svcA".into()]));
    }

    #[test]
    fn keywords_are_case_sensitive() {
        assert_eq!(RunMode::parse("ALL"), RunMode::Only(vec!["ALL".into()]));
    }

    #[test]
    fn resolve_expands_all_against_known_names() {
        let known = vec!["a".to_string(), "b".to_string()];
        assert_eq!(RunMode::All.resolve(&known), known);
        assert_eq!(
            RunMode::parse("b").resolve(&known),
            vec!["b".to_string()]
        );
    }
}
