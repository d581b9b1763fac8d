//! Equality-based label selectors.

use std::collections::BTreeMap;
use std::fmt;

/// Conjunction of `key=value` requirements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector(BTreeMap<String, String>);

impl LabelSelector {
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// An empty selector matches everything.
    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.0.iter().all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
    }
}

/// Renders in `ListParams::labels` syntax.
impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{}={}", k, v)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn requires_every_pair() {
        let sel = LabelSelector::from_pairs([("a", "1"), ("b", "2")]);
        assert!(sel.matches(Some(&labels(&[("a", "1"), ("b", "2"), ("c", "3")]))));
        assert!(!sel.matches(Some(&labels(&[("a", "1")]))));
        assert!(!sel.matches(Some(&labels(&[("a", "1"), ("b", "x")]))));
        assert!(!sel.matches(None));
    }

    #[test]
    fn empty_matches_all() {
        let sel = LabelSelector::default();
        assert!(sel.is_empty());
        assert!(sel.matches(None));
        assert_eq!(sel.to_string(), "");
    }
}
