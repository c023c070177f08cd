// ============================================================================
// WQL subset
// ============================================================================
//
// Enough of WQL for the loopback provider:
//
//   SELECT * | field[, field...] FROM Class [WHERE Prop = "text" | number]
//
// Keywords and identifiers compare case-insensitively.
//
// ============================================================================

use lazy_static::lazy_static;
use regex::Regex;

use crate::core::codec::{variant_to_u64, wql_unquote};
use crate::core::{Instance, Result, StoreError};

lazy_static! {
    static ref SELECT_RE: Regex = Regex::new(
        r#"(?is)^\s*SELECT\s+(?P<fields>\*|[A-Za-z_]\w*(?:\s*,\s*[A-Za-z_]\w*)*)\s+FROM\s+(?P<class>[A-Za-z_]\w*)(?:\s+WHERE\s+(?P<prop>[A-Za-z_]\w*)\s*=\s*(?:"(?P<text>(?:[^"\\]|\\.)*)"|(?P<num>\d+)))?\s*$"#
    )
    .expect("static WQL pattern compiles");
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Literal {
    Text(String),
    Number(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    /// `None` selects every property.
    pub fields: Option<Vec<String>>,
    pub class: String,
    pub filter: Option<(String, Literal)>,
}

impl Query {
    pub fn parse(text: &str) -> Result<Self> {
        let caps = SELECT_RE
            .captures(text)
            .ok_or_else(|| StoreError::Query(text.to_string()))?;

        let fields = match &caps["fields"] {
            "*" => None,
            list => Some(list.split(',').map(|f| f.trim().to_string()).collect()),
        };

        let filter = caps.name("prop").map(|prop| {
            let literal = match (caps.name("text"), caps.name("num")) {
                (Some(text), _) => Literal::Text(wql_unquote(text.as_str())),
                (None, Some(num)) => Literal::Number(num.as_str().parse().unwrap_or(u64::MAX)),
                (None, None) => Literal::Text(String::new()),
            };
            (prop.as_str().to_string(), literal)
        });

        Ok(Self {
            fields,
            class: caps["class"].to_string(),
            filter,
        })
    }

    pub fn is_class(&self, class: &str) -> bool {
        self.class.eq_ignore_ascii_case(class)
    }

    /// Whether `instance` satisfies the class and WHERE clause.
    pub fn matches(&self, instance: &Instance) -> bool {
        if !self.is_class(instance.class()) {
            return false;
        }

        let Some((prop, literal)) = &self.filter else {
            return true;
        };

        let value = instance
            .properties()
            .find(|(name, _)| name.eq_ignore_ascii_case(prop))
            .map(|(_, v)| v);

        match (value, literal) {
            (Some(v), Literal::Text(expected)) => v.as_string().as_deref() == Some(expected.as_str()),
            (Some(v), Literal::Number(expected)) => {
                v.as_bstr().is_none() && !v.is_empty() && variant_to_u64(v) == *expected
            }
            (None, _) => false,
        }
    }

    /// Apply the field list to a matching instance.
    pub fn select(&self, instance: &Instance) -> Instance {
        match &self.fields {
            None => instance.clone(),
            Some(fields) => instance.project(fields),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Variant;

    #[test]
    fn test_parse_select_star_with_text_filter() {
        let q = Query::parse(r#"SELECT * from CitrixXenStoreWatchEvent WHERE EventId="data/a \"b\"""#).unwrap();
        assert_eq!(q.fields, None);
        assert_eq!(q.class, "CitrixXenStoreWatchEvent");
        assert_eq!(
            q.filter,
            Some(("EventId".to_string(), Literal::Text(r#"data/a "b""#.to_string())))
        );
    }

    #[test]
    fn test_parse_numeric_filter_and_fields() {
        let q = Query::parse("select Name, Domain FROM Win32_ComputerSystem where SessionId=42").unwrap();
        assert_eq!(q.fields, Some(vec!["Name".to_string(), "Domain".to_string()]));
        assert_eq!(q.filter, Some(("SessionId".to_string(), Literal::Number(42))));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(Query::parse("DELETE FROM x"), Err(StoreError::Query(_))));
        assert!(Query::parse("SELECT * FROM").is_err());
    }

    #[test]
    fn test_matches() {
        let q = Query::parse("SELECT * FROM CitrixXenStoreSession WHERE SessionId=7").unwrap();
        let hit = Instance::new("CitrixXenStoreSession").with("SessionId", Variant::UI4(7));
        let miss = Instance::new("CitrixXenStoreSession").with("SessionId", Variant::UI4(8));
        let other = Instance::new("CitrixXenStoreBase").with("SessionId", Variant::UI4(7));
        assert!(q.matches(&hit));
        assert!(!q.matches(&miss));
        assert!(!q.matches(&other));

        let q = Query::parse(r#"SELECT * FROM citrixxenstoresession WHERE Id="svc : a""#).unwrap();
        assert!(q.matches(&Instance::new("CitrixXenStoreSession").with("Id", "svc : a")));
    }
}
