//! Journal tokens and query requests.
//!
//! A token names a position in the journal: `(run_id, generation, seq_nr)`.
//! `run_id` and `generation` together identify an epoch; `seq_nr` is only
//! meaningful inside that epoch. Text form:
//!
//! ```text
//! :internal:<run_id>:<generation>:<seq_nr>
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TokenError;

pub const TOKEN_PREFIX: &str = ":internal:";

/// Text a client sends when it has no token yet.
pub const BOOTSTRAP_SENTINEL: &str = "bootstrap";

/// Identity of one journal epoch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Epoch {
    pub run_id: String,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Token {
    pub run_id: String,
    pub generation: u64,
    pub seq_nr: u64,
}

impl Token {
    pub fn new(run_id: impl Into<String>, generation: u64, seq_nr: u64) -> Self {
        Self {
            run_id: run_id.into(),
            generation,
            seq_nr,
        }
    }

    pub fn epoch(&self) -> Epoch {
        Epoch {
            run_id: self.run_id.clone(),
            generation: self.generation,
        }
    }

    /// True when both tokens belong to the same epoch. Tokens from different
    /// epochs must never be ordered by `seq_nr`.
    pub fn same_epoch(&self, other: &Token) -> bool {
        self.run_id == other.run_id && self.generation == other.generation
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{TOKEN_PREFIX}{}:{}:{}",
            self.run_id, self.generation, self.seq_nr
        )
    }
}

impl FromStr for Token {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(TOKEN_PREFIX)
            .ok_or_else(|| TokenError::MissingPrefix(s.to_string()))?;

        let fields: Vec<&str> = rest.split(':').collect();
        let [run_id, generation, seq_nr] = fields.as_slice() else {
            return Err(TokenError::Shape(s.to_string()));
        };
        if run_id.is_empty() {
            return Err(TokenError::EmptyRunId(s.to_string()));
        }

        let generation = parse_field(s, generation, "generation")?;
        let seq_nr = parse_field(s, seq_nr, "seq_nr")?;
        Ok(Token::new(*run_id, generation, seq_nr))
    }
}

fn parse_field(text: &str, field: &str, name: &'static str) -> Result<u64, TokenError> {
    // u64::from_str accepts a leading '+', which would break exact round-trips.
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TokenError::NotNumeric {
            text: text.to_string(),
            field: name,
        });
    }
    field.parse().map_err(|_| TokenError::NotNumeric {
        text: text.to_string(),
        field: name,
    })
}

impl Serialize for Token {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Token {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// What a client knows when it asks for changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryRequest {
    /// "I know nothing"; always answered with rescan-required.
    Bootstrap,
    Since(Token),
}

impl QueryRequest {
    /// Interpret client-supplied text. Anything that is not a well-formed
    /// token is a bootstrap request; it can never match a live epoch anyway.
    pub fn from_text(text: &str) -> Self {
        match text.trim().parse::<Token>() {
            Ok(token) => QueryRequest::Since(token),
            Err(_) => QueryRequest::Bootstrap,
        }
    }

    pub fn to_text(&self) -> String {
        match self {
            QueryRequest::Bootstrap => BOOTSTRAP_SENTINEL.to_string(),
            QueryRequest::Since(token) => token.to_string(),
        }
    }
}

impl From<Token> for QueryRequest {
    fn from(token: Token) -> Self {
        QueryRequest::Since(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_wire_form() {
        let token = Token::new("test", 3, 42);
        assert_eq!(token.to_string(), ":internal:test:3:42");
    }

    #[test]
    fn parse_round_trips_exactly() {
        let text = ":internal:1f2e.17a9c0:0:18446744073709551615";
        let token: Token = text.parse().expect("parse");
        assert_eq!(token.seq_nr, u64::MAX);
        assert_eq!(token.to_string(), text);
    }

    #[test]
    fn same_epoch_ignores_seq_nr() {
        let a = Token::new("run", 1, 5);
        let b = Token::new("run", 1, 900);
        let c = Token::new("run", 2, 5);
        assert!(a.same_epoch(&b));
        assert!(!a.same_epoch(&c));
    }

    #[test]
    fn unparseable_text_is_bootstrap() {
        assert_eq!(QueryRequest::from_text(""), QueryRequest::Bootstrap);
        assert_eq!(QueryRequest::from_text("builtin:fake"), QueryRequest::Bootstrap);
        assert_eq!(
            QueryRequest::from_text(" :internal:r:1:2\n"),
            QueryRequest::Since(Token::new("r", 1, 2))
        );
    }

    #[test]
    fn serde_round_trips_through_text_form() {
        let token = Token::new("test", 0, 7);
        let yaml = serde_yaml::to_string(&token).expect("serialize");
        assert!(yaml.contains(":internal:test:0:7"), "got: {yaml}");
        let back: Token = serde_yaml::from_str(&yaml).expect("deserialize");
        assert_eq!(back, token);
    }
}
