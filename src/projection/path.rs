// idShortPath grammar: dot-separated idShort segments, with `[i]` index
// suffixes addressing children of a SubmodelElementList.
//
//   Stack[0].Temperature  ->  IdShort("Stack"), Index(0), IdShort("Temperature")

use std::fmt;

use crate::error::{Result, TitanError};
use crate::validation::validate_id_short;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathToken {
    IdShort(String),
    Index(usize),
}

/// A parsed, validated idShortPath.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdShortPath {
    tokens: Vec<PathToken>,
}

impl IdShortPath {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(TitanError::InvalidPath("empty path".to_string()));
        }

        let mut tokens = Vec::new();
        for segment in raw.split('.') {
            if segment.is_empty() {
                return Err(TitanError::InvalidPath(format!("empty segment in {raw:?}")));
            }
            let (name, indices) = split_indices(segment, raw)?;
            validate_id_short(name).map_err(|_| {
                TitanError::InvalidPath(format!("invalid idShort {name:?} in {raw:?}"))
            })?;
            tokens.push(PathToken::IdShort(name.to_string()));
            tokens.extend(indices.into_iter().map(PathToken::Index));
        }
        Ok(Self { tokens })
    }

    pub fn tokens(&self) -> &[PathToken] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Path without its final token, and that token. A single-token path
    /// yields an empty parent (the submodel root).
    pub fn split_last(&self) -> (IdShortPath, &PathToken) {
        let (last, head) = self.tokens.split_last().expect("path is never empty");
        (
            IdShortPath {
                tokens: head.to_vec(),
            },
            last,
        )
    }

    /// Extend with one more idShort segment.
    pub fn child(&self, id_short: &str) -> IdShortPath {
        let mut tokens = self.tokens.clone();
        tokens.push(PathToken::IdShort(id_short.to_string()));
        IdShortPath { tokens }
    }

    /// Extend with a list index.
    pub fn indexed(&self, index: usize) -> IdShortPath {
        let mut tokens = self.tokens.clone();
        tokens.push(PathToken::Index(index));
        IdShortPath { tokens }
    }

    pub(crate) fn from_tokens(tokens: Vec<PathToken>) -> Self {
        Self { tokens }
    }
}

impl fmt::Display for IdShortPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, token) in self.tokens.iter().enumerate() {
            match token {
                PathToken::IdShort(name) => {
                    if i > 0 {
                        write!(f, ".")?;
                    }
                    write!(f, "{name}")?;
                }
                PathToken::Index(index) => write!(f, "[{index}]")?,
            }
        }
        Ok(())
    }
}

fn split_indices<'a>(segment: &'a str, raw: &str) -> Result<(&'a str, Vec<usize>)> {
    let Some(bracket) = segment.find('[') else {
        if segment.contains(']') {
            return Err(TitanError::InvalidPath(format!("stray ']' in {raw:?}")));
        }
        return Ok((segment, Vec::new()));
    };

    let name = &segment[..bracket];
    let mut indices = Vec::new();
    let mut rest = &segment[bracket..];
    while !rest.is_empty() {
        if !rest.starts_with('[') {
            return Err(TitanError::InvalidPath(format!("malformed index in {raw:?}")));
        }
        let Some(close) = rest.find(']') else {
            return Err(TitanError::InvalidPath(format!("unterminated index in {raw:?}")));
        };
        let digits = &rest[1..close];
        let index: usize = digits
            .parse()
            .map_err(|_| TitanError::InvalidPath(format!("bad index {digits:?} in {raw:?}")))?;
        indices.push(index);
        rest = &rest[close + 1..];
    }
    Ok((name, indices))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_path() {
        let path = IdShortPath::parse("Temperature").unwrap();
        assert_eq!(path.tokens(), &[PathToken::IdShort("Temperature".into())]);
        assert_eq!(path.to_string(), "Temperature");
    }

    #[test]
    fn test_nested_with_index() {
        let path = IdShortPath::parse("Stack[0].Temperature").unwrap();
        assert_eq!(
            path.tokens(),
            &[
                PathToken::IdShort("Stack".into()),
                PathToken::Index(0),
                PathToken::IdShort("Temperature".into()),
            ]
        );
        assert_eq!(path.to_string(), "Stack[0].Temperature");
    }

    #[test]
    fn test_double_index() {
        let path = IdShortPath::parse("Matrix[1][2]").unwrap();
        assert_eq!(
            path.tokens(),
            &[
                PathToken::IdShort("Matrix".into()),
                PathToken::Index(1),
                PathToken::Index(2),
            ]
        );
    }

    #[test]
    fn test_malformed_paths() {
        for bad in ["", ".", "a..b", "a[", "a[]", "a[x]", "a]b", "9a", "a[1]x"] {
            assert!(
                matches!(IdShortPath::parse(bad), Err(TitanError::InvalidPath(_))),
                "expected InvalidPath for {bad:?}"
            );
        }
    }

    #[test]
    fn test_split_last() {
        let path = IdShortPath::parse("Stack[0].Temperature").unwrap();
        let (parent, last) = path.split_last();
        assert_eq!(parent.to_string(), "Stack[0]");
        assert_eq!(last, &PathToken::IdShort("Temperature".into()));
    }
}
