//! Selector parser built on nom 8.

use std::collections::BTreeSet;

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, multispace0, multispace1},
    combinator::{all_consuming, map, value},
    error::ErrorKind,
    multi::{many0, separated_list0},
    sequence::{delimited, preceded},
    IResult, Parser,
};
use thiserror::Error;

use super::ast::Selector;

/// Deepest selector tree accepted, counting negations and chained operators.
pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectorError {
    #[error("Empty selector")]
    Empty,

    #[error("Invalid selector '{selector}' at offset {offset}")]
    Syntax { selector: String, offset: usize },

    #[error("Selector nests deeper than {limit} levels")]
    TooDeep { limit: usize },
}

/// A parsed subtree with its height.
type Subtree = (Selector, usize);

/// Parses a selector expression.
pub fn parse_selector(input: &str) -> Result<Selector, SelectorError> {
    if input.trim().is_empty() {
        return Err(SelectorError::Empty);
    }
    match all_consuming(|i| expr(i, 0)).parse(input) {
        Ok((_, (selector, _))) => Ok(selector),
        Err(nom::Err::Failure(e)) if e.code == ErrorKind::TooLarge => {
            Err(SelectorError::TooDeep { limit: MAX_DEPTH })
        }
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(SelectorError::Syntax {
            selector: input.to_string(),
            offset: input.len() - e.input.len(),
        }),
        Err(nom::Err::Incomplete(_)) => Err(SelectorError::Syntax {
            selector: input.to_string(),
            offset: input.len(),
        }),
    }
}

fn too_deep(input: &str) -> nom::Err<nom::error::Error<&str>> {
    nom::Err::Failure(nom::error::Error::new(input, ErrorKind::TooLarge))
}

fn bounded(input: &str, (selector, height): Subtree) -> IResult<&str, Subtree> {
    if height > MAX_DEPTH {
        return Err(too_deep(input));
    }
    Ok((input, (selector, height)))
}

/// Left-folds an operator chain, checking its height before building it.
fn chain<'a>(
    input: &'a str,
    first: Subtree,
    rest: Vec<Subtree>,
    join: fn(Selector, Selector) -> Selector,
) -> IResult<&'a str, Subtree> {
    let height = rest.iter().fold(first.1, |acc, (_, h)| acc.max(*h) + 1);
    if height > MAX_DEPTH {
        return Err(too_deep(input));
    }
    let selector = rest.into_iter().fold(first.0, |acc, (next, _)| join(acc, next));
    Ok((input, (selector, height)))
}

fn ws<'a, O, P>(inner: P) -> impl Parser<&'a str, Output = O, Error = nom::error::Error<&'a str>>
where
    P: Parser<&'a str, Output = O, Error = nom::error::Error<&'a str>>,
{
    delimited(multispace0, inner, multispace0)
}

fn expr(input: &str, depth: usize) -> IResult<&str, Subtree> {
    let (input, first) = and_expr(input, depth)?;
    let (input, rest) = many0(preceded(tag("||"), |i| and_expr(i, depth))).parse(input)?;
    chain(input, first, rest, Selector::or)
}

fn and_expr(input: &str, depth: usize) -> IResult<&str, Subtree> {
    let (input, first) = unary(input, depth)?;
    let (input, rest) = many0(preceded(tag("&&"), |i| unary(i, depth))).parse(input)?;
    chain(input, first, rest, Selector::and)
}

/// `depth` counts open parentheses and negations, bounding recursion.
fn unary(input: &str, depth: usize) -> IResult<&str, Subtree> {
    if depth > MAX_DEPTH {
        return Err(too_deep(input));
    }
    let (input, parsed) = ws(alt((
        map(preceded(char('!'), |i| unary(i, depth + 1)), |(s, h): Subtree| {
            (s.negate(), h + 1)
        }),
        |i| primary(i, depth),
    )))
    .parse(input)?;
    bounded(input, parsed)
}

fn primary(input: &str, depth: usize) -> IResult<&str, Subtree> {
    alt((
        delimited(char('('), |i| expr(i, depth + 1), char(')')),
        value(
            (Selector::All, 1),
            (tag("all"), multispace0, char('('), multispace0, char(')')),
        ),
        map(
            delimited(
                (tag("has"), multispace0, char('(')),
                ws(label_key),
                char(')'),
            ),
            |key: &str| (Selector::Has(key.to_string()), 1),
        ),
        map(comparison, |s| (s, 1)),
    ))
    .parse(input)
}

fn comparison(input: &str) -> IResult<&str, Selector> {
    let (input, (key, _)) = (label_key, multispace0).parse(input)?;
    let key = key.to_string();
    let result = alt((
        map(preceded((tag("=="), multispace0), quoted), |v: &str| {
            Selector::Eq(key.clone(), v.to_string())
        }),
        map(preceded((tag("!="), multispace0), quoted), |v: &str| {
            Selector::NotEq(key.clone(), v.to_string())
        }),
        map(
            preceded((tag("not"), multispace1, tag("in"), multispace0), value_set),
            |vs| Selector::NotIn(key.clone(), vs),
        ),
        map(preceded((tag("in"), multispace0), value_set), |vs| {
            Selector::In(key.clone(), vs)
        }),
    ))
    .parse(input);
    result
}

/// Label keys allow the characters Kubernetes-style labels use.
fn label_key(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/' | '-'))
        .parse(input)
}

fn quoted(input: &str) -> IResult<&str, &str> {
    alt((
        delimited(char('\''), take_while(|c: char| c != '\''), char('\'')),
        delimited(char('"'), take_while(|c: char| c != '"'), char('"')),
    ))
    .parse(input)
}

fn value_set(input: &str) -> IResult<&str, BTreeSet<String>> {
    map(
        delimited(
            ws(char('{')),
            separated_list0(ws(char(',')), quoted),
            ws(char('}')),
        ),
        |values: Vec<&str>| values.into_iter().map(String::from).collect(),
    )
    .parse(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn set(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_primitives() {
        assert_eq!(parse_selector("all()").unwrap(), Selector::All);
        assert_eq!(parse_selector(" all ( ) ").unwrap(), Selector::All);
        assert_eq!(
            parse_selector("has(role)").unwrap(),
            Selector::Has("role".into())
        );
        assert_eq!(
            parse_selector("role==\"blocked\"").unwrap(),
            Selector::Eq("role".into(), "blocked".into())
        );
        assert_eq!(
            parse_selector("k8s.io/zone != 'a'").unwrap(),
            Selector::NotEq("k8s.io/zone".into(), "a".into())
        );
        assert_eq!(
            parse_selector("tier not in {'1','2'}").unwrap(),
            Selector::NotIn("tier".into(), set(&["1", "2"]))
        );
        assert_eq!(
            parse_selector("tier in { }").unwrap(),
            Selector::In("tier".into(), BTreeSet::new())
        );
    }

    #[test]
    fn keys_that_look_like_keywords() {
        assert_eq!(
            parse_selector("allow == 'x'").unwrap(),
            Selector::Eq("allow".into(), "x".into())
        );
        assert_eq!(
            parse_selector("has == 'x'").unwrap(),
            Selector::Eq("has".into(), "x".into())
        );
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let parsed = parse_selector("a == '1' || b == '2' && !has(c)").unwrap();
        let expected = Selector::Eq("a".into(), "1".into()).or(Selector::Eq(
            "b".into(),
            "2".into(),
        )
        .and(Selector::Has("c".into()).negate()));
        assert_eq!(parsed, expected);
    }

    #[test]
    fn rejects_malformed_input() {
        assert_eq!(parse_selector(""), Err(SelectorError::Empty));
        assert_eq!(parse_selector("   "), Err(SelectorError::Empty));
        for bad in [
            "role ==",
            "role == blocked",
            "has(role",
            "(a == '1'",
            "a == '1' &&",
            "a in {'x'",
            "a == 'x' junk",
            "&&",
        ] {
            assert!(
                matches!(parse_selector(bad), Err(SelectorError::Syntax { .. })),
                "{bad} should not parse"
            );
        }
    }

    #[test]
    fn syntax_error_reports_offset() {
        let err = parse_selector("a == 'x' junk").unwrap_err();
        assert_eq!(
            err,
            SelectorError::Syntax {
                selector: "a == 'x' junk".into(),
                offset: 9
            }
        );
    }

    #[test]
    fn deep_nesting_is_rejected_not_overflowed() {
        let parens = format!("{}all(){}", "(".repeat(10_000), ")".repeat(10_000));
        let negations = format!("{}all()", "!".repeat(10_000));
        let chain = vec!["has(a)"; 10_000].join(" && ");
        for input in [parens, negations, chain] {
            assert_eq!(
                parse_selector(&input),
                Err(SelectorError::TooDeep { limit: MAX_DEPTH })
            );
        }
    }

    #[test]
    fn nesting_within_the_limit_parses() {
        let parens = format!("{}has(a){}", "(".repeat(MAX_DEPTH), ")".repeat(MAX_DEPTH));
        assert_eq!(parse_selector(&parens).unwrap(), Selector::Has("a".into()));

        let negations = format!("{}all()", "!".repeat(MAX_DEPTH - 1));
        assert!(parse_selector(&negations).is_ok());
        let over = format!("{}all()", "!".repeat(MAX_DEPTH));
        assert_eq!(
            parse_selector(&over),
            Err(SelectorError::TooDeep { limit: MAX_DEPTH })
        );
    }

    fn leaf() -> impl Strategy<Value = Selector> {
        let key = "[a-z][a-z0-9_]{0,6}";
        let val = "[a-z0-9]{0,4}";
        prop_oneof![
            Just(Selector::All),
            key.prop_map(Selector::Has),
            (key, val).prop_map(|(k, v)| Selector::Eq(k, v)),
            (key, val).prop_map(|(k, v)| Selector::NotEq(k, v)),
            (key, proptest::collection::btree_set(val, 0..3)).prop_map(|(k, v)| Selector::In(k, v)),
            (key, proptest::collection::btree_set(val, 0..3))
                .prop_map(|(k, v)| Selector::NotIn(k, v)),
        ]
    }

    fn tree() -> impl Strategy<Value = Selector> {
        leaf().prop_recursive(3, 16, 2, |inner| {
            prop_oneof![
                inner.clone().prop_map(Selector::negate),
                (inner.clone(), inner.clone()).prop_map(|(a, b)| a.and(b)),
                (inner.clone(), inner).prop_map(|(a, b)| a.or(b)),
            ]
        })
    }

    proptest! {
        #[test]
        fn display_parses_back(selector in tree()) {
            let rendered = selector.to_string();
            prop_assert_eq!(parse_selector(&rendered).unwrap(), selector);
        }
    }
}
