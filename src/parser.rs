use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_until, take_while1},
    character::complete::{char, digit1, multispace0, multispace1},
    combinator::{map, map_res, opt, recognize},
    error::{Error, ErrorKind},
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};
use serde_json::Value;

use crate::filter::{Filter, Predicate, Query};
use crate::isolation::IsolationLevel;
use crate::model::Document;

#[derive(Debug, PartialEq, Clone)]
pub enum Command {
    Begin { level: IsolationLevel },
    Commit { tx: u64 },
    Rollback { tx: u64 },
    Insert { tx: u64, name: String, doc: Document },
    Find { tx: u64, query: Query },
    Update { tx: u64, set: Document, query: Query },
    Delete { tx: u64, query: Query },
    Stats,
    Help,
    Exit,
}

// --- BASIC PARSERS ---

fn parse_u64(input: &str) -> IResult<&str, u64> {
    map_res(digit1, |s: &str| s.parse::<u64>())(input)
}

fn parse_i64(input: &str) -> IResult<&str, i64> {
    map_res(recognize(pair(opt(char('-')), digit1)), |s: &str| s.parse::<i64>())(input)
}

fn parse_quoted_string(input: &str) -> IResult<&str, String> {
    let (input, _) = char('"')(input)?;
    let (input, content) = take_until("\"")(input)?;
    let (input, _) = char('"')(input)?;
    Ok((input, content.to_string()))
}

fn parse_word(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !c.is_whitespace())(input)
}

fn parse_identifier(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_alphanumeric() || c == '_' || c == '.' || c == '$' || c == '-')(input)
}

/// A JSON object embedded in the command line.
fn parse_document(input: &str) -> IResult<&str, Document> {
    let mut stream = serde_json::Deserializer::from_str(input).into_iter::<Value>();
    match stream.next() {
        Some(Ok(Value::Object(doc))) => Ok((&input[stream.byte_offset()..], doc)),
        _ => Err(nom::Err::Error(Error::new(input, ErrorKind::Verify))),
    }
}

/// Quoted strings stay strings; bare words are read as JSON scalars when
/// they parse as one.
fn parse_value(input: &str) -> IResult<&str, Value> {
    alt((
        map(parse_quoted_string, Value::String),
        map(parse_word, |s: &str| serde_json::from_str::<Value>(s).unwrap_or_else(|_| Value::String(s.to_string()))),
    ))(input)
}

fn parse_predicate(input: &str) -> IResult<&str, Predicate> {
    alt((
        map(tag("!="), |_| Predicate::Ne),
        map(tag("<="), |_| Predicate::Lte),
        map(tag(">="), |_| Predicate::Gte),
        map(tag("<"), |_| Predicate::Lt),
        map(tag(">"), |_| Predicate::Gt),
        map(tag("="), |_| Predicate::Eq),
    ))(input)
}

// --- HELPERS ---
fn ws<'a, F, O, E: nom::error::ParseError<&'a str>>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O, E>
where F: FnMut(&'a str) -> IResult<&'a str, O, E> {
    delimited(multispace0, inner, multispace0)
}

fn tag_ci(t: &'static str) -> impl FnMut(&str) -> IResult<&str, &str> {
    move |input| tag_no_case(t)(input)
}

fn parse_tx(input: &str) -> IResult<&str, u64> {
    preceded(multispace1, parse_u64)(input)
}

fn parse_condition(input: &str) -> IResult<&str, Filter> {
    let (input, (field, predicate, value)) = tuple((parse_identifier, ws(parse_predicate), parse_value))(input)?;
    Ok((input, Filter::new(field, predicate, value)))
}

/// `[WHERE field op value] [LIMIT n]`
fn parse_query(input: &str) -> IResult<&str, Query> {
    let (input, filter) = opt(preceded(ws(tag_ci("WHERE")), parse_condition))(input)?;
    let (input, limit) = opt(preceded(ws(tag_ci("LIMIT")), parse_i64))(input)?;
    Ok((input, Query { filter: filter.unwrap_or_default(), limit }))
}

// --- COMMAND PARSERS ---

fn parse_begin(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("BEGIN")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, level) = map_res(parse_identifier, |s: &str| s.parse::<IsolationLevel>())(input)?;
    Ok((input, Command::Begin { level }))
}

fn parse_commit(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("COMMIT")(input)?;
    let (input, tx) = parse_tx(input)?;
    Ok((input, Command::Commit { tx }))
}

fn parse_rollback(input: &str) -> IResult<&str, Command> {
    let (input, _) = alt((tag_ci("ROLLBACK"), tag_ci("ABORT")))(input)?;
    let (input, tx) = parse_tx(input)?;
    Ok((input, Command::Rollback { tx }))
}

fn parse_insert(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("INSERT")(input)?;
    let (input, tx) = parse_tx(input)?;
    let (input, _) = multispace1(input)?;
    let (input, name) = alt((parse_quoted_string, map(parse_identifier, str::to_string)))(input)?;
    let (input, doc) = opt(preceded(multispace0, parse_document))(input)?;
    Ok((input, Command::Insert { tx, name, doc: doc.unwrap_or_default() }))
}

fn parse_find(input: &str) -> IResult<&str, Command> {
    let (input, _) = alt((tag_ci("FIND"), tag_ci("SELECT")))(input)?;
    let (input, tx) = parse_tx(input)?;
    let (input, query) = parse_query(input)?;
    Ok((input, Command::Find { tx, query }))
}

fn parse_update(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("UPDATE")(input)?;
    let (input, tx) = parse_tx(input)?;
    let (input, _) = ws(tag_ci("SET"))(input)?;
    let (input, set) = parse_document(input)?;
    let (input, query) = parse_query(input)?;
    Ok((input, Command::Update { tx, set, query }))
}

fn parse_delete(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("DELETE")(input)?;
    let (input, tx) = parse_tx(input)?;
    let (input, query) = parse_query(input)?;
    Ok((input, Command::Delete { tx, query }))
}

fn parse_stats(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("STATS")(input)?;
    Ok((input, Command::Stats))
}

fn parse_help(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("HELP")(input)?;
    Ok((input, Command::Help))
}

fn parse_exit(input: &str) -> IResult<&str, Command> {
    let (input, _) = alt((tag_ci("EXIT"), tag_ci("QUIT")))(input)?;
    Ok((input, Command::Exit))
}

pub fn parse_command(input: &str) -> Result<Command, String> {
    let input = input.trim();
    let result = alt((
        parse_begin,
        parse_commit,
        parse_rollback,
        parse_insert,
        parse_find,
        parse_update,
        parse_delete,
        parse_stats,
        parse_help,
        parse_exit,
    ))(input);

    match result {
        Ok((remainder, cmd)) => {
            if !remainder.trim().is_empty() {
                return Err(format!("Unexpected tokens at end: '{}'", remainder.trim()));
            }
            Ok(cmd)
        },
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            let context: String = e.input.chars().take(20).collect();
            let ellipsis = if e.input.chars().count() > 20 { "..." } else { "" };
            Err(format!("Invalid syntax near: '{}{}'", context, ellipsis))
        },
        Err(nom::Err::Incomplete(_)) => Err("Incomplete command.".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_begin_levels() {
        assert_eq!(
            parse_command("begin SERIALIZABLE").unwrap(),
            Command::Begin { level: IsolationLevel::Serializable }
        );
        assert_eq!(
            parse_command("BEGIN read_uncommitted").unwrap(),
            Command::Begin { level: IsolationLevel::ReadUncommitted }
        );
        assert!(parse_command("BEGIN sloppy").is_err());
    }

    #[test]
    fn test_insert_with_document() {
        let cmd = parse_command(r#"INSERT 4 "Ada Lovelace" {"born": 1815, "tags": ["math"]}"#).unwrap();
        match cmd {
            Command::Insert { tx, name, doc } => {
                assert_eq!(tx, 4);
                assert_eq!(name, "Ada Lovelace");
                assert_eq!(doc["born"], json!(1815));
                assert_eq!(doc["tags"], json!(["math"]));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_insert_bare_name_without_document() {
        assert_eq!(
            parse_command("insert 1 babbage").unwrap(),
            Command::Insert { tx: 1, name: "babbage".into(), doc: Document::new() }
        );
    }

    #[test]
    fn test_find_with_where_and_limit() {
        let cmd = parse_command(r#"FIND 2 WHERE doc.city != "Paris" LIMIT 3"#).unwrap();
        assert_eq!(
            cmd,
            Command::Find {
                tx: 2,
                query: Query::new(Filter::new("doc.city", Predicate::Ne, "Paris")).with_limit(3),
            }
        );
    }

    #[test]
    fn test_bare_values_parse_as_json_scalars() {
        let Command::Find { query, .. } = parse_command("FIND 1 WHERE born>=1900").unwrap() else {
            panic!("expected find");
        };
        assert_eq!(query.filter.predicate, Some(Predicate::Gte));
        assert_eq!(query.filter.value, Some(json!(1900)));

        let Command::Delete { query, .. } = parse_command("DELETE 1 WHERE name = turing").unwrap() else {
            panic!("expected delete");
        };
        assert_eq!(query.filter.value, Some(json!("turing")));
    }

    #[test]
    fn test_update_set_clause() {
        let cmd = parse_command(r#"UPDATE 7 SET {"status": "done"} WHERE id = 12"#).unwrap();
        let Command::Update { tx, set, query } = cmd else {
            panic!("expected update");
        };
        assert_eq!(tx, 7);
        assert_eq!(set["status"], json!("done"));
        assert_eq!(query.filter, Filter::eq("id", 12));
        assert_eq!(query.limit, None);
    }

    #[test]
    fn test_trailing_garbage_is_reported() {
        let err = parse_command("COMMIT 3 now").unwrap_err();
        assert!(err.contains("now"), "{}", err);
        assert!(parse_command("UPDATE 1 SET not-json").is_err());
    }
}
