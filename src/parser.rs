use serde::de::DeserializeOwned;

use crate::error::ParseError;

/// Turns a response body into a typed value.
pub trait ResponseParser: Send + Sync + 'static {
    fn parse<T: DeserializeOwned>(&self, body: &str) -> Result<T, ParseError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JsonResponseParser;

impl ResponseParser for JsonResponseParser {
    fn parse<T: DeserializeOwned>(&self, body: &str) -> Result<T, ParseError> {
        serde_json::from_str(body).map_err(|error| ParseError::with_source(error.to_string(), error))
    }
}

/// Hands the body over untouched. Only string-like targets can be produced;
/// anything else is a parse error.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughResponseParser;

impl ResponseParser for PassthroughResponseParser {
    fn parse<T: DeserializeOwned>(&self, body: &str) -> Result<T, ParseError> {
        serde_json::from_value(serde_json::Value::String(body.to_owned())).map_err(|error| {
            ParseError::with_source(
                format!("passthrough parser only produces strings: {error}"),
                error,
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::{JsonResponseParser, PassthroughResponseParser, ResponseParser};

    #[derive(Debug, Deserialize, PartialEq)]
    struct User {
        id: u64,
        name: String,
    }

    #[test]
    fn json_parser_reads_structs() {
        let user: User = JsonResponseParser
            .parse(r#"{"id":7,"name":"ada"}"#)
            .expect("parse user");
        assert_eq!(
            user,
            User {
                id: 7,
                name: "ada".to_owned()
            }
        );
    }

    #[test]
    fn json_parser_reports_malformed_input() {
        let error = JsonResponseParser
            .parse::<User>("{not json")
            .expect_err("malformed json");
        assert!(!error.message().is_empty());
    }

    #[test]
    fn passthrough_parser_only_yields_strings() {
        let text: String = PassthroughResponseParser
            .parse("plain <b>text</b>")
            .expect("string target");
        assert_eq!(text, "plain <b>text</b>");
        assert!(PassthroughResponseParser.parse::<User>("{}").is_err());
    }
}
