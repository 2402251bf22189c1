//! Journal epoch/token behavior as seen by clients.

use fsmonitor_core::{
    journal::DETERMINISTIC_RUN_ID, Journal, QueryRequest, Token, TokenError,
};
use rstest::rstest;

fn since(token: &Token) -> QueryRequest {
    QueryRequest::Since(token.clone())
}

// ---------------------------------------------------------------------------
// 1. Epoch scenario
// ---------------------------------------------------------------------------

#[test]
fn flush_scenario_across_two_epochs() {
    let mut journal = Journal::new(true, 1_000);
    let e1 = journal.current_token();

    journal.append("file_1");
    journal.append("file_2");
    let response = journal.query(&since(&e1));
    assert!(!response.rescan);
    assert!(response.paths.contains(&"file_1".to_string()));
    assert!(response.paths.contains(&"file_2".to_string()));

    let e2 = journal.flush();
    assert_eq!(e2.generation, e1.generation + 1);
    assert_eq!(e2.seq_nr, 0);
    assert!(journal.query(&since(&e2)).paths.is_empty());

    journal.append("file_3");
    let response = journal.query(&since(&e2));
    assert_eq!(response.paths, vec!["file_3".to_string()]);

    // The pre-flush epoch is gone for good.
    assert!(journal.query(&since(&e1)).rescan);
}

#[test]
fn history_survives_until_flush() {
    let mut journal = Journal::new(true, 1_000);
    let start = journal.current_token();
    let mut expected = Vec::new();
    for i in 0..50 {
        let path = format!("dir/file_{i:02}");
        journal.append(path.clone());
        expected.push(path);
    }
    // Touch a few again; coalescing must not hide them from older tokens.
    journal.append_batch(["dir/file_03", "dir/file_07"]);

    let response = journal.query(&since(&start));
    assert_eq!(response.paths, expected);
}

#[test]
fn bootstrap_ignores_prior_history() {
    let mut journal = Journal::new(true, 1_000);
    journal.append_batch(["a", "b", "c"]);
    journal.flush();
    journal.append("d");

    let response = journal.query(&QueryRequest::Bootstrap);
    assert!(response.rescan);
    assert!(response.paths.is_empty());
    assert_eq!(response.token, journal.current_token());
}

#[test]
fn rename_is_two_independent_entries() {
    let mut journal = Journal::new(true, 1_000);
    let start = journal.current_token();
    journal.append_batch(["old_name.txt", "new_name.txt"]);
    let response = journal.query(&since(&start));
    assert_eq!(
        response.paths,
        vec!["new_name.txt".to_string(), "old_name.txt".to_string()]
    );
}

// ---------------------------------------------------------------------------
// 2. Token text form
// ---------------------------------------------------------------------------

#[rstest]
#[case(":internal:test:0:0")]
#[case(":internal:test:12:3456")]
#[case(":internal:4d2.17f3a9b1c2d:7:1")]
fn token_text_round_trips(#[case] text: &str) {
    let token: Token = text.parse().expect("parse");
    assert_eq!(token.to_string(), text);
}

#[rstest]
#[case("internal:test:0:0", "prefix")]
#[case(":internal:test:0", "form")]
#[case(":internal:test:0:0:0", "form")]
#[case(":internal::0:0", "empty run id")]
#[case(":internal:test:x:0", "generation")]
#[case(":internal:test:0:+1", "seq_nr")]
#[case(":internal:test:0:", "seq_nr")]
fn malformed_tokens_are_rejected(#[case] text: &str, #[case] needle: &str) {
    let err: TokenError = text.parse::<Token>().unwrap_err();
    assert!(err.to_string().contains(needle), "got: {err}");
    assert_eq!(QueryRequest::from_text(text), QueryRequest::Bootstrap);
}

#[test]
fn deterministic_tokens_are_reproducible() {
    let mut a = Journal::new(true, 10);
    let mut b = Journal::new(true, 10);
    assert_eq!(a.current_token(), b.current_token());
    a.append("x");
    b.append("y");
    assert_eq!(a.current_token(), b.current_token());
    assert_eq!(a.flush(), b.flush());
    assert_eq!(a.current_token().run_id, DETERMINISTIC_RUN_ID);
}
