use super::*;

use crate::term::VariableNamer;

fn decoded_text(value: serde_json::Value) -> String {
    Term::from_json(&value).expect("value decodes").to_string()
}

#[test]
fn atoms_and_numbers_round_trip() {
    assert_eq!(decoded_text(json!("a")), "a");
    assert_eq!(decoded_text(json!(1)), "1");
    assert_eq!(decoded_text(json!(1.1)), "1.1");
    assert_eq!(decoded_text(json!([2, 1.1])), "[2,1.1]");
}

#[test]
fn whole_floats_keep_their_decimal_point() {
    assert_eq!(decoded_text(json!(2.0)), "2.0");
    assert_eq!(Term::Float(-3.0).to_string(), "-3.0");
}

#[test]
fn compounds_and_lists_round_trip() {
    assert_eq!(decoded_text(json!({"functor": "a", "args": ["b"]})), "a(b)");
    assert_eq!(
        decoded_text(json!({"functor": "a", "args": ["b", "c"]})),
        "a(b,c)"
    );
    assert_eq!(
        decoded_text(json!([
            {"functor": "a", "args": ["b"]},
            {"functor": "b", "args": ["c"]}
        ])),
        "[a(b),b(c)]"
    );
    assert_eq!(
        decoded_text(json!([{"functor": "a", "args": [{"functor": "b", "args": ["d"]}]}])),
        "[a(b(d))]"
    );
}

#[test]
fn quoting_follows_the_atom_rule() {
    assert_eq!(decoded_text(json!({"functor": "a", "args": ["b A"]})), "a('b A')");
    assert_eq!(decoded_text(json!({"functor": "a", "args": ["1b"]})), "a('1b')");
    assert_eq!(
        decoded_text(json!({"functor": "a b", "args": [["1b", "a b"]]})),
        "'a b'(['1b','a b'])"
    );
    // Strings that merely look like variables to a human are atoms on the
    // wire unless they start with an underscore.
    assert_eq!(decoded_text(json!("Auto")), "'Auto'");
    assert_eq!(Term::atom("").to_string(), "''");
}

#[test]
fn quoted_atoms_escape_quotes_and_backslashes() {
    assert_eq!(Term::atom("it's").to_string(), r"'it\'s'");
    assert_eq!(Term::atom(r"a\b").to_string(), r"'a\\b'");
}

#[test]
fn strings_render_double_quoted() {
    assert_eq!(Term::Str("hi".into()).to_string(), "\"hi\"");
    assert_eq!(
        Term::Str(r#"say "hi""#.into()).to_string(),
        r#""say \"hi\"""#
    );
}

#[test]
fn variables_are_canonicalized_per_value() {
    assert_eq!(decoded_text(json!("_1")), "A");
    assert_eq!(decoded_text(json!("_")), "_");
    assert_eq!(decoded_text(json!(["_1", "_a", "_G27"])), "[A,B,C]");
    // The same raw name maps to the same canonical letter.
    assert_eq!(decoded_text(json!(["_1", "_a", "_1"])), "[A,B,A]");
    // The anonymous variable never consumes a letter.
    assert_eq!(decoded_text(json!(["_", "_9"])), "[_,A]");
}

#[test]
fn canonical_names_continue_past_z() {
    let mut namer = VariableNamer::default();
    let mut last = String::new();
    for index in 0..28 {
        last = namer.rename(&format!("_v{index}"));
    }
    assert_eq!(namer.rename("_v0"), "A");
    assert_eq!(namer.rename("_v25"), "Z");
    assert_eq!(namer.rename("_v26"), "AA");
    assert_eq!(last, "AB");
}

#[test]
fn name_and_args_expose_the_principal_functor() {
    let term = Term::compound("point", vec![Term::Integer(1), Term::Integer(2)]);
    assert_eq!(term.name(), "point");
    assert_eq!(term.args().len(), 2);
    assert_eq!(Term::atom("a").name(), "a");
    assert!(Term::atom("a").args().is_empty());
    assert_eq!(Term::Integer(7).name(), "7");
    assert_eq!(Term::Variable("A".into()).name(), "A");
}

#[test]
fn zero_arity_compounds_decode_as_atoms() {
    let term = Term::from_json(&json!({"functor": "standalone", "args": []})).unwrap();
    assert_eq!(term, Term::atom("standalone"));
}

#[test]
fn malformed_values_are_rejected() {
    assert!(Term::from_json(&json!(null)).is_err());
    assert!(Term::from_json(&json!(true)).is_err());
    assert!(Term::from_json(&json!({"args": [1]})).is_err());
    assert!(Term::from_json(&json!({"functor": "f"})).is_err());
}
