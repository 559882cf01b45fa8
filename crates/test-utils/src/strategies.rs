//! Proptest strategies for store values.
//!
//! ```no_run
//! use quarry_test_utils::strategies;
//! use proptest::prelude::*;
//!
//! proptest! {
//!     #[test]
//!     fn terms_round_trip(term in strategies::arb_term()) {
//!         // ...
//!     }
//! }
//! ```

use proptest::prelude::*;
use quarry_store::Term;

/// An IRI under a small set of namespaces.
pub fn arb_iri() -> impl Strategy<Value = String> {
    (
        prop::sample::select(vec![
            "http://example.org/",
            "http://xmlns.com/foaf/0.1/",
            "urn:uuid:",
        ]),
        "[a-zA-Z0-9_-]{1,40}",
    )
        .prop_map(|(ns, local)| format!("{ns}{local}"))
}

/// Any kind of term, with lexical forms short enough to be inlined and long
/// enough to need the node table.
pub fn arb_term() -> impl Strategy<Value = Term> {
    prop_oneof![
        arb_iri().prop_map(Term::iri),
        "[a-z0-9]{1,12}".prop_map(Term::blank),
        ".{0,64}".prop_map(Term::plain),
        ("[a-z ]{0,32}", "[a-z]{2}(-[A-Z]{2})?").prop_map(|(l, lang)| Term::lang(l, lang)),
        ("[0-9.]{1,20}", Just("http://www.w3.org/2001/XMLSchema#decimal"))
            .prop_map(|(lexical, dt)| Term::typed(lexical, dt)),
        any::<i64>().prop_map(Term::Integer),
    ]
}

/// A record key of exactly `len` bytes.
pub fn arb_key(len: usize) -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), len)
}

/// A sequence of inserts (`true`) and deletes (`false`) over a small key
/// space so that keys repeat.
pub fn arb_ops(len: usize, max_ops: usize) -> impl Strategy<Value = Vec<(Vec<u8>, bool)>> {
    proptest::collection::vec(
        (proptest::collection::vec(0u8..16, len), prop::bool::weighted(0.7)),
        0..max_ops,
    )
}
